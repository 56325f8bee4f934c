use crate::engine::{EngineError, NegotiationEngine, SessionBackend};
use crate::transport::{SignalTransport, TransportError};
use catline_proto::call::{
    CallAccept, CallHangup, CallInitiate, CallReject, ClientEvent, MediaKind, NegotiationSignal,
    ServerEvent,
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Where the local user stands in the call lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Calling,
    Ringing,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallView {
    pub call_id: String,
    pub peer: String,
    pub chat_id: String,
    pub media_kind: MediaKind,
    pub initiator: bool,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("another call is already in progress")]
    Busy,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Drives the local call lifecycle against server events. At most one of
/// the outgoing, incoming and active slots is ever populated; an outgoing
/// call carries a provisional local id until the server's call-accepted
/// event supplies the authoritative one.
pub struct CallOrchestrator<T: SignalTransport, B: SessionBackend> {
    user_id: String,
    transport: T,
    engine: NegotiationEngine<B>,
    outgoing: Option<CallView>,
    incoming: Option<CallView>,
    active: Option<CallView>,
    local_sequence: u64,
}

impl<T: SignalTransport, B: SessionBackend> CallOrchestrator<T, B> {
    pub fn new(user_id: &str, transport: T, backend: B) -> Self {
        CallOrchestrator {
            user_id: user_id.to_string(),
            transport,
            engine: NegotiationEngine::new(backend),
            outgoing: None,
            incoming: None,
            active: None,
            local_sequence: 0,
        }
    }

    pub fn phase(&self) -> CallPhase {
        debug_assert!(
            [&self.outgoing, &self.incoming, &self.active]
                .iter()
                .filter(|slot| slot.is_some())
                .count()
                <= 1
        );
        if self.active.is_some() {
            CallPhase::Connected
        } else if self.outgoing.is_some() {
            CallPhase::Calling
        } else if self.incoming.is_some() {
            CallPhase::Ringing
        } else {
            CallPhase::Idle
        }
    }

    pub fn current_call(&self) -> Option<&CallView> {
        self.active
            .as_ref()
            .or(self.outgoing.as_ref())
            .or(self.incoming.as_ref())
    }

    /// Starts an outgoing call and returns its provisional id. The real
    /// id arrives with call-accepted; until then the call is tracked
    /// locally only.
    pub fn place_call(
        &mut self,
        target_user_id: &str,
        chat_id: &str,
        media_kind: MediaKind,
    ) -> Result<String, CallError> {
        if self.phase() != CallPhase::Idle {
            return Err(CallError::Busy);
        }
        self.local_sequence += 1;
        let provisional_id = format!("local-{}-{}", self.user_id, self.local_sequence);
        self.transport.send(ClientEvent::Initiate(CallInitiate {
            target_user_id: target_user_id.to_string(),
            chat_id: chat_id.to_string(),
            media_kind,
        }))?;
        self.outgoing = Some(CallView {
            call_id: provisional_id.clone(),
            peer: target_user_id.to_string(),
            chat_id: chat_id.to_string(),
            media_kind,
            initiator: true,
        });
        debug!(call = %provisional_id, peer = %target_user_id, "outgoing call placed");
        Ok(provisional_id)
    }

    /// Answers the ringing incoming call. Capture starts here; the offer
    /// will arrive from the caller once it sees call-accepted.
    pub fn accept_call(&mut self) -> Result<(), CallError> {
        let Some(view) = self.incoming.take() else {
            warn!("accept with no ringing call");
            return Ok(());
        };
        if let Err(err) = self.engine.start(view.media_kind) {
            let _ = self.transport.send(ClientEvent::Reject(CallReject {
                call_id: view.call_id.clone(),
            }));
            self.reset();
            return Err(err.into());
        }
        if let Err(err) = self.transport.send(ClientEvent::Accept(CallAccept {
            call_id: view.call_id.clone(),
        })) {
            self.reset();
            return Err(err.into());
        }
        debug!(call = %view.call_id, "incoming call accepted");
        self.active = Some(view);
        Ok(())
    }

    /// Leaves the current call, whatever phase it is in. Always resets
    /// local state, even when the farewell signal cannot be sent.
    pub fn hang_up(&mut self) -> Result<(), CallError> {
        let farewell = if let Some(view) = &self.active {
            Some(ClientEvent::End(CallHangup {
                call_id: view.call_id.clone(),
            }))
        } else if let Some(view) = &self.incoming {
            Some(ClientEvent::Reject(CallReject {
                call_id: view.call_id.clone(),
            }))
        } else if let Some(view) = &self.outgoing {
            // best effort: the server id is unknown until call-accepted,
            // so an unanswered cancel rides the ring timeout out
            Some(ClientEvent::End(CallHangup {
                call_id: view.call_id.clone(),
            }))
        } else {
            None
        };
        let Some(farewell) = farewell else {
            return Ok(());
        };
        let sent = self.transport.send(farewell);
        self.reset();
        sent.map_err(CallError::from)
    }

    pub fn announce_local_candidate(&mut self, candidate: Value) -> Result<(), CallError> {
        let Some(view) = self.active.as_ref() else {
            debug!("local candidate dropped, no active call");
            return Ok(());
        };
        self.transport.send(ClientEvent::Candidate(NegotiationSignal {
            call_id: view.call_id.clone(),
            payload: candidate,
            from_user_id: None,
        }))?;
        Ok(())
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.engine.set_audio_enabled(enabled);
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.engine.set_video_enabled(enabled);
    }

    /// Feeds one server event through the state machine.
    pub fn handle_event(&mut self, event: ServerEvent) -> Result<(), CallError> {
        match event {
            ServerEvent::IncomingCall(incoming) => {
                if self.phase() != CallPhase::Idle {
                    // the server-side busy check raced a local transition
                    warn!(call = %incoming.call_id, "incoming call while busy, rejecting");
                    self.transport.send(ClientEvent::Reject(CallReject {
                        call_id: incoming.call_id,
                    }))?;
                    return Ok(());
                }
                self.incoming = Some(CallView {
                    call_id: incoming.call_id,
                    peer: incoming.caller_id,
                    chat_id: incoming.chat_id,
                    media_kind: incoming.media_kind,
                    initiator: false,
                });
                Ok(())
            }
            ServerEvent::CallAccepted(accepted) => {
                let Some(mut view) = self.outgoing.take() else {
                    // a cancelled outgoing call was accepted anyway; hang the
                    // half-open server call up so neither party stays in-call
                    debug!(call = %accepted.call_id, "call-accepted without outgoing call, ending");
                    self.transport.send(ClientEvent::End(CallHangup {
                        call_id: accepted.call_id,
                    }))?;
                    return Ok(());
                };
                if view.peer != accepted.accepted_by {
                    warn!(
                        call = %accepted.call_id,
                        accepted_by = %accepted.accepted_by,
                        "call-accepted from unexpected peer"
                    );
                    self.outgoing = Some(view);
                    return Ok(());
                }
                // reconcile the provisional id to the server's
                view.call_id = accepted.call_id;
                let call_id = view.call_id.clone();
                let media_kind = view.media_kind;
                self.active = Some(view);
                match self.start_caller_negotiation(media_kind, &call_id) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        warn!(call = %call_id, error = %err, "negotiation start failed");
                        let _ = self.transport.send(ClientEvent::End(CallHangup {
                            call_id,
                        }));
                        self.reset();
                        Err(err)
                    }
                }
            }
            ServerEvent::CallRejected(rejected) => {
                if self.outgoing.is_some() {
                    debug!(call = %rejected.call_id, by = %rejected.rejected_by, "call rejected");
                    self.reset();
                }
                Ok(())
            }
            ServerEvent::CallTimeout(timeout) => {
                let ours = self.outgoing.is_some()
                    || self.matches_current(&timeout.call_id);
                if ours {
                    debug!(call = %timeout.call_id, "call timed out");
                    self.reset();
                }
                Ok(())
            }
            ServerEvent::CallEnded(ended) => {
                // an outgoing call still carries its provisional id, so the
                // server's id cannot match; any end while calling is ours
                if self.outgoing.is_some() || self.matches_current(&ended.call_id) {
                    debug!(call = %ended.call_id, by = %ended.ended_by, "call ended remotely");
                    self.reset();
                }
                Ok(())
            }
            ServerEvent::CallFailed(failed) => {
                if self.outgoing.is_some() {
                    debug!(reason = failed.reason.as_str(), "outgoing call failed");
                    self.reset();
                } else {
                    debug!(reason = failed.reason.as_str(), "call failure event");
                }
                Ok(())
            }
            ServerEvent::Offer(signal) => {
                if !self.matches_active(&signal.call_id) {
                    debug!(call = %signal.call_id, "offer for unknown call ignored");
                    return Ok(());
                }
                let answer = match self.engine.accept_offer(&signal.payload) {
                    Ok(answer) => answer,
                    Err(err) => {
                        warn!(call = %signal.call_id, error = %err, "offer handling failed");
                        let _ = self.transport.send(ClientEvent::End(CallHangup {
                            call_id: signal.call_id,
                        }));
                        self.reset();
                        return Err(err.into());
                    }
                };
                self.transport.send(ClientEvent::Answer(NegotiationSignal {
                    call_id: signal.call_id,
                    payload: answer,
                    from_user_id: None,
                }))?;
                Ok(())
            }
            ServerEvent::Answer(signal) => {
                if !self.matches_active(&signal.call_id) {
                    debug!(call = %signal.call_id, "answer for unknown call ignored");
                    return Ok(());
                }
                self.engine.apply_answer(&signal.payload)?;
                Ok(())
            }
            ServerEvent::Candidate(signal) => {
                if !self.matches_active(&signal.call_id) {
                    debug!(call = %signal.call_id, "candidate for unknown call ignored");
                    return Ok(());
                }
                self.engine.add_candidate(signal.payload)?;
                Ok(())
            }
            ServerEvent::SnapshotState(_) => Ok(()),
            ServerEvent::Error(error) => {
                warn!(message = %error.message, "server error event");
                Ok(())
            }
        }
    }

    fn start_caller_negotiation(
        &mut self,
        media_kind: MediaKind,
        call_id: &str,
    ) -> Result<(), CallError> {
        self.engine.start(media_kind)?;
        let offer = self.engine.create_offer()?;
        self.transport.send(ClientEvent::Offer(NegotiationSignal {
            call_id: call_id.to_string(),
            payload: offer,
            from_user_id: None,
        }))?;
        Ok(())
    }

    fn matches_active(&self, call_id: &str) -> bool {
        self.active
            .as_ref()
            .map(|view| view.call_id == call_id)
            .unwrap_or(false)
    }

    fn matches_current(&self, call_id: &str) -> bool {
        self.current_call()
            .map(|view| view.call_id == call_id)
            .unwrap_or(false)
    }

    /// Clears every slot and releases the media session.
    pub fn reset(&mut self) {
        self.outgoing = None;
        self.incoming = None;
        self.active = None;
        self.engine.teardown();
    }
}
