use super::AppState;
use crate::presence::Availability;
use crate::registry::{CallRecord, CallStatus};
use crate::util::generate_id;
use catline_proto::call::{
    CallAccepted, CallEndReason, CallEnded, CallFailed, CallFailureReason, CallInitiate,
    CallRejected, CallTimeout, IncomingCall, ServerEvent,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

enum InitiateOutcome {
    Rejected(CallFailureReason, &'static str),
    Ready {
        call_id: String,
        callee_sender: mpsc::Sender<ServerEvent>,
    },
}

enum AcceptOutcome {
    Invalid(&'static str),
    Ready { caller: String },
}

impl AppState {
    /// Places a call. The availability check and record creation happen
    /// under one lock acquisition, so two simultaneous initiations to the
    /// same callee cannot both observe idle.
    pub async fn initiate(self: &Arc<Self>, caller_id: &str, request: CallInitiate) {
        let outcome = {
            let mut core = self.core.write().await;
            if request.target_user_id == caller_id {
                InitiateOutcome::Rejected(CallFailureReason::InvalidCall, "cannot call yourself")
            } else if core.directory.availability(caller_id) != Availability::Idle {
                InitiateOutcome::Rejected(CallFailureReason::InvalidCall, "caller is not idle")
            } else {
                match core.directory.live_sender(&request.target_user_id) {
                    None => InitiateOutcome::Rejected(
                        CallFailureReason::UserOffline,
                        "callee is offline",
                    ),
                    Some(callee_sender) => {
                        if core.directory.availability(&request.target_user_id)
                            != Availability::Idle
                        {
                            InitiateOutcome::Rejected(
                                CallFailureReason::UserBusy,
                                "callee is busy",
                            )
                        } else {
                            let call_id = generate_id(caller_id);
                            let record = CallRecord {
                                call_id: call_id.clone(),
                                caller: caller_id.to_string(),
                                callee: request.target_user_id.clone(),
                                chat_id: request.chat_id.clone(),
                                media_kind: request.media_kind,
                                status: CallStatus::Ringing,
                                started_at: Utc::now(),
                            };
                            match core.registry.insert(record) {
                                Ok(()) => {
                                    core.directory
                                        .set_availability(caller_id, Availability::Calling);
                                    core.directory.set_availability(
                                        &request.target_user_id,
                                        Availability::Calling,
                                    );
                                    InitiateOutcome::Ready {
                                        call_id,
                                        callee_sender,
                                    }
                                }
                                Err(err) => {
                                    warn!(error = %err, "call record insert failed");
                                    InitiateOutcome::Rejected(
                                        CallFailureReason::ServerError,
                                        "call registration failed",
                                    )
                                }
                            }
                        }
                    }
                }
            }
        };
        match outcome {
            InitiateOutcome::Rejected(reason, message) => {
                self.metrics.mark_call_failed();
                debug!(
                    caller = %caller_id,
                    callee = %request.target_user_id,
                    reason = reason.as_str(),
                    "call initiation refused"
                );
                self.deliver(
                    caller_id,
                    ServerEvent::CallFailed(CallFailed {
                        reason,
                        message: message.to_string(),
                        call_id: None,
                    }),
                )
                .await;
            }
            InitiateOutcome::Ready {
                call_id,
                callee_sender,
            } => {
                self.metrics.mark_call_initiated();
                info!(
                    call = %call_id,
                    caller = %caller_id,
                    callee = %request.target_user_id,
                    media = request.media_kind.as_str(),
                    "call initiated"
                );
                let incoming = ServerEvent::IncomingCall(IncomingCall {
                    call_id: call_id.clone(),
                    caller_id: caller_id.to_string(),
                    chat_id: request.chat_id.clone(),
                    media_kind: request.media_kind,
                });
                if callee_sender.send(incoming).await.is_err() {
                    // callee vanished between the lock and the send
                    warn!(call = %call_id, "incoming-call delivery failed");
                    self.destroy_call(&call_id).await;
                    self.metrics.mark_call_failed();
                    self.deliver(
                        caller_id,
                        ServerEvent::CallFailed(CallFailed {
                            reason: CallFailureReason::ServerError,
                            message: "callee unreachable".to_string(),
                            call_id: Some(call_id),
                        }),
                    )
                    .await;
                } else {
                    self.arm_ring_timer(call_id).await;
                }
            }
        }
    }

    /// Accepting is valid for the registered callee of a ringing call only.
    /// The transition out of ringing happens under the lock, so the caller
    /// can never observe two call-accepted events for one call id.
    pub async fn accept(self: &Arc<Self>, actor_id: &str, call_id: &str) {
        let outcome = {
            let mut core = self.core.write().await;
            let matched = match core.registry.get(call_id) {
                Some(record)
                    if record.callee == actor_id && record.status == CallStatus::Ringing =>
                {
                    Some(record.caller.clone())
                }
                _ => None,
            };
            match matched {
                Some(caller) => {
                    core.registry.set_status(call_id, CallStatus::Accepted);
                    core.directory
                        .set_availability(&caller, Availability::InCall);
                    core.directory
                        .set_availability(actor_id, Availability::InCall);
                    AcceptOutcome::Ready { caller }
                }
                None => AcceptOutcome::Invalid("call cannot be accepted by this user"),
            }
        };
        match outcome {
            AcceptOutcome::Invalid(message) => {
                debug!(call = %call_id, actor = %actor_id, "accept refused");
                self.deliver(
                    actor_id,
                    ServerEvent::CallFailed(CallFailed {
                        reason: CallFailureReason::InvalidCall,
                        message: message.to_string(),
                        call_id: Some(call_id.to_string()),
                    }),
                )
                .await;
            }
            AcceptOutcome::Ready { caller } => {
                self.cancel_ring_timer(call_id).await;
                self.metrics.mark_call_answered();
                info!(call = %call_id, callee = %actor_id, "call accepted");
                self.deliver(
                    &caller,
                    ServerEvent::CallAccepted(CallAccepted {
                        call_id: call_id.to_string(),
                        accepted_by: actor_id.to_string(),
                    }),
                )
                .await;
            }
        }
    }

    /// Rejection by anyone other than the callee of a ringing call is
    /// silently ignored; the rejecting side never sees an error.
    pub async fn reject(self: &Arc<Self>, actor_id: &str, call_id: &str) {
        let caller = {
            let mut core = self.core.write().await;
            let matched = match core.registry.get(call_id) {
                Some(record)
                    if record.callee == actor_id && record.status == CallStatus::Ringing =>
                {
                    Some(record.caller.clone())
                }
                _ => None,
            };
            if let Some(caller) = &matched {
                core.registry.remove(call_id);
                core.directory.set_availability(caller, Availability::Idle);
                core.directory.set_availability(actor_id, Availability::Idle);
            }
            matched
        };
        let Some(caller) = caller else {
            debug!(call = %call_id, actor = %actor_id, "reject ignored");
            return;
        };
        self.cancel_ring_timer(call_id).await;
        self.metrics.mark_call_ended();
        info!(call = %call_id, callee = %actor_id, "call rejected");
        self.deliver(
            &caller,
            ServerEvent::CallRejected(CallRejected {
                call_id: call_id.to_string(),
                rejected_by: actor_id.to_string(),
            }),
        )
        .await;
    }

    /// Either party may hang up; repeating it against an already-cleared
    /// call id is a no-op.
    pub async fn end(self: &Arc<Self>, actor_id: &str, call_id: &str) {
        let peer = {
            let mut core = self.core.write().await;
            let matched = match core.registry.get(call_id) {
                Some(record) if record.involves(actor_id) => {
                    record.other_party(actor_id).map(str::to_string)
                }
                _ => None,
            };
            if let Some(peer) = &matched {
                core.registry.remove(call_id);
                core.directory.set_availability(actor_id, Availability::Idle);
                core.directory.set_availability(peer, Availability::Idle);
            }
            matched
        };
        let Some(peer) = peer else {
            debug!(call = %call_id, actor = %actor_id, "end ignored");
            return;
        };
        self.cancel_ring_timer(call_id).await;
        self.metrics.mark_call_ended();
        info!(call = %call_id, ended_by = %actor_id, "call ended");
        self.deliver(
            &peer,
            ServerEvent::CallEnded(CallEnded {
                call_id: call_id.to_string(),
                ended_by: actor_id.to_string(),
                reason: Some(CallEndReason::Hangup),
            }),
        )
        .await;
    }

    async fn destroy_call(self: &Arc<Self>, call_id: &str) {
        let mut core = self.core.write().await;
        if let Some(record) = core.registry.remove(call_id) {
            core.directory
                .set_availability(&record.caller, Availability::Idle);
            core.directory
                .set_availability(&record.callee, Availability::Idle);
        }
    }

    async fn arm_ring_timer(self: &Arc<Self>, call_id: String) {
        let deadline = Duration::from_secs(self.config.ring_timeout_seconds);
        let state = Arc::clone(self);
        let timer_call_id = call_id.clone();
        // Pin the deadline now; sleeping inside the spawned task would
        // capture it at first poll, after an arbitrary scheduling delay.
        let sleep = tokio::time::sleep(deadline);
        let handle = tokio::spawn(async move {
            sleep.await;
            state.handle_ring_timeout(&timer_call_id).await;
        });
        if let Some(previous) = self.ring_timers.lock().await.insert(call_id, handle) {
            previous.abort();
        }
    }

    /// Deadline fire re-verifies status under the lock, so a call that
    /// already progressed past ringing is a no-op even when the timer was
    /// never aborted.
    pub async fn handle_ring_timeout(self: &Arc<Self>, call_id: &str) {
        self.ring_timers.lock().await.remove(call_id);
        let parties = {
            let mut core = self.core.write().await;
            let still_ringing = matches!(core.registry.status(call_id), Some(CallStatus::Ringing));
            if !still_ringing {
                None
            } else if let Some(record) = core.registry.remove(call_id) {
                core.directory
                    .set_availability(&record.caller, Availability::Idle);
                core.directory
                    .set_availability(&record.callee, Availability::Idle);
                let caller_sender = core.directory.live_sender(&record.caller);
                let callee_sender = core.directory.live_sender(&record.callee);
                Some((record, caller_sender, callee_sender))
            } else {
                None
            }
        };
        let Some((record, caller_sender, callee_sender)) = parties else {
            return;
        };
        self.metrics.mark_call_timed_out();
        info!(
            call = %call_id,
            caller = %record.caller,
            callee = %record.callee,
            "call timed out unanswered"
        );
        let event = CallTimeout {
            call_id: call_id.to_string(),
        };
        for sender in [caller_sender, callee_sender].into_iter().flatten() {
            let _ = sender.send(ServerEvent::CallTimeout(event.clone())).await;
        }
    }
}
