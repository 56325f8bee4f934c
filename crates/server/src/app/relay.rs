use super::AppState;
use crate::registry::CallStatus;
use catline_proto::call::{CallFailed, CallFailureReason, NegotiationSignal, ServerEvent};
use std::sync::Arc;
use tracing::{debug, warn};

impl AppState {
    /// Offers travel caller to callee only. The payload stays opaque; the
    /// relay only stamps the sender identity before forwarding.
    pub async fn relay_offer(self: &Arc<Self>, sender_id: &str, signal: NegotiationSignal) {
        let target = {
            let core = self.core.read().await;
            match core.registry.get(&signal.call_id) {
                Some(record) if record.caller == sender_id => Some(record.callee.clone()),
                _ => None,
            }
        };
        match target {
            Some(callee) => {
                self.forward(sender_id, &callee, signal, ServerEvent::Offer)
                    .await
            }
            None => self.refuse_signal(sender_id, &signal.call_id, "offer refused").await,
        }
    }

    /// Answers travel callee to caller, and the first answer on an accepted
    /// call advances it to connected.
    pub async fn relay_answer(self: &Arc<Self>, sender_id: &str, signal: NegotiationSignal) {
        let target = {
            let mut core = self.core.write().await;
            let matched = match core.registry.get(&signal.call_id) {
                Some(record) if record.callee == sender_id => {
                    Some((record.caller.clone(), record.status))
                }
                _ => None,
            };
            match matched {
                Some((caller, CallStatus::Accepted)) => {
                    core.registry.set_status(&signal.call_id, CallStatus::Connected);
                    self.metrics.mark_call_connected();
                    Some(caller)
                }
                Some((caller, CallStatus::Connected)) => Some(caller),
                _ => None,
            }
        };
        match target {
            Some(caller) => {
                self.forward(sender_id, &caller, signal, ServerEvent::Answer)
                    .await
            }
            None => self.refuse_signal(sender_id, &signal.call_id, "answer refused").await,
        }
    }

    /// Candidates flow both ways for the lifetime of the record. A candidate
    /// for an unknown call is dropped without an error; trickle candidates
    /// routinely outlive short calls.
    pub async fn relay_candidate(self: &Arc<Self>, sender_id: &str, signal: NegotiationSignal) {
        let target = {
            let core = self.core.read().await;
            core.registry
                .get(&signal.call_id)
                .and_then(|record| record.other_party(sender_id))
                .map(str::to_string)
        };
        match target {
            Some(peer) => {
                self.forward(sender_id, &peer, signal, ServerEvent::Candidate)
                    .await
            }
            None => {
                debug!(call = %signal.call_id, sender = %sender_id, "candidate dropped");
            }
        }
    }

    async fn forward(
        self: &Arc<Self>,
        sender_id: &str,
        target: &str,
        mut signal: NegotiationSignal,
        wrap: fn(NegotiationSignal) -> ServerEvent,
    ) {
        signal.from_user_id = Some(sender_id.to_string());
        self.metrics.mark_signal_relayed();
        if !self.deliver(target, wrap(signal)).await {
            warn!(target = %target, "negotiation forward failed");
        }
    }

    async fn refuse_signal(self: &Arc<Self>, sender_id: &str, call_id: &str, message: &str) {
        debug!(call = %call_id, sender = %sender_id, detail = message, "negotiation signal refused");
        self.deliver(
            sender_id,
            ServerEvent::CallFailed(CallFailed {
                reason: CallFailureReason::InvalidCall,
                message: message.to_string(),
                call_id: Some(call_id.to_string()),
            }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use catline_proto::call::{CallInitiate, MediaKind};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            metrics_bind: None,
            connection_keepalive: 60,
            ring_timeout_seconds: 30,
            outbound_queue_depth: 16,
        }
    }

    async fn connect(state: &Arc<AppState>, user: &str) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(16);
        state.register_connection(user, tx).await;
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn signal(call_id: &str, payload: serde_json::Value) -> NegotiationSignal {
        NegotiationSignal {
            call_id: call_id.to_string(),
            payload,
            from_user_id: None,
        }
    }

    /// Sets up an accepted call between users "1" (caller) and "2" (callee)
    /// and returns the call id plus both receivers, drained.
    async fn accepted_call(
        state: &Arc<AppState>,
    ) -> (String, mpsc::Receiver<ServerEvent>, mpsc::Receiver<ServerEvent>) {
        let mut caller_rx = connect(state, "1").await;
        let mut callee_rx = connect(state, "2").await;
        state
            .initiate(
                "1",
                CallInitiate {
                    target_user_id: "2".to_string(),
                    chat_id: "c1".to_string(),
                    media_kind: MediaKind::Video,
                },
            )
            .await;
        let call_id = match drain(&mut callee_rx).remove(0) {
            ServerEvent::IncomingCall(incoming) => incoming.call_id,
            other => panic!("unexpected event: {:?}", other),
        };
        state.accept("2", &call_id).await;
        drain(&mut caller_rx);
        (call_id, caller_rx, callee_rx)
    }

    #[tokio::test]
    async fn offer_forwards_to_callee_with_sender_stamp() {
        let state = AppState::new(test_config());
        let (call_id, mut caller_rx, mut callee_rx) = accepted_call(&state).await;

        state
            .relay_offer("1", signal(&call_id, json!({"sdp": "v=0 offer"})))
            .await;

        let events = drain(&mut callee_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::Offer(forwarded) => {
                assert_eq!(forwarded.call_id, call_id);
                assert_eq!(forwarded.from_user_id.as_deref(), Some("1"));
                assert_eq!(forwarded.payload, json!({"sdp": "v=0 offer"}));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(drain(&mut caller_rx).is_empty());
    }

    #[tokio::test]
    async fn offer_from_callee_is_refused() {
        let state = AppState::new(test_config());
        let (call_id, mut caller_rx, mut callee_rx) = accepted_call(&state).await;

        state
            .relay_offer("2", signal(&call_id, json!({"sdp": "v=0"})))
            .await;

        let events = drain(&mut callee_rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::CallFailed(failed)]
                if failed.reason == CallFailureReason::InvalidCall
        ));
        assert!(drain(&mut caller_rx).is_empty());
    }

    #[tokio::test]
    async fn answer_advances_accepted_call_to_connected() {
        let state = AppState::new(test_config());
        let (call_id, mut caller_rx, _callee_rx) = accepted_call(&state).await;

        state
            .relay_answer("2", signal(&call_id, json!({"sdp": "v=0 answer"})))
            .await;

        let events = drain(&mut caller_rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::Answer(forwarded) => {
                assert_eq!(forwarded.from_user_id.as_deref(), Some("2"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            state.core.read().await.registry.status(&call_id),
            Some(CallStatus::Connected)
        );

        // a renegotiated answer on a connected call still forwards
        state
            .relay_answer("2", signal(&call_id, json!({"sdp": "v=1 answer"})))
            .await;
        assert!(matches!(
            drain(&mut caller_rx).as_slice(),
            [ServerEvent::Answer(_)]
        ));
    }

    #[tokio::test]
    async fn answer_before_accept_is_refused() {
        let state = AppState::new(test_config());
        let mut caller_rx = connect(&state, "1").await;
        let mut callee_rx = connect(&state, "2").await;
        state
            .initiate(
                "1",
                CallInitiate {
                    target_user_id: "2".to_string(),
                    chat_id: "c1".to_string(),
                    media_kind: MediaKind::Voice,
                },
            )
            .await;
        let call_id = match drain(&mut callee_rx).remove(0) {
            ServerEvent::IncomingCall(incoming) => incoming.call_id,
            other => panic!("unexpected event: {:?}", other),
        };

        state
            .relay_answer("2", signal(&call_id, json!({"sdp": "v=0"})))
            .await;

        assert!(matches!(
            drain(&mut callee_rx).as_slice(),
            [ServerEvent::CallFailed(failed)]
                if failed.reason == CallFailureReason::InvalidCall
        ));
        assert!(drain(&mut caller_rx).is_empty());
    }

    #[tokio::test]
    async fn candidates_flow_both_directions() {
        let state = AppState::new(test_config());
        let (call_id, mut caller_rx, mut callee_rx) = accepted_call(&state).await;

        state
            .relay_candidate("1", signal(&call_id, json!({"candidate": "a"})))
            .await;
        state
            .relay_candidate("2", signal(&call_id, json!({"candidate": "b"})))
            .await;

        assert!(matches!(
            drain(&mut callee_rx).as_slice(),
            [ServerEvent::Candidate(forwarded)]
                if forwarded.from_user_id.as_deref() == Some("1")
        ));
        assert!(matches!(
            drain(&mut caller_rx).as_slice(),
            [ServerEvent::Candidate(forwarded)]
                if forwarded.from_user_id.as_deref() == Some("2")
        ));
    }

    #[tokio::test]
    async fn candidate_for_unknown_call_dropped_silently() {
        let state = AppState::new(test_config());
        let mut caller_rx = connect(&state, "1").await;

        state
            .relay_candidate("1", signal("no-such-call", json!({"candidate": "x"})))
            .await;

        assert!(drain(&mut caller_rx).is_empty());
    }

    #[tokio::test]
    async fn candidate_from_outsider_dropped_silently() {
        let state = AppState::new(test_config());
        let (call_id, mut caller_rx, mut callee_rx) = accepted_call(&state).await;
        let mut outsider_rx = connect(&state, "3").await;

        state
            .relay_candidate("3", signal(&call_id, json!({"candidate": "x"})))
            .await;

        assert!(drain(&mut caller_rx).is_empty());
        assert!(drain(&mut callee_rx).is_empty());
        assert!(drain(&mut outsider_rx).is_empty());
    }
}
