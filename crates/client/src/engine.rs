use catline_proto::call::MediaKind;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("media capture unavailable: {0}")]
    CaptureUnavailable(String),
    #[error("negotiation failure: {0}")]
    Negotiation(String),
    #[error("no active media session")]
    NoSession,
}

/// One peer media session. Implementations wrap whatever stack actually
/// produces descriptions and candidates; the engine only sequences them.
pub trait PeerSession {
    fn create_offer(&mut self) -> Result<Value, EngineError>;
    fn create_answer(&mut self, remote_offer: &Value) -> Result<Value, EngineError>;
    fn apply_remote_answer(&mut self, answer: &Value) -> Result<(), EngineError>;
    fn apply_remote_candidate(&mut self, candidate: &Value) -> Result<(), EngineError>;
    fn set_audio_enabled(&mut self, enabled: bool);
    fn set_video_enabled(&mut self, enabled: bool);
    fn close(&mut self);
}

pub trait SessionBackend {
    type Session: PeerSession;

    fn open_session(&mut self, media: MediaKind) -> Result<Self::Session, EngineError>;
}

/// Sequences one negotiation at a time. Remote candidates arriving before
/// the remote description are buffered and applied in arrival order once a
/// description lands; applying them earlier is a protocol error in every
/// session stack this fronts.
pub struct NegotiationEngine<B: SessionBackend> {
    backend: B,
    session: Option<B::Session>,
    pending_candidates: Vec<Value>,
    remote_described: bool,
}

impl<B: SessionBackend> NegotiationEngine<B> {
    pub fn new(backend: B) -> Self {
        NegotiationEngine {
            backend,
            session: None,
            pending_candidates: Vec::new(),
            remote_described: false,
        }
    }

    /// Opens a fresh session for the call. Any previous session is closed
    /// first, so capture never leaks across calls.
    pub fn start(&mut self, media: MediaKind) -> Result<(), EngineError> {
        self.teardown();
        self.session = Some(self.backend.open_session(media)?);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn create_offer(&mut self) -> Result<Value, EngineError> {
        self.session
            .as_mut()
            .ok_or(EngineError::NoSession)?
            .create_offer()
    }

    /// Callee path: the remote offer is the remote description, so buffered
    /// candidates flush right after the answer is produced.
    pub fn accept_offer(&mut self, remote_offer: &Value) -> Result<Value, EngineError> {
        let answer = self
            .session
            .as_mut()
            .ok_or(EngineError::NoSession)?
            .create_answer(remote_offer)?;
        self.remote_described = true;
        self.flush_pending()?;
        Ok(answer)
    }

    /// Caller path: the remote answer is the remote description.
    pub fn apply_answer(&mut self, answer: &Value) -> Result<(), EngineError> {
        self.session
            .as_mut()
            .ok_or(EngineError::NoSession)?
            .apply_remote_answer(answer)?;
        self.remote_described = true;
        self.flush_pending()
    }

    pub fn add_candidate(&mut self, candidate: Value) -> Result<(), EngineError> {
        if !self.remote_described {
            debug!(buffered = self.pending_candidates.len() + 1, "candidate buffered");
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.session
            .as_mut()
            .ok_or(EngineError::NoSession)?
            .apply_remote_candidate(&candidate)
    }

    fn flush_pending(&mut self) -> Result<(), EngineError> {
        let session = self.session.as_mut().ok_or(EngineError::NoSession)?;
        for candidate in self.pending_candidates.drain(..) {
            session.apply_remote_candidate(&candidate)?;
        }
        Ok(())
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) {
        if let Some(session) = self.session.as_mut() {
            session.set_audio_enabled(enabled);
        }
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        if let Some(session) = self.session.as_mut() {
            session.set_video_enabled(enabled);
        }
    }

    /// Closes the session and drops all negotiation state. Runs on every
    /// call teardown path, including failed ones, so capture devices are
    /// released no matter how the call went down.
    pub fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.pending_candidates.clear();
        self.remote_described = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct MockSession {
        ops: Rc<RefCell<Vec<String>>>,
        fail_answer: bool,
    }

    impl PeerSession for MockSession {
        fn create_offer(&mut self) -> Result<Value, EngineError> {
            self.ops.borrow_mut().push("offer".to_string());
            Ok(json!({"sdp": "offer"}))
        }

        fn create_answer(&mut self, _remote_offer: &Value) -> Result<Value, EngineError> {
            if self.fail_answer {
                return Err(EngineError::Negotiation("answer failed".to_string()));
            }
            self.ops.borrow_mut().push("answer".to_string());
            Ok(json!({"sdp": "answer"}))
        }

        fn apply_remote_answer(&mut self, _answer: &Value) -> Result<(), EngineError> {
            self.ops.borrow_mut().push("remote_answer".to_string());
            Ok(())
        }

        fn apply_remote_candidate(&mut self, candidate: &Value) -> Result<(), EngineError> {
            self.ops
                .borrow_mut()
                .push(format!("candidate:{}", candidate["id"]));
            Ok(())
        }

        fn set_audio_enabled(&mut self, enabled: bool) {
            self.ops.borrow_mut().push(format!("audio:{}", enabled));
        }

        fn set_video_enabled(&mut self, enabled: bool) {
            self.ops.borrow_mut().push(format!("video:{}", enabled));
        }

        fn close(&mut self) {
            self.ops.borrow_mut().push("close".to_string());
        }
    }

    struct MockBackend {
        ops: Rc<RefCell<Vec<String>>>,
        fail_open: bool,
        fail_answer: bool,
    }

    impl MockBackend {
        fn new() -> (Self, Rc<RefCell<Vec<String>>>) {
            let ops = Rc::new(RefCell::new(Vec::new()));
            (
                MockBackend {
                    ops: Rc::clone(&ops),
                    fail_open: false,
                    fail_answer: false,
                },
                ops,
            )
        }
    }

    impl SessionBackend for MockBackend {
        type Session = MockSession;

        fn open_session(&mut self, media: MediaKind) -> Result<MockSession, EngineError> {
            if self.fail_open {
                return Err(EngineError::CaptureUnavailable("no microphone".to_string()));
            }
            self.ops.borrow_mut().push(format!("open:{}", media.as_str()));
            Ok(MockSession {
                ops: Rc::clone(&self.ops),
                fail_answer: self.fail_answer,
            })
        }
    }

    #[test]
    fn candidates_buffer_until_remote_answer() {
        let (backend, ops) = MockBackend::new();
        let mut engine = NegotiationEngine::new(backend);
        engine.start(MediaKind::Voice).unwrap();

        engine.add_candidate(json!({"id": 1})).unwrap();
        engine.add_candidate(json!({"id": 2})).unwrap();
        assert!(!ops.borrow().iter().any(|op| op.starts_with("candidate")));

        engine.apply_answer(&json!({"sdp": "answer"})).unwrap();
        engine.add_candidate(json!({"id": 3})).unwrap();

        assert_eq!(
            ops.borrow().as_slice(),
            [
                "open:voice",
                "remote_answer",
                "candidate:1",
                "candidate:2",
                "candidate:3"
            ]
        );
    }

    #[test]
    fn accept_offer_flushes_buffered_candidates() {
        let (backend, ops) = MockBackend::new();
        let mut engine = NegotiationEngine::new(backend);
        engine.start(MediaKind::Video).unwrap();

        engine.add_candidate(json!({"id": 7})).unwrap();
        let answer = engine.accept_offer(&json!({"sdp": "offer"})).unwrap();
        assert_eq!(answer, json!({"sdp": "answer"}));
        assert_eq!(
            ops.borrow().as_slice(),
            ["open:video", "answer", "candidate:7"]
        );
    }

    #[test]
    fn candidates_without_session_still_buffer() {
        let (backend, _ops) = MockBackend::new();
        let mut engine = NegotiationEngine::new(backend);
        engine.add_candidate(json!({"id": 1})).unwrap();
        assert!(!engine.is_active());
    }

    #[test]
    fn teardown_closes_session_and_clears_state() {
        let (backend, ops) = MockBackend::new();
        let mut engine = NegotiationEngine::new(backend);
        engine.start(MediaKind::Voice).unwrap();
        engine.add_candidate(json!({"id": 1})).unwrap();

        engine.teardown();
        assert!(!engine.is_active());
        assert!(ops.borrow().contains(&"close".to_string()));

        // buffered candidates from the dead call must not leak forward
        engine.start(MediaKind::Voice).unwrap();
        engine.apply_answer(&json!({"sdp": "answer"})).unwrap();
        assert!(!ops.borrow().iter().any(|op| op.starts_with("candidate")));
    }

    #[test]
    fn restart_closes_previous_session() {
        let (backend, ops) = MockBackend::new();
        let mut engine = NegotiationEngine::new(backend);
        engine.start(MediaKind::Voice).unwrap();
        engine.start(MediaKind::Video).unwrap();
        assert_eq!(
            ops.borrow().as_slice(),
            ["open:voice", "close", "open:video"]
        );
    }

    #[test]
    fn failed_answer_surfaces_error() {
        let (mut backend, _ops) = MockBackend::new();
        backend.fail_answer = true;
        let mut engine = NegotiationEngine::new(backend);
        engine.start(MediaKind::Voice).unwrap();
        assert!(matches!(
            engine.accept_offer(&json!({"sdp": "offer"})),
            Err(EngineError::Negotiation(_))
        ));
    }

    #[test]
    fn failed_open_leaves_engine_inactive() {
        let (mut backend, _ops) = MockBackend::new();
        backend.fail_open = true;
        let mut engine = NegotiationEngine::new(backend);
        assert!(matches!(
            engine.start(MediaKind::Voice),
            Err(EngineError::CaptureUnavailable(_))
        ));
        assert!(!engine.is_active());
    }

    #[test]
    fn toggles_reach_the_session() {
        let (backend, ops) = MockBackend::new();
        let mut engine = NegotiationEngine::new(backend);
        engine.start(MediaKind::Video).unwrap();
        engine.set_audio_enabled(false);
        engine.set_video_enabled(true);
        assert_eq!(
            ops.borrow().as_slice(),
            ["open:video", "audio:false", "video:true"]
        );
    }
}
