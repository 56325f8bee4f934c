//! Client-side call machinery: the orchestrator owns the call lifecycle
//! state machine, the negotiation engine owns the media session, and the
//! transport trait decouples both from the actual socket.

pub mod engine;
pub mod orchestrator;
pub mod transport;

pub use engine::{EngineError, NegotiationEngine, PeerSession, SessionBackend};
pub use orchestrator::{CallError, CallOrchestrator, CallPhase, CallView};
pub use transport::{SignalTransport, TransportError};
