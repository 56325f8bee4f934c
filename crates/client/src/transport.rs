use catline_proto::call::ClientEvent;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound half of the signaling connection. The orchestrator never reads
/// from the transport directly; inbound server events are pushed into
/// [`crate::orchestrator::CallOrchestrator::handle_event`] by whoever owns
/// the socket.
pub trait SignalTransport {
    fn send(&mut self, event: ClientEvent) -> Result<(), TransportError>;
}
