//! Raw channel: fire one message at a destination handle.

use async_trait::async_trait;

use crate::protocol::Message;
use crate::window::Handle;
use crate::wire::EncodeError;

/// Outbound half of the channel. Delivery is not guaranteed; `Ok` only means
/// the message left this peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `message` to `destination`, restricted to `target_origin`
    /// (`*` for any). Hosts drop messages whose destination origin differs.
    async fn send_message(
        &self,
        destination: &Handle,
        target_origin: &str,
        message: Message,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("destination is closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport rejected message: {0}")]
    Rejected(String),
}
