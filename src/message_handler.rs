use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::connection_key::ConnectionKey;
use crate::error::NudpError;

/// Upcalls from the transport to the layer above it (typically RPC framing)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// a complete, reassembled message
    async fn on_message(&self, connection: &ConnectionKey, msg_buf: &[u8]);

    /// a peer's SYN created a new connection on this endpoint
    async fn on_new_connection(&self, connection: &ConnectionKey);

    /// socket send failures and handshake exhaustion
    async fn on_connection_error(&self, connection: &ConnectionKey, error: &NudpError);
}
