use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};
use crate::error::{NudpError, NudpResult};

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing. The socket is shared by all connections of an endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> NudpResult<()>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> NudpResult<()> {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        match self.send_to(packet_buf, to).await {
            Ok(written) if written == packet_buf.len() => Ok(()),
            Ok(written) => {
                error!("short write sending UDP packet to {:?}: {} of {} bytes", to, written, packet_buf.len());
                Err(NudpError::ShortWrite { expected: packet_buf.len(), written })
            }
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                Err(NudpError::Transport(e.to_string()))
            }
        }
    }
}
