use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use tokio::select;
use tokio::sync::{oneshot, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};
use crate::ack_message::DataAck;
use crate::config::NudpConfig;
use crate::connection_key::ConnectionKey;
use crate::end_point::ConnectionRegistry;
use crate::error::{NudpError, NudpResult};
use crate::message_handler::MessageHandler;
use crate::packet_header::{PacketHeader, PacketType};
use crate::receive_buffer::ReceiveBuffer;
use crate::send_socket::SendSocket;
use crate::send_window::{SendWindow, SendWindowLimits};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    Init,
    Connected,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub send_window_len: usize,
    pub send_window_bytes: usize,
    pub queued_messages: usize,
    pub next_send_seq: u64,
    pub next_expected_seq: u64,
    pub buffered_out_of_order: usize,
}

struct ConnectionInner {
    state: ConnectionState,
    connect_waiters: Vec<oneshot::Sender<NudpResult<()>>>,

    send_window: SendWindow,
    receive_buffer: ReceiveBuffer,

    auth_token: Option<Vec<u8>>,

    syn_handle: Option<JoinHandle<()>>,
    pacing_handle: Option<JoinHandle<()>>,
    ack_flush_handle: Option<JoinHandle<()>>,
}

impl ConnectionInner {
    fn abort_tasks(&mut self) {
        for handle in [self.syn_handle.take(), self.pacing_handle.take(), self.ack_flush_handle.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// One NUDP connection: the handshake state machine plus the send and receive pipelines.
///
/// All mutable state sits behind a single per-connection lock, so the packet handlers, the timer
///  driven tasks (SYN retry, pacing, delayed ack flush) and application calls are serialized
///  per connection. Upcalls to the [MessageHandler] are made after the lock is released.
pub struct Connection {
    key: ConnectionKey,
    config: Arc<NudpConfig>,
    inner: RwLock<ConnectionInner>,
    send_notify: Notify,
    socket: Arc<dyn SendSocket>,
    message_handler: Arc<dyn MessageHandler>,
    registry: Weak<ConnectionRegistry>,
}

impl Connection {
    pub(crate) fn new(
        key: ConnectionKey,
        config: Arc<NudpConfig>,
        socket: Arc<dyn SendSocket>,
        message_handler: Arc<dyn MessageHandler>,
        registry: Weak<ConnectionRegistry>,
    ) -> Connection {
        let inner = ConnectionInner {
            state: ConnectionState::Init,
            connect_waiters: Vec::new(),
            send_window: SendWindow::new(key.epoch, SendWindowLimits::from(config.as_ref())),
            receive_buffer: ReceiveBuffer::new(config.window_length_max),
            auth_token: None,
            syn_handle: None,
            pacing_handle: None,
            ack_flush_handle: None,
        };

        Connection {
            key,
            config,
            inner: RwLock::new(inner),
            send_notify: Notify::new(),
            socket,
            message_handler,
            registry,
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    pub async fn stats(&self) -> ConnectionStats {
        let inner = self.inner.read().await;
        ConnectionStats {
            state: inner.state,
            send_window_len: inner.send_window.window_len(),
            send_window_bytes: inner.send_window.window_bytes(),
            queued_messages: inner.send_window.queue_len(),
            next_send_seq: inner.send_window.next_seq().to_raw(),
            next_expected_seq: inner.receive_buffer.next_expected().to_raw(),
            buffered_out_of_order: inner.receive_buffer.num_buffered(),
        }
    }

    /// Stores an opaque bearer token for the layer above. The transport neither sends nor
    ///  protects it.
    pub async fn authenticate(&self, auth_token: &[u8]) {
        self.inner.write().await.auth_token = Some(auth_token.to_vec());
    }

    pub async fn auth_token(&self) -> Option<Vec<u8>> {
        self.inner.read().await.auth_token.clone()
    }

    /// Resolves once the handshake completed, or fails if it is exhausted or the connection is
    ///  closed first.
    pub async fn wait_connected(&self) -> NudpResult<()> {
        let receiver = {
            let mut inner = self.inner.write().await;
            match inner.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(NudpError::ConnectionClosed),
                ConnectionState::Init => {
                    let (sender, receiver) = oneshot::channel();
                    inner.connect_waiters.push(sender);
                    receiver
                }
            }
        };

        receiver.await
            .unwrap_or(Err(NudpError::ConnectionClosed))
    }

    /// Sends a message, resolving when every packet of it is acknowledged by the peer.
    ///
    /// Messages sent before the handshake completes are queued and go out once the connection
    ///  is established.
    pub async fn send(&self, message: &[u8]) -> NudpResult<()> {
        let receiver = {
            let mut inner = self.inner.write().await;
            if inner.state == ConnectionState::Closed {
                return Err(NudpError::ConnectionClosed);
            }
            debug!("{}: registering message of length {} for sending", self.key, message.len());
            inner.send_window.enqueue(Bytes::copy_from_slice(message))?
        };
        self.send_notify.notify_one();

        receiver.await
            .unwrap_or(Err(NudpError::ConnectionClosed))
    }

    /// Idempotent teardown: sends FIN (unless closed before), fails every pending send and
    ///  connect with [NudpError::ConnectionClosed], discards all buffers and removes the
    ///  connection from its registry.
    pub async fn close(&self) {
        let (waiters, completions) = {
            let mut inner = self.inner.write().await;
            if inner.state == ConnectionState::Closed {
                trace!("{}: already closed", self.key);
                return;
            }
            inner.state = ConnectionState::Closed;
            inner.abort_tasks();
            inner.receive_buffer.clear();
            (mem::take(&mut inner.connect_waiters), inner.send_window.drain())
        };

        debug!("{}: closing connection, failing {} pending sends", self.key, completions.len());

        self.send_control(PacketType::Fin, 0).await;

        for waiter in waiters {
            let _ = waiter.send(Err(NudpError::ConnectionClosed));
        }
        for completion in completions {
            let _ = completion.send(Err(NudpError::ConnectionClosed));
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key).await;
        }
    }

    /// initiator side: send SYNs until the peer answers or the attempts are exhausted
    pub(crate) async fn start_handshake(self: &Arc<Self>) {
        let mut inner = self.inner.write().await;
        if inner.syn_handle.is_some() || inner.state != ConnectionState::Init {
            return;
        }
        inner.syn_handle = Some(tokio::spawn(self.clone().syn_loop()));
    }

    async fn syn_loop(self: Arc<Self>) {
        for attempt in 1..=self.config.syn_attempts {
            if self.state().await != ConnectionState::Init {
                return;
            }
            debug!("{}: sending SYN attempt {}", self.key, attempt);
            self.send_control(PacketType::Syn, attempt).await;
            sleep(self.config.syn_attempt_delay).await;
        }

        let waiters = {
            let mut inner = self.inner.write().await;
            if inner.state != ConnectionState::Init {
                return;
            }
            // detach from this task so that close() does not abort it
            inner.syn_handle = None;
            mem::take(&mut inner.connect_waiters)
        };

        warn!("{}: no reply after {} SYN attempts - giving up", self.key, self.config.syn_attempts);
        for waiter in waiters {
            let _ = waiter.send(Err(NudpError::HandshakeExhausted));
        }
        self.message_handler.on_connection_error(&self.key, &NudpError::HandshakeExhausted).await;
        self.close().await;
    }

    /// dispatch of a packet that was demultiplexed to this connection
    pub(crate) async fn on_packet(self: &Arc<Self>, header: &PacketHeader, payload: &[u8]) -> NudpResult<()> {
        if self.state().await == ConnectionState::Closed {
            // NB: never answer a FIN with a FIN, two closed peers would keep bouncing them
            if header.packet_type != PacketType::Fin {
                trace!("{}: received {:?} on closed connection - replying with FIN", self.key, header.packet_type);
                self.send_control(PacketType::Fin, 0).await;
            }
            return Ok(());
        }

        match header.packet_type {
            PacketType::Syn => self.on_syn(header.seq).await,
            PacketType::SynAck => self.on_syn_ack(header.seq).await,
            PacketType::Fin => self.on_fin().await,
            PacketType::Data => return self.on_data(header, payload).await,
            PacketType::DataAck => return self.on_data_ack(payload).await,
        }
        Ok(())
    }

    async fn on_syn(self: &Arc<Self>, attempt: u64) {
        let reply = {
            let mut inner = self.inner.write().await;
            trace!("{}: received SYN attempt {} in state {:?}", self.key, attempt, inner.state);

            if inner.state == ConnectionState::Init {
                self.do_set_connected(&mut inner);
            }
            match inner.state {
                ConnectionState::Connected => PacketType::SynAck,
                _ => PacketType::Fin,
            }
        };

        match reply {
            PacketType::SynAck => self.send_control(PacketType::SynAck, attempt).await,
            _ => self.send_control(PacketType::Fin, 0).await,
        }
    }

    async fn on_syn_ack(self: &Arc<Self>, attempt: u64) {
        let mut inner = self.inner.write().await;
        trace!("{}: received SYN_ACK for attempt {} in state {:?}", self.key, attempt, inner.state);

        if inner.state == ConnectionState::Init {
            self.do_set_connected(&mut inner);
        }
    }

    async fn on_fin(&self) {
        debug!("{}: received FIN", self.key);
        self.close().await;
    }

    fn do_set_connected(self: &Arc<Self>, inner: &mut ConnectionInner) {
        debug!("{}: connected", self.key);
        inner.state = ConnectionState::Connected;
        for waiter in inner.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        if inner.pacing_handle.is_none() {
            inner.pacing_handle = Some(tokio::spawn(self.clone().pacing_loop()));
        }
    }

    async fn on_data(self: &Arc<Self>, header: &PacketHeader, payload: &[u8]) -> NudpResult<()> {
        let messages = {
            let mut inner = self.inner.write().await;
            if inner.state != ConnectionState::Connected {
                return Err(NudpError::ProtocolViolation(format!("DATA in state {:?}", inner.state)));
            }

            trace!("{}: received DATA #{} with {} bytes", self.key, header.seq, payload.len());
            let messages = inner.receive_buffer.on_data(header.packet_id(), header.is_boundary_end(), Bytes::copy_from_slice(payload))?;

            if inner.receive_buffer.has_delayed_acks() && inner.ack_flush_handle.is_none() {
                let conn = self.clone();
                let ack_delay = self.config.ack_delay;
                inner.ack_flush_handle = Some(tokio::spawn(async move {
                    sleep(ack_delay).await;
                    conn.flush_delayed_acks().await;
                }));
            }
            messages
        };

        for message in messages {
            self.message_handler.on_message(&self.key, &message).await;
        }
        Ok(())
    }

    async fn flush_delayed_acks(&self) {
        let packets = {
            let mut inner = self.inner.write().await;
            inner.ack_flush_handle = None;
            if inner.state != ConnectionState::Connected {
                return;
            }
            let acks = inner.receive_buffer.take_delayed_acks();
            trace!("{}: flushing {} delayed acks", self.key, acks.len());
            DataAck::build_packets(self.key.epoch, self.config.mtu, &acks)
        };

        for packet in packets {
            self.transmit(&packet).await;
        }
    }

    async fn on_data_ack(&self, mut payload: &[u8]) -> NudpResult<()> {
        let ack = DataAck::deser(&mut payload);

        let mut inner = self.inner.write().await;
        if inner.state != ConnectionState::Connected {
            return Err(NudpError::ProtocolViolation(format!("DATA_ACK in state {:?}", inner.state)));
        }

        trace!("{}: received DATA_ACK for {} packets", self.key, ack.acked.len());
        inner.send_window.on_ack(&ack.acked);

        if inner.send_window.has_unsegmented_messages() {
            self.send_notify.notify_one();
        }
        Ok(())
    }

    /// Runs pacing passes for as long as the connection lives, sleeping for the delay each pass
    ///  returns or until new messages are queued.
    async fn pacing_loop(self: Arc<Self>) {
        loop {
            let next_delay = self.do_pacing_pass().await;
            trace!("{}: next pacing pass in {:?}", self.key, next_delay);

            select! {
                _ = sleep(next_delay) => {}
                _ = self.send_notify.notified() => {}
            }
        }
    }

    async fn do_pacing_pass(&self) -> Duration {
        let pass = {
            let mut inner = self.inner.write().await;
            if inner.state != ConnectionState::Connected {
                return self.config.send_delay_max;
            }
            inner.send_window.pacing_pass(Instant::now())
        };

        // NB: the lock is released here so that acks and data are processed during a long batch
        for packet in &pass.packets {
            self.transmit(packet).await;
        }
        pass.next_delay
    }

    async fn send_control(&self, packet_type: PacketType, seq: u64) {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN);
        PacketHeader::control(packet_type, self.key.epoch, seq)
            .ser(&mut buf);
        self.transmit(&buf).await;
    }

    /// NB: Send failures are reported but not retried here - DATA packets stay in the window and
    ///      are retransmitted by the pacing loop
    async fn transmit(&self, packet: &[u8]) {
        if let Err(e) = self.socket.do_send_packet(self.key.peer_addr, packet).await {
            warn!("{}: sending packet failed: {}", self.key, e);
            self.message_handler.on_connection_error(&self.key, &e).await;
        }
    }
}
