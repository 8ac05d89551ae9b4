use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::anyhow;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::config::NudpConfig;
use crate::connection::Connection;
use crate::connection_key::{ConnectionEpoch, ConnectionKey};
use crate::error::{NudpError, NudpResult};
use crate::message_handler::MessageHandler;
use crate::packet_header::{PacketHeader, PacketType};
use crate::send_socket::SendSocket;

#[derive(Default)]
struct RegistryMaps {
    by_key: FxHashMap<ConnectionKey, Arc<Connection>>,
    /// connections this endpoint initiated, for making `connect` idempotent per peer
    outbound_by_peer: FxHashMap<SocketAddr, ConnectionKey>,
}

/// All live connections of an endpoint. A connection removes itself when it is closed.
#[derive(Default)]
pub(crate) struct ConnectionRegistry {
    maps: RwLock<RegistryMaps>,
}

impl ConnectionRegistry {
    pub async fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.maps.read().await
            .by_key.get(key)
            .cloned()
    }

    #[cfg(test)]
    pub async fn insert(&self, connection: Arc<Connection>) {
        self.maps.write().await
            .by_key.insert(*connection.key(), connection);
    }

    /// returns the registered connection and `true` if it was created by this call
    pub async fn get_or_insert(&self, key: ConnectionKey, create: impl FnOnce() -> Arc<Connection>) -> (Arc<Connection>, bool) {
        let mut maps = self.maps.write().await;
        if let Some(existing) = maps.by_key.get(&key) {
            return (existing.clone(), false);
        }
        let connection = create();
        maps.by_key.insert(key, connection.clone());
        (connection, true)
    }

    pub async fn get_or_insert_outbound(&self, peer_addr: SocketAddr, create: impl FnOnce() -> anyhow::Result<Arc<Connection>>) -> anyhow::Result<Arc<Connection>> {
        let mut maps = self.maps.write().await;
        if let Some(key) = maps.outbound_by_peer.get(&peer_addr) {
            if let Some(existing) = maps.by_key.get(key) {
                return Ok(existing.clone());
            }
        }

        let connection = create()?;
        let key = *connection.key();
        maps.outbound_by_peer.insert(peer_addr, key);
        maps.by_key.insert(key, connection.clone());
        Ok(connection)
    }

    pub async fn remove(&self, key: &ConnectionKey) {
        let mut maps = self.maps.write().await;
        if maps.by_key.remove(key).is_some() {
            trace!("{}: removed from registry", key);
        }
        if maps.outbound_by_peer.get(&key.peer_addr) == Some(key) {
            maps.outbound_by_peer.remove(&key.peer_addr);
        }
    }

    pub async fn all(&self) -> Vec<Arc<Connection>> {
        self.maps.read().await
            .by_key.values()
            .cloned()
            .collect()
    }
}

/// EndPoint is the place where all parts of the protocol come together: It listens on a
///  UdpSocket, demultiplexes incoming datagrams to their connections (creating connections for
///  incoming SYNs), and has the API for application code to connect, send and close.
pub struct EndPoint {
    config: Arc<NudpConfig>,
    message_handler: Arc<dyn MessageHandler>,
    registry: Arc<ConnectionRegistry>,
    /// present while listening, taken out by `shutdown`
    socket: RwLock<Option<Arc<dyn SendSocket>>>,
    recv_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EndPoint {
    pub fn new(config: NudpConfig, message_handler: Arc<dyn MessageHandler>) -> anyhow::Result<EndPoint> {
        config.validate()?;

        Ok(EndPoint {
            config: Arc::new(config),
            message_handler,
            registry: Default::default(),
            socket: RwLock::new(None),
            recv_loop_handle: Mutex::new(None),
        })
    }

    /// Binds the UDP socket and starts dispatching received datagrams. Returns the actually
    ///  bound address, which is useful when binding to port 0.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let mut socket_slot = self.socket.write().await;
        if socket_slot.is_some() {
            return Err(NudpError::AlreadyListening.into());
        }

        //TODO "don't fragment" flag
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let send_socket: Arc<dyn SendSocket> = Arc::new(socket.clone());
        *socket_slot = Some(send_socket);
        drop(socket_slot);
        info!("listening on {:?}", local_addr);

        let handle = tokio::spawn(self.clone().recv_loop(socket));
        *self.recv_loop_handle.lock().await = Some(handle);
        Ok(local_addr)
    }

    pub(crate) async fn attach_socket(&self, socket: Arc<dyn SendSocket>) -> NudpResult<()> {
        let mut socket_slot = self.socket.write().await;
        if socket_slot.is_some() {
            return Err(NudpError::AlreadyListening);
        }
        *socket_slot = Some(socket);
        Ok(())
    }

    async fn send_socket(&self) -> anyhow::Result<Arc<dyn SendSocket>> {
        self.socket.read().await
            .clone()
            .ok_or_else(|| anyhow!("endpoint is not listening"))
    }

    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; NudpConfig::MTU_MAX];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            self.on_datagram(from, &buf[..num_read])
                .instrument(span)
                .await;
        }
    }

    pub(crate) async fn on_datagram(&self, from: SocketAddr, buf: &[u8]) {
        trace!("received {} bytes from {:?}", buf.len(), from);

        let Some(socket) = self.socket.read().await.clone() else {
            debug!("received datagram while not listening - dropping");
            return;
        };

        let mut parse_buf = buf;
        let header = match PacketHeader::deser(&mut parse_buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("received packet with unparsable header from {:?}, dropping: {}", from, e);
                return;
            }
        };

        let key = ConnectionKey::new(from, header.epoch);
        let (connection, is_new) = match self.registry.get(&key).await {
            Some(connection) => (connection, false),
            None if header.packet_type == PacketType::Syn => {
                self.registry.get_or_insert(key, || Arc::new(self.new_connection(key, socket.clone()))).await
            }
            None => {
                if header.packet_type != PacketType::Fin {
                    trace!("{}: received {:?} for unknown connection - replying with FIN", key, header.packet_type);
                    Self::send_fin_for_unknown(socket.as_ref(), key).await;
                }
                return;
            }
        };

        if is_new {
            debug!("{}: new inbound connection", key);
        }

        if let Err(e) = connection.on_packet(&header, parse_buf).await {
            warn!("{}: dropping {:?} packet #{}: {}", key, header.packet_type, header.seq, e);
        }

        if is_new {
            self.message_handler.on_new_connection(&key).await;
        }
    }

    async fn send_fin_for_unknown(socket: &dyn SendSocket, key: ConnectionKey) {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN);
        PacketHeader::control(PacketType::Fin, key.epoch, 0)
            .ser(&mut buf);

        if let Err(e) = socket.do_send_packet(key.peer_addr, &buf).await {
            debug!("{}: sending FIN failed: {}", key, e);
        }
    }

    fn new_connection(&self, key: ConnectionKey, socket: Arc<dyn SendSocket>) -> Connection {
        Connection::new(
            key,
            self.config.clone(),
            socket,
            self.message_handler.clone(),
            Arc::downgrade(&self.registry),
        )
    }

    /// Returns the connection to a peer, performing the handshake if there is no connection
    ///  yet. Concurrent calls for the same peer share a single handshake.
    pub async fn connect(&self, peer_addr: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        let socket = self.send_socket().await?;

        let connection = self.registry.get_or_insert_outbound(peer_addr, || {
            let key = ConnectionKey::new(peer_addr, ConnectionEpoch::generate()?);
            debug!("{}: new outbound connection", key);
            Ok(Arc::new(self.new_connection(key, socket)))
        }).await?;

        connection.start_handshake().await;
        connection.wait_connected().await?;
        Ok(connection)
    }

    pub async fn connection(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.registry.get(key).await
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.all().await
    }

    pub async fn send(&self, key: &ConnectionKey, message: &[u8]) -> NudpResult<()> {
        match self.registry.get(key).await {
            Some(connection) => connection.send(message).await,
            None => Err(NudpError::ConnectionClosed),
        }
    }

    pub async fn close(&self, key: &ConnectionKey) {
        if let Some(connection) = self.registry.get(key).await {
            connection.close().await;
        }
    }

    /// Closes all connections, stops the receive loop and releases the socket. The endpoint can
    ///  `listen` again afterwards.
    pub async fn shutdown(&self) {
        for connection in self.registry.all().await {
            connection.close().await;
        }

        let recv_loop_handle = self.recv_loop_handle.lock().await.take();
        if let Some(handle) = recv_loop_handle {
            info!("stopping receive loop");
            handle.abort();
            // the aborted loop owns a reference to the socket, wait for it to be dropped
            let _ = handle.await;
        }

        if self.socket.write().await.take().is_some() {
            debug!("released socket");
        }
    }
}
