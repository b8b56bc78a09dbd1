//! TCP transport layer
//!
//! One listener accepts sessions, `dial` opens them. Both sides exchange a
//! `Hello` carrying their node id before any stream message flows. Each
//! session gets a reader task that forwards frames as [`TransportEvent`]s and
//! a writer task fed by a guarded channel.

use crate::channel::{guarded_channel, ChannelError, GuardedReceiver, GuardedSender};
use crate::framing::{Frame, FrameCodec, FrameError};
use crate::message::{Message, MsgCode, SessionKind};
use crate::peer::{PeerId, PeerInfo};
use bytes::BytesMut;
use parking_lot::RwLock;
use replica_core::Eid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_BUFFER: usize = 256;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
    #[error("Already connected to peer: {0}")]
    AlreadyConnected(PeerId),
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

impl TransportError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            TransportError::AlreadyConnected(_) => replica_core::ErrorKind::Conflict,
            TransportError::Handshake(_) => replica_core::ErrorKind::Authority,
            _ => replica_core::ErrorKind::Sync,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    #[serde(rename = "ID")]
    id: Eid,
    #[serde(rename = "L")]
    listen: SocketAddr,
}

/// Connection to a peer
pub struct Connection {
    /// Peer info
    pub peer: PeerInfo,
    /// Send channel, closed when the session ends
    tx: GuardedSender<Frame>,
}

impl Connection {
    /// Send a frame to this peer
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|e| match e {
            ChannelError::Closed => TransportError::ConnectionClosed,
            other => TransportError::Channel(other),
        })
    }

    /// Check if connection is open
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Close the connection
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Event from the transport layer
#[derive(Debug)]
pub enum TransportEvent {
    /// New peer connected
    PeerConnected(PeerId),
    /// Peer disconnected
    PeerDisconnected(PeerId),
    /// Frame received from peer
    FrameReceived { from: PeerId, frame: Frame },
}

/// Transport layer managing connections
pub struct Transport {
    /// Our node id
    our_id: PeerId,
    /// Listen address
    listen_addr: SocketAddr,
    /// Connected peers
    connections: RwLock<HashMap<PeerId, Arc<Connection>>>,
    /// Known peers (may not be connected)
    known_peers: RwLock<HashMap<PeerId, PeerInfo>>,
    /// Where inbound events go
    event_tx: mpsc::Sender<TransportEvent>,
}

impl Transport {
    /// Create a new transport
    pub fn new(
        our_id: PeerId,
        listen_addr: SocketAddr,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            our_id,
            listen_addr,
            connections: RwLock::new(HashMap::new()),
            known_peers: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn our_id(&self) -> PeerId {
        self.our_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Add a known peer
    pub fn add_peer(&self, peer: PeerInfo) {
        self.known_peers.write().insert(peer.id, peer);
    }

    /// Get a known peer
    pub fn get_peer(&self, id: &PeerId) -> Option<PeerInfo> {
        self.known_peers.read().get(id).cloned()
    }

    pub fn known_peers(&self) -> Vec<PeerInfo> {
        self.known_peers.read().values().cloned().collect()
    }

    /// List connected peers
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.read().keys().copied().collect()
    }

    /// Check if connected to a peer
    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.connections
            .read()
            .get(id)
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    /// Send a frame to a peer
    pub async fn send(&self, to: &PeerId, frame: Frame) -> Result<(), TransportError> {
        let conn = self
            .connections
            .read()
            .get(to)
            .cloned()
            .ok_or(TransportError::PeerNotFound(*to))?;

        conn.send(frame).await
    }

    /// Broadcast a frame to all connected peers
    pub async fn broadcast(&self, frame: Frame) {
        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        for conn in connections {
            if let Err(e) = conn.send(frame.clone()).await {
                warn!("Failed to broadcast to {}: {}", conn.peer.id, e);
            }
        }
    }

    /// Close the session with a peer
    pub fn disconnect(&self, id: &PeerId) {
        if let Some(conn) = self.connections.write().remove(id) {
            conn.close();
        }
    }

    /// Close every session
    pub fn close_all(&self) {
        for (_, conn) in self.connections.write().drain() {
            conn.close();
        }
    }

    /// Bind the listen address
    pub async fn bind(&self) -> Result<TcpListener, TransportError> {
        Ok(TcpListener::bind(self.listen_addr).await?)
    }

    /// Accept sessions until shutdown
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TransportError> {
        info!("Transport listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let transport = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = transport.establish(stream).await {
                                    warn!("Inbound session from {} failed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Transport shutting down");
                    self.close_all();
                    break;
                }
            }
        }

        Ok(())
    }

    /// Open a session to `addr`, returning the remote node id
    pub async fn dial(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        self.clone().establish(stream).await
    }

    async fn establish(self: Arc<Self>, stream: TcpStream) -> Result<PeerId, TransportError> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let hello = Message::new(
            MsgCode::Session(SessionKind::Hello),
            Eid::EMPTY,
            &Hello {
                id: self.our_id,
                listen: self.listen_addr,
            },
        )?;
        write_frame(&mut writer, &mut codec, hello.to_frame()).await?;

        let frame = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            read_frame(&mut reader, &mut buf, &mut codec),
        )
        .await
        .map_err(|_| TransportError::Handshake("timed out".into()))??
        .ok_or(TransportError::ConnectionClosed)?;

        let msg = Message::from_frame(&frame)?;
        if msg.code != MsgCode::Session(SessionKind::Hello) {
            return Err(TransportError::Handshake(format!("unexpected code {:?}", msg.code)));
        }
        let hello: Hello = msg.decode_body()?;
        if hello.id == self.our_id {
            return Err(TransportError::Handshake("connected to self".into()));
        }
        let peer_id = hello.id;

        let (tx, rx) = guarded_channel(SEND_BUFFER);
        let mut info = self
            .get_peer(&peer_id)
            .unwrap_or_else(|| PeerInfo::new(peer_id, vec![]));
        if !info.addrs.contains(&hello.listen) {
            info.addrs.push(hello.listen);
        }
        info.touch();

        {
            let mut conns = self.connections.write();
            if conns.get(&peer_id).map(|c| c.is_open()).unwrap_or(false) {
                return Err(TransportError::AlreadyConnected(peer_id));
            }
            conns.insert(
                peer_id,
                Arc::new(Connection {
                    peer: info.clone(),
                    tx: tx.clone(),
                }),
            );
        }
        self.add_peer(info);
        info!(peer = %peer_id, %remote, "Peer connected");

        // connected must be observed before any frame of the session
        if self
            .event_tx
            .send(TransportEvent::PeerConnected(peer_id))
            .await
            .is_err()
        {
            self.disconnect(&peer_id);
            return Err(TransportError::ConnectionClosed);
        }

        tokio::spawn(write_loop(writer, rx));
        tokio::spawn(self.clone().read_loop(peer_id, reader, buf, tx));

        Ok(peer_id)
    }

    async fn read_loop<R: AsyncRead + Unpin>(
        self: Arc<Self>,
        peer_id: PeerId,
        mut reader: R,
        mut buf: BytesMut,
        tx: GuardedSender<Frame>,
    ) {
        let mut codec = FrameCodec::new();
        loop {
            match read_frame(&mut reader, &mut buf, &mut codec).await {
                Ok(Some(frame)) => {
                    if frame.code == MsgCode::Session(SessionKind::Ping).to_u16() {
                        let pong = Frame::new(MsgCode::Session(SessionKind::Pong).to_u16(), frame.body);
                        if tx.send(pong).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    if self
                        .event_tx
                        .send(TransportEvent::FrameReceived { from: peer_id, frame })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer = %peer_id, "Peer closed session");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer_id, "Read error: {}", e);
                    break;
                }
            }
        }

        tx.close();
        let removed = {
            let mut conns = self.connections.write();
            match conns.get(&peer_id) {
                Some(conn) if !conn.is_open() => conns.remove(&peer_id).is_some(),
                _ => false,
            }
        };
        if removed {
            let _ = self
                .event_tx
                .send(TransportEvent::PeerDisconnected(peer_id))
                .await;
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: GuardedReceiver<Frame>) {
    let mut codec = FrameCodec::new();
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &mut codec, frame).await {
            warn!("Write error: {}", e);
            rx.close();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    codec: &mut FrameCodec,
    frame: Frame,
) -> Result<(), TransportError> {
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf)?;
    writer.write_all(&buf).await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    codec: &mut FrameCodec,
) -> Result<Option<Frame>, TransportError> {
    loop {
        if let Some(frame) = codec.decode(buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MsgKind;
    use replica_core::Stream;

    async fn transport() -> (Arc<Transport>, TcpListener, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = Arc::new(Transport::new(Eid::new_random(), addr, event_tx));
        (transport, listener, event_rx)
    }

    #[tokio::test]
    async fn test_dial_and_exchange() {
        let (a, listener_a, mut events_a) = transport().await;
        let (b, listener_b, mut events_b) = transport().await;
        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(a.clone().run(listener_a, shutdown_tx.subscribe()));
        drop(listener_b);

        let remote = b.dial(a.listen_addr()).await.unwrap();
        assert_eq!(remote, a.our_id());
        assert!(matches!(
            events_b.recv().await.unwrap(),
            TransportEvent::PeerConnected(id) if id == a.our_id()
        ));
        assert!(matches!(
            events_a.recv().await.unwrap(),
            TransportEvent::PeerConnected(id) if id == b.our_id()
        ));

        let msg = Message::new(
            MsgCode::Stream(Stream::Board, MsgKind::SyncOplog),
            Eid::new_random(),
            &serde_json::json!({"LT": {"T": 1, "NT": 0}}),
        )
        .unwrap();
        b.send(&a.our_id(), msg.to_frame()).await.unwrap();

        match events_a.recv().await.unwrap() {
            TransportEvent::FrameReceived { from, frame } => {
                assert_eq!(from, b.our_id());
                assert_eq!(Message::from_frame(&frame).unwrap(), msg);
            }
            other => panic!("unexpected event {:?}", other),
        }

        b.disconnect(&a.our_id());
        assert!(matches!(
            events_a.recv().await.unwrap(),
            TransportEvent::PeerDisconnected(id) if id == b.our_id()
        ));
        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (a, _listener, _events) = transport().await;
        let err = a.send(&Eid::new_random(), Frame::new(1, vec![])).await;
        assert!(matches!(err, Err(TransportError::PeerNotFound(_))));
    }
}
