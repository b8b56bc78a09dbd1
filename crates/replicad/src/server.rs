//! replicad server - main service loop

use crate::config::Config;
use crate::manager::{Command, EntityActor, ManagerError, Outbound, ProtocolManager, SystemClock};
use crate::storage::{Storage, StorageError};
use parking_lot::{Mutex, RwLock};
use replica_core::crypto::KeyPair;
use replica_core::Eid;
use replica_net::{GuardedSender, Message, PeerHealth, PeerId, Transport, TransportError, TransportEvent};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const NODE_KEY: &[u8] = b".nodk";
const EVENT_BUFFER: usize = 1024;
const OUTBOUND_BUFFER: usize = 1024;
const MAILBOX_BUFFER: usize = 256;
const MAX_DIAL_ATTEMPTS: u32 = 8;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Manager error: {0}")]
    Manager(#[from] ManagerError),
    #[error("Core error: {0}")]
    Core(#[from] replica_core::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),
    #[error("Server already running")]
    AlreadyRunning,
}

impl ServerError {
    pub fn kind(&self) -> replica_core::ErrorKind {
        match self {
            ServerError::Storage(e) => e.kind(),
            ServerError::Transport(e) => e.kind(),
            ServerError::Manager(e) => e.kind(),
            ServerError::Core(e) => e.kind(),
            ServerError::Config(_) => replica_core::ErrorKind::Validation,
            ServerError::AlreadyRunning => replica_core::ErrorKind::Fatal,
        }
    }
}

/// Server state
pub struct Server {
    config: Config,
    key: KeyPair,
    node_id: PeerId,
    storage: Arc<Storage>,
    transport: Arc<Transport>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    /// Mailboxes of the entity actors
    entities: RwLock<HashMap<Eid, GuardedSender<Command>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Open storage and load or create the node key
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let key = match storage.key.get(NODE_KEY)? {
            Some(bytes) => KeyPair::from_private_bytes(&bytes)?,
            None => {
                let key = KeyPair::generate();
                storage.key.put(NODE_KEY, &key.private_bytes())?;
                info!("Generated node key");
                key
            }
        };
        let node_id = Eid::with_address_postfix(&key.address(), &Eid::EMPTY);

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let transport = Arc::new(Transport::new(node_id, config.listen, event_tx));
        for peer in storage.load_peers()? {
            transport.add_peer(peer);
        }
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            key,
            node_id,
            storage,
            transport,
            events: Mutex::new(Some(event_rx)),
            entities: RwLock::new(HashMap::new()),
            shutdown_tx,
        })
    }

    pub fn node_id(&self) -> PeerId {
        self.node_id
    }

    /// Entities with a running actor
    pub fn entities(&self) -> Vec<Eid> {
        self.entities.read().keys().copied().collect()
    }

    /// Run the server
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let mut events = self.events.lock().take().ok_or(ServerError::AlreadyRunning)?;
        info!(node = %self.node_id, listen = %self.config.listen, "Starting replicad");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let mut handles = self.spawn_entities(outbound_tx)?;

        let listener = self.transport.bind().await?;
        let transport = self.transport.clone();
        let shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = transport.run(listener, shutdown).await {
                error!("Transport stopped: {}", e);
            }
        }));
        handles.push(tokio::spawn(deliver(self.transport.clone(), outbound_rx)));
        self.spawn_dialers();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.dispatch(event).await,
                        None => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        for tx in self.entities.read().values() {
            tx.close();
        }
        self.transport.close_all();
        for handle in handles {
            handle.abort();
        }
        self.storage.flush()?;
        Ok(())
    }

    fn spawn_entities(&self, outbound: mpsc::Sender<Outbound>) -> Result<Vec<JoinHandle<()>>, ServerError> {
        let params = self.config.params();
        let mut managers = Vec::new();
        for entity_id in self.config.entity_ids()? {
            managers.push(ProtocolManager::new(
                &self.storage,
                entity_id,
                self.config.entity_type,
                self.key.clone(),
                params.clone(),
                Arc::new(SystemClock),
            )?);
        }
        if self.config.create_entity {
            let (pm, _) = ProtocolManager::create_entity(
                &self.storage,
                self.config.entity_type,
                self.key.clone(),
                params.clone(),
                Arc::new(SystemClock),
            )?;
            info!(entity = %pm.entity_id(), "Replicating new entity");
            managers.push(pm);
        }

        let mut handles = Vec::with_capacity(managers.len());
        let mut entities = self.entities.write();
        for pm in managers {
            let entity_id = pm.entity_id();
            if entities.contains_key(&entity_id) {
                continue;
            }
            let (tx, handle) = EntityActor::spawn(
                pm,
                outbound.clone(),
                self.shutdown_tx.subscribe(),
                Duration::from_secs(self.config.sync_interval_secs),
                Duration::from_secs(self.config.merkle_interval_secs),
                MAILBOX_BUFFER,
            );
            entities.insert(entity_id, tx);
            handles.push(handle);
            debug!(entity = %entity_id, "Entity actor started");
        }
        Ok(handles)
    }

    /// Dial bootstrap and remembered peers
    fn spawn_dialers(&self) {
        let mut addrs: Vec<SocketAddr> = self.config.bootstrap.clone();
        for peer in self.transport.known_peers() {
            addrs.extend(peer.addrs);
        }
        addrs.sort();
        addrs.dedup();
        addrs.retain(|a| *a != self.config.listen);

        for addr in addrs {
            info!("Bootstrap peer: {}", addr);
            tokio::spawn(dial_with_backoff(
                self.transport.clone(),
                addr,
                self.config.strike_limit,
                self.shutdown_tx.subscribe(),
            ));
        }
    }

    async fn dispatch(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected(peer) => {
                if let Some(info) = self.transport.get_peer(&peer) {
                    if let Err(e) = self.storage.put_peer(&info) {
                        warn!(%peer, "Failed to persist peer: {}", e);
                    }
                }
                self.to_all(|| Command::PeerConnected(peer)).await;
            }
            TransportEvent::PeerDisconnected(peer) => {
                self.to_all(|| Command::PeerDisconnected(peer)).await;
            }
            TransportEvent::FrameReceived { from, frame } => {
                let message = match Message::from_frame(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(peer = %from, "Malformed frame: {}", e);
                        return;
                    }
                };
                let mailbox = self.entities.read().get(&message.entity_id).cloned();
                match mailbox {
                    Some(tx) => {
                        if let Err(e) = tx.send(Command::Message { from, message }).await {
                            debug!(peer = %from, "Entity mailbox closed: {}", e);
                        }
                    }
                    None => debug!(peer = %from, entity = %message.entity_id, "Message for unknown entity"),
                }
            }
        }
    }

    async fn to_all<F: Fn() -> Command>(&self, command: F) {
        let mailboxes: Vec<GuardedSender<Command>> = self.entities.read().values().cloned().collect();
        for tx in mailboxes {
            if let Err(e) = tx.send(command()).await {
                debug!("Entity mailbox closed: {}", e);
            }
        }
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Put manager output on the wire
async fn deliver(transport: Arc<Transport>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Send { to, message } => {
                if let Err(e) = transport.send(&to, message.to_frame()).await {
                    debug!(peer = %to, "Send failed: {}", e);
                }
            }
            Outbound::Broadcast { except: None, message } => transport.broadcast(message.to_frame()).await,
            Outbound::Broadcast {
                except: Some(except),
                message,
            } => {
                let frame = message.to_frame();
                for peer in transport.connected_peers() {
                    if peer == except {
                        continue;
                    }
                    if let Err(e) = transport.send(&peer, frame.clone()).await {
                        debug!(%peer, "Broadcast send failed: {}", e);
                    }
                }
            }
            Outbound::Drop(peer) => {
                warn!(%peer, "Disconnecting misbehaving peer");
                transport.disconnect(&peer);
            }
        }
    }
}

async fn dial_with_backoff(
    transport: Arc<Transport>,
    addr: SocketAddr,
    strike_limit: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut health = PeerHealth::new(strike_limit, Duration::from_secs(1), Duration::from_secs(60));
    for _ in 0..MAX_DIAL_ATTEMPTS {
        match transport.dial(addr).await {
            Ok(peer) => {
                info!(%peer, %addr, "Dialed peer");
                return;
            }
            Err(TransportError::AlreadyConnected(_)) => return,
            Err(e) => {
                health.record_failure();
                let wait = health.backoff_with_jitter();
                debug!(%addr, "Dial failed: {}, retrying in {:?}", e, wait);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.recv() => return,
                }
            }
        }
    }
    warn!(%addr, "Giving up on peer");
}
