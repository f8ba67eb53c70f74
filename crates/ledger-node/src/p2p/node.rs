//! The P2P node: listener, live peer set, known-address set, and the accept,
//! discovery and per-peer loops.

use super::codec::MessageCodec;
use super::connection::{self, PeerHandle, PeerStream};
use super::error::{NetworkError, NetworkResult};
use super::message::{Blocks, ChainInfo, Message, P2pMessage, PeerId, PeerList};
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_SEND_TIMEOUT, MAX_FRAME_LENGTH,
    PEER_QUEUE_DEPTH,
};
use chrono::{DateTime, Utc};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use ledger_core::chain::Repository;
use ledger_core::consensus::{apply_offered_chain, Replacement};
use ledger_core::ChainId;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// Timeouts and limits for peer connections.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Bound on one socket write, and on waiting for room in a peer's
    /// outbound queue.
    pub send_timeout: Duration,
    pub max_frame_length: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Outcome of the latest discovery cycle. `success` only when every attempt
/// in the cycle reached its peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryStatus {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus {
    pub state: NodeState,
    pub local_id: PeerId,
    pub listen_addr: Option<SocketAddr>,
    pub peer_count: usize,
    pub known_peers: usize,
    pub last_discovery: Option<DiscoveryStatus>,
}

struct Runtime {
    cancel: CancellationToken,
    accept: JoinHandle<()>,
    discovery: JoinHandle<()>,
}

struct NodeInner {
    local_id: PeerId,
    repo: Arc<dyn Repository>,
    config: NetworkConfig,
    peers: RwLock<HashMap<PeerId, PeerHandle>>,
    known: RwLock<HashSet<SocketAddr>>,
    discovery: RwLock<Option<DiscoveryStatus>>,
    state: RwLock<NodeState>,
    listen_addr: RwLock<Option<SocketAddr>>,
    /// Held across start/stop so they never interleave.
    runtime: Mutex<Option<Runtime>>,
    /// Handshake and per-peer tasks; drained by `stop`.
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct P2pNode {
    inner: Arc<NodeInner>,
}

impl P2pNode {
    pub fn new(repo: Arc<dyn Repository>, config: NetworkConfig) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                local_id: PeerId::random(),
                repo,
                config,
                peers: RwLock::new(HashMap::new()),
                known: RwLock::new(HashSet::new()),
                discovery: RwLock::new(None),
                state: RwLock::new(NodeState::Stopped),
                listen_addr: RwLock::new(None),
                runtime: Mutex::new(None),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.read()
    }

    fn set_state(&self, state: NodeState) {
        *self.inner.state.write() = state;
    }

    /// Bind `listen_addr` and launch the accept and discovery loops. Returns
    /// the bound address once both loops are running.
    pub async fn start(
        &self,
        listen_addr: SocketAddr,
        discovery_interval: Duration,
    ) -> NetworkResult<SocketAddr> {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            return Err(NetworkError::AlreadyRunning);
        }
        self.set_state(NodeState::Starting);
        let listener = match TcpListener::bind(listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.set_state(NodeState::Stopped);
                return Err(e.into());
            }
        };
        let bound = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let accept = tokio::spawn(self.clone().accept_loop(listener, cancel.clone()));
        let discovery = tokio::spawn(
            self.clone()
                .discovery_loop(discovery_interval, cancel.clone()),
        );
        *runtime = Some(Runtime {
            cancel,
            accept,
            discovery,
        });
        *self.inner.listen_addr.write() = Some(bound);
        self.set_state(NodeState::Running);
        info!(addr = %bound, id = %self.inner.local_id, "p2p node listening");
        Ok(bound)
    }

    /// Cancel both loops, close the listener and every peer, and wait for
    /// all network tasks to finish. No network I/O happens after this returns.
    pub async fn stop(&self) -> NetworkResult<()> {
        let mut runtime = self.inner.runtime.lock().await;
        let Some(rt) = runtime.take() else {
            return Err(NetworkError::NotRunning);
        };
        self.set_state(NodeState::Stopping);
        rt.cancel.cancel();
        for handle in [rt.accept, rt.discovery] {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }

        let peers: Vec<PeerHandle> = self.inner.peers.write().drain().map(|(_, p)| p).collect();
        for peer in &peers {
            peer.close();
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();

        *self.inner.listen_addr.write() = None;
        self.set_state(NodeState::Stopped);
        info!(peers = peers.len(), "p2p node stopped");
        Ok(())
    }

    async fn running_token(&self) -> NetworkResult<CancellationToken> {
        self.inner
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|rt| rt.cancel.clone())
            .ok_or(NetworkError::NotRunning)
    }

    async fn accept_loop(self, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let (stream, addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            debug!(%addr, "incoming connection");
            let node = self.clone();
            let cancel = cancel.clone();
            self.inner.tasks.spawn(async move {
                if let Err(e) = node.accept_peer(stream, addr, cancel).await {
                    warn!(%addr, error = %e, "inbound peer rejected");
                }
            });
        }
        debug!("accept loop stopped");
    }

    async fn accept_peer(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> NetworkResult<()> {
        stream.set_nodelay(true)?;
        let mut stream = Framed::new(
            stream,
            MessageCodec::with_max_frame_length(self.inner.config.max_frame_length),
        );
        let remote = tokio::select! {
            _ = cancel.cancelled() => return Err(NetworkError::ConnectionClosed),
            remote = connection::server_handshake(
                &mut stream,
                self.inner.local_id,
                self.inner.config.handshake_timeout,
            ) => remote?,
        };
        let peer = self.register(remote, addr, stream, &cancel)?;

        let gossip = Message::PeerList(PeerList {
            peers: self.known_peers().iter().map(ToString::to_string).collect(),
        });
        if let Err(e) = peer.send(gossip, self.inner.config.send_timeout).await {
            debug!(peer = %peer.id, error = %e, "could not gossip known peers");
        }
        Ok(())
    }

    async fn discovery_loop(self, interval: Duration, cancel: CancellationToken) {
        loop {
            self.discover(&cancel).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("discovery loop stopped");
    }

    /// One discovery cycle over every known address without a live peer.
    async fn discover(&self, cancel: &CancellationToken) {
        let live: HashSet<SocketAddr> = self.inner.peers.read().values().map(|p| p.addr).collect();
        let targets: Vec<SocketAddr> = self
            .inner
            .known
            .read()
            .iter()
            .filter(|addr| !live.contains(addr))
            .copied()
            .collect();

        let mut success = true;
        for addr in targets {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return,
                attempt = self.connect_peer(addr, cancel) => attempt,
            };
            match attempt {
                Ok(peer) => debug!(peer = %peer.id, %addr, "discovered peer"),
                Err(NetworkError::DuplicatePeer(id)) => {
                    debug!(peer = %id, %addr, "already connected")
                }
                Err(NetworkError::SelfConnection) => {
                    debug!(%addr, "known address is ourselves; forgetting it");
                    self.inner.known.write().remove(&addr);
                }
                Err(e) => {
                    success = false;
                    warn!(%addr, error = %e, "discovery connect failed");
                }
            }
        }
        *self.inner.discovery.write() = Some(DiscoveryStatus {
            success,
            timestamp: Utc::now(),
        });
    }

    /// Outbound connect + initiator handshake, without waiting for the
    /// discovery loop. The node must be running.
    pub async fn connect(&self, addr: SocketAddr) -> NetworkResult<PeerId> {
        let cancel = self.running_token().await?;
        Ok(self.connect_peer(addr, &cancel).await?.id)
    }

    #[instrument(skip(self, cancel))]
    async fn connect_peer(
        &self,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> NetworkResult<PeerHandle> {
        let config = &self.inner.config;
        let mut stream =
            connection::connect(addr, config.connect_timeout, config.max_frame_length).await?;
        let remote =
            connection::client_handshake(&mut stream, self.inner.local_id, config.handshake_timeout)
                .await?;
        self.register(remote, addr, stream, cancel)
    }

    /// Add a handshaken connection to the live set and start its handler.
    /// On error the stream is dropped, which closes the socket.
    fn register(
        &self,
        remote: PeerId,
        addr: SocketAddr,
        stream: PeerStream,
        cancel: &CancellationToken,
    ) -> NetworkResult<PeerHandle> {
        if remote == self.inner.local_id {
            return Err(NetworkError::SelfConnection);
        }
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        let peer = PeerHandle::new(remote, addr, tx, cancel.child_token());
        {
            let mut peers = self.inner.peers.write();
            if peers.contains_key(&remote) {
                return Err(NetworkError::DuplicatePeer(remote));
            }
            peers.insert(remote, peer.clone());
        }
        info!(peer = %remote, %addr, "peer connected");
        self.inner
            .tasks
            .spawn(self.clone().run_peer(peer.clone(), stream, rx));
        Ok(peer)
    }

    /// Drop `peer` from the live set unless a newer session replaced it.
    fn remove_peer(&self, peer: &PeerHandle) {
        let mut peers = self.inner.peers.write();
        if peers.get(&peer.id).is_some_and(|p| p.same_session(peer)) {
            peers.remove(&peer.id);
        }
    }

    async fn run_peer(
        self,
        peer: PeerHandle,
        stream: PeerStream,
        mut outbound: mpsc::Receiver<Message>,
    ) {
        let (mut sink, mut incoming): (SplitSink<PeerStream, Message>, _) = stream.split();
        loop {
            let reply = tokio::select! {
                _ = peer.closed().cancelled() => break,
                frame = incoming.next() => match frame {
                    Some(Ok(envelope)) => match self.dispatch(envelope).await {
                        Ok(Some(reply)) => reply,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(peer = %peer.id, error = %e, "dropping peer");
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        warn!(peer = %peer.id, error = %e, "receive failed");
                        break;
                    }
                    None => {
                        debug!(peer = %peer.id, "connection closed by peer");
                        break;
                    }
                },
                Some(message) = outbound.recv() => message,
            };
            if let Err(e) = self.write(&peer, &mut sink, reply).await {
                warn!(peer = %peer.id, error = %e, "send failed");
                break;
            }
        }
        if !peer.closed().is_cancelled() {
            let _ = timeout(self.inner.config.send_timeout, sink.close()).await;
        }
        self.remove_peer(&peer);
        info!(peer = %peer.id, "peer disconnected");
    }

    /// Write one frame. Gives up after `send_timeout` or as soon as the
    /// peer is closed, so a peer that stops reading cannot stall `stop`.
    async fn write(
        &self,
        peer: &PeerHandle,
        sink: &mut SplitSink<PeerStream, Message>,
        message: Message,
    ) -> NetworkResult<()> {
        tokio::select! {
            _ = peer.closed().cancelled() => Err(NetworkError::ConnectionClosed),
            sent = timeout(self.inner.config.send_timeout, sink.send(message)) => {
                sent.map_err(|_| NetworkError::Timeout(format!("writing to {}", peer.id)))?
            }
        }
    }

    /// Handle one frame; the returned message is sent back on the same
    /// connection. Errors tear the connection down.
    async fn dispatch(&self, envelope: P2pMessage) -> NetworkResult<Option<Message>> {
        let kind = envelope.kind.clone();
        let Some(message) = envelope.into_message()? else {
            debug!(%kind, "ignoring unknown message");
            return Ok(None);
        };
        match message {
            Message::ChainInfo(info) => self.answer_chain_info(info).await,
            Message::Blocks(blocks) => {
                self.ingest_blocks(blocks).await?;
                Ok(None)
            }
            Message::PeerList(list) => {
                self.merge_known_peers(&list.peers);
                Ok(None)
            }
            Message::Hello(_) | Message::HelloAck(_) => {
                debug!(%kind, "ignoring handshake message on a live connection");
                Ok(None)
            }
        }
    }

    async fn answer_chain_info(&self, info: ChainInfo) -> NetworkResult<Option<Message>> {
        let ChainInfo {
            chain_id,
            block_count,
        } = info;
        let reply = self
            .with_repo(move |repo| {
                let Some(blockchain) = repo.get_blockchain(chain_id)? else {
                    return Ok(None);
                };
                if repo.count_blocks(chain_id)? <= block_count {
                    return Ok(None);
                }
                let chain_blocks = repo.fetch(chain_id)?;
                Ok(Some(Message::Blocks(Blocks {
                    blockchain,
                    chain_blocks,
                })))
            })
            .await?;
        if reply.is_some() {
            debug!(chain = %chain_id, peer_count = block_count, "serving longer chain");
        }
        Ok(reply)
    }

    async fn ingest_blocks(&self, offer: Blocks) -> NetworkResult<()> {
        let chain_id = offer.blockchain.id;
        let offered = offer.chain_blocks.len();
        let outcome = self
            .with_repo(move |repo| {
                apply_offered_chain(repo, &offer.blockchain, &offer.chain_blocks)
            })
            .await?;
        match outcome {
            Replacement::Replaced { blocks } => {
                info!(chain = %chain_id, blocks, "synced chain from peer")
            }
            Replacement::Rejected(reason) => {
                debug!(chain = %chain_id, offered, %reason, "kept local chain")
            }
        }
        Ok(())
    }

    fn merge_known_peers(&self, peers: &[String]) {
        let mut known = self.inner.known.write();
        let before = known.len();
        for entry in peers {
            match entry.parse::<SocketAddr>() {
                Ok(addr) => {
                    known.insert(addr);
                }
                Err(_) => debug!(%entry, "ignoring unparseable peer address"),
            }
        }
        let added = known.len() - before;
        if added > 0 {
            debug!(added, "learned peer addresses");
        }
    }

    async fn with_repo<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&dyn Repository) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let repo = Arc::clone(&self.inner.repo);
        tokio::task::spawn_blocking(move || f(repo.as_ref())).await?
    }

    /// Advertise our length of `chain_id` to every live peer; any peer with a
    /// longer chain answers with `Blocks`. Returns how many peers were asked.
    pub async fn sync_chain(&self, chain_id: ChainId) -> NetworkResult<usize> {
        let block_count = self
            .with_repo(move |repo| repo.count_blocks(chain_id))
            .await?;
        let peers: Vec<PeerHandle> = self.inner.peers.read().values().cloned().collect();
        let mut asked = 0;
        for peer in peers {
            let info = Message::ChainInfo(ChainInfo {
                chain_id,
                block_count,
            });
            match peer.send(info, self.inner.config.send_timeout).await {
                Ok(()) => asked += 1,
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "dropping unreachable peer");
                    self.remove_peer(&peer);
                    peer.close();
                }
            }
        }
        debug!(chain = %chain_id, block_count, asked, "sync requested");
        Ok(asked)
    }

    /// Resolve `host:port` and remember it for the next discovery cycle.
    pub async fn add_known_peer(&self, host: &str, port: u16) -> NetworkResult<SocketAddr> {
        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| NetworkError::Resolve(format!("{host}:{port}")))?;
        if self.inner.known.write().insert(addr) {
            info!(%addr, "added known peer");
        }
        Ok(addr)
    }

    pub fn known_peers(&self) -> Vec<SocketAddr> {
        let mut known: Vec<_> = self.inner.known.read().iter().copied().collect();
        known.sort();
        known
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self
            .inner
            .peers
            .read()
            .values()
            .map(|p| PeerInfo {
                id: p.id,
                addr: p.addr,
            })
            .collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            state: self.state(),
            local_id: self.inner.local_id,
            listen_addr: *self.inner.listen_addr.read(),
            peer_count: self.peer_count(),
            known_peers: self.inner.known.read().len(),
            last_discovery: *self.inner.discovery.read(),
        }
    }
}
