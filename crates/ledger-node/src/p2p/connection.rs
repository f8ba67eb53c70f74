//! Connection setup and the two-message identity handshake.

use super::codec::MessageCodec;
use super::error::{NetworkError, NetworkResult};
use super::message::{Hello, Message, PeerId};
use futures::{SinkExt, StreamExt};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub type PeerStream = Framed<TcpStream, MessageCodec>;

/// Open a TCP connection within `connect_timeout`.
#[instrument(skip(max_frame_length))]
pub async fn connect(
    addr: SocketAddr,
    connect_timeout: Duration,
    max_frame_length: usize,
) -> NetworkResult<PeerStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NetworkError::Timeout(format!("connecting to {addr}")))??;
    stream.set_nodelay(true)?;
    debug!("connected");
    Ok(Framed::new(
        stream,
        MessageCodec::with_max_frame_length(max_frame_length),
    ))
}

/// Initiator side: send `Hello`, expect `HelloAck`.
pub async fn client_handshake(
    stream: &mut PeerStream,
    local_id: PeerId,
    limit: Duration,
) -> NetworkResult<PeerId> {
    timeout(limit, initiate(stream, local_id))
        .await
        .map_err(|_| NetworkError::Timeout("handshake".to_string()))?
}

/// Responder side: expect `Hello`, reply `HelloAck`.
pub async fn server_handshake(
    stream: &mut PeerStream,
    local_id: PeerId,
    limit: Duration,
) -> NetworkResult<PeerId> {
    timeout(limit, respond(stream, local_id))
        .await
        .map_err(|_| NetworkError::Timeout("handshake".to_string()))?
}

async fn initiate(stream: &mut PeerStream, local_id: PeerId) -> NetworkResult<PeerId> {
    stream
        .send(Message::Hello(Hello { peer_id: local_id }))
        .await?;
    match receive(stream).await? {
        Message::HelloAck(ack) => accept_identity(ack),
        other => Err(unexpected("HelloAck", &other)),
    }
}

async fn respond(stream: &mut PeerStream, local_id: PeerId) -> NetworkResult<PeerId> {
    let remote = match receive(stream).await? {
        Message::Hello(hello) => accept_identity(hello)?,
        other => return Err(unexpected("Hello", &other)),
    };
    stream
        .send(Message::HelloAck(Hello { peer_id: local_id }))
        .await?;
    Ok(remote)
}

async fn receive(stream: &mut PeerStream) -> NetworkResult<Message> {
    let envelope = stream.next().await.ok_or(NetworkError::ConnectionClosed)??;
    let kind = envelope.kind.clone();
    envelope
        .into_message()?
        .ok_or_else(|| NetworkError::HandshakeFailed(format!("unexpected {kind}")))
}

fn accept_identity(hello: Hello) -> NetworkResult<PeerId> {
    if hello.peer_id.is_nil() {
        return Err(NetworkError::HandshakeFailed("empty peer id".to_string()));
    }
    Ok(hello.peer_id)
}

fn unexpected(expected: &str, got: &Message) -> NetworkError {
    NetworkError::HandshakeFailed(format!("expected {expected}, got {}", got.kind()))
}

/// A live, handshaken peer. The socket itself is owned by the peer task in
/// the node; this handle queues outbound messages to it and can close it.
/// Two handles are equal when they name the same remote identity.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl PeerHandle {
    pub(crate) fn new(
        id: PeerId,
        addr: SocketAddr,
        outbound: mpsc::Sender<Message>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id,
            addr,
            outbound,
            closed,
        }
    }

    /// Queue `message`, waiting at most `limit` for room.
    pub async fn send(&self, message: Message, limit: Duration) -> NetworkResult<()> {
        timeout(limit, self.outbound.send(message))
            .await
            .map_err(|_| NetworkError::Timeout(format!("sending to {}", self.id)))?
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Same session, not merely the same identity.
    pub(crate) fn same_session(&self, other: &PeerHandle) -> bool {
        self.outbound.same_channel(&other.outbound)
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerHandle {}

impl Hash for PeerHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
