mod helpers;

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use helpers::*;
use ledger_core::chain::Repository;
use ledger_core::{Block, Blockchain};
use ledger_node::p2p::codec::MessageCodec;
use ledger_node::p2p::connection::{self, PeerStream};
use ledger_node::p2p::message::{ChainInfo, Hello, PeerList};
use ledger_node::p2p::{Message, NetworkConfig, NetworkError, NodeState, PeerId};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

/// A bare client that has completed the handshake with the node at `addr`.
async fn raw_client(addr: SocketAddr) -> anyhow::Result<PeerStream> {
    let config = NetworkConfig::default();
    let mut stream =
        connection::connect(addr, config.connect_timeout, config.max_frame_length).await?;
    connection::client_handshake(&mut stream, PeerId::random(), config.handshake_timeout)
        .await?;
    Ok(stream)
}

/// Store a chain of `len` unmined blocks, enough to make the node's reply
/// outgrow the socket buffers.
fn store_long_chain(repo: &dyn Repository, len: usize) -> anyhow::Result<Blockchain> {
    let chain = test_chain("long", 0);
    repo.store(&chain)?;
    let mut blocks = repo.fetch(chain.id)?;
    for i in 1..len {
        let prev = blocks[i - 1].hash.clone();
        blocks.push(Block::new(chain.id, prev, payment(&format!("payer-{i}"), 1)));
    }
    blocks.reverse();
    assert!(repo.replace_chain_blocks(chain.id, &blocks)?);
    Ok(chain)
}

#[tokio::test]
async fn nil_hello_ack_is_rejected() -> anyhow::Result<()> {
    let (node, _repo, _addr) = running_node().await;

    let impostor = TcpListener::bind("127.0.0.1:0").await?;
    let impostor_addr = impostor.local_addr()?;
    tokio::spawn(async move {
        let (socket, _) = impostor.accept().await.unwrap();
        let mut framed = Framed::new(socket, MessageCodec::new());
        let _hello = framed.next().await;
        framed
            .send(Message::HelloAck(Hello {
                peer_id: PeerId::nil(),
            }))
            .await
            .unwrap();
        // hold the socket open so the failure comes from the handshake
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let result = node.connect(impostor_addr).await;
    assert!(matches!(result, Err(NetworkError::HandshakeFailed(_))));
    assert_eq!(node.peer_count(), 0);

    node.stop().await?;
    Ok(())
}

#[tokio::test]
async fn connect_registers_on_both_sides() -> anyhow::Result<()> {
    let (a, _repo_a, addr_a) = running_node().await;
    let (b, _repo_b, _addr_b) = running_node().await;

    let remote = b.connect(addr_a).await?;
    assert_eq!(remote, a.local_id());
    assert!(eventually(|| async { a.peer_count() == 1 }).await);
    assert_eq!(a.peers()[0].id, b.local_id());

    // same identity again is refused
    assert!(matches!(
        b.connect(addr_a).await,
        Err(NetworkError::DuplicatePeer(id)) if id == a.local_id()
    ));

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn self_connection_is_refused() -> anyhow::Result<()> {
    let (node, _repo, addr) = running_node().await;
    assert!(matches!(
        node.connect(addr).await,
        Err(NetworkError::SelfConnection)
    ));
    node.stop().await?;
    Ok(())
}

#[tokio::test]
async fn sync_pulls_the_longer_chain() -> anyhow::Result<()> {
    let (a, repo_a, addr_a) = running_node().await;
    let (b, repo_b, _addr_b) = running_node().await;

    let chain = test_chain("vat", DIFFICULTY);
    repo_a.store(&chain)?;
    extend(repo_a.as_ref(), &chain, 2);
    repo_b.store(&chain)?;
    extend(repo_b.as_ref(), &chain, 1);

    b.connect(addr_a).await?;
    assert_eq!(b.sync_chain(chain.id).await?, 1);

    assert!(eventually(|| async { count(repo_b.as_ref(), chain.id) == 3 }).await);
    assert_eq!(repo_b.fetch(chain.id)?, repo_a.fetch(chain.id)?);
    assert!(repo_b.verify(chain.id)?);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn sync_creates_a_chain_the_node_never_had() -> anyhow::Result<()> {
    let (a, repo_a, addr_a) = running_node().await;
    let (b, repo_b, _addr_b) = running_node().await;

    let chain = test_chain("income", DIFFICULTY);
    repo_a.store(&chain)?;
    extend(repo_a.as_ref(), &chain, 1);

    b.connect(addr_a).await?;
    b.sync_chain(chain.id).await?;

    assert!(eventually(|| async { count(repo_b.as_ref(), chain.id) == 2 }).await);
    assert_eq!(repo_b.get_blockchain(chain.id)?, Some(chain));

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn shorter_remote_chain_is_not_sent() -> anyhow::Result<()> {
    let (a, repo_a, addr_a) = running_node().await;
    let (b, repo_b, _addr_b) = running_node().await;

    let chain = test_chain("vat", DIFFICULTY);
    repo_a.store(&chain)?;
    repo_b.store(&chain)?;
    extend(repo_b.as_ref(), &chain, 2);
    let before = repo_b.fetch(chain.id)?;

    b.connect(addr_a).await?;
    b.sync_chain(chain.id).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(repo_b.fetch(chain.id)?, before);
    assert_eq!(count(repo_a.as_ref(), chain.id), 1);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn discovery_connects_to_known_peers_and_gossips() -> anyhow::Result<()> {
    let (a, _repo_a, addr_a) = running_node().await;
    let (c, _repo_c, addr_c) = running_node().await;

    // a knows c; b learns about c through a's gossip
    a.add_known_peer("127.0.0.1", addr_c.port()).await?;

    let repo_b = std::sync::Arc::new(ledger_storage::MemoryStore::new());
    let b = ledger_node::P2pNode::new(repo_b, Default::default());
    b.start("127.0.0.1:0".parse()?, Duration::from_millis(100))
        .await?;
    b.add_known_peer("127.0.0.1", addr_a.port()).await?;

    assert!(eventually(|| async { b.peer_count() == 2 }).await);
    let status = b.status();
    assert_eq!(status.state, NodeState::Running);
    assert!(status.last_discovery.is_some());
    assert!(b.known_peers().contains(&addr_c));

    a.stop().await?;
    b.stop().await?;
    c.stop().await?;
    Ok(())
}

#[tokio::test]
async fn start_and_stop_are_not_reentrant() -> anyhow::Result<()> {
    let (node, _repo, _addr) = running_node().await;
    assert!(matches!(
        node.start("127.0.0.1:0".parse()?, QUIET).await,
        Err(NetworkError::AlreadyRunning)
    ));

    node.stop().await?;
    assert_eq!(node.state(), NodeState::Stopped);
    assert!(matches!(node.stop().await, Err(NetworkError::NotRunning)));
    assert!(matches!(
        node.connect("127.0.0.1:1".parse()?).await,
        Err(NetworkError::NotRunning)
    ));

    // a stopped node can be started again
    node.start("127.0.0.1:0".parse()?, QUIET).await?;
    node.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stop_disconnects_peers() -> anyhow::Result<()> {
    let (a, _repo_a, addr_a) = running_node().await;
    let (b, _repo_b, _addr_b) = running_node().await;

    b.connect(addr_a).await?;
    assert!(eventually(|| async { a.peer_count() == 1 }).await);

    a.stop().await?;
    assert_eq!(a.peer_count(), 0);
    assert!(eventually(|| async { b.peer_count() == 0 }).await);

    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stop_completes_while_a_peer_never_reads() -> anyhow::Result<()> {
    let (node, repo, addr) = running_node().await;
    let chain = store_long_chain(repo.as_ref(), 60_000)?;

    let mut stalled = raw_client(addr).await?;
    stalled
        .send(Message::ChainInfo(ChainInfo {
            chain_id: chain.id,
            block_count: 0,
        }))
        .await?;
    // give the node time to start writing the reply into a full socket
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(10), node.stop()).await;
    assert!(matches!(stopped, Ok(Ok(()))));
    assert_eq!(node.peer_count(), 0);
    drop(stalled);
    Ok(())
}

#[tokio::test]
async fn stalled_write_drops_the_peer() -> anyhow::Result<()> {
    let repo = std::sync::Arc::new(ledger_storage::MemoryStore::new());
    let config = NetworkConfig {
        send_timeout: Duration::from_millis(300),
        ..NetworkConfig::default()
    };
    let node = ledger_node::P2pNode::new(repo.clone(), config);
    let addr = node.start("127.0.0.1:0".parse()?, QUIET).await?;
    let chain = store_long_chain(repo.as_ref(), 60_000)?;

    let mut stalled = raw_client(addr).await?;
    assert!(eventually(|| async { node.peer_count() == 1 }).await);
    stalled
        .send(Message::ChainInfo(ChainInfo {
            chain_id: chain.id,
            block_count: 0,
        }))
        .await?;

    assert!(eventually(|| async { node.peer_count() == 0 }).await);
    node.stop().await?;
    drop(stalled);
    Ok(())
}

#[tokio::test]
async fn peer_list_keeps_only_parseable_addresses() -> anyhow::Result<()> {
    let (node, _repo, addr) = running_node().await;

    let mut client = raw_client(addr).await?;
    client
        .send(Message::PeerList(PeerList {
            peers: vec![
                "127.0.0.1:7000".to_string(),
                "not an addr".to_string(),
                "10.0.0.1".to_string(),
                "[::1]:7001".to_string(),
            ],
        }))
        .await?;

    assert!(eventually(|| async { node.known_peers().len() == 2 }).await);
    let expected: Vec<SocketAddr> = vec!["127.0.0.1:7000".parse()?, "[::1]:7001".parse()?];
    assert_eq!(node.known_peers(), expected);
    // a bad entry is not a protocol error
    assert_eq!(node.peer_count(), 1);

    node.stop().await?;
    Ok(())
}

#[tokio::test]
async fn malformed_payload_drops_only_that_peer() -> anyhow::Result<()> {
    let (a, repo_a, addr_a) = running_node().await;
    let (b, repo_b, _addr_b) = running_node().await;

    let chain = test_chain("vat", DIFFICULTY);
    repo_a.store(&chain)?;
    extend(repo_a.as_ref(), &chain, 2);

    b.connect(addr_a).await?;
    let mut bad = raw_client(addr_a).await?;
    assert!(eventually(|| async { a.peer_count() == 2 }).await);

    // known discriminator, payload of the wrong shape
    let body = br#"{"Type":"Blocks","Payload":1}"#;
    let socket = bad.get_mut();
    socket.write_all(&(body.len() as u32).to_le_bytes()).await?;
    socket.write_all(body).await?;
    socket.flush().await?;

    assert!(eventually(|| async { a.peer_count() == 1 }).await);
    assert_eq!(a.peers()[0].id, b.local_id());
    // the bad peer sees its connection closed
    assert!(matches!(
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(Ok(_)) = bad.next().await {}
        })
        .await,
        Ok(())
    ));

    // the healthy peer is still served
    b.sync_chain(chain.id).await?;
    assert!(eventually(|| async { count(repo_b.as_ref(), chain.id) == 3 }).await);

    a.stop().await?;
    b.stop().await?;
    Ok(())
}

#[tokio::test]
async fn peers_known_before_start_are_dialled_at_once() -> anyhow::Result<()> {
    let (seed, _seed_repo, seed_addr) = running_node().await;

    let repo = std::sync::Arc::new(ledger_storage::MemoryStore::new());
    let node = ledger_node::P2pNode::new(repo, NetworkConfig::default());
    node.add_known_peer("127.0.0.1", seed_addr.port()).await?;
    node.start("127.0.0.1:0".parse()?, QUIET).await?;

    // the next cycle is an hour away, so only the startup cycle can do this
    assert!(eventually(|| async { node.peer_count() == 1 }).await);
    assert_eq!(node.peers()[0].id, seed.local_id());
    assert!(node.status().last_discovery.is_some());

    node.stop().await?;
    seed.stop().await?;
    Ok(())
}
