//! Peer-to-peer protocol: framing, handshake, and the node that owns the
//! listener, the peer set and the background loops.

pub mod codec;
pub mod connection;
pub mod error;
pub mod message;
pub mod node;

pub use connection::PeerHandle;
pub use error::{NetworkError, NetworkResult};
pub use message::{Message, P2pMessage, PeerId};
pub use node::{DiscoveryStatus, NetworkConfig, NodeState, NodeStatus, P2pNode, PeerInfo};
