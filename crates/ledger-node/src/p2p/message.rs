//! Wire messages. Every frame carries a JSON envelope
//! `{"Type": "...", "Payload": {...}}`; the payload shape depends on `Type`.

use super::error::NetworkResult;
use ledger_core::{Block, Blockchain, ChainId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Opaque node identity exchanged in the handshake. The nil UUID is the
/// empty identity and is never accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl From<Uuid> for PeerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Hello {
    pub peer_id: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChainInfo {
    pub chain_id: ChainId,
    pub block_count: usize,
}

/// A whole chain, newest block first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Blocks {
    pub blockchain: Blockchain,
    pub chain_blocks: Vec<Block>,
}

/// Known peer addresses as `host:port` strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerList {
    pub peers: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "Type", content = "Payload")]
pub enum Message {
    Hello(Hello),
    HelloAck(Hello),
    ChainInfo(ChainInfo),
    Blocks(Blocks),
    PeerList(PeerList),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::HelloAck(_) => "HelloAck",
            Message::ChainInfo(_) => "ChainInfo",
            Message::Blocks(_) => "Blocks",
            Message::PeerList(_) => "PeerList",
        }
    }
}

/// Undecoded envelope as read off the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct P2pMessage {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Payload", default)]
    pub payload: Value,
}

impl P2pMessage {
    /// Decode the payload for known discriminators. Unknown ones yield
    /// `Ok(None)`; a known type with a malformed payload is an error.
    pub fn into_message(self) -> NetworkResult<Option<Message>> {
        let payload = self.payload;
        let message = match self.kind.as_str() {
            "Hello" => Message::Hello(serde_json::from_value(payload)?),
            "HelloAck" => Message::HelloAck(serde_json::from_value(payload)?),
            "ChainInfo" => Message::ChainInfo(serde_json::from_value(payload)?),
            "Blocks" => Message::Blocks(serde_json::from_value(payload)?),
            "PeerList" => Message::PeerList(serde_json::from_value(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}
