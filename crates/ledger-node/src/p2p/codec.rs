//! Frame codec.
//!
//! ```text
//! +-------------------+--------------------------+
//! |  Length (u32 LE)  |  JSON envelope (Length)  |
//! +-------------------+--------------------------+
//! ```
//!
//! A stream that ends exactly on a frame boundary is an orderly close.

use super::error::{NetworkError, NetworkResult};
use super::message::{Message, P2pMessage};
use crate::constants::MAX_FRAME_LENGTH;
use bytes::{Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub struct MessageCodec {
    frames: LengthDelimitedCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .little_endian()
            .max_frame_length(max)
            .new_codec();
        Self { frames }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn frame_error(err: io::Error) -> NetworkError {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
            NetworkError::InvalidMessage(err.to_string())
        }
        _ => NetworkError::Io(err),
    }
}

impl Decoder for MessageCodec {
    type Item = P2pMessage;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> NetworkResult<Option<P2pMessage>> {
        match self.frames.decode(src).map_err(frame_error)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> NetworkResult<()> {
        let body = serde_json::to_vec(&item)?;
        self.frames
            .encode(Bytes::from(body), dst)
            .map_err(frame_error)
    }
}
