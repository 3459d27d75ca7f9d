//! Connection framing
//!
//! One TCP connection carries many logical streams. Every frame is
//! `MAGIC (4) | length (4, big endian) | bincode(Frame)`.

use crate::network::addr::PeerId;
use crate::network::message::MAGIC;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use tokio_util::codec::{Decoder, Encoder};

/// Largest frame accepted from a peer
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 8;

/// Stream multiplexing frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame in each direction; identifies the sender
    Hello {
        peer_id: PeerId,
        listen_addr: SocketAddr,
        net_version: String,
    },
    /// Open a stream for a protocol
    Open { stream_id: u64, protocol: String },
    /// Stream payload: one encoded message
    Data { stream_id: u64, payload: Vec<u8> },
    /// Graceful end of a stream
    Close { stream_id: u64 },
    /// Abort a stream
    Reset { stream_id: u64 },
}

/// Frame codec for length-prefixed framing
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = bincode::serialize(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if data.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame too large: {} bytes", data.len()),
            ));
        }

        // Magic (4) + Length (4) + Data
        dst.reserve(HEADER_LEN + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame too large: {} bytes", len),
            ));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let data = src.split_to(len);

        let frame = bincode::deserialize(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(Some(frame))
    }
}
