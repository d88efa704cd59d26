// Protocol messages and wire codec
//
// A datagram carries a compound frame: the primary message followed by any
// piggybacked broadcasts, encoded together as one sequence. Streams carry a
// single length-prefixed message.

use crate::error::{MeshError, Result};
use crate::node::MemberStatus;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a push/pull stream frame
const MAX_STREAM_FRAME: usize = 8 * 1024 * 1024;

/// Protocol message taxonomy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Direct liveness check
    Ping {
        seqno: u32,
        source: String,
        target: String,
    },

    /// Request that the receiver probe `target` on the sender's behalf
    IndirectPing {
        seqno: u32,
        source: String,
        target: String,
        target_addr: SocketAddr,
    },

    /// Response to a ping, direct or relayed
    Ack { seqno: u32, payload: Vec<u8> },

    /// Explicit refusal to relay; tolerated but never emitted
    Nack { seqno: u32 },

    /// Declaration that a node is alive at an incarnation
    Alive {
        incarnation: u64,
        name: String,
        addr: SocketAddr,
        meta: Vec<u8>,
    },

    /// Declaration that a node is suspected of failure
    Suspect {
        incarnation: u64,
        name: String,
        from: String,
    },

    /// Declaration that a node has failed
    Dead {
        incarnation: u64,
        name: String,
        from: String,
    },

    /// Full-state anti-entropy exchange
    PushPull { entries: Vec<PushPullState> },
}

/// One member entry in a push/pull snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPullState {
    pub name: String,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
    pub incarnation: u64,
    pub status: MemberStatus,
}

/// Encode a compound datagram frame
pub fn encode_frame(messages: &[Message]) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(messages, bincode::config::standard())
        .map_err(|e| MeshError::Encode(e.to_string()))
}

/// Decode a compound datagram frame
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<Message>> {
    let (messages, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| MeshError::Decode(e.to_string()))?;
    Ok(messages)
}

/// Write a single length-prefixed message to a stream
pub async fn write_stream_frame<S>(stream: &mut S, message: &Message) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| MeshError::Encode(e.to_string()))?;
    if body.len() > MAX_STREAM_FRAME {
        return Err(MeshError::Encode(format!("stream frame of {} bytes exceeds limit", body.len())));
    }
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a single length-prefixed message from a stream
pub async fn read_stream_frame<S>(stream: &mut S) -> Result<Message>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len > MAX_STREAM_FRAME {
        return Err(MeshError::Decode(format!("stream frame of {} bytes exceeds limit", len)));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let (message, _) = bincode::serde::decode_from_slice(&body, bincode::config::standard())
        .map_err(|e| MeshError::Decode(e.to_string()))?;
    Ok(message)
}
