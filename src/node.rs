use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

/// Lifecycle state of a peer as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Member is healthy and answering probes
    Alive,

    /// Member failed a probe round and is awaiting refutation
    Suspect,

    /// Member was declared failed; kept until reaped
    Dead,
}

impl MemberStatus {
    /// Check if the member is considered reachable
    pub fn is_alive(&self) -> bool {
        matches!(self, MemberStatus::Alive)
    }

    /// Check if the member is suspected of failure
    pub fn is_suspect(&self) -> bool {
        matches!(self, MemberStatus::Suspect)
    }

    /// Check if the member has been declared failed
    pub fn is_dead(&self) -> bool {
        matches!(self, MemberStatus::Dead)
    }
}

/// A known peer and everything the local node believes about it.
///
/// Copies of this struct are handed to subscribers and API callers; the
/// authoritative entry lives in the member table.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    /// Unique, case-sensitive identifier of the peer
    pub name: String,

    /// Endpoint used for probes and state exchange streams
    pub addr: SocketAddr,

    /// Opaque user-defined payload carried with the member
    pub meta: Vec<u8>,

    /// Monotonic counter owned by the peer itself, used to arbitrate
    /// conflicting declarations
    pub incarnation: u64,

    /// Current lifecycle state
    pub status: MemberStatus,

    /// When the state last changed
    pub state_change: Instant,
}

impl Member {
    /// Create a member in the Alive state at the given incarnation
    pub fn alive(name: impl Into<String>, addr: SocketAddr, meta: Vec<u8>, incarnation: u64) -> Self {
        Self {
            name: name.into(),
            addr,
            meta,
            incarnation,
            status: MemberStatus::Alive,
            state_change: Instant::now(),
        }
    }
}
