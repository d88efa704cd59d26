// Anti-entropy state exchange
//
// Periodically trades a full membership snapshot with one random member
// over a stream. Remote entries are replayed through the state transition
// engine, so the exchange can only accelerate convergence, never override
// newer local knowledge.

use crate::error::{MeshError, Result};
use crate::lifecycle::LifecycleEngine;
use crate::message::{self, Message, PushPullState};
use crate::state::MemberTable;
use crate::transport::{PeerStream, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct StateSync {
    local_name: String,
    push_pull_interval: Duration,
    dial_timeout: Duration,
    table: Arc<MemberTable>,
    engine: LifecycleEngine,
    transport: Arc<dyn Transport>,
}

impl StateSync {
    pub fn new(
        local_name: impl Into<String>,
        push_pull_interval: Duration,
        dial_timeout: Duration,
        table: Arc<MemberTable>,
        engine: LifecycleEngine,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            push_pull_interval,
            dial_timeout,
            table,
            engine,
            transport,
        }
    }

    /// Periodic exchange driver. A zero interval disables the cycle; joins
    /// still exchange state directly.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.push_pull_interval.is_zero() {
            let _ = shutdown.changed().await;
            return;
        }
        let start = tokio::time::Instant::now() + self.push_pull_interval;
        let mut ticker = tokio::time::interval_at(start, self.push_pull_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.exchange_with_random_member().await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("anti-entropy loop stopped");
    }

    async fn exchange_with_random_member(&self) {
        let peers = self.table.random_k(1, &[&self.local_name]);
        let Some(peer) = peers.first() else {
            tracing::trace!("no members available for push/pull");
            return;
        };
        if let Err(e) = self.push_pull_node(peer.addr).await {
            tracing::warn!(member = %peer.name, error = %e, "push/pull exchange failed");
        }
    }

    /// Dial a member, push the local snapshot, pull its snapshot and merge.
    pub(crate) async fn push_pull_node(&self, addr: SocketAddr) -> Result<()> {
        let mut stream = self.transport.dial_stream(addr, self.dial_timeout).await?;

        let push = Message::PushPull {
            entries: self.local_snapshot(),
        };
        message::write_stream_frame(&mut stream, &push).await?;

        match message::read_stream_frame(&mut stream).await? {
            Message::PushPull { entries } => {
                self.engine.merge_remote(entries);
                Ok(())
            }
            other => Err(MeshError::Decode(format!(
                "expected push/pull reply, got {:?}",
                std::mem::discriminant(&other)
            ))),
        }
    }

    /// Answer one inbound exchange: pull the remote snapshot, push ours
    /// back, then merge.
    pub(crate) async fn handle_stream(&self, mut stream: PeerStream) {
        match message::read_stream_frame(&mut stream).await {
            Ok(Message::PushPull { entries }) => {
                let reply = Message::PushPull {
                    entries: self.local_snapshot(),
                };
                if let Err(e) = message::write_stream_frame(&mut stream, &reply).await {
                    tracing::warn!(error = %e, "failed to answer push/pull");
                    return;
                }
                self.engine.merge_remote(entries);
            }
            Ok(_) => tracing::debug!("ignoring non-push/pull stream"),
            Err(e) => tracing::debug!(error = %e, "discarding undecodable stream"),
        }
    }

    fn local_snapshot(&self) -> Vec<PushPullState> {
        self.table
            .snapshot()
            .into_iter()
            .map(|m| PushPullState {
                name: m.name,
                addr: m.addr,
                meta: m.meta,
                incarnation: m.incarnation,
                status: m.status,
            })
            .collect()
    }
}
