// Failure detector
//
// Drives the SWIM probe round: pick the next member off the shuffled walk,
// ping it directly, fall back to indirect pings through other members, and
// escalate to suspicion when the full round passes without an ack. Also
// dispatches inbound protocol datagrams, since replying to pings and
// relaying indirect probes share the same state.

use crate::ack::{AckHandler, AckRegistry};
use crate::broadcast::BroadcastQueue;
use crate::lifecycle::LifecycleEngine;
use crate::message::{self, Message};
use crate::node::Member;
use crate::state::MemberTable;
use crate::transport::{Datagram, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Most broadcasts piggybacked on a single datagram
const MAX_PIGGYBACK: usize = 6;

pub struct Prober {
    local_name: String,
    probe_interval: Duration,
    probe_timeout: Duration,
    indirect_probes: usize,
    gossip_fanout: usize,
    reap_interval: Duration,
    table: Arc<MemberTable>,
    engine: LifecycleEngine,
    acks: Arc<AckRegistry>,
    broadcasts: Arc<BroadcastQueue>,
    transport: Arc<dyn Transport>,
}

impl Prober {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_name: impl Into<String>,
        probe_interval: Duration,
        probe_timeout: Duration,
        indirect_probes: usize,
        gossip_fanout: usize,
        reap_interval: Duration,
        table: Arc<MemberTable>,
        engine: LifecycleEngine,
        acks: Arc<AckRegistry>,
        broadcasts: Arc<BroadcastQueue>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            probe_interval,
            probe_timeout,
            indirect_probes,
            gossip_fanout,
            reap_interval,
            table,
            engine,
            acks,
            broadcasts,
            transport,
        }
    }

    /// Probe scheduler; one round per probe interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + self.probe_interval;
        let mut ticker = tokio::time::interval_at(start, self.probe_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_round().await;
                    self.gossip().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("probe loop stopped");
    }

    /// One probe round: select the next eligible member and probe it.
    pub(crate) async fn probe_round(&self) {
        let Some(target) = self.table.next_probe_target(self.reap_interval) else {
            tracing::trace!("no probe-eligible members");
            return;
        };
        self.probe_node(&target).await;
    }

    /// Probe one member: direct ping, then indirect fan-out, then
    /// suspicion. A suspect member is probed like an alive one to give it
    /// a chance to refute; its ack alone never clears the suspicion.
    pub(crate) async fn probe_node(&self, target: &Member) {
        let seqno = self.acks.next_seqno();
        let (tx, mut rx) = oneshot::channel();
        self.acks.register(seqno, AckHandler::Notify(tx), self.probe_interval);

        let ping = Message::Ping {
            seqno,
            source: self.local_name.clone(),
            target: target.name.clone(),
        };
        self.send_with_piggyback(target.addr, ping).await;

        if let Ok(Ok(())) = tokio::time::timeout(self.probe_timeout, &mut rx).await {
            return;
        }

        // No direct ack in time; ask other members to probe on our behalf.
        let relays = self.table.random_k(self.indirect_probes, &[&self.local_name, &target.name]);
        tracing::debug!(
            member = %target.name,
            relays = relays.len(),
            "direct probe timed out, probing indirectly"
        );
        for relay in &relays {
            let indirect = Message::IndirectPing {
                seqno,
                source: self.local_name.clone(),
                target: target.name.clone(),
                target_addr: target.addr,
            };
            self.send_with_piggyback(relay.addr, indirect).await;
        }

        let remainder = self.probe_interval.saturating_sub(self.probe_timeout);
        if let Ok(Ok(())) = tokio::time::timeout(remainder, &mut rx).await {
            return;
        }

        self.engine.mark_suspect(target.incarnation, &target.name, &self.local_name);
    }

    /// Push pending broadcasts to a few random members. Piggybacking covers
    /// members we happen to talk to; this covers everyone else.
    pub(crate) async fn gossip(&self) {
        let targets = self.table.random_k(self.gossip_fanout, &[&self.local_name]);
        for target in targets {
            let drained = self.broadcasts.pop(self.table.len(), MAX_PIGGYBACK);
            if drained.is_empty() {
                return;
            }
            self.send_frame(target.addr, &drained).await;
        }
    }

    /// Handle one inbound datagram frame.
    pub(crate) async fn handle_datagram(&self, datagram: Datagram) {
        let messages = match message::decode_frame(&datagram.payload) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::debug!(from = %datagram.from, error = %e, "discarding undecodable datagram");
                return;
            }
        };
        for msg in messages {
            self.handle_message(msg, datagram.from).await;
        }
    }

    async fn handle_message(&self, msg: Message, from: SocketAddr) {
        match msg {
            Message::Ping { seqno, target, .. } => {
                if target != self.local_name {
                    tracing::debug!(%from, ping_target = %target, "ignoring ping for another node");
                    return;
                }
                let ack = Message::Ack {
                    seqno,
                    payload: Vec::new(),
                };
                self.send_with_piggyback(from, ack).await;
            }
            Message::IndirectPing {
                seqno,
                target,
                target_addr,
                ..
            } => {
                self.relay_probe(seqno, target, target_addr, from).await;
            }
            Message::Ack { seqno, .. } => {
                self.acks.invoke(seqno);
            }
            Message::Nack { seqno } => {
                tracing::debug!(seqno, %from, "indirect probe refused");
            }
            Message::Alive {
                incarnation,
                name,
                addr,
                meta,
            } => {
                self.engine.mark_alive(incarnation, &name, addr, meta);
            }
            Message::Suspect { incarnation, name, from: origin } => {
                self.engine.mark_suspect(incarnation, &name, &origin);
            }
            Message::Dead { incarnation, name, from: origin } => {
                self.engine.mark_dead(incarnation, &name, &origin);
            }
            Message::PushPull { .. } => {
                tracing::debug!(%from, "ignoring push/pull on the datagram path");
            }
        }
    }

    /// Probe `target` on behalf of `origin` and forward the ack under the
    /// origin's sequence number.
    async fn relay_probe(&self, origin_seqno: u32, target: String, target_addr: SocketAddr, origin: SocketAddr) {
        let seqno = self.acks.next_seqno();

        let transport = Arc::clone(&self.transport);
        let forward = AckHandler::Callback(Box::new(move || {
            tokio::spawn(async move {
                let ack = Message::Ack {
                    seqno: origin_seqno,
                    payload: Vec::new(),
                };
                match message::encode_frame(&[ack]) {
                    Ok(frame) => {
                        if let Err(e) = transport.send_datagram(&frame, origin).await {
                            tracing::debug!(%origin, error = %e, "failed to forward indirect ack");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode indirect ack"),
                }
            });
        }));
        self.acks.register(seqno, forward, self.probe_timeout);

        let ping = Message::Ping {
            seqno,
            source: self.local_name.clone(),
            target,
        };
        self.send_with_piggyback(target_addr, ping).await;
    }

    /// Send one message plus any pending broadcasts as a compound frame.
    async fn send_with_piggyback(&self, dest: SocketAddr, msg: Message) {
        let mut frame = vec![msg];
        frame.extend(self.broadcasts.pop(self.table.len(), MAX_PIGGYBACK));
        self.send_frame(dest, &frame).await;
    }

    async fn send_frame(&self, dest: SocketAddr, frame: &[Message]) {
        match message::encode_frame(frame) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send_datagram(&bytes, dest).await {
                    tracing::warn!(%dest, error = %e, "datagram send failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "frame encoding failed"),
        }
    }
}
