// Public membership facade
//
// Wires the table, transition engine, prober, ack registry, broadcast queue
// and anti-entropy exchanger together over a transport, and runs the
// background tasks: datagram dispatch, stream dispatch, the probe scheduler
// and the push/pull scheduler.

use crate::ack::AckRegistry;
use crate::broadcast::BroadcastQueue;
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::event::{EventBus, MemberEvent};
use crate::lifecycle::LifecycleEngine;
use crate::node::{Member, MemberStatus};
use crate::probe::Prober;
use crate::state::MemberTable;
use crate::sync::StateSync;
use crate::transport::{NetTransport, Transport};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A running membership instance.
///
/// ```no_run
/// use rusty_mesh::{Membership, MeshConfig};
///
/// #[tokio::main]
/// async fn main() -> rusty_mesh::Result<()> {
///     let node1 = Membership::new(MeshConfig::local("node1")).await?;
///     let node2 = Membership::new(MeshConfig::local("node2")).await?;
///     node2.join(&[node1.local_member().addr]).await?;
///     assert_eq!(node2.members().len(), 2);
///     node2.leave(std::time::Duration::from_secs(1)).await?;
///     node2.shutdown().await?;
///     node1.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct Membership {
    config: MeshConfig,
    table: Arc<MemberTable>,
    engine: LifecycleEngine,
    prober: Arc<Prober>,
    sync: Arc<StateSync>,
    acks: Arc<AckRegistry>,
    broadcasts: Arc<BroadcastQueue>,
    events: Arc<EventBus>,
    transport: Arc<dyn Transport>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shut: AtomicBool,
}

impl Membership {
    /// Bind the network transport and start a fully scheduled instance.
    pub async fn new(config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let transport = NetTransport::bind(config.bind_addr, config.advertise_addr).await?;
        let membership = Self::with_transport(config, Arc::new(transport)).await?;
        membership.start_schedulers();
        Ok(membership)
    }

    /// Assemble an instance over an already running transport. Inbound
    /// dispatch starts immediately; the probe and anti-entropy schedulers
    /// are left to `start_schedulers`.
    pub async fn with_transport(config: MeshConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let table = Arc::new(MemberTable::new(&config.name));
        let events = Arc::new(EventBus::new(config.event_buffer));
        let broadcasts = Arc::new(BroadcastQueue::new(config.retransmit_mult));
        let acks = Arc::new(AckRegistry::new());
        let engine = LifecycleEngine::new(
            &config.name,
            Arc::clone(&table),
            Arc::clone(&events),
            Arc::clone(&broadcasts),
            config.probe_interval,
            config.suspicion_mult,
        );
        let prober = Arc::new(Prober::new(
            &config.name,
            config.probe_interval,
            config.probe_timeout,
            config.indirect_probes,
            config.gossip_fanout,
            config.reap_interval,
            Arc::clone(&table),
            engine.clone(),
            Arc::clone(&acks),
            Arc::clone(&broadcasts),
            Arc::clone(&transport),
        ));
        let sync = Arc::new(StateSync::new(
            &config.name,
            config.push_pull_interval,
            config.dial_timeout,
            Arc::clone(&table),
            engine.clone(),
            Arc::clone(&transport),
        ));

        // The local node enters its own table alive at the first
        // incarnation.
        engine.mark_alive(1, &config.name, transport.advertise_addr(), config.meta.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(dispatch_datagrams(
            Arc::clone(&prober),
            Arc::clone(&transport),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(dispatch_streams(
            Arc::clone(&sync),
            Arc::clone(&transport),
            shutdown_rx.clone(),
        )));

        Ok(Self {
            config,
            table,
            engine,
            prober,
            sync,
            acks,
            broadcasts,
            events,
            transport,
            shutdown_tx,
            shutdown_rx,
            tasks: parking_lot::Mutex::new(tasks),
            shut: AtomicBool::new(false),
        })
    }

    /// Start the probe and anti-entropy schedulers.
    pub fn start_schedulers(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            Arc::clone(&self.prober).run(self.shutdown_rx.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.sync).run(self.shutdown_rx.clone()),
        ));
    }

    /// Contact seed addresses and merge state with each. Returns the number
    /// of seeds successfully exchanged with.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        let mut contacted = 0;
        let mut last_error = None;
        for &seed in seeds {
            match self.sync.push_pull_node(seed).await {
                Ok(()) => contacted += 1,
                Err(e) => {
                    tracing::warn!(%seed, error = %e, "failed to join via seed");
                    last_error = Some(e);
                }
            }
        }
        if contacted == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(contacted)
    }

    /// Gracefully announce departure and wait until the death broadcast has
    /// drained, bounded by `timeout`.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        self.engine.leave();

        let deadline = Instant::now() + timeout;
        loop {
            let peers_left = self
                .table
                .snapshot()
                .iter()
                .any(|m| m.name != self.config.name && m.status == MemberStatus::Alive);
            if !peers_left || self.broadcasts.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(MeshError::Timeout("leave broadcast still pending".to_string()));
            }
            self.prober.gossip().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Known members that are not dead
    pub fn members(&self) -> Vec<Member> {
        self.table
            .snapshot()
            .into_iter()
            .filter(|m| m.status != MemberStatus::Dead)
            .collect()
    }

    /// Snapshot of the local node
    pub fn local_member(&self) -> Member {
        self.table
            .lookup(&self.config.name)
            .expect("local node is always present in its own table")
    }

    /// Subscribe to join notifications
    pub fn subscribe_join(&self) -> mpsc::Receiver<Member> {
        self.events.subscribe_join()
    }

    /// Subscribe to leave notifications
    pub fn subscribe_leave(&self) -> mpsc::Receiver<Member> {
        self.events.subscribe_leave()
    }

    /// Subscribe to update notifications
    pub fn subscribe_update(&self) -> mpsc::Receiver<Member> {
        self.events.subscribe_update()
    }

    /// Subscribe to all notification kinds on one channel
    pub fn subscribe_events(&self) -> mpsc::Receiver<MemberEvent> {
        self.events.subscribe_all()
    }

    /// Stop all tasks, close the transport and end subscriber streams.
    /// Outstanding probe handlers are dropped without firing.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(true);
        self.transport.shutdown().await?;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        futures::future::join_all(tasks).await;

        self.acks.clear();
        self.events.close();
        tracing::info!(node = %self.config.name, "membership shut down");
        Ok(())
    }

    pub(crate) fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    pub(crate) fn prober(&self) -> &Arc<Prober> {
        &self.prober
    }

    pub(crate) fn table(&self) -> &Arc<MemberTable> {
        &self.table
    }

    pub(crate) fn acks(&self) -> &Arc<AckRegistry> {
        &self.acks
    }
}

async fn dispatch_datagrams(
    prober: Arc<Prober>,
    transport: Arc<dyn Transport>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = transport.recv_datagram() => match received {
                Ok(datagram) => prober.handle_datagram(datagram).await,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("datagram dispatcher stopped");
}

async fn dispatch_streams(
    sync: Arc<StateSync>,
    transport: Arc<dyn Transport>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = transport.accept_stream() => match accepted {
                Ok(stream) => {
                    let sync = Arc::clone(&sync);
                    tokio::spawn(async move { sync.handle_stream(stream).await });
                }
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("stream dispatcher stopped");
}
