// dmxnode - Art-Net/sACN to DMX512 output node
// Core supervisor: data-plane wiring and lifecycle

pub mod buffers;
pub mod clock;
pub mod config;
pub mod failsafe;
pub mod merge;
pub mod metrics;
pub mod network;
pub mod output;
pub mod route;
pub mod snapshot;

use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use buffers::PortBuffers;
use clock::MonotonicClock;
use config::{Config, ConfigEvent, ConfigSource};
use failsafe::SnapshotBank;
use merge::{MergeEngine, MergeMode};
use metrics::{Metrics, MetricsSnapshot};
use network::ingest;
use network::multicast::MulticastManager;
use network::{ARTNET_PORT, SACN_PORT};
use output::PortBackend;
use route::RoutingTable;
use snapshot::{MemorySnapshotStore, SnapshotStore};

/// DMX512 standard channel count
pub const DMX_UNIVERSE_SIZE: usize = 512;
/// Null start code + 512 channels
pub const DMX_FRAME_SIZE: usize = DMX_UNIVERSE_SIZE + 1;
pub const DMX_START_CODE: u8 = 0x00;
/// Number of physical output ports
pub const PORT_COUNT: usize = 4;

/// Start-time failures. Data-plane errors never surface here; they are
/// counted and logged instead.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("both listener sockets failed to bind")]
    AllSocketsDown,
    #[error("port index {0} out of range")]
    InvalidPort(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Aggregates owned by the core and handed to the workers. Write access is
/// narrowed per component: the merge engine owns the buffer write side, the
/// adapter owns the config/route swaps, everyone else reads.
pub(crate) struct CoreShared {
    pub(crate) clock: MonotonicClock,
    pub(crate) config: RwLock<Arc<Config>>,
    pub(crate) routes: RwLock<Arc<RoutingTable>>,
    pub(crate) buffers: Arc<PortBuffers>,
    pub(crate) merge: MergeEngine,
    pub(crate) multicast: MulticastManager,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) snapshots: SnapshotBank,
    pub(crate) snapshot_store: Box<dyn SnapshotStore>,
}

impl CoreShared {
    pub(crate) fn new(config: Config, snapshot_store: Box<dyn SnapshotStore>) -> Self {
        let buffers = Arc::new(PortBuffers::new());
        let metrics = Arc::new(Metrics::new());
        Self {
            clock: MonotonicClock::new(),
            routes: RwLock::new(Arc::new(RoutingTable::from_config(&config))),
            config: RwLock::new(Arc::new(config)),
            merge: MergeEngine::new(buffers.clone()),
            buffers,
            multicast: MulticastManager::new(metrics.clone()),
            metrics,
            snapshots: SnapshotBank::new(),
            snapshot_store,
        }
    }

    pub(crate) fn config_snapshot(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub(crate) fn routes(&self) -> Arc<RoutingTable> {
        self.routes.read().clone()
    }

    /// Swap in a new config and routing table wholesale, then bring the
    /// multicast memberships in line.
    fn apply_config(&self, config: Config) {
        let config = Arc::new(config);
        *self.routes.write() = Arc::new(RoutingTable::from_config(&config));
        *self.config.write() = config.clone();
        self.multicast.reconcile(&config);
    }
}

/// Startup options. Wire defaults are the standard ports; tests override
/// them to run hermetically.
pub struct CoreOptions {
    pub artnet_port: u16,
    pub sacn_port: u16,
    pub backends: [PortBackend; PORT_COUNT],
    pub snapshot_store: Box<dyn SnapshotStore>,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            artnet_port: ARTNET_PORT,
            sacn_port: SACN_PORT,
            backends: std::array::from_fn(|_| output::discard_backend()),
            snapshot_store: Box::new(MemorySnapshotStore::new()),
        }
    }
}

/// Handle to a running core. Dropping it without `stop` detaches the
/// workers; `stop` shuts everything down cleanly.
pub struct DmxCore {
    shared: Arc<CoreShared>,
    stop: watch::Sender<bool>,
    ingest_task: tokio::task::JoinHandle<()>,
    adapter_task: tokio::task::JoinHandle<()>,
    output_workers: Vec<std::thread::JoinHandle<()>>,
    artnet_addr: Option<SocketAddr>,
    sacn_addr: Option<SocketAddr>,
}

impl DmxCore {
    /// Bring up sockets, ingestion, output workers and the config/event
    /// adapter.
    pub async fn start(
        config_source: Arc<dyn ConfigSource>,
        options: CoreOptions,
    ) -> Result<Self, CoreError> {
        let config = config_source.snapshot().validated();
        let shared = Arc::new(CoreShared::new(config, options.snapshot_store));
        let config = shared.config_snapshot();

        // Restore fail-safe snapshots before the first output tick
        if config.failsafe.has_snapshot {
            for port in 0..PORT_COUNT {
                match shared.snapshot_store.load(port) {
                    Some(data) => shared.snapshots.set(port, &data),
                    None => warn!("failed to restore snapshot for port {}, using zeros", port),
                }
            }
        }

        let sockets = ingest::bind_sockets(options.artnet_port, options.sacn_port, &shared);
        if !sockets.any_bound() {
            return Err(CoreError::AllSocketsDown);
        }
        let artnet_addr = sockets.artnet.as_ref().and_then(|s| s.local_addr().ok());
        let sacn_addr = sockets.sacn.as_ref().and_then(|s| s.local_addr().ok());

        if let Some(sacn) = &sockets.sacn {
            shared.multicast.apply_to_socket(sacn.clone());
        }
        shared.multicast.reconcile(&config);

        let (stop, stop_rx) = watch::channel(false);
        let output_workers = output::engine::spawn_workers(&shared, options.backends, &stop_rx)?;
        let ingest_task = tokio::spawn(ingest::run(shared.clone(), sockets, stop_rx.clone()));
        let adapter_task = tokio::spawn(run_event_adapter(
            shared.clone(),
            config_source,
            stop_rx,
        ));

        info!("core started");
        Ok(Self {
            shared,
            stop,
            ingest_task,
            adapter_task,
            output_workers,
            artnet_addr,
            sacn_addr,
        })
    }

    /// Clean shutdown: the ingestion worker wakes within 100 ms, leaves
    /// its multicast groups and closes the sockets; output workers finish
    /// their tick and exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if self.ingest_task.await.is_err() {
            error!("ingestion task panicked");
        }
        if self.adapter_task.await.is_err() {
            error!("event adapter task panicked");
        }
        for worker in self.output_workers {
            if worker.join().is_err() {
                error!("output worker panicked");
            }
        }
        info!("core stopped");
    }

    /// Read-only copy of a port's current output universe.
    pub fn dmx_buffer(&self, port: usize) -> Result<[u8; DMX_UNIVERSE_SIZE], CoreError> {
        check_port(port)?;
        Ok(self.shared.buffers.copy_current(port))
    }

    /// Output change rate over the recent activity window.
    pub fn port_fps(&self, port: usize) -> Result<u16, CoreError> {
        check_port(port)?;
        Ok(self.shared.buffers.fps(port))
    }

    /// Runtime-only merge-mode change; not persisted.
    pub fn set_merge_mode(&self, port: usize, mode: MergeMode) -> Result<(), CoreError> {
        check_port(port)?;
        self.shared.merge.set_merge_mode(port, mode);
        Ok(())
    }

    pub fn merge_mode(&self, port: usize) -> Result<MergeMode, CoreError> {
        check_port(port)?;
        Ok(self.shared.merge.merge_mode(port))
    }

    /// Copy the port's current output into its fail-safe snapshot and
    /// persist it through the snapshot store.
    pub fn request_snapshot(&self, port: usize) -> Result<(), CoreError> {
        check_port(port)?;
        let data = self.shared.buffers.copy_current(port);
        self.shared.snapshots.set(port, &data);
        self.shared.snapshot_store.save(port, &data)?;
        info!("snapshot recorded for port {}", port);
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Universes the multicast manager currently tracks.
    pub fn multicast_universes(&self) -> Vec<u16> {
        self.shared.multicast.joined_universes()
    }

    pub fn artnet_local_addr(&self) -> Option<SocketAddr> {
        self.artnet_addr
    }

    pub fn sacn_local_addr(&self) -> Option<SocketAddr> {
        self.sacn_addr
    }
}

fn check_port(port: usize) -> Result<(), CoreError> {
    if port >= PORT_COUNT {
        return Err(CoreError::InvalidPort(port));
    }
    Ok(())
}

/// React to collaborator events: config swaps and link transitions.
async fn run_event_adapter(
    shared: Arc<CoreShared>,
    source: Arc<dyn ConfigSource>,
    mut stop: watch::Receiver<bool>,
) {
    use tokio::sync::broadcast::error::RecvError;

    let mut events = source.events();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            event = events.recv() => match event {
                Ok(ConfigEvent::ConfigApplied { port }) => {
                    info!("config applied on port {}, reloading routes", port);
                    shared.apply_config(source.snapshot().validated());
                }
                Ok(ConfigEvent::LinkUp) => {
                    info!("link up, replaying multicast memberships");
                    shared.multicast.rejoin_all();
                }
                Ok(ConfigEvent::LinkDown) => {
                    info!("link down");
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("event stream lagged by {}, resyncing config", n);
                    shared.apply_config(source.snapshot().validated());
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
