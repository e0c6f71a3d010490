// sACN multicast group management
//
// Tracks the universes the node wants to receive and reconciles them with
// the lifetime of the sACN socket: joins are queued while no socket is
// bound and replayed when one appears.

use parking_lot::Mutex;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::{Config, Protocol};
use crate::metrics::Metrics;
use crate::network::sacn::sacn_multicast_address;

/// Upper bound on concurrently joined universes
pub const MAX_JOINED_UNIVERSES: usize = 64;

/// Narrow view of a socket's IGMP surface so membership traffic can be
/// observed in tests.
pub trait GroupMembership: Send + Sync {
    fn join(&self, group: Ipv4Addr) -> io::Result<()>;
    fn leave(&self, group: Ipv4Addr) -> io::Result<()>;
}

impl GroupMembership for UdpSocket {
    fn join(&self, group: Ipv4Addr) -> io::Result<()> {
        self.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
    }

    fn leave(&self, group: Ipv4Addr) -> io::Result<()> {
        self.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
    }
}

struct McastInner {
    desired: Vec<u16>,
    socket: Option<Arc<dyn GroupMembership>>,
}

/// Desired-set tracker for sACN multicast memberships.
pub struct MulticastManager {
    inner: Mutex<McastInner>,
    metrics: Arc<Metrics>,
}

impl MulticastManager {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Mutex::new(McastInner {
                desired: Vec::new(),
                socket: None,
            }),
            metrics,
        }
    }

    /// Add a universe to the desired set and join immediately when a
    /// socket is bound. Returns false when refused (universe 0 or table
    /// full).
    pub fn request_join(&self, universe: u16) -> bool {
        // Universe 0 has no multicast group
        if universe == 0 {
            return false;
        }

        let mut inner = self.inner.lock();
        if !inner.desired.contains(&universe) {
            if inner.desired.len() >= MAX_JOINED_UNIVERSES {
                warn!(
                    "cannot join universe {}: {} memberships already tracked",
                    universe, MAX_JOINED_UNIVERSES
                );
                return false;
            }
            inner.desired.push(universe);
        }

        match &inner.socket {
            Some(socket) => self.socket_join(socket.as_ref(), universe),
            None => debug!("join for universe {} queued, socket not ready", universe),
        }
        true
    }

    /// Drop a universe from the desired set and leave its group when a
    /// socket is bound.
    pub fn request_leave(&self, universe: u16) {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.desired.iter().position(|&u| u == universe) else {
            debug!("leave for universe {} ignored, not joined", universe);
            return;
        };
        inner.desired.swap_remove(idx);

        if let Some(socket) = &inner.socket {
            self.socket_leave(socket.as_ref(), universe);
        }
    }

    /// Diff the desired set against the enabled sACN ports of a config
    /// snapshot. Invoked on every config-applied event.
    pub fn reconcile(&self, config: &Config) {
        let desired: Vec<u16> = config
            .ports
            .iter()
            .filter(|p| p.enabled && p.protocol == Protocol::Sacn && p.universe != 0)
            .map(|p| p.universe)
            .collect();

        let current = self.joined_universes();

        for &universe in desired.iter().filter(|u| !current.contains(u)) {
            info!("joining universe {}", universe);
            self.request_join(universe);
        }
        for &universe in current.iter().filter(|u| !desired.contains(u)) {
            info!("leaving universe {}", universe);
            self.request_leave(universe);
        }
    }

    /// Bind a freshly created sACN socket and replay all desired joins.
    pub fn apply_to_socket(&self, socket: Arc<dyn GroupMembership>) {
        let mut inner = self.inner.lock();
        for &universe in &inner.desired {
            self.socket_join(socket.as_ref(), universe);
        }
        inner.socket = Some(socket);
    }

    /// Forget the socket binding; the desired set is retained for the
    /// next socket.
    pub fn clear_socket(&self) {
        self.inner.lock().socket = None;
    }

    /// Re-issue every desired join on the current socket, used after a
    /// link bounce invalidates the kernel's membership state.
    pub fn rejoin_all(&self) {
        let inner = self.inner.lock();
        if let Some(socket) = &inner.socket {
            for &universe in &inner.desired {
                self.socket_join(socket.as_ref(), universe);
            }
        }
    }

    /// Leave every group on the current socket, keeping the desired set.
    /// Used on shutdown before the socket closes.
    pub fn leave_all(&self) {
        let inner = self.inner.lock();
        if let Some(socket) = &inner.socket {
            for &universe in &inner.desired {
                self.socket_leave(socket.as_ref(), universe);
            }
        }
    }

    pub fn joined_universes(&self) -> Vec<u16> {
        self.inner.lock().desired.clone()
    }

    fn socket_join(&self, socket: &dyn GroupMembership, universe: u16) {
        let group = sacn_multicast_address(universe);
        match socket.join(group) {
            Ok(()) => info!("joined multicast {} (universe {})", group, universe),
            Err(e) => {
                warn!("failed to join {}: {}", group, e);
                self.metrics.inc_igmp_failure();
            }
        }
    }

    fn socket_leave(&self, socket: &dyn GroupMembership, universe: u16) {
        let group = sacn_multicast_address(universe);
        match socket.leave(group) {
            Ok(()) => info!("left multicast {} (universe {})", group, universe),
            Err(e) => {
                warn!("failed to drop membership {}: {}", group, e);
                self.metrics.inc_igmp_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum MembershipOp {
        Join(Ipv4Addr),
        Leave(Ipv4Addr),
    }

    /// Records IGMP traffic; optionally fails every call.
    struct RecordingSocket {
        ops: Mutex<Vec<MembershipOp>>,
        fail: bool,
    }

    impl RecordingSocket {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ops: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                ops: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn ops(&self) -> Vec<MembershipOp> {
            self.ops.lock().clone()
        }
    }

    impl GroupMembership for RecordingSocket {
        fn join(&self, group: Ipv4Addr) -> io::Result<()> {
            self.ops.lock().push(MembershipOp::Join(group));
            if self.fail {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            Ok(())
        }

        fn leave(&self, group: Ipv4Addr) -> io::Result<()> {
            self.ops.lock().push(MembershipOp::Leave(group));
            if self.fail {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            Ok(())
        }
    }

    fn manager() -> (MulticastManager, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        (MulticastManager::new(metrics.clone()), metrics)
    }

    fn sacn_config(universes: &[u16]) -> Config {
        let mut config = Config::default();
        for (i, &u) in universes.iter().enumerate() {
            config.ports[i] = PortConfig {
                enabled: true,
                protocol: Protocol::Sacn,
                universe: u,
                ..PortConfig::default()
            };
        }
        config
    }

    #[test]
    fn joins_queue_until_socket_appears() {
        let (manager, _) = manager();
        assert!(manager.request_join(1));
        assert!(manager.request_join(2));
        assert_eq!(manager.joined_universes(), vec![1, 2]);

        let socket = RecordingSocket::new();
        manager.apply_to_socket(socket.clone());
        assert_eq!(
            socket.ops(),
            vec![
                MembershipOp::Join(Ipv4Addr::new(239, 255, 0, 1)),
                MembershipOp::Join(Ipv4Addr::new(239, 255, 0, 2)),
            ]
        );
    }

    #[test]
    fn reconcile_diffs_joins_and_leaves() {
        let (manager, _) = manager();
        let socket = RecordingSocket::new();
        manager.apply_to_socket(socket.clone());

        manager.reconcile(&sacn_config(&[1, 2]));
        assert_eq!(manager.joined_universes(), vec![1, 2]);

        manager.reconcile(&sacn_config(&[3]));
        let mut joined = manager.joined_universes();
        joined.sort_unstable();
        assert_eq!(joined, vec![3]);

        let ops = socket.ops();
        assert_eq!(
            ops,
            vec![
                MembershipOp::Join(Ipv4Addr::new(239, 255, 0, 1)),
                MembershipOp::Join(Ipv4Addr::new(239, 255, 0, 2)),
                MembershipOp::Join(Ipv4Addr::new(239, 255, 0, 3)),
                MembershipOp::Leave(Ipv4Addr::new(239, 255, 0, 1)),
                MembershipOp::Leave(Ipv4Addr::new(239, 255, 0, 2)),
            ]
        );
    }

    #[test]
    fn reconcile_is_idempotent() {
        let (manager, _) = manager();
        let socket = RecordingSocket::new();
        manager.apply_to_socket(socket.clone());

        manager.reconcile(&sacn_config(&[5]));
        manager.reconcile(&sacn_config(&[5]));
        assert_eq!(manager.joined_universes(), vec![5]);
        // Exactly one join on the wire
        assert_eq!(
            socket.ops(),
            vec![MembershipOp::Join(Ipv4Addr::new(239, 255, 0, 5))]
        );
    }

    #[test]
    fn universe_zero_is_never_joined() {
        let (manager, _) = manager();
        assert!(!manager.request_join(0));
        manager.reconcile(&sacn_config(&[0, 4]));
        assert_eq!(manager.joined_universes(), vec![4]);
    }

    #[test]
    fn full_table_refuses_new_joins() {
        let (manager, _) = manager();
        for u in 1..=MAX_JOINED_UNIVERSES as u16 {
            assert!(manager.request_join(u));
        }
        assert!(!manager.request_join(1000));
        // Existing memberships are untouched
        assert_eq!(manager.joined_universes().len(), MAX_JOINED_UNIVERSES);
        // Re-joining an existing member is still fine
        assert!(manager.request_join(1));
    }

    #[test]
    fn igmp_failures_are_counted() {
        let (manager, metrics) = manager();
        manager.apply_to_socket(RecordingSocket::failing());
        manager.request_join(1);
        manager.request_leave(1);
        assert_eq!(metrics.snapshot().igmp_failures, 2);
    }

    #[test]
    fn socket_loss_retains_desired_set() {
        let (manager, _) = manager();
        let socket = RecordingSocket::new();
        manager.apply_to_socket(socket);
        manager.request_join(7);
        manager.clear_socket();
        assert_eq!(manager.joined_universes(), vec![7]);

        // A replacement socket sees the full replay
        let replacement = RecordingSocket::new();
        manager.apply_to_socket(replacement.clone());
        assert_eq!(
            replacement.ops(),
            vec![MembershipOp::Join(Ipv4Addr::new(239, 255, 0, 7))]
        );
    }

    #[test]
    fn rejoin_all_replays_on_current_socket() {
        let (manager, _) = manager();
        let socket = RecordingSocket::new();
        manager.apply_to_socket(socket.clone());
        manager.request_join(9);

        manager.rejoin_all();
        assert_eq!(
            socket.ops(),
            vec![
                MembershipOp::Join(Ipv4Addr::new(239, 255, 0, 9)),
                MembershipOp::Join(Ipv4Addr::new(239, 255, 0, 9)),
            ]
        );
    }

    #[test]
    fn leave_all_keeps_desired_set() {
        let (manager, _) = manager();
        let socket = RecordingSocket::new();
        manager.apply_to_socket(socket.clone());
        manager.request_join(3);
        manager.leave_all();
        assert_eq!(manager.joined_universes(), vec![3]);
        assert!(socket
            .ops()
            .contains(&MembershipOp::Leave(Ipv4Addr::new(239, 255, 0, 3))));
    }
}
