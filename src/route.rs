// Universe-to-port routing

use crate::config::{Config, Protocol};
use crate::PORT_COUNT;

/// One `(protocol, universe) -> port` mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub protocol: Protocol,
    pub universe: u16,
    pub port: usize,
}

/// Immutable routing table. Rebuilt wholesale from each applied config and
/// swapped in behind an `Arc`; never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    entries: Vec<RouteEntry>,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the table from a config snapshot, keeping port order so that
    /// lookups resolve to the lowest-index match.
    pub fn from_config(config: &Config) -> Self {
        let mut entries = Vec::with_capacity(PORT_COUNT);
        for (port, cfg) in config.ports.iter().enumerate() {
            if cfg.enabled {
                entries.push(RouteEntry {
                    protocol: cfg.protocol,
                    universe: cfg.universe,
                    port,
                });
            }
        }
        Self { entries }
    }

    /// Linear scan; at most four comparisons.
    pub fn find_port(&self, protocol: Protocol, universe: u16) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.protocol == protocol && e.universe == universe)
            .map(|e| e.port)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
