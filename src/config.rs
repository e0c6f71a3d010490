// Configuration snapshots and events consumed from the management collaborator

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::PORT_COUNT;

/// Protocol type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    ArtNet,
    #[serde(rename = "sACN")]
    Sacn,
}

/// DMX line timing for one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortTiming {
    /// Break time: 88-500us
    #[serde(default = "default_break_us")]
    pub break_us: u16,
    /// Mark After Break: 8-100us
    #[serde(default = "default_mab_us")]
    pub mab_us: u16,
    /// Refresh rate: 20-44Hz
    #[serde(default = "default_refresh_hz")]
    pub refresh_hz: u16,
}

pub const BREAK_US_MIN: u16 = 88;
pub const BREAK_US_MAX: u16 = 500;
pub const MAB_US_MIN: u16 = 8;
pub const MAB_US_MAX: u16 = 100;
pub const REFRESH_HZ_MIN: u16 = 20;
pub const REFRESH_HZ_MAX: u16 = 44;

fn default_break_us() -> u16 {
    176
}

fn default_mab_us() -> u16 {
    12
}

fn default_refresh_hz() -> u16 {
    40
}

impl Default for PortTiming {
    fn default() -> Self {
        Self {
            break_us: default_break_us(),
            mab_us: default_mab_us(),
            refresh_hz: default_refresh_hz(),
        }
    }
}

impl PortTiming {
    /// Clamp every field into its legal range without reporting.
    pub fn clamped(&self) -> Self {
        Self {
            break_us: self.break_us.clamp(BREAK_US_MIN, BREAK_US_MAX),
            mab_us: self.mab_us.clamp(MAB_US_MIN, MAB_US_MAX),
            refresh_hz: self.refresh_hz.clamp(REFRESH_HZ_MIN, REFRESH_HZ_MAX),
        }
    }

    fn in_range(&self) -> bool {
        *self == self.clamped()
    }
}

/// Per-port configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default)]
    pub enabled: bool,
    pub protocol: Protocol,
    #[serde(default)]
    pub universe: u16,
    #[serde(default)]
    pub timing: PortTiming,
}

/// Universe ids are 15-bit
pub const UNIVERSE_MAX: u16 = 32767;

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            protocol: Protocol::ArtNet,
            universe: 0,
            timing: PortTiming::default(),
        }
    }
}

/// Fail-safe output policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailsafeMode {
    Hold,
    Blackout,
    Snapshot,
}

/// Global fail-safe configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailsafeConfig {
    #[serde(default = "default_failsafe_mode")]
    pub mode: FailsafeMode,
    #[serde(default = "default_failsafe_timeout_ms")]
    pub timeout_ms: u16,
    #[serde(default)]
    pub has_snapshot: bool,
}

fn default_failsafe_mode() -> FailsafeMode {
    FailsafeMode::Hold
}

fn default_failsafe_timeout_ms() -> u16 {
    2000
}

impl Default for FailsafeConfig {
    fn default() -> Self {
        Self {
            mode: default_failsafe_mode(),
            timeout_ms: default_failsafe_timeout_ms(),
            has_snapshot: false,
        }
    }
}

/// Point-in-time configuration snapshot for the whole node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ports: [PortConfig; PORT_COUNT],
    #[serde(default)]
    pub failsafe: FailsafeConfig,
}

impl Config {
    /// Clamp out-of-range values into their legal domains. The external
    /// validator normally rejects these before they reach the core; a value
    /// that slips through is clamped with a warning.
    pub fn validated(mut self) -> Self {
        for (idx, port) in self.ports.iter_mut().enumerate() {
            if port.universe > UNIVERSE_MAX {
                warn!(
                    "port {} universe {} above maximum, clamping to {}",
                    idx, port.universe, UNIVERSE_MAX
                );
                port.universe = UNIVERSE_MAX;
            }
            if !port.timing.in_range() {
                let clamped = port.timing.clamped();
                warn!(
                    "port {} timing out of range ({:?}), clamping to {:?}",
                    idx, port.timing, clamped
                );
                port.timing = clamped;
            }
        }
        self
    }
}

/// Events emitted by the management collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    ConfigApplied { port: usize },
    LinkUp,
    LinkDown,
}

/// Read side of the configuration collaborator: point-in-time snapshots
/// plus a change-event stream.
pub trait ConfigSource: Send + Sync {
    fn snapshot(&self) -> Config;
    fn events(&self) -> broadcast::Receiver<ConfigEvent>;
}

/// In-process configuration holder. The management surface applies whole
/// snapshots here; the core only ever reads.
pub struct SharedConfig {
    current: RwLock<Config>,
    events: broadcast::Sender<ConfigEvent>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            current: RwLock::new(config),
            events,
        }
    }

    /// Replace the configuration and announce which port changed.
    pub fn apply(&self, config: Config, port: usize) {
        *self.current.write() = config;
        let _ = self.events.send(ConfigEvent::ConfigApplied { port });
    }

    pub fn notify_link_up(&self) {
        let _ = self.events.send(ConfigEvent::LinkUp);
    }

    pub fn notify_link_down(&self) {
        let _ = self.events.send(ConfigEvent::LinkDown);
    }
}

impl ConfigSource for SharedConfig {
    fn snapshot(&self) -> Config {
        *self.current.read()
    }

    fn events(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }
}
