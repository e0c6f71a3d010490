// Stream-loss supervision and output substitution

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::buffers::PortBuffers;
use crate::config::{FailsafeConfig, FailsafeMode};
use crate::{DMX_UNIVERSE_SIZE, PORT_COUNT};

/// Per-port snapshot buffers shared between the output workers and the
/// snapshot API. Restored from the store at start, recorded on request.
pub struct SnapshotBank {
    ports: [Mutex<[u8; DMX_UNIVERSE_SIZE]>; PORT_COUNT],
}

impl SnapshotBank {
    pub fn new() -> Self {
        Self {
            ports: std::array::from_fn(|_| Mutex::new([0; DMX_UNIVERSE_SIZE])),
        }
    }

    pub fn set(&self, port: usize, data: &[u8; DMX_UNIVERSE_SIZE]) {
        *self.ports[port].lock() = *data;
    }

    pub fn get(&self, port: usize) -> [u8; DMX_UNIVERSE_SIZE] {
        *self.ports[port].lock()
    }

    fn copy_into(&self, port: usize, out: &mut [u8]) {
        out.copy_from_slice(&*self.ports[port].lock());
    }
}

impl Default for SnapshotBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-port stream-loss state, owned by that port's output worker. Reads
/// activity and buffer contents only; never writes into shared buffers.
pub(crate) struct FailsafeState {
    port: usize,
    in_failsafe: bool,
}

impl FailsafeState {
    pub fn new(port: usize) -> Self {
        Self {
            port,
            in_failsafe: false,
        }
    }

    pub fn in_failsafe(&self) -> bool {
        self.in_failsafe
    }

    /// Fill `out` (512 bytes) with the data to transmit this tick: the live
    /// buffer while the stream is healthy, the configured substitute once
    /// it has been silent past the timeout. Transitions are logged once.
    pub fn select_into(
        &mut self,
        now_us: u64,
        config: &FailsafeConfig,
        buffers: &PortBuffers,
        snapshots: &SnapshotBank,
        out: &mut [u8],
    ) {
        let age_us = now_us.saturating_sub(buffers.last_activity_us(self.port));
        let timeout_us = config.timeout_ms as u64 * 1_000;

        if age_us <= timeout_us {
            if self.in_failsafe {
                info!("port {} back to normal", self.port);
                self.in_failsafe = false;
            }
            buffers.copy_current_into(self.port, out);
            return;
        }

        if !self.in_failsafe {
            warn!("port {} entering failsafe ({:?})", self.port, config.mode);
            self.in_failsafe = true;
        }

        match config.mode {
            FailsafeMode::Hold => buffers.copy_current_into(self.port, out),
            FailsafeMode::Blackout => out.fill(0),
            FailsafeMode::Snapshot => snapshots.copy_into(self.port, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (PortBuffers, SnapshotBank) {
        let buffers = PortBuffers::new();
        let mut live = [0u8; DMX_UNIVERSE_SIZE];
        live.fill(0xFF);
        buffers.write_if_changed(0, &live, 1_000_000); // activity at t = 1 s
        let snapshots = SnapshotBank::new();
        snapshots.set(0, &[0xAB; DMX_UNIVERSE_SIZE]);
        (buffers, snapshots)
    }

    fn config(mode: FailsafeMode) -> FailsafeConfig {
        FailsafeConfig {
            mode,
            timeout_ms: 2000,
            has_snapshot: true,
        }
    }

    #[test]
    fn healthy_stream_passes_live_data() {
        let (buffers, snapshots) = fixtures();
        let mut state = FailsafeState::new(0);
        let mut out = [0u8; DMX_UNIVERSE_SIZE];

        // age = 1999 ms, just inside the timeout
        state.select_into(
            2_999_000,
            &config(FailsafeMode::Blackout),
            &buffers,
            &snapshots,
            &mut out,
        );
        assert!(!state.in_failsafe());
        assert_eq!(out, [0xFF; DMX_UNIVERSE_SIZE]);
    }

    #[test]
    fn blackout_substitutes_zeros_past_timeout() {
        let (buffers, snapshots) = fixtures();
        let mut state = FailsafeState::new(0);
        let mut out = [0u8; DMX_UNIVERSE_SIZE];

        // age = 2001 ms
        state.select_into(
            3_001_000,
            &config(FailsafeMode::Blackout),
            &buffers,
            &snapshots,
            &mut out,
        );
        assert!(state.in_failsafe());
        assert_eq!(out, [0; DMX_UNIVERSE_SIZE]);
    }

    #[test]
    fn hold_keeps_last_output() {
        let (buffers, snapshots) = fixtures();
        let mut state = FailsafeState::new(0);
        let mut out = [0u8; DMX_UNIVERSE_SIZE];

        state.select_into(
            10_000_000,
            &config(FailsafeMode::Hold),
            &buffers,
            &snapshots,
            &mut out,
        );
        assert!(state.in_failsafe());
        assert_eq!(out, [0xFF; DMX_UNIVERSE_SIZE]);
    }

    #[test]
    fn snapshot_substitutes_stored_frame() {
        let (buffers, snapshots) = fixtures();
        let mut state = FailsafeState::new(0);
        let mut out = [0u8; DMX_UNIVERSE_SIZE];

        state.select_into(
            10_000_000,
            &config(FailsafeMode::Snapshot),
            &buffers,
            &snapshots,
            &mut out,
        );
        assert!(state.in_failsafe());
        assert_eq!(out, [0xAB; DMX_UNIVERSE_SIZE]);
    }

    #[test]
    fn recovers_when_activity_returns() {
        let (buffers, snapshots) = fixtures();
        let mut state = FailsafeState::new(0);
        let mut out = [0u8; DMX_UNIVERSE_SIZE];
        let cfg = config(FailsafeMode::Blackout);

        state.select_into(10_000_000, &cfg, &buffers, &snapshots, &mut out);
        assert!(state.in_failsafe());

        // New packet bumps activity; the next tick goes back to live data
        let mut live = [0u8; DMX_UNIVERSE_SIZE];
        live.fill(0x42);
        buffers.write_if_changed(0, &live, 10_500_000);
        state.select_into(10_600_000, &cfg, &buffers, &snapshots, &mut out);
        assert!(!state.in_failsafe());
        assert_eq!(out, [0x42; DMX_UNIVERSE_SIZE]);
    }

    #[test]
    fn boundary_age_is_still_normal() {
        let (buffers, snapshots) = fixtures();
        let mut state = FailsafeState::new(0);
        let mut out = [0u8; DMX_UNIVERSE_SIZE];

        // age exactly equal to the timeout stays normal
        state.select_into(
            3_000_000,
            &config(FailsafeMode::Blackout),
            &buffers,
            &snapshots,
            &mut out,
        );
        assert!(!state.in_failsafe());
        assert_eq!(out, [0xFF; DMX_UNIVERSE_SIZE]);
    }
}
