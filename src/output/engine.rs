// Periodic per-port DMX output workers

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

use super::PortBackend;
use crate::failsafe::FailsafeState;
use crate::{CoreShared, DMX_FRAME_SIZE, DMX_START_CODE, PORT_COUNT};

/// Spawn one transmit worker per port, each on its own thread so frame
/// timing never competes with the ingestion loop.
pub(crate) fn spawn_workers(
    shared: &Arc<CoreShared>,
    backends: [PortBackend; PORT_COUNT],
    stop: &watch::Receiver<bool>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    backends
        .into_iter()
        .enumerate()
        .map(|(port, backend)| {
            let shared = shared.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("dmx-out-{}", port))
                .spawn(move || run_port(port, shared, backend, stop))
        })
        .collect()
}

fn run_port(
    port: usize,
    shared: Arc<CoreShared>,
    mut backend: PortBackend,
    stop: watch::Receiver<bool>,
) {
    let mut failsafe = FailsafeState::new(port);
    let mut frame = [0u8; DMX_FRAME_SIZE];
    frame[0] = DMX_START_CODE;
    let mut next_tick = Instant::now();

    info!("output worker {} started", port);

    while !*stop.borrow() {
        // Timing and fail-safe settings hot-swap with the config snapshot
        let config = shared.config_snapshot();
        let port_config = &config.ports[port];
        let timing = port_config.timing.clamped();
        let period = Duration::from_micros(1_000_000 / timing.refresh_hz as u64);

        if port_config.enabled {
            failsafe.select_into(
                shared.clock.now_us(),
                &config.failsafe,
                &shared.buffers,
                &shared.snapshots,
                &mut frame[1..],
            );

            if let Err(e) = backend.submit(&frame, &timing) {
                // Tick dropped; the next one re-submits fresh data
                debug!("port {} tick dropped: {}", port, e);
            }
        }

        // Periodic schedule with skip-on-overrun: a late tick is never
        // queued behind the next one
        next_tick += period;
        let now = Instant::now();
        if next_tick <= now {
            next_tick = now + period;
        } else {
            std::thread::sleep(next_tick - now);
        }
    }

    info!("output worker {} stopping", port);
}
