// Shared DMX output buffers with activity and FPS tracking

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{DMX_UNIVERSE_SIZE, PORT_COUNT};

const FPS_WINDOW_SIZE: usize = 100; // Track last 100 output changes
const FPS_MAX: u64 = 200;

/// Circular buffer of activity timestamps for FPS estimation
#[derive(Debug)]
struct FpsRing {
    timestamps: [u64; FPS_WINDOW_SIZE],
    write_idx: usize,
    count: usize,
}

impl FpsRing {
    const fn new() -> Self {
        Self {
            timestamps: [0; FPS_WINDOW_SIZE],
            write_idx: 0,
            count: 0,
        }
    }

    fn push(&mut self, timestamp_us: u64) {
        self.timestamps[self.write_idx] = timestamp_us;
        self.write_idx = (self.write_idx + 1) % FPS_WINDOW_SIZE;
        if self.count < FPS_WINDOW_SIZE {
            self.count += 1;
        }
    }

    fn fps(&self) -> u16 {
        // Need at least 2 samples to estimate a rate
        if self.count < 2 {
            return 0;
        }

        let oldest_idx = (self.write_idx + FPS_WINDOW_SIZE - self.count) % FPS_WINDOW_SIZE;
        let newest_idx = (self.write_idx + FPS_WINDOW_SIZE - 1) % FPS_WINDOW_SIZE;

        let oldest = self.timestamps[oldest_idx];
        let newest = self.timestamps[newest_idx];
        if newest <= oldest {
            return 0;
        }

        let fps = (self.count as u64 - 1) * 1_000_000 / (newest - oldest);
        fps.min(FPS_MAX) as u16
    }
}

struct BufferInner {
    current: [u8; DMX_UNIVERSE_SIZE],
    fps: FpsRing,
}

struct PortBuffer {
    inner: Mutex<BufferInner>,
    last_activity_us: AtomicU64,
}

impl PortBuffer {
    fn new() -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                current: [0; DMX_UNIVERSE_SIZE],
                fps: FpsRing::new(),
            }),
            last_activity_us: AtomicU64::new(0),
        }
    }
}

/// One stable 512-byte output buffer per port. The merge engine is the only
/// writer; the output engine and external inspectors take copies.
pub struct PortBuffers {
    ports: [PortBuffer; PORT_COUNT],
}

impl PortBuffers {
    pub fn new() -> Self {
        Self {
            ports: std::array::from_fn(|_| PortBuffer::new()),
        }
    }

    /// Compare-then-copy writeback. Returns true when the contents actually
    /// changed; identical data leaves the buffer and the activity timestamp
    /// untouched (idle suppression).
    pub(crate) fn write_if_changed(
        &self,
        port: usize,
        data: &[u8; DMX_UNIVERSE_SIZE],
        now_us: u64,
    ) -> bool {
        let buffer = &self.ports[port];
        let mut inner = buffer.inner.lock();
        if inner.current == *data {
            return false;
        }
        inner.current.copy_from_slice(data);
        inner.fps.push(now_us);
        buffer.last_activity_us.store(now_us, Ordering::Release);
        true
    }

    /// Copy of the port's current output universe.
    pub fn copy_current(&self, port: usize) -> [u8; DMX_UNIVERSE_SIZE] {
        self.ports[port].inner.lock().current
    }

    /// Copy the current universe into a caller-provided slice of 512 bytes.
    pub(crate) fn copy_current_into(&self, port: usize, out: &mut [u8]) {
        let inner = self.ports[port].inner.lock();
        out.copy_from_slice(&inner.current);
    }

    pub fn last_activity_us(&self, port: usize) -> u64 {
        self.ports[port].last_activity_us.load(Ordering::Acquire)
    }

    pub fn fps(&self, port: usize) -> u16 {
        self.ports[port].inner.lock().fps.fps()
    }
}

impl Default for PortBuffers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_zero_without_samples() {
        let buffers = PortBuffers::new();
        assert_eq!(buffers.fps(0), 0);
    }

    #[test]
    fn fps_zero_with_single_sample() {
        let buffers = PortBuffers::new();
        let mut data = [0u8; DMX_UNIVERSE_SIZE];
        data[0] = 1;
        assert!(buffers.write_if_changed(0, &data, 1_000));
        assert_eq!(buffers.fps(0), 0);
    }

    #[test]
    fn fps_tracks_steady_rate() {
        let buffers = PortBuffers::new();
        let mut data = [0u8; DMX_UNIVERSE_SIZE];
        // 40 Hz: one change every 25 000 us
        for i in 0..50u64 {
            data[0] = i as u8 + 1;
            buffers.write_if_changed(0, &data, i * 25_000);
        }
        let fps = buffers.fps(0);
        assert!((39..=41).contains(&fps), "fps = {}", fps);
    }

    #[test]
    fn fps_capped() {
        let buffers = PortBuffers::new();
        let mut data = [0u8; DMX_UNIVERSE_SIZE];
        for i in 0..10u64 {
            data[0] = i as u8 + 1;
            buffers.write_if_changed(0, &data, i);
        }
        assert_eq!(buffers.fps(0), 200);
    }

    #[test]
    fn fps_window_wraps() {
        let buffers = PortBuffers::new();
        let mut data = [0u8; DMX_UNIVERSE_SIZE];
        // More samples than the window; the estimate uses the last 100
        for i in 0..250u64 {
            data[0] = (i % 255) as u8 + 1;
            buffers.write_if_changed(0, &data, i * 50_000);
        }
        let fps = buffers.fps(0);
        assert!((19..=21).contains(&fps), "fps = {}", fps);
    }

    #[test]
    fn writeback_suppresses_identical_data() {
        let buffers = PortBuffers::new();
        let mut data = [0u8; DMX_UNIVERSE_SIZE];
        data[7] = 0x55;

        assert!(buffers.write_if_changed(1, &data, 100));
        assert_eq!(buffers.last_activity_us(1), 100);

        // Same contents again: no write, no new activity stamp
        assert!(!buffers.write_if_changed(1, &data, 200));
        assert_eq!(buffers.last_activity_us(1), 100);

        data[7] = 0x56;
        assert!(buffers.write_if_changed(1, &data, 300));
        assert_eq!(buffers.last_activity_us(1), 300);
        assert_eq!(buffers.copy_current(1)[7], 0x56);
    }

    #[test]
    fn ports_are_independent() {
        let buffers = PortBuffers::new();
        let mut data = [0u8; DMX_UNIVERSE_SIZE];
        data[0] = 9;
        buffers.write_if_changed(2, &data, 500);
        assert_eq!(buffers.copy_current(2)[0], 9);
        assert_eq!(buffers.copy_current(3)[0], 0);
        assert_eq!(buffers.last_activity_us(3), 0);
    }
}
