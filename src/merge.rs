// Per-port multi-source merge (HTP/LTP with sACN priority)

use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::debug;

use crate::buffers::PortBuffers;
use crate::{DMX_UNIVERSE_SIZE, PORT_COUNT};

/// Stream-loss timeout per ANSI E1.31
pub const PROTO_STREAM_TIMEOUT_MS: u64 = 2_500;

/// Merge policy when two equal-priority sources feed one port.
/// Runtime-only; not part of the persisted configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Highest-Takes-Precedence: channel-wise max
    #[default]
    Htp,
    /// Latest-Takes-Precedence: newest source wins the whole universe
    Ltp,
}

/// One network source feeding a port, keyed by its address
#[derive(Debug, Clone, Copy)]
struct SourceSlot {
    active: bool,
    last_pkt_ms: u64,
    priority: u8,
    src_addr: IpAddr,
    data: [u8; DMX_UNIVERSE_SIZE],
}

impl SourceSlot {
    const fn new() -> Self {
        Self {
            active: false,
            last_pkt_ms: 0,
            priority: 0,
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            data: [0; DMX_UNIVERSE_SIZE],
        }
    }

    fn clear(&mut self) {
        self.active = false;
        self.data = [0; DMX_UNIVERSE_SIZE];
    }
}

struct PortMerge {
    sources: [SourceSlot; 2],
    final_data: [u8; DMX_UNIVERSE_SIZE],
    merge_mode: MergeMode,
}

impl PortMerge {
    fn new() -> Self {
        Self {
            sources: [SourceSlot::new(); 2],
            final_data: [0; DMX_UNIVERSE_SIZE],
            merge_mode: MergeMode::default(),
        }
    }

    /// Pick the slot an arriving packet lands in: its own slot if the
    /// address is known, a free slot otherwise, else evict the stalest.
    fn target_slot(&mut self, src_addr: IpAddr) -> &mut SourceSlot {
        if self.sources[0].src_addr == src_addr || !self.sources[0].active {
            return &mut self.sources[0];
        }
        if self.sources[1].src_addr == src_addr || !self.sources[1].active {
            return &mut self.sources[1];
        }
        // Both occupied by other senders: overwrite the older one, slot 0
        // on a tie
        if self.sources[0].last_pkt_ms <= self.sources[1].last_pkt_ms {
            &mut self.sources[0]
        } else {
            &mut self.sources[1]
        }
    }

    /// Recompute `final_data` from the two slots.
    ///
    /// If both sources are active with different sACN priorities, the
    /// higher-priority source wins the entire universe regardless of the
    /// merge mode. Otherwise HTP takes the channel-wise max and LTP takes
    /// the newest source wholesale.
    fn combine(&mut self) {
        let [a, b] = &self.sources;

        if a.active && b.active && a.priority != b.priority {
            let higher = if a.priority > b.priority { a } else { b };
            self.final_data = higher.data;
            return;
        }

        match self.merge_mode {
            MergeMode::Htp => {
                for i in 0..DMX_UNIVERSE_SIZE {
                    let va = if a.active { a.data[i] } else { 0 };
                    let vb = if b.active { b.data[i] } else { 0 };
                    self.final_data[i] = va.max(vb);
                }
            }
            MergeMode::Ltp => {
                let newer = match (a.active, b.active) {
                    (true, true) => Some(if a.last_pkt_ms >= b.last_pkt_ms { a } else { b }),
                    (true, false) => Some(a),
                    (false, true) => Some(b),
                    (false, false) => None,
                };
                match newer {
                    Some(src) => self.final_data = src.data,
                    None => self.final_data = [0; DMX_UNIVERSE_SIZE],
                }
            }
        }
    }

    /// Expire slots that have been silent past the stream timeout.
    /// Returns true when any slot changed.
    fn expire(&mut self, now_ms: u64) -> bool {
        let mut changed = false;
        for slot in &mut self.sources {
            if slot.active && now_ms.saturating_sub(slot.last_pkt_ms) > PROTO_STREAM_TIMEOUT_MS {
                slot.clear();
                changed = true;
            }
        }
        changed
    }
}

/// Write side of the data plane: assigns arriving universes to source
/// slots, combines them, and performs the compare-then-copy writeback into
/// the shared port buffers.
pub struct MergeEngine {
    ports: [Mutex<PortMerge>; PORT_COUNT],
    buffers: Arc<PortBuffers>,
}

impl MergeEngine {
    pub fn new(buffers: Arc<PortBuffers>) -> Self {
        Self {
            ports: std::array::from_fn(|_| Mutex::new(PortMerge::new())),
            buffers,
        }
    }

    /// Feed one parsed universe into a port. `priority` is 0 for Art-Net
    /// and the framing-layer priority for sACN.
    pub fn ingest(
        &self,
        port: usize,
        data: &[u8],
        priority: u8,
        src_addr: IpAddr,
        now_ms: u64,
    ) {
        let mut merge = self.ports[port].lock();

        let slot = merge.target_slot(src_addr);
        slot.active = true;
        slot.last_pkt_ms = now_ms;
        slot.priority = priority;
        slot.src_addr = src_addr;
        // Shorter payloads update only the leading channels; the rest of
        // the slot keeps its previous values
        let len = data.len().min(DMX_UNIVERSE_SIZE);
        slot.data[..len].copy_from_slice(&data[..len]);

        merge.combine();
        self.buffers
            .write_if_changed(port, &merge.final_data, now_ms * 1_000);
    }

    /// Expire silent sources on every port and rewrite outputs that
    /// changed as a result. Invoked from the ingestion loop at least once
    /// per 100 ms.
    pub fn sweep_timeouts(&self, now_ms: u64) {
        for port in 0..PORT_COUNT {
            let mut merge = self.ports[port].lock();
            if merge.expire(now_ms) {
                debug!("port {} source timed out", port);
                merge.combine();
                self.buffers
                    .write_if_changed(port, &merge.final_data, now_ms * 1_000);
            }
        }
    }

    pub fn set_merge_mode(&self, port: usize, mode: MergeMode) {
        self.ports[port].lock().merge_mode = mode;
    }

    pub fn merge_mode(&self, port: usize) -> MergeMode {
        self.ports[port].lock().merge_mode
    }
}
