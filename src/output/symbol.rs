// Symbol-stream transmit backend
//
// Renders a DMX frame as timed line symbols for hardware-timed peripherals:
// break, mark-after-break, then 513 bytes of start bit, eight data-bit
// half-symbol pairs (LSB first) and two stop bits. The encoder is a small
// resumable state machine so a partially filled symbol buffer can be
// continued on the next pump.

use parking_lot::Mutex;
use std::sync::Arc;

use super::{TxError, DMX_BIT_US};
use crate::config::PortTiming;
use crate::DMX_FRAME_SIZE;

/// One timed line state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub high: bool,
    pub duration_us: u16,
}

impl Symbol {
    pub const fn low(duration_us: u16) -> Self {
        Self {
            high: false,
            duration_us,
        }
    }

    pub const fn high(duration_us: u16) -> Self {
        Self {
            high: true,
            duration_us,
        }
    }
}

/// The symbol buffer rejected a push because it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkFull;

/// Consumer of the encoded symbol stream, typically a DMA ring feeding a
/// timer peripheral.
pub trait SymbolSink: Send {
    /// Queue one symbol; `Err(SinkFull)` leaves the symbol with the encoder
    /// for the next pump.
    fn try_push(&mut self, symbol: Symbol) -> Result<(), SinkFull>;

    /// The last symbol of a frame has been queued.
    fn frame_complete(&mut self) -> Result<(), TxError>;

    /// A previous transfer is still in flight; submits are refused while
    /// true.
    fn is_busy(&self) -> bool {
        false
    }
}

enum Stage {
    Break,
    Mab,
    Start,
    /// First (low) half of data bit n
    BitLow(u8),
    /// Second (level = bit value) half of data bit n
    BitLevel(u8),
    Stop1,
    Stop2,
    Done,
}

/// Streaming frame-to-symbol encoder.
pub struct DmxSymbolEncoder {
    frame: [u8; DMX_FRAME_SIZE],
    break_us: u16,
    mab_us: u16,
    byte_idx: usize,
    stage: Stage,
}

impl DmxSymbolEncoder {
    pub fn new(frame: &[u8; DMX_FRAME_SIZE], timing: &PortTiming) -> Self {
        Self {
            frame: *frame,
            break_us: timing.break_us,
            mab_us: timing.mab_us,
            byte_idx: 0,
            stage: Stage::Break,
        }
    }

    fn current(&self) -> Option<Symbol> {
        let byte = self.frame[self.byte_idx.min(DMX_FRAME_SIZE - 1)];
        match self.stage {
            Stage::Break => Some(Symbol::low(self.break_us)),
            Stage::Mab => Some(Symbol::high(self.mab_us)),
            Stage::Start => Some(Symbol::low(DMX_BIT_US)),
            Stage::BitLow(_) => Some(Symbol::low(DMX_BIT_US)),
            Stage::BitLevel(bit) => {
                let high = (byte >> bit) & 1 == 1;
                Some(Symbol {
                    high,
                    duration_us: DMX_BIT_US,
                })
            }
            Stage::Stop1 | Stage::Stop2 => Some(Symbol::high(DMX_BIT_US)),
            Stage::Done => None,
        }
    }

    fn advance(&mut self) {
        self.stage = match self.stage {
            Stage::Break => Stage::Mab,
            Stage::Mab => Stage::Start,
            Stage::Start => Stage::BitLow(0),
            Stage::BitLow(bit) => Stage::BitLevel(bit),
            Stage::BitLevel(bit) if bit < 7 => Stage::BitLow(bit + 1),
            Stage::BitLevel(_) => Stage::Stop1,
            Stage::Stop1 => Stage::Stop2,
            Stage::Stop2 => {
                self.byte_idx += 1;
                if self.byte_idx >= DMX_FRAME_SIZE {
                    Stage::Done
                } else {
                    Stage::Start
                }
            }
            Stage::Done => Stage::Done,
        };
    }

    fn is_done(&self) -> bool {
        matches!(self.stage, Stage::Done)
    }
}

/// Transmit backend driving a `SymbolSink`.
pub struct SymbolTx {
    sink: Box<dyn SymbolSink>,
    pending: Option<DmxSymbolEncoder>,
}

impl SymbolTx {
    pub fn new(sink: Box<dyn SymbolSink>) -> Self {
        Self {
            sink,
            pending: None,
        }
    }

    /// Start a frame transfer. Non-blocking: if the sink fills mid-frame
    /// the remainder streams out on subsequent `pump` calls.
    pub(crate) fn submit(
        &mut self,
        frame: &[u8; DMX_FRAME_SIZE],
        timing: &PortTiming,
    ) -> Result<(), TxError> {
        if self.sink.is_busy() {
            return Err(TxError::Busy);
        }
        if self.pending.is_some() {
            // Previous frame stalled on a full sink; push what fits before
            // deciding this tick is lost
            self.pump()?;
            if self.pending.is_some() {
                return Err(TxError::QueueFull);
            }
        }
        self.pending = Some(DmxSymbolEncoder::new(frame, timing));
        self.pump()
    }

    /// Push queued symbols into the sink until the frame completes or the
    /// sink fills.
    pub fn pump(&mut self) -> Result<(), TxError> {
        let Some(encoder) = self.pending.as_mut() else {
            return Ok(());
        };

        while let Some(symbol) = encoder.current() {
            if self.sink.try_push(symbol).is_err() {
                // Sink full: resume from this symbol on the next pump
                return Ok(());
            }
            encoder.advance();
        }

        if encoder.is_done() {
            self.pending = None;
            self.sink.frame_complete()?;
        }
        Ok(())
    }

    pub fn idle(&self) -> bool {
        self.pending.is_none()
    }
}

/// Accepts everything and throws it away.
pub struct DiscardSink;

impl SymbolSink for DiscardSink {
    fn try_push(&mut self, _symbol: Symbol) -> Result<(), SinkFull> {
        Ok(())
    }

    fn frame_complete(&mut self) -> Result<(), TxError> {
        Ok(())
    }
}

/// Records complete symbol frames for inspection.
pub struct CaptureSink {
    current: Vec<Symbol>,
    frames: Arc<Mutex<Vec<Vec<Symbol>>>>,
}

impl CaptureSink {
    /// Returns the sink and a shared handle to the captured frames.
    pub fn new() -> (Self, Arc<Mutex<Vec<Vec<Symbol>>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                current: Vec::new(),
                frames: frames.clone(),
            },
            frames,
        )
    }
}

impl SymbolSink for CaptureSink {
    fn try_push(&mut self, symbol: Symbol) -> Result<(), SinkFull> {
        self.current.push(symbol);
        Ok(())
    }

    fn frame_complete(&mut self) -> Result<(), TxError> {
        self.frames.lock().push(std::mem::take(&mut self.current));
        Ok(())
    }
}

/// Reassemble the byte stream from a captured symbol frame (test helper).
#[cfg(test)]
pub(crate) fn decode_symbols(symbols: &[Symbol]) -> Vec<u8> {
    // Skip break + MAB, then walk 19-symbol byte groups:
    // start, 8 half-symbol bit pairs, 2 stop
    let mut bytes = Vec::new();
    let mut idx = 2;
    while idx + 19 <= symbols.len() {
        let mut byte = 0u8;
        // start bit at idx, bit pairs follow
        for bit in 0..8 {
            let level = symbols[idx + 1 + bit * 2 + 1];
            if level.high {
                byte |= 1 << bit;
            }
        }
        bytes.push(byte);
        idx += 19;
    }
    bytes
}
