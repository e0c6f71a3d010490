// DMX512 output engine and transmit backends

pub(crate) mod engine;
pub mod symbol;
pub mod uart;

use thiserror::Error;

use crate::config::PortTiming;
use crate::DMX_FRAME_SIZE;

pub use symbol::{CaptureSink, DiscardSink, DmxSymbolEncoder, SinkFull, Symbol, SymbolSink, SymbolTx};
pub use uart::{UartPort, UartTx};

/// Serial bit cell at 250 kbit/s
pub const DMX_BIT_US: u16 = 4;

/// Transmit-submit failures. Either way the tick is dropped and the next
/// tick re-submits fresh data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxError {
    #[error("transmit backend busy")]
    Busy,
    #[error("transmit queue full")]
    QueueFull,
}

/// A port's transmit backend, chosen at configuration time.
pub enum PortBackend {
    /// Hardware-timed symbol encoder (timer/DMA class peripherals)
    Symbol(SymbolTx),
    /// UART with line inversion for the break, plus a driver-enable line
    Uart(UartTx),
}

impl PortBackend {
    pub(crate) fn submit(
        &mut self,
        frame: &[u8; DMX_FRAME_SIZE],
        timing: &PortTiming,
    ) -> Result<(), TxError> {
        match self {
            PortBackend::Symbol(tx) => tx.submit(frame, timing),
            PortBackend::Uart(tx) => tx.submit(frame, timing),
        }
    }
}

/// Backend that accepts and discards every frame. Placeholder until a
/// hardware sink is wired in.
pub fn discard_backend() -> PortBackend {
    PortBackend::Symbol(SymbolTx::new(Box::new(DiscardSink)))
}
