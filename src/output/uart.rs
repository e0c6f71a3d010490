// UART transmit backend
//
// Generates the break by inverting the TX line for `break_us`, releases it
// for the mark-after-break, then pushes the 513-byte frame through the UART
// at 250 kbit/s 8-N-2. A driver-enable line gates the RS-485 transceiver
// around the whole frame.

use std::time::Duration;

use super::TxError;
use crate::config::PortTiming;
use crate::DMX_FRAME_SIZE;

/// Narrow view of a UART peripheral with an RS-485 driver-enable line.
pub trait UartPort: Send {
    fn set_driver_enable(&mut self, enabled: bool);

    /// Invert (true) or release (false) the TX line for break generation.
    fn set_break_level(&mut self, active: bool);

    /// Block until any in-flight transmit has left the shifter.
    fn wait_tx_idle(&mut self) -> Result<(), TxError>;

    /// Queue a full frame; completion is awaited via `wait_tx_idle`.
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TxError>;
}

/// Transmit backend driving a `UartPort`.
pub struct UartTx {
    port: Box<dyn UartPort>,
}

impl UartTx {
    pub fn new(port: Box<dyn UartPort>) -> Self {
        Self { port }
    }

    pub(crate) fn submit(
        &mut self,
        frame: &[u8; DMX_FRAME_SIZE],
        timing: &PortTiming,
    ) -> Result<(), TxError> {
        self.port.set_driver_enable(true);
        let result = self.transfer(frame, timing);
        self.port.set_driver_enable(false);
        result
    }

    fn transfer(&mut self, frame: &[u8], timing: &PortTiming) -> Result<(), TxError> {
        // Previous frame may still be shifting out
        self.port.wait_tx_idle()?;

        self.port.set_break_level(true);
        std::thread::sleep(Duration::from_micros(timing.break_us as u64));
        self.port.set_break_level(false);
        std::thread::sleep(Duration::from_micros(timing.mab_us as u64));

        self.port.write_frame(frame)?;
        self.port.wait_tx_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum UartOp {
        DriverEnable(bool),
        BreakLevel(bool),
        WaitIdle,
        Write(Vec<u8>),
    }

    struct RecordingUart {
        ops: Arc<Mutex<Vec<UartOp>>>,
        fail_write: bool,
    }

    impl UartPort for RecordingUart {
        fn set_driver_enable(&mut self, enabled: bool) {
            self.ops.lock().push(UartOp::DriverEnable(enabled));
        }

        fn set_break_level(&mut self, active: bool) {
            self.ops.lock().push(UartOp::BreakLevel(active));
        }

        fn wait_tx_idle(&mut self) -> Result<(), TxError> {
            self.ops.lock().push(UartOp::WaitIdle);
            Ok(())
        }

        fn write_frame(&mut self, frame: &[u8]) -> Result<(), TxError> {
            self.ops.lock().push(UartOp::Write(frame.to_vec()));
            if self.fail_write {
                return Err(TxError::QueueFull);
            }
            Ok(())
        }
    }

    fn timing() -> PortTiming {
        // Short break/MAB keep the test fast; values are still in range
        PortTiming {
            break_us: 88,
            mab_us: 8,
            refresh_hz: 40,
        }
    }

    #[test]
    fn frame_sequence_is_ordered() {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let mut tx = UartTx::new(Box::new(RecordingUart {
            ops: ops.clone(),
            fail_write: false,
        }));

        let mut frame = [0u8; DMX_FRAME_SIZE];
        frame[1] = 0x42;
        tx.submit(&frame, &timing()).unwrap();

        let ops = ops.lock();
        assert_eq!(ops[0], UartOp::DriverEnable(true));
        assert_eq!(ops[1], UartOp::WaitIdle);
        assert_eq!(ops[2], UartOp::BreakLevel(true));
        assert_eq!(ops[3], UartOp::BreakLevel(false));
        match &ops[4] {
            UartOp::Write(bytes) => {
                assert_eq!(bytes.len(), DMX_FRAME_SIZE);
                assert_eq!(bytes[0], 0x00);
                assert_eq!(bytes[1], 0x42);
            }
            other => panic!("expected write, got {:?}", other),
        }
        assert_eq!(ops[5], UartOp::WaitIdle);
        assert_eq!(ops[6], UartOp::DriverEnable(false));
        assert_eq!(ops.len(), 7);
    }

    #[test]
    fn driver_enable_released_on_error() {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let mut tx = UartTx::new(Box::new(RecordingUart {
            ops: ops.clone(),
            fail_write: true,
        }));

        let err = tx.submit(&[0u8; DMX_FRAME_SIZE], &timing()).unwrap_err();
        assert_eq!(err, TxError::QueueFull);
        assert_eq!(ops.lock().last(), Some(&UartOp::DriverEnable(false)));
    }
}
