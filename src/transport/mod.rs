//! Abstract ICSP transport interface.
use std::time::Duration;

use anyhow::Result;

use crate::instruction::{Instruction, Sequence};

pub use self::bitbang::{BitBang, Pins};
pub use self::buspirate::BusPirate;
pub use self::sim::{SimConfig, SimTarget};

pub mod bitbang;
pub mod buspirate;
pub mod sim;

/// Abstraction of the programmer hardware.
/// Owns line control, bit serialization and physical timing.
///
/// Instructions and captures are queued; only [`Transport::flush`] guarantees
/// they reached the target and that their response bytes can be drained.
pub trait Transport {
    /// Target supply on or off.
    fn vcc(&mut self, on: bool) -> Result<()>;
    /// Drive PGC low.
    fn clock_low(&mut self) -> Result<()>;
    /// Drive PGD low.
    fn data_low(&mut self) -> Result<()>;
    /// Drive MCLR high (released) or low (reset asserted).
    fn mclr(&mut self, high: bool) -> Result<()>;

    /// Serialize raw bytes, MSB first. Only used for the entry key.
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<()>;
    /// Serialize `count` raw bits of `value`, LSB first.
    fn send_bits(&mut self, count: u8, value: u32) -> Result<()>;

    /// Queue a SIX of `instr` followed by `nops` NOP slots, at most 3.
    fn write_instruction(&mut self, instr: Instruction, nops: u8) -> Result<()>;
    /// Queue a REGOUT, which appends 2 bytes to the response queue.
    fn read_instruction(&mut self) -> Result<()>;
    /// Drain `buf.len()` response bytes in capture order.
    fn get_data(&mut self, buf: &mut [u8]) -> Result<()>;
    /// Block until everything queued has been clocked out.
    fn flush(&mut self) -> Result<()>;

    fn delay(&mut self, duration: Duration) -> Result<()> {
        std::thread::sleep(duration);
        Ok(())
    }

    /// Replay a sequence and drain the bytes it captured.
    fn transfer(&mut self, seq: &Sequence) -> Result<Vec<u8>> {
        seq.run(self)?;
        let mut resp = vec![0u8; seq.response_len()];
        self.get_data(&mut resp)?;
        if !resp.is_empty() {
            log::trace!("<= {}", hex::encode(&resp));
        }
        Ok(resp)
    }
}
