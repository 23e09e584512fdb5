//! ICSP over raw line control.
//!
//! Queues SIX/REGOUT exchanges and clocks them out on flush. Line-level
//! requests drain the queue first so ordering on the wire always matches
//! call order.
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;

use super::Transport;
use crate::constants::MAX_POST_NOPS;
use crate::error::IcspError;
use crate::instruction::{frame, Instruction, Op};

/// Hold time around MCLR edges and after the entry key.
pub const RESET_DELAY: Duration = Duration::from_millis(1);

/// Line driver for the four ICSP signals plus target supply.
pub trait Pins {
    fn set_power(&mut self, on: bool) -> Result<()>;
    fn set_pgc(&mut self, high: bool) -> Result<()>;
    /// Drive PGD, turning it into an output if it was released.
    fn set_pgd(&mut self, high: bool) -> Result<()>;
    fn set_mclr(&mut self, high: bool) -> Result<()>;
    /// Stop driving PGD so the target can.
    fn release_pgd(&mut self) -> Result<()>;
    fn read_pgd(&mut self) -> Result<bool>;

    fn delay(&mut self, duration: Duration) -> Result<()> {
        std::thread::sleep(duration);
        Ok(())
    }
}

pub struct BitBang<P: Pins> {
    pins: P,
    queue: Vec<Op>,
    responses: VecDeque<u8>,
}

impl<P: Pins> BitBang<P> {
    pub fn new(pins: P) -> Self {
        BitBang {
            pins,
            queue: Vec::new(),
            responses: VecDeque::new(),
        }
    }

    pub fn into_inner(self) -> P {
        self.pins
    }

    fn clock_out(&mut self, bit: bool) -> Result<()> {
        self.pins.set_pgd(bit)?;
        self.pins.set_pgc(true)?;
        self.pins.set_pgc(false)
    }

    /// Target shifts on the rising edge, sample after the falling one.
    fn clock_in(&mut self) -> Result<bool> {
        self.pins.set_pgc(true)?;
        self.pins.set_pgc(false)?;
        self.pins.read_pgd()
    }

    fn send_frame(&mut self, value: u32, count: u8) -> Result<()> {
        for bit in frame::bits_lsb_first(value, count) {
            self.clock_out(bit)?;
        }
        Ok(())
    }

    fn six(&mut self, instr: Instruction) -> Result<()> {
        self.send_frame(frame::encode_six(instr), frame::SIX_BITS)
    }

    fn regout(&mut self) -> Result<u16> {
        self.send_frame(frame::REGOUT_CODE, frame::CODE_BITS)?;
        self.pins.release_pgd()?;
        for _ in 0..frame::REGOUT_IDLE_BITS {
            self.clock_in()?;
        }
        let mut bits = Vec::with_capacity(frame::REGOUT_DATA_BITS as usize);
        for _ in 0..frame::REGOUT_DATA_BITS {
            bits.push(self.clock_in()?);
        }
        self.pins.set_pgd(false)?;
        Ok(frame::collect_lsb_first(bits) as u16)
    }

    fn drain_queue(&mut self) -> Result<()> {
        let queue = std::mem::take(&mut self.queue);
        for op in queue {
            match op {
                Op::Six { instr, nops } => {
                    self.six(instr)?;
                    for _ in 0..nops {
                        self.six(Instruction::NOP)?;
                    }
                }
                Op::Regout => {
                    let value = self.regout()?;
                    self.responses.extend(value.to_be_bytes());
                }
                Op::Flush => {}
            }
        }
        Ok(())
    }
}

impl<P: Pins> Transport for BitBang<P> {
    fn vcc(&mut self, on: bool) -> Result<()> {
        self.drain_queue()?;
        self.pins.set_power(on)
    }

    fn clock_low(&mut self) -> Result<()> {
        self.drain_queue()?;
        self.pins.set_pgc(false)
    }

    fn data_low(&mut self) -> Result<()> {
        self.drain_queue()?;
        self.pins.set_pgd(false)
    }

    fn mclr(&mut self, high: bool) -> Result<()> {
        self.drain_queue()?;
        self.pins.set_mclr(high)?;
        self.pins.delay(RESET_DELAY)
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.drain_queue()?;
        for &byte in bytes {
            for i in (0..8).rev() {
                self.clock_out(byte >> i & 1 == 1)?;
            }
        }
        self.pins.delay(RESET_DELAY)
    }

    fn send_bits(&mut self, count: u8, value: u32) -> Result<()> {
        self.drain_queue()?;
        self.send_frame(value, count)
    }

    fn write_instruction(&mut self, instr: Instruction, nops: u8) -> Result<()> {
        anyhow::ensure!(
            nops <= MAX_POST_NOPS,
            "{} NOP slots requested after {}, at most {} allowed",
            nops,
            instr,
            MAX_POST_NOPS
        );
        self.queue.push(Op::Six { instr, nops });
        Ok(())
    }

    fn read_instruction(&mut self) -> Result<()> {
        self.queue.push(Op::Regout);
        Ok(())
    }

    fn get_data(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.len() > self.responses.len() {
            if self.queue.iter().any(|op| matches!(op, Op::Regout)) {
                return Err(IcspError::NotFlushed.into());
            }
            return Err(IcspError::ResponseUnderflow {
                wanted: buf.len(),
                available: self.responses.len(),
            }
            .into());
        }
        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(self.responses.drain(..n)) {
            *dst = src;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.drain_queue()
    }

    fn delay(&mut self, duration: Duration) -> Result<()> {
        self.drain_queue()?;
        self.pins.delay(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every PGD level latched on a rising PGC edge and replays a
    /// fixed bit pattern when PGD is released.
    #[derive(Default)]
    struct Recorder {
        pgc: bool,
        pgd: bool,
        released: bool,
        sent: Vec<bool>,
        reply: VecDeque<bool>,
        mclr_log: Vec<bool>,
        lines: Vec<Line>,
        /// Bits already accounted for in `lines`.
        marked: usize,
    }

    #[derive(Debug, PartialEq)]
    enum Line {
        Mclr(bool),
        Bits(usize),
        Wait(Duration),
    }

    impl Pins for Recorder {
        fn set_power(&mut self, _on: bool) -> Result<()> {
            Ok(())
        }

        fn set_pgc(&mut self, high: bool) -> Result<()> {
            if high && !self.pgc && !self.released {
                self.sent.push(self.pgd);
            }
            self.pgc = high;
            Ok(())
        }

        fn set_pgd(&mut self, high: bool) -> Result<()> {
            self.released = false;
            self.pgd = high;
            Ok(())
        }

        fn set_mclr(&mut self, high: bool) -> Result<()> {
            self.mclr_log.push(high);
            self.lines.push(Line::Mclr(high));
            Ok(())
        }

        fn release_pgd(&mut self) -> Result<()> {
            self.released = true;
            Ok(())
        }

        fn read_pgd(&mut self) -> Result<bool> {
            Ok(self.reply.pop_front().unwrap_or(false))
        }

        fn delay(&mut self, duration: Duration) -> Result<()> {
            if self.sent.len() > self.marked {
                self.lines.push(Line::Bits(self.sent.len() - self.marked));
                self.marked = self.sent.len();
            }
            self.lines.push(Line::Wait(duration));
            Ok(())
        }
    }

    #[test]
    fn test_six_is_clocked_lsb_first_on_flush() {
        let mut bb = BitBang::new(Recorder::default());
        bb.write_instruction(Instruction::new(0x880190).unwrap(), 0)
            .unwrap();
        assert!(bb.pins.sent.is_empty());
        bb.flush().unwrap();

        let sent = &bb.pins.sent;
        assert_eq!(sent.len(), frame::SIX_BITS as usize);
        let value = frame::collect_lsb_first(sent.iter().copied());
        assert_eq!(frame::decode_six(value).unwrap().raw(), 0x880190);
    }

    #[test]
    fn test_nops_follow_instruction() {
        let mut bb = BitBang::new(Recorder::default());
        bb.write_instruction(Instruction::GOTO_EXEC, 2).unwrap();
        bb.flush().unwrap();
        assert_eq!(bb.pins.sent.len(), 3 * frame::SIX_BITS as usize);
        assert!(bb.pins.sent[frame::SIX_BITS as usize..].iter().all(|b| !b));
    }

    #[test]
    fn test_regout_captures_high_byte_first() {
        let mut pins = Recorder::default();
        pins.reply.extend(std::iter::repeat(false).take(8));
        // 0x8001, LSB first
        pins.reply.extend(frame::bits_lsb_first(0x8001, 16));
        let mut bb = BitBang::new(pins);

        bb.read_instruction().unwrap();
        let mut buf = [0u8; 2];
        let err = bb.get_data(&mut buf).unwrap_err();
        assert_eq!(err.downcast_ref::<IcspError>(), Some(&IcspError::NotFlushed));

        bb.flush().unwrap();
        bb.get_data(&mut buf).unwrap();
        assert_eq!(buf, [0x80, 0x01]);
        // control code only; idle and data clocks happen with PGD released
        assert_eq!(bb.pins.sent, vec![true, false, false, false]);
    }

    #[test]
    fn test_key_is_sent_msb_first() {
        let mut bb = BitBang::new(Recorder::default());
        bb.send_bytes(&[0x80, 0x01]).unwrap();
        let mut expected = vec![false; 16];
        expected[0] = true;
        expected[15] = true;
        assert_eq!(bb.pins.sent, expected);
    }

    #[test]
    fn test_line_control_drains_queue() {
        let mut bb = BitBang::new(Recorder::default());
        bb.write_instruction(Instruction::NOP, 0).unwrap();
        bb.mclr(false).unwrap();
        assert_eq!(bb.pins.sent.len(), frame::SIX_BITS as usize);
        assert_eq!(bb.pins.mclr_log, vec![false]);
    }

    #[test]
    fn test_entry_edges_are_held() {
        let mut bb = BitBang::new(Recorder::default());
        bb.mclr(false).unwrap();
        bb.send_bytes(&0x4d43_4851u32.to_be_bytes()).unwrap();
        bb.mclr(true).unwrap();

        assert_eq!(
            bb.pins.lines,
            vec![
                Line::Mclr(false),
                Line::Wait(RESET_DELAY),
                Line::Bits(32),
                Line::Wait(RESET_DELAY),
                Line::Mclr(true),
                Line::Wait(RESET_DELAY),
            ]
        );
    }

    #[test]
    fn test_too_many_nops_rejected() {
        let mut bb = BitBang::new(Recorder::default());
        assert!(bb.write_instruction(Instruction::NOP, MAX_POST_NOPS + 1).is_err());
        bb.write_instruction(Instruction::NOP, MAX_POST_NOPS).unwrap();
        bb.flush().unwrap();
        assert_eq!(
            bb.pins.sent.len(),
            (1 + MAX_POST_NOPS as usize) * frame::SIX_BITS as usize
        );
    }
}
