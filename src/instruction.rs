//! PIC24 instruction words and the ICSP exchanges that carry them.
//!
//! Operations never talk to a transport directly. They build a [`Sequence`]
//! of [`Op`]s which is then replayed in order, so the exact instruction
//! stream of every operation can be inspected without a device.

use std::fmt;

use anyhow::Result;

use crate::constants::{opcodes, MAX_POST_NOPS};
use crate::transport::Transport;

/// A 24-bit PIC24 machine instruction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instruction(u32);

impl Instruction {
    pub const MAX: u32 = 0x00ff_ffff;
    pub const NOP: Instruction = Instruction(opcodes::NOP);
    pub const GOTO_EXEC: Instruction = Instruction(opcodes::GOTO_EXEC);

    pub fn new(raw: u32) -> Result<Self> {
        anyhow::ensure!(
            raw <= Self::MAX,
            "instruction 0x{:x} does not fit in 24 bits",
            raw
        );
        Ok(Instruction(raw))
    }

    /// For opcode constants known to fit.
    pub(crate) const fn fixed(raw: u32) -> Self {
        Instruction(raw & Self::MAX)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// `MOV #lit16, Wd`
    pub const fn mov_literal(lit: u16, wd: u8) -> Self {
        Instruction(opcodes::MOV_LIT_W | (lit as u32) << 4 | (wd & 0x0f) as u32)
    }

    /// `MOV Ws, f` for a word-aligned data-space address.
    pub const fn mov_to_file(ws: u8, file: u16) -> Self {
        Instruction(opcodes::MOV_W_F | ((file as u32) >> 1) << 4 | (ws & 0x0f) as u32)
    }

    /// `MOV f, Wd` for a word-aligned data-space address.
    pub const fn mov_from_file(file: u16, wd: u8) -> Self {
        Instruction(opcodes::MOV_F_W | ((file as u32) >> 1) << 4 | (wd & 0x0f) as u32)
    }

    /// Big-endian wire bytes, opcode byte first.
    pub fn to_bytes(self) -> [u8; 3] {
        let [_, hi, mid, lo] = self.0.to_be_bytes();
        [hi, mid, lo]
    }

    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        Instruction(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06x}", self.0)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06X}", self.0)
    }
}

/// One ICSP exchange as queued on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// SIX: execute `instr`, then clock `nops` NOP slots (0..=3) so that
    /// multi-cycle instructions settle before the next one.
    Six { instr: Instruction, nops: u8 },
    /// REGOUT: capture the 16-bit VISI register, 2 bytes high first.
    Regout,
    /// Barrier: everything queued before it is on the wire and every
    /// capture is readable once it returns.
    Flush,
}

/// An ordered ICSP instruction stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sequence {
    ops: Vec<Op>,
}

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn six(&mut self, instr: Instruction, nops: u8) -> &mut Self {
        debug_assert!(nops <= MAX_POST_NOPS);
        self.ops.push(Op::Six { instr, nops });
        self
    }

    pub fn regout(&mut self) -> &mut Self {
        self.ops.push(Op::Regout);
        self
    }

    pub fn flush(&mut self) -> &mut Self {
        self.ops.push(Op::Flush);
        self
    }

    pub fn append(&mut self, other: &Sequence) -> &mut Self {
        self.ops.extend_from_slice(&other.ops);
        self
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Executed instruction words, in order, without NOP padding.
    pub fn instructions(&self) -> impl Iterator<Item = Instruction> + '_ {
        self.ops.iter().filter_map(|op| match op {
            Op::Six { instr, .. } => Some(*instr),
            _ => None,
        })
    }

    /// Number of response bytes this sequence leaves in the transport.
    pub fn response_len(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, Op::Regout)).count() * 2
    }

    /// Replay onto a transport.
    pub fn run<T: Transport + ?Sized>(&self, transport: &mut T) -> Result<()> {
        for op in &self.ops {
            match *op {
                Op::Six { instr, nops } => transport.write_instruction(instr, nops)?,
                Op::Regout => transport.read_instruction()?,
                Op::Flush => transport.flush()?,
            }
        }
        Ok(())
    }
}

/// Serial bit frames of the two ICSP commands.
///
/// Both start with a 4-bit control code; everything is clocked LSB first.
/// SIX carries the 24 instruction bits after its code. REGOUT is followed
/// by 8 idle clocks, after which the device drives 16 data bits.
pub mod frame {
    use anyhow::Result;

    use super::Instruction;

    pub const SIX_CODE: u32 = 0b0000;
    pub const REGOUT_CODE: u32 = 0b0001;
    pub const CODE_BITS: u8 = 4;
    pub const SIX_BITS: u8 = CODE_BITS + 24;
    pub const REGOUT_IDLE_BITS: u8 = 8;
    pub const REGOUT_DATA_BITS: u8 = 16;

    /// SIX frame, bit 0 goes out first.
    pub const fn encode_six(instr: Instruction) -> u32 {
        SIX_CODE | instr.raw() << CODE_BITS
    }

    pub fn decode_six(frame: u32) -> Result<Instruction> {
        anyhow::ensure!(
            frame & 0x0f == SIX_CODE,
            "frame 0x{:07x} is not a SIX command",
            frame
        );
        Instruction::new(frame >> CODE_BITS)
    }

    /// Expand a frame value into line levels, in transmit order.
    pub fn bits_lsb_first(value: u32, count: u8) -> impl Iterator<Item = bool> {
        (0..count).map(move |i| value >> i & 1 == 1)
    }

    /// Fold line levels received LSB first back into a value.
    pub fn collect_lsb_first<I: IntoIterator<Item = bool>>(bits: I) -> u32 {
        bits.into_iter()
            .enumerate()
            .fold(0, |acc, (i, bit)| acc | (bit as u32) << i)
    }
}
