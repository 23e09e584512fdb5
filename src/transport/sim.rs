//! Simulated PIC24 target.
//!
//! Interprets the instruction subset the ICSP sequences use (MOV forms,
//! CLR, TBLRD/TBLWT, BSET, GOTO, NOP) against a model of the W array,
//! TBLPAG, NVMCON, VISI, the write latches and program flash. Used by the
//! `--dummy` programmer and by the tests.
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use anyhow::Result;

use super::Transport;
use crate::constants::{nvmcon, opcodes, sfr, DEVICE_ID_ADDR, MAX_POST_NOPS};
use crate::error::IcspError;
use crate::instruction::{Instruction, Op};
use crate::nvm::Nvmcon;

/// Erased program word.
pub const ERASED_WORD: u32 = 0x00ff_ffff;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub entry_key: u32,
    pub device_id: u16,
    pub revision: u16,
    /// Exclusive end of program memory, in program-space address units.
    pub program_end: u32,
    /// Status reads that still report WR after a cycle starts.
    /// `None` models a cycle that never completes.
    pub busy_polls: Option<usize>,
}

impl Default for SimConfig {
    /// PIC24FJ64GA002
    fn default() -> Self {
        SimConfig {
            entry_key: 0x4d43_4851,
            device_id: 0x0447,
            revision: 0x3003,
            program_end: 0xac00,
            busy_polls: Some(1),
        }
    }
}

/// Counters for assertions on session and polling behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub enters: usize,
    pub exits: usize,
    pub flushes: usize,
    pub status_polls: usize,
    pub cycles: usize,
}

#[derive(Debug, Clone, Copy)]
enum Operand {
    Reg(usize),
    Mem(u16),
}

pub struct SimTarget {
    config: SimConfig,
    powered: bool,
    mclr: bool,
    in_icsp: bool,
    key: Option<u32>,
    pad_bits: Vec<u8>,

    w: [u16; 16],
    tblpag: u16,
    nvmcon: u16,
    visi: u16,
    busy_remaining: Option<usize>,
    latches: BTreeMap<u32, u32>,
    flash: Vec<u32>,

    trace: Vec<Op>,
    pending: VecDeque<u8>,
    responses: VecDeque<u8>,
    stats: SimStats,
}

impl SimTarget {
    pub fn new(config: SimConfig) -> Self {
        let words = (config.program_end / 2) as usize;
        SimTarget {
            config,
            powered: false,
            mclr: false,
            in_icsp: false,
            key: None,
            pad_bits: Vec::new(),
            w: [0; 16],
            tblpag: 0,
            nvmcon: 0,
            visi: 0,
            busy_remaining: None,
            latches: BTreeMap::new(),
            flash: vec![ERASED_WORD; words],
            trace: Vec::new(),
            pending: VecDeque::new(),
            responses: VecDeque::new(),
            stats: SimStats::default(),
        }
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    pub fn in_icsp(&self) -> bool {
        self.in_icsp
    }

    pub fn powered(&self) -> bool {
        self.powered
    }

    /// Everything queued since the last [`SimTarget::clear_trace`].
    pub fn trace(&self) -> &[Op] {
        &self.trace
    }

    pub fn clear_trace(&mut self) {
        self.trace.clear();
    }

    /// Pad-bit counts sent with `send_bits`, in order.
    pub fn pad_bits(&self) -> &[u8] {
        &self.pad_bits
    }

    pub fn last_key(&self) -> Option<u32> {
        self.key
    }

    /// Program word at a program-space address.
    pub fn word(&self, addr: u32) -> u32 {
        self.flash
            .get((addr / 2) as usize)
            .copied()
            .unwrap_or(ERASED_WORD)
    }

    pub fn load(&mut self, addr: u32, words: &[u32]) {
        let Some(slots) = self.flash.get_mut((addr / 2) as usize..) else {
            return;
        };
        for (slot, &word) in slots.iter_mut().zip(words) {
            *slot = word & ERASED_WORD;
        }
    }

    fn reset_core(&mut self) {
        self.w = [0; 16];
        self.tblpag = 0;
        self.nvmcon = 0;
        self.visi = 0;
        self.busy_remaining = None;
        self.latches.clear();
    }

    fn program_read(&self, addr: u32) -> u32 {
        match addr & !1 {
            DEVICE_ID_ADDR => self.config.device_id as u32,
            a if a == DEVICE_ID_ADDR + 2 => self.config.revision as u32,
            a => self.flash.get((a / 2) as usize).copied().unwrap_or(0),
        }
    }

    fn program_address(&self, offset: u16) -> u32 {
        (self.tblpag as u32) << 16 | offset as u32
    }

    fn sfr_mut(&mut self, addr: u16) -> Option<&mut u16> {
        match addr & !1 {
            a if a < 0x20 => Some(&mut self.w[(a / 2) as usize]),
            sfr::TBLPAG => Some(&mut self.tblpag),
            sfr::NVMCON => Some(&mut self.nvmcon),
            sfr::VISI => Some(&mut self.visi),
            _ => None,
        }
    }

    fn read_data(&mut self, addr: u16) -> u16 {
        if addr & !1 == sfr::NVMCON {
            self.stats.status_polls += 1;
            self.tick_nvm();
        }
        self.sfr_mut(addr).map(|r| *r).unwrap_or(0)
    }

    fn write_data(&mut self, addr: u16, value: u16) {
        match self.sfr_mut(addr) {
            Some(reg) => *reg = value,
            None => log::warn!("sim: write to unmodelled data address 0x{:04x}", addr),
        }
    }

    fn read_data_byte(&mut self, addr: u16) -> u8 {
        let word = self.sfr_mut(addr).map(|r| *r).unwrap_or(0);
        (word >> ((addr & 1) * 8)) as u8
    }

    fn write_data_byte(&mut self, addr: u16, value: u8) {
        let shift = (addr & 1) * 8;
        if let Some(reg) = self.sfr_mut(addr) {
            *reg = *reg & !(0xff << shift) | (value as u16) << shift;
        }
    }

    /// Resolve an addressing mode, applying pre-modification.
    fn operand(&mut self, mode: u32, reg: usize, step: u16) -> Operand {
        match mode {
            0 => Operand::Reg(reg),
            4 => {
                self.w[reg] = self.w[reg].wrapping_sub(step);
                Operand::Mem(self.w[reg])
            }
            5 => {
                self.w[reg] = self.w[reg].wrapping_add(step);
                Operand::Mem(self.w[reg])
            }
            _ => Operand::Mem(self.w[reg]),
        }
    }

    fn post_modify(&mut self, mode: u32, reg: usize, step: u16) {
        match mode {
            2 => self.w[reg] = self.w[reg].wrapping_sub(step),
            3 => self.w[reg] = self.w[reg].wrapping_add(step),
            _ => {}
        }
    }

    fn load_operand(&mut self, op: Operand, byte: bool) -> u16 {
        match (op, byte) {
            (Operand::Reg(r), false) => self.w[r],
            (Operand::Reg(r), true) => self.w[r] & 0xff,
            (Operand::Mem(a), false) => self.read_data(a),
            (Operand::Mem(a), true) => self.read_data_byte(a) as u16,
        }
    }

    fn store_operand(&mut self, op: Operand, byte: bool, value: u16) {
        match (op, byte) {
            (Operand::Reg(r), false) => self.w[r] = value,
            (Operand::Reg(r), true) => self.w[r] = self.w[r] & 0xff00 | value & 0xff,
            (Operand::Mem(a), false) => self.write_data(a, value),
            (Operand::Mem(a), true) => self.write_data_byte(a, value as u8),
        }
    }

    /// TBLRDL/TBLRDH/TBLWTL/TBLWTH, `1011 101W HBqq qddd dppp ssss`.
    fn table(&mut self, raw: u32) {
        let write = raw >> 16 & 1 == 1;
        let high = raw >> 15 & 1 == 1;
        let byte = raw >> 14 & 1 == 1;
        let dst_mode = raw >> 11 & 7;
        let dst = (raw >> 7 & 0xf) as usize;
        let src_mode = raw >> 4 & 7;
        let src = (raw & 0xf) as usize;
        let step = if byte { 1 } else { 2 };

        let src_op = self.operand(src_mode, src, step);
        let dst_op = self.operand(dst_mode, dst, step);

        if write {
            let value = self.load_operand(src_op, byte);
            if let Operand::Mem(offset) = dst_op {
                let addr = self.program_address(offset);
                let latch = self.latches.entry(addr & !1).or_insert(ERASED_WORD);
                *latch = match (high, byte, addr & 1) {
                    (false, false, _) => *latch & 0xff_0000 | value as u32,
                    (false, true, 0) => *latch & 0xff_ff00 | (value & 0xff) as u32,
                    (false, true, _) => *latch & 0xff_00ff | ((value & 0xff) as u32) << 8,
                    (true, _, 0) => *latch & 0x00_ffff | ((value & 0xff) as u32) << 16,
                    (true, _, _) => *latch,
                };
            }
        } else if let Operand::Mem(offset) = src_op {
            let addr = self.program_address(offset);
            let word = self.program_read(addr);
            let value = match (high, byte, addr & 1) {
                (false, false, _) => word & 0xffff,
                (false, true, 0) => word & 0xff,
                (false, true, _) => word >> 8 & 0xff,
                (true, _, 0) => word >> 16 & 0xff,
                (true, _, _) => 0,
            };
            self.store_operand(dst_op, byte, value as u16);
        }

        self.post_modify(src_mode, src, step);
        self.post_modify(dst_mode, dst, step);
    }

    /// `BSET f, #bit`, word form: `1010 1000 bbbf ffff ffff fffb`.
    fn bit_set(&mut self, raw: u32) {
        let file = ((raw >> 1 & 0xfff) << 1) as u16;
        let bit = (raw >> 13 & 7) << 1 | raw & 1;
        let value = self.sfr_mut(file).map(|r| *r).unwrap_or(0) | 1 << bit;
        self.write_data(file, value);
        if file == sfr::NVMCON && Nvmcon::new(value).busy() {
            self.start_nvm_cycle();
        }
    }

    fn start_nvm_cycle(&mut self) {
        let status = Nvmcon::new(self.nvmcon);
        self.stats.cycles += 1;
        if !status.wren() {
            log::warn!("sim: WR set without WREN, cycle ignored");
            self.nvmcon &= !nvmcon::WR_MASK;
            return;
        }
        match (status.erase(), status.nvmop()) {
            (true, Nvmcon::OP_CHIP_ERASE) => {
                self.flash.iter_mut().for_each(|w| *w = ERASED_WORD);
            }
            (false, Nvmcon::OP_ROW_PROGRAM) => {
                for (&addr, &word) in &self.latches {
                    if let Some(slot) = self.flash.get_mut((addr / 2) as usize) {
                        *slot = word;
                    }
                }
            }
            (erase, op) => log::warn!("sim: unsupported NVM operation erase={} op={:x}", erase, op),
        }
        self.latches.clear();
        self.busy_remaining = self.config.busy_polls;
        if self.busy_remaining == Some(0) {
            self.nvmcon &= !nvmcon::WR_MASK;
        }
    }

    /// A status read observes WR, then the cycle advances.
    fn tick_nvm(&mut self) {
        if self.nvmcon & nvmcon::WR_MASK == 0 {
            return;
        }
        match self.busy_remaining {
            Some(0) => self.nvmcon &= !(1 << 15),
            Some(n) => self.busy_remaining = Some(n - 1),
            None => {}
        }
    }

    fn execute(&mut self, instr: Instruction) {
        let raw = instr.raw();
        match raw >> 16 {
            0x00 if raw == opcodes::NOP => {}
            0x04 => {}
            0x20..=0x2f => {
                let lit = (raw >> 4 & 0xffff) as u16;
                self.w[(raw & 0xf) as usize] = lit;
            }
            0x88..=0x8f => {
                let file = ((raw >> 4 & 0x7fff) << 1) as u16;
                let value = self.w[(raw & 0xf) as usize];
                self.write_data(file, value);
            }
            0x80..=0x87 => {
                let file = ((raw >> 4 & 0x7fff) << 1) as u16;
                let value = self.read_data(file);
                self.w[(raw & 0xf) as usize] = value;
            }
            0xeb => {
                let mode = raw >> 11 & 7;
                let reg = (raw >> 7 & 0xf) as usize;
                let byte = raw >> 14 & 1 == 1;
                let op = self.operand(mode, reg, if byte { 1 } else { 2 });
                self.store_operand(op, byte, 0);
            }
            0xba | 0xbb => self.table(raw),
            0xa8 => self.bit_set(raw),
            _ => log::warn!("sim: unsupported instruction {:?}", instr),
        }
    }

    /// Instructions only execute in ICSP mode on a powered target.
    fn active(&self) -> bool {
        self.powered && self.in_icsp
    }
}

impl Transport for SimTarget {
    fn vcc(&mut self, on: bool) -> Result<()> {
        self.powered = on;
        if !on {
            self.in_icsp = false;
        }
        Ok(())
    }

    fn clock_low(&mut self) -> Result<()> {
        Ok(())
    }

    fn data_low(&mut self) -> Result<()> {
        Ok(())
    }

    fn mclr(&mut self, high: bool) -> Result<()> {
        if !high && self.in_icsp {
            self.in_icsp = false;
            self.stats.exits += 1;
        }
        if high && !self.mclr && self.powered && self.key == Some(self.config.entry_key) {
            self.in_icsp = true;
            self.stats.enters += 1;
            self.reset_core();
            // a key only unlocks the MCLR edge that follows it
            self.key = None;
        }
        self.mclr = high;
        Ok(())
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.powered && !self.mclr && bytes.len() == 4 {
            self.key = Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        }
        Ok(())
    }

    fn send_bits(&mut self, count: u8, _value: u32) -> Result<()> {
        self.pad_bits.push(count);
        Ok(())
    }

    fn write_instruction(&mut self, instr: Instruction, nops: u8) -> Result<()> {
        anyhow::ensure!(nops <= MAX_POST_NOPS, "{} NOP slots after {}", nops, instr);
        self.trace.push(Op::Six { instr, nops });
        if self.active() {
            self.execute(instr);
        }
        Ok(())
    }

    fn read_instruction(&mut self) -> Result<()> {
        self.trace.push(Op::Regout);
        let value = if self.active() { self.visi } else { 0 };
        self.pending.extend(value.to_be_bytes());
        Ok(())
    }

    fn get_data(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.len() > self.responses.len() {
            if !self.pending.is_empty() {
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
        self.trace.push(Op::Flush);
        self.stats.flushes += 1;
        self.responses.extend(self.pending.drain(..));
        Ok(())
    }

    fn delay(&mut self, _duration: Duration) -> Result<()> {
        Ok(())
    }
}
