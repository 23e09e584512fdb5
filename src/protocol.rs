//! The ICSP instruction sequences of every operation.
//!
//! Each builder returns the exact stream the device must see. Device-side
//! state (TBLPAG, W6/W7 pointers, NVMCON) is never mirrored locally; it
//! exists only as the effect of these instructions.
//!
//! Register usage: W0 carries TBLPAG, W6 is the read pointer (or, during
//! writes, walks W0..W5 as a data pointer), W7 is the VISI pointer for
//! reads and the latch pointer for writes, W10 loads NVMCON, W2 carries
//! the status word.

use crate::constants::{opcodes, sfr, WRITE_BLOCK_SIZE};
use crate::instruction::{Instruction, Sequence};

/// Source byte offsets, as (low, high), of the six literals loaded into
/// W0..W5 for each 16-byte chunk of a write block. Four instructions per
/// chunk: W0 and W2 are the low words of the first two, W1 their upper
/// bytes; likewise W3, W5 and W4 for the next two.
pub const WRITE_STITCH: [(usize, usize); 6] = [(0, 1), (2, 6), (4, 5), (8, 9), (10, 14), (12, 13)];

/// Bytes of input consumed per latch-loading iteration.
pub const WRITE_CHUNK: usize = 16;

const fn op(raw: u32) -> Instruction {
    Instruction::fixed(raw)
}

/// Pad bits are sent separately; this follows them.
pub fn priming() -> Sequence {
    let mut seq = Sequence::new();
    seq.six(Instruction::GOTO_EXEC, 0)
        .six(Instruction::GOTO_EXEC, 3)
        .six(Instruction::GOTO_EXEC, 1)
        .flush();
    seq
}

/// Load TBLPAG with `addr[23:16]` through W0 and the pointer register
/// `reg` with `addr[15:0]`.
fn load_table_pointer(seq: &mut Sequence, addr: u32, reg: u8, nops: [u8; 3]) {
    seq.six(Instruction::mov_literal((addr >> 16) as u16, 0), nops[0])
        .six(op(opcodes::table::MOV_W0_TBLPAG), nops[1])
        .six(Instruction::mov_literal(addr as u16, reg), nops[2]);
}

/// Return the executive to 0x200.
pub fn trailer() -> Sequence {
    let mut seq = Sequence::new();
    seq.six(Instruction::NOP, 0)
        .six(Instruction::GOTO_EXEC, 2)
        .flush();
    seq
}

/// Packed read of `pairs` instruction pairs at program address `addr`.
/// Captures three VISI words, 6 bytes, per pair.
pub fn read_raw(addr: u32, pairs: usize) -> Sequence {
    let mut seq = Sequence::new();
    load_table_pointer(&mut seq, addr, 6, [0, 0, 0]);
    seq.six(op(opcodes::table::MOV_VISI_W7), 1).flush();

    for _ in 0..pairs {
        seq.six(op(opcodes::read::TBLRDL_W6_W7), 2).regout();
        seq.six(op(opcodes::read::TBLRDH_B_W6_INC_W7_INC), 2)
            .six(op(opcodes::read::TBLRDH_B_PREINC_W6_W7_DEC), 2)
            .regout();
        seq.six(op(opcodes::read::TBLRDL_W6_INC_W7), 2).regout();
    }

    seq.append(&trailer());
    seq
}

fn load_nvmcon(seq: &mut Sequence, nvmcon: u16) {
    seq.six(Instruction::mov_literal(nvmcon, 10), 0)
        .six(op(opcodes::nvm::MOV_W10_NVMCON), 0);
}

/// Stage one 256-byte block at program address `addr` and start the
/// write cycle. Does not poll.
pub fn write_block(nvmcon: u16, addr: u32, block: &[u8; WRITE_BLOCK_SIZE]) -> Sequence {
    let mut seq = Sequence::new();
    load_nvmcon(&mut seq, nvmcon);
    load_table_pointer(&mut seq, addr, 7, [0, 1, 2]);

    for chunk in block.chunks_exact(WRITE_CHUNK) {
        for (wd, &(lo, hi)) in WRITE_STITCH.iter().enumerate() {
            let lit = u16::from_le_bytes([chunk[lo], chunk[hi]]);
            seq.six(Instruction::mov_literal(lit, wd as u8), 0);
        }
        seq.six(op(opcodes::write::CLR_W6), 1);
        for raw in opcodes::write::LATCH_SEQUENCE {
            seq.six(op(raw), 2);
        }
    }

    seq.six(op(opcodes::nvm::BSET_NVMCON_WR), 2).flush();
    seq
}

/// Arm and start a bulk erase. Does not poll.
pub fn bulk_erase(nvmcon: u16) -> Sequence {
    let mut seq = Sequence::new();
    load_nvmcon(&mut seq, nvmcon);
    load_table_pointer_page_only(&mut seq);
    seq.six(op(opcodes::nvm::TBLWTL_W0_W0), 2)
        .six(op(opcodes::nvm::BSET_NVMCON_WR), 2)
        .flush();
    seq
}

/// TBLPAG = 0; the dummy latch write addresses through W0 itself.
fn load_table_pointer_page_only(seq: &mut Sequence) {
    seq.six(Instruction::mov_literal(0, 0), 0)
        .six(op(opcodes::table::MOV_W0_TBLPAG), 1);
}

/// One status poll: NVMCON through W2 into VISI, captured.
pub fn poll_status() -> Sequence {
    let mut seq = Sequence::new();
    seq.six(Instruction::GOTO_EXEC, 1)
        .six(Instruction::mov_from_file(sfr::NVMCON, 2), 0)
        .six(Instruction::mov_to_file(2, sfr::VISI), 1)
        .regout()
        .flush();
    seq
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Op;

    fn raws(seq: &Sequence) -> Vec<u32> {
        seq.instructions().map(Instruction::raw).collect()
    }

    #[test]
    fn test_priming() {
        let seq = priming();
        assert_eq!(raws(&seq), vec![0x040200; 3]);
        assert_eq!(
            seq.ops()[1],
            Op::Six {
                instr: Instruction::GOTO_EXEC,
                nops: 3
            }
        );
        assert_eq!(seq.ops().last(), Some(&Op::Flush));
    }

    #[test]
    fn test_read_raw_setup() {
        let seq = read_raw(0x00ff_0000, 1);
        assert_eq!(
            raws(&seq),
            vec![
                0x200ff0, 0x880190, 0x200006, 0x207847, // setup
                0xba0b96, 0xbadbb6, 0xbad3d6, 0xba0bb6, // one pair
                0x000000, 0x040200, // trailer
            ]
        );
        assert_eq!(seq.response_len(), 6);
        // setup is committed before the first read
        assert_eq!(seq.ops()[4], Op::Flush);
        assert_eq!(seq.ops().last(), Some(&Op::Flush));
    }

    #[test]
    fn test_read_raw_low_address() {
        let seq = read_raw(0x0001_2344, 3);
        let r = raws(&seq);
        assert_eq!(&r[..3], &[0x200010, 0x880190, 0x223446]);
        assert_eq!(seq.response_len(), 18);
    }

    #[test]
    fn test_write_block_layout() {
        let mut block = [0u8; WRITE_BLOCK_SIZE];
        for (i, b) in block.iter_mut().enumerate() {
            *b = i as u8;
        }
        let seq = write_block(0x4001, 0x0200, &block);
        let r = raws(&seq);

        assert_eq!(&r[..5], &[0x24001a, 0x883b0a, 0x200000, 0x880190, 0x202007]);
        // 16 iterations of 6 literals, CLR W6, 8 latch writes
        assert_eq!(r.len(), 5 + 16 * 15 + 1);
        assert_eq!(
            &r[5..11],
            &[
                0x201000, // W0 = 0x0100
                0x206021, // W1 = 0x0602
                0x205042, // W2 = 0x0504
                0x209083, // W3 = 0x0908
                0x20e0a4, // W4 = 0x0e0a
                0x20d0c5, // W5 = 0x0d0c
            ]
        );
        assert_eq!(r[11], 0xeb0300);
        assert_eq!(&r[12..20], &opcodes::write::LATCH_SEQUENCE);
        assert_eq!(r[r.len() - 1], 0xa8e761);
        assert_eq!(seq.response_len(), 0);
    }

    #[test]
    fn test_bulk_erase() {
        let seq = bulk_erase(0x404f);
        assert_eq!(
            raws(&seq),
            vec![0x2404fa, 0x883b0a, 0x200000, 0x880190, 0xbb0800, 0xa8e761]
        );
    }

    #[test]
    fn test_poll_status() {
        let seq = poll_status();
        assert_eq!(raws(&seq), vec![0x040200, 0x803b02, 0x883c22]);
        assert_eq!(seq.response_len(), 2);
        assert_eq!(&seq.ops()[3..], &[Op::Regout, Op::Flush]);
    }
}
