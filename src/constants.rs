//! PIC24 ICSP constants: SFR addresses, opcodes and protocol limits.
//!
//! Opcodes are the exact 24-bit words clocked into the device. Most of them
//! are fixed register forms; the ones carrying a literal or an address are
//! completed by the builders in [`crate::instruction`].

/// Instruction words staged per write cycle.
pub const WRITE_BLOCK_WORDS: usize = 64;
/// Input bytes per write cycle: 16 iterations of 16 bytes, 4 bytes per word.
pub const WRITE_BLOCK_SIZE: usize = WRITE_BLOCK_WORDS * 4;
/// Bytes of packed read output per instruction pair.
pub const RAW_PAIR_SIZE: usize = 6;
/// Bytes of unpacked output per instruction pair.
pub const UNPACKED_PAIR_SIZE: usize = 8;

/// Status polls allowed for a write cycle.
pub const WRITE_RETRIES: usize = 10;
/// Status polls allowed for a bulk erase.
pub const ERASE_RETRIES: usize = 100;

/// Program-space address of the DEVID/DEVREV words.
pub const DEVICE_ID_ADDR: u32 = 0x00ff_0000;
/// Reset vector the ICSP executive jumps to after entry.
pub const EXEC_ENTRY_ADDR: u32 = 0x0200;

/// Extra clocks required before the first SIX after the key.
pub const FIRST_SIX_PAD_BITS: u8 = 5;
/// Upper bound for the NOP slots a transport appends to a SIX.
pub const MAX_POST_NOPS: u8 = 3;

/// Special function registers (data-space byte addresses).
pub mod sfr {
    pub const TBLPAG: u16 = 0x0032;
    pub const NVMCON: u16 = 0x0760;
    pub const VISI: u16 = 0x0784;
}

/// NVMCON bit positions.
pub mod nvmcon {
    /// Write control, set to start, reads 1 while the cycle runs.
    pub const WR_BIT: u8 = 15;
    pub const WR_MASK: u16 = 1 << WR_BIT;
}

/// Fixed instruction words, grouped per operation.
pub mod opcodes {
    /// `NOP`
    pub const NOP: u32 = 0x00_0000;
    /// `GOTO 0x200`, first word. Resets the executive program counter.
    pub const GOTO_EXEC: u32 = 0x04_0000 | super::EXEC_ENTRY_ADDR;

    /// `MOV #lit16, Wd`: bits 19..4 literal, bits 3..0 destination register.
    pub const MOV_LIT_W: u32 = 0x20_0000;
    /// `MOV Ws, f`: bits 18..4 word address of `f`, bits 3..0 source register.
    pub const MOV_W_F: u32 = 0x88_0000;
    /// `MOV f, Wd`: bits 18..4 word address of `f`, bits 3..0 destination.
    pub const MOV_F_W: u32 = 0x80_0000;

    /// Table pointer setup.
    pub mod table {
        /// `MOV W0, TBLPAG`
        pub const MOV_W0_TBLPAG: u32 = 0x88_0190;
        /// `MOV #VISI, W7`
        pub const MOV_VISI_W7: u32 = 0x20_7847;
    }

    /// Packed read of two instruction words through VISI.
    pub mod read {
        /// `TBLRDL [W6], [W7]`: low word of the first instruction.
        pub const TBLRDL_W6_W7: u32 = 0xba_0b96;
        /// `TBLRDH.B [W6++], [W7++]`: upper byte of the first instruction.
        pub const TBLRDH_B_W6_INC_W7_INC: u32 = 0xba_dbb6;
        /// `TBLRDH.B [++W6], [W7--]`: upper byte of the second instruction.
        pub const TBLRDH_B_PREINC_W6_W7_DEC: u32 = 0xba_d3d6;
        /// `TBLRDL [W6++], [W7]`: low word of the second instruction.
        pub const TBLRDL_W6_INC_W7: u32 = 0xba_0bb6;
    }

    /// Latch loading during a row write. W6 walks W0..W5, W7 the latches.
    pub mod write {
        /// `CLR W6`
        pub const CLR_W6: u32 = 0xeb_0300;
        /// `TBLWTL [W6++], [W7]`
        pub const TBLWTL_W6_INC_W7: u32 = 0xbb_0bb6;
        /// `TBLWTH.B [W6++], [W7++]`
        pub const TBLWTH_B_W6_INC_W7_INC: u32 = 0xbb_dbb6;
        /// `TBLWTH.B [W6++], [++W7]`
        pub const TBLWTH_B_W6_INC_PREINC_W7: u32 = 0xbb_ebb6;
        /// `TBLWTL [W6++], [W7++]`
        pub const TBLWTL_W6_INC_W7_INC: u32 = 0xbb_1bb6;
        /// The eight latch writes following `CLR W6`, two instructions per half.
        pub const LATCH_SEQUENCE: [u32; 8] = [
            TBLWTL_W6_INC_W7,
            TBLWTH_B_W6_INC_W7_INC,
            TBLWTH_B_W6_INC_PREINC_W7,
            TBLWTL_W6_INC_W7_INC,
            TBLWTL_W6_INC_W7,
            TBLWTH_B_W6_INC_W7_INC,
            TBLWTH_B_W6_INC_PREINC_W7,
            TBLWTL_W6_INC_W7_INC,
        ];
    }

    /// NVM control.
    pub mod nvm {
        /// `MOV W10, NVMCON`
        pub const MOV_W10_NVMCON: u32 = 0x88_3b0a;
        /// `BSET NVMCON, #WR`
        pub const BSET_NVMCON_WR: u32 = 0xa8_e761;
        /// `TBLWTL W0, [W0]`: dummy latch write that arms a bulk erase.
        pub const TBLWTL_W0_W0: u32 = 0xbb_0800;
    }

    /// Completion polling through VISI.
    pub mod poll {
        /// `MOV NVMCON, W2`
        pub const MOV_NVMCON_W2: u32 = 0x80_3b02;
        /// `MOV W2, VISI`
        pub const MOV_W2_VISI: u32 = 0x88_3c22;
    }
}
