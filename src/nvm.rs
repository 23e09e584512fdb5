//! NVMCON, the non-volatile memory control register.

use anyhow::Result;
use bitfield::bitfield;
use scroll::{Pread, BE};

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Nvmcon(u16);
    impl Debug;
    /// Write control. Set to start a cycle, hardware clears it when done.
    pub wr, set_wr: 15;
    /// Write enable.
    pub wren, set_wren: 14;
    /// Sequence terminated early.
    pub wrerr, set_wrerr: 13;
    /// Operation erases instead of programming.
    pub erase, set_erase: 6;
    pub u8, nvmop, set_nvmop: 3, 0;
}

impl Nvmcon {
    /// NVMOP selecting a row program.
    pub const OP_ROW_PROGRAM: u8 = 0x1;
    /// NVMOP selecting a whole-chip erase when combined with ERASE.
    pub const OP_CHIP_ERASE: u8 = 0xf;

    pub const fn new(bits: u16) -> Self {
        Nvmcon(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Decode the 2 bytes captured from VISI, high byte first.
    pub fn from_response(raw: &[u8]) -> Result<Self> {
        Ok(Nvmcon(raw.pread_with::<u16>(0, BE)?))
    }

    pub fn busy(self) -> bool {
        self.wr()
    }
}

impl From<u16> for Nvmcon {
    fn from(bits: u16) -> Self {
        Nvmcon(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_family_values() {
        let write = Nvmcon::new(0x4001);
        assert!(write.wren());
        assert!(!write.erase());
        assert_eq!(write.nvmop(), Nvmcon::OP_ROW_PROGRAM);

        let erase = Nvmcon::new(0x404f);
        assert!(erase.wren());
        assert!(erase.erase());
        assert_eq!(erase.nvmop(), Nvmcon::OP_CHIP_ERASE);
    }

    #[test]
    fn test_status_from_response() {
        let status = Nvmcon::from_response(&[0xc0, 0x01]).unwrap();
        assert!(status.busy());
        assert_eq!(status.bits(), 0xc001);

        let done = Nvmcon::from_response(&[0x40, 0x01]).unwrap();
        assert!(!done.busy());

        assert!(Nvmcon::from_response(&[0x40]).is_err());
    }
}
