//! PIC24 ICSP session and memory operations.
//!
//! `read_raw`, `read` and `write` expect the caller to hold a session
//! (see [`Icsp::with_session`]); `erase` and `read_id` open their own.

use anyhow::Result;
use scroll::{Pread, BE};

use crate::constants::{
    DEVICE_ID_ADDR, ERASE_RETRIES, FIRST_SIX_PAD_BITS, RAW_PAIR_SIZE, UNPACKED_PAIR_SIZE,
    WRITE_BLOCK_SIZE, WRITE_RETRIES,
};
use crate::device::{IcspEntry, IcspFamily};
use crate::error::IcspError;
use crate::instruction::Sequence;
use crate::nvm::Nvmcon;
use crate::protocol;
use crate::transport::Transport;

/// DEVID and DEVREV as read from 0xFF0000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    /// DEVREV in the high half, DEVID in the low half.
    pub raw: u32,
    pub id: u16,
    pub revision: u16,
}

impl DeviceId {
    pub const fn from_raw(raw: u32) -> Self {
        DeviceId {
            raw,
            id: raw as u16,
            revision: (raw >> 16) as u16,
        }
    }

    /// Low 16 bits of the raw value.
    pub const fn legacy(&self) -> u16 {
        self.raw as u16
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04x} rev 0x{:04x}", self.id, self.revision)
    }
}

/// Decode one packed pair read from the device-ID address.
///
/// Bytes 0..2 hold DEVID high byte first, bytes 4..6 DEVREV; the upper
/// bytes in 2..4 carry nothing.
pub fn decode_device_id(raw: &[u8]) -> Result<DeviceId> {
    let id = raw.pread_with::<u16>(0, BE)?;
    let revision = raw.pread_with::<u16>(4, BE)?;
    Ok(DeviceId::from_raw((revision as u32) << 16 | id as u32))
}

/// Unpack 6-byte packed pairs into 8-byte units of two 4-byte instruction
/// slots: low byte, middle byte, upper byte, zero.
pub fn unpack_pairs(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() / RAW_PAIR_SIZE * UNPACKED_PAIR_SIZE);
    for p in raw.chunks_exact(RAW_PAIR_SIZE) {
        out.extend_from_slice(&[p[1], p[0], p[3], 0, p[5], p[4], p[2], 0]);
    }
    out
}

/// Instruction pairs needed to cover `len` unpacked bytes.
pub const fn pairs_for(len: usize) -> usize {
    len.div_ceil(UNPACKED_PAIR_SIZE)
}

/// A programmer attached to one target of family `F`.
pub struct Icsp<T: Transport, F: IcspFamily> {
    transport: T,
    family: F,
}

impl<T: Transport, F: IcspFamily> Icsp<T, F> {
    pub fn new(transport: T, family: F) -> Self {
        Icsp { transport, family }
    }

    pub fn family(&self) -> &F {
        &self.family
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_parts(self) -> (T, F) {
        (self.transport, self.family)
    }

    /// Unlock programming mode and park the executive at 0x200.
    ///
    /// Nothing is read back; a failed entry only shows up as garbage in
    /// later reads.
    pub fn enter_icsp(&mut self) -> Result<()> {
        anyhow::ensure!(
            self.family.entry() == IcspEntry::Lvp,
            "high-voltage ICSP entry needs a VPP-capable programmer"
        );
        let key = self.family.entry_key();
        log::debug!("enter ICSP, key 0x{:08x}", key);

        let t = &mut self.transport;
        t.vcc(true)?;
        t.clock_low()?;
        t.data_low()?;
        t.mclr(false)?;
        t.mclr(true)?;
        t.mclr(false)?;

        t.send_bytes(&key.to_be_bytes())?;
        t.data_low()?;
        t.mclr(true)?;

        t.send_bits(FIRST_SIX_PAD_BITS, 0)?;
        protocol::priming().run(t)
    }

    pub fn exit_icsp(&mut self) -> Result<()> {
        log::debug!("exit ICSP");
        self.transport.mclr(false)?;
        self.transport.mclr(true)?;
        self.transport.vcc(false)
    }

    /// Run `f` between Enter and Exit. Exit runs whatever `f` returned,
    /// and the first error wins.
    pub fn with_session<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let result = self.enter_icsp().and_then(|()| f(self));
        if let Err(e) = self.exit_icsp() {
            if result.is_ok() {
                return Err(e);
            }
            log::warn!("exit ICSP failed: {}", e);
        }
        result
    }

    /// Packed read of `pairs` instruction pairs at program address `addr`.
    pub fn read_raw(&mut self, addr: u32, pairs: usize) -> Result<Vec<u8>> {
        let seq = protocol::read_raw(addr, pairs);
        let raw = self.transport.transfer(&seq)?;
        log::debug!("read_raw 0x{:06x}, length = 0x{:x}", addr, raw.len());
        log::trace!("{}", hex::encode(&raw));
        Ok(raw)
    }

    /// Read `len` bytes at hex-file byte address `addr`, 4 bytes per
    /// instruction with a zero upper byte. A trailing partial pair is read
    /// in full; the result is `pairs_for(len) * 8` long.
    pub fn read(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let raw = self.read_raw(addr / 2, pairs_for(len))?;
        Ok(unpack_pairs(&raw))
    }

    /// Program one 256-byte block at hex-file byte address `addr`.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let block: &[u8; WRITE_BLOCK_SIZE] =
            data.try_into().map_err(|_| IcspError::BlockSize {
                len: data.len(),
                expected: WRITE_BLOCK_SIZE,
            })?;
        let addr = addr / 2;
        log::debug!("write block at 0x{:06x}", addr);

        let seq = protocol::write_block(self.family.nvmcon_write(), addr, block);
        seq.run(&mut self.transport)?;

        let done = self.poll_nvm(WRITE_RETRIES)?;
        protocol::trailer().run(&mut self.transport)?;
        if !done {
            log::error!("Write taking too long");
            return Err(IcspError::WriteTimeout {
                polls: WRITE_RETRIES,
            }
            .into());
        }
        Ok(())
    }

    /// Erase all program memory, including configuration words.
    pub fn erase(&mut self) -> Result<()> {
        self.with_session(|icsp| {
            let seq = protocol::bulk_erase(icsp.family.nvmcon_erase());
            seq.run(&mut icsp.transport)?;

            let done = icsp.poll_nvm(ERASE_RETRIES)?;
            let delay = icsp.family.erase_delay();
            if done && !delay.is_zero() {
                icsp.transport.delay(delay)?;
            }
            protocol::trailer().run(&mut icsp.transport)?;
            if !done {
                log::error!("Erase taking too long");
                return Err(IcspError::EraseTimeout {
                    polls: ERASE_RETRIES,
                }
                .into());
            }
            Ok(())
        })
    }

    pub fn read_id(&mut self) -> Result<DeviceId> {
        let raw = self.with_session(|icsp| icsp.read_raw(DEVICE_ID_ADDR, 1))?;
        log::debug!("device id raw: {}", hex::encode(&raw));
        decode_device_id(&raw)
    }

    /// Poll NVMCON until WR clears, at most `retries` times.
    fn poll_nvm(&mut self, retries: usize) -> Result<bool> {
        let poll: Sequence = protocol::poll_status();
        for _ in 0..retries {
            let resp = self.transport.transfer(&poll)?;
            let status = Nvmcon::from_response(&resp)?;
            log::debug!("NVMCON state: {:04x}", status.bits());
            if !status.busy() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_device_id_offsets() {
        let raw = [0x12, 0x34, 0xaa, 0xbb, 0x56, 0x78];
        let id = decode_device_id(&raw).unwrap();
        let expected =
            raw[1] as u32 | (raw[0] as u32) << 8 | (raw[5] as u32) << 16 | (raw[4] as u32) << 24;
        assert_eq!(id.raw, expected);
        assert_eq!(id.raw, 0x5678_1234);
        assert_eq!(id.id, 0x1234);
        assert_eq!(id.revision, 0x5678);
        assert_eq!(id.legacy(), 0x1234);
    }

    #[test]
    fn test_decode_device_id_short() {
        assert!(decode_device_id(&[0x04, 0x47]).is_err());
    }

    #[test]
    fn test_unpack_pairs() {
        let raw = [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        let out = unpack_pairs(&raw);
        assert_eq!(
            out,
            vec![
                0x34, 0x12, 0x78, 0, 0xbc, 0x9a, 0x56, 0, //
                0xff, 0xff, 0xff, 0, 0xff, 0xff, 0xff, 0,
            ]
        );
    }

    #[test]
    fn test_unpack_pads_upper_bytes() {
        use rand::Rng;

        let mut rng = rand::rng();
        for _ in 0..100 {
            let raw: [u8; 6] = rng.random();
            let out = unpack_pairs(&raw);
            assert_eq!(out.len(), 8);
            assert_eq!(out[3], 0);
            assert_eq!(out[7], 0);
        }
    }

    #[test]
    fn test_pairs_for() {
        assert_eq!(pairs_for(0), 0);
        assert_eq!(pairs_for(1), 1);
        assert_eq!(pairs_for(8), 1);
        assert_eq!(pairs_for(9), 2);
        assert_eq!(pairs_for(256), 32);
    }
}
