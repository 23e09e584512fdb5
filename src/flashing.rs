//! Chip flashing logic.

use anyhow::{Error, Result};
use indicatif::{ProgressBar, ProgressStyle};

use crate::constants::WRITE_BLOCK_SIZE;
use crate::device::{Chip, ChipDB, Family};
use crate::icsp::{DeviceId, Icsp};
use crate::transport::{BitBang, BusPirate, SimConfig, SimTarget, Transport};

/// Erased program memory as it reads back: upper byte 0xFF, phantom 0.
pub const ERASED_PATTERN: [u8; 4] = [0xff, 0xff, 0xff, 0x00];

/// Bytes per read request while dumping.
const READ_CHUNK: usize = 0x400;

pub struct Flashing<T: Transport> {
    icsp: Icsp<T, Family>,
    chip: Chip,
    device_id: DeviceId,
}

impl Flashing<BitBang<BusPirate>> {
    pub fn new_from_buspirate(port: Option<&str>, chip: Option<&str>) -> Result<Self> {
        let pins = match port {
            Some(port) => BusPirate::open(port)?,
            None => BusPirate::open_any()?,
        };
        Self::detect(BitBang::new(pins), chip).or_else(|(bb, e)| {
            // leave the Bus Pirate usable from its terminal
            if let Err(close_err) = bb.into_inner().close() {
                log::warn!("closing Bus Pirate failed: {}", close_err);
            }
            Err(e)
        })
    }
}

impl Flashing<SimTarget> {
    /// A simulated target, for dry runs without hardware.
    pub fn new_dummy(chip: Option<&str>) -> Result<Self> {
        let db = ChipDB::load()?;
        let config = match chip {
            Some(name) => {
                let (family, chip) = db.find_chip_by_name(name)?;
                SimConfig {
                    entry_key: family.icsp_key,
                    device_id: chip.device_id,
                    program_end: chip.program_end,
                    ..SimConfig::default()
                }
            }
            None => SimConfig::default(),
        };
        Self::connect(SimTarget::new(config), chip)
    }
}

impl<T: Transport> Flashing<T> {
    /// Identify the attached chip, or trust `chip` when given.
    ///
    /// Without a name every family's entry key is tried in turn until the
    /// device ID matches one of its variants.
    pub fn connect(transport: T, chip: Option<&str>) -> Result<Self> {
        Self::detect(transport, chip).map_err(|(_, e)| e)
    }

    /// Like [`Flashing::connect`], handing the transport back on failure.
    fn detect(transport: T, chip: Option<&str>) -> std::result::Result<Self, (T, Error)> {
        let db = match ChipDB::load() {
            Ok(db) => db,
            Err(e) => return Err((transport, e)),
        };

        if let Some(name) = chip {
            let (family, chip) = match db.find_chip_by_name(name) {
                Ok(found) => found,
                Err(e) => return Err((transport, e)),
            };
            let mut icsp = Icsp::new(transport, family);
            let device_id = match icsp.read_id() {
                Ok(id) => id,
                Err(e) => return Err((icsp.into_parts().0, e)),
            };
            if device_id.id != chip.device_id {
                log::warn!(
                    "Device ID {} does not match {}, continuing as requested",
                    device_id,
                    chip
                );
            }
            return Ok(Flashing {
                icsp,
                chip,
                device_id,
            });
        }

        let mut transport = transport;
        for family in db.families() {
            let mut icsp = Icsp::new(transport, family.clone());
            let device_id = match icsp.read_id() {
                Ok(id) => id,
                Err(e) => return Err((icsp.into_parts().0, e)),
            };
            log::debug!("{}: read device ID {}", family.name, device_id);
            if let Some(chip) = ChipDB::find_in_family(family, device_id.id) {
                log::debug!("found chip: {}", chip);
                return Ok(Flashing {
                    icsp,
                    chip,
                    device_id,
                });
            }
            transport = icsp.into_parts().0;
        }
        Err((transport, anyhow::format_err!("No supported chip found")))
    }

    pub fn chip(&self) -> &Chip {
        &self.chip
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn into_transport(self) -> T {
        self.icsp.into_parts().0
    }

    pub fn dump_info(&self) -> Result<()> {
        log::info!(
            "Chip: {} (Flash: {}KiB, {} instruction words)",
            self.chip,
            self.chip.flash_size / 1024,
            self.chip.instruction_words()
        );
        log::info!("Family: {}", self.chip.family);
        log::info!("Device ID: {}", self.device_id);
        Ok(())
    }

    pub fn erase(&mut self) -> Result<()> {
        self.icsp.erase()?;
        log::info!("Device erased");
        Ok(())
    }

    /// Program `image`, laid out from address 0 in hex-file byte
    /// addressing. Blocks that are entirely erased are skipped, so the
    /// device is expected to be blank.
    pub fn flash(&mut self, image: &[u8]) -> Result<()> {
        let image = self.padded(image)?;
        let blocks = image.len() / WRITE_BLOCK_SIZE;

        let bar = progress_bar(blocks as u64)?;
        self.icsp.with_session(|icsp| {
            for (i, block) in image.chunks_exact(WRITE_BLOCK_SIZE).enumerate() {
                if !is_erased(block) {
                    icsp.write((i * WRITE_BLOCK_SIZE) as u32, block)?;
                }
                bar.inc(1);
            }
            Ok(())
        })?;
        bar.finish();

        log::info!("Flashed {} bytes in {} blocks", image.len(), blocks);
        Ok(())
    }

    /// Read back and compare, ignoring the phantom upper bytes.
    pub fn verify(&mut self, image: &[u8]) -> Result<()> {
        let image = self.padded(image)?;
        let readback = self.read(0, image.len())?;
        if let Some(offset) = first_mismatch(&image, &readback) {
            anyhow::bail!(
                "Verify failed at 0x{:06x}: expected {}, read {}",
                offset & !3,
                hex::encode(&image[offset & !3..][..4]),
                hex::encode(&readback[offset & !3..][..4])
            );
        }
        Ok(())
    }

    /// Read `len` bytes of program memory at hex-file byte address `addr`.
    pub fn read(&mut self, addr: u32, len: usize) -> Result<Vec<u8>> {
        anyhow::ensure!(addr % 8 == 0, "read address must be 8-byte aligned");
        anyhow::ensure!(
            addr as usize + len <= self.chip.image_size(),
            "read past the end of program memory (0x{:x})",
            self.chip.image_size()
        );

        let bar = progress_bar(len as u64)?;
        let mut data = Vec::with_capacity(len);
        self.icsp.with_session(|icsp| {
            let mut offset = 0;
            while offset < len {
                let n = READ_CHUNK.min(len - offset);
                let chunk = icsp.read(addr + offset as u32, n)?;
                data.extend_from_slice(&chunk[..n]);
                offset += n;
                bar.inc(n as u64);
            }
            Ok(())
        })?;
        bar.finish();
        Ok(data)
    }

    fn padded(&self, image: &[u8]) -> Result<Vec<u8>> {
        anyhow::ensure!(
            image.len() <= self.chip.image_size(),
            "Firmware of {} bytes does not fit {} ({} bytes)",
            image.len(),
            self.chip,
            self.chip.image_size()
        );
        Ok(pad_image(image))
    }
}

/// Pad to whole write blocks with the erased pattern.
pub fn pad_image(image: &[u8]) -> Vec<u8> {
    let len = image.len().div_ceil(WRITE_BLOCK_SIZE) * WRITE_BLOCK_SIZE;
    let mut padded = image.to_vec();
    padded.extend((image.len()..len).map(|i| ERASED_PATTERN[i % 4]));
    padded
}

fn is_erased(block: &[u8]) -> bool {
    block
        .iter()
        .enumerate()
        .all(|(i, &b)| i % 4 == 3 || b == ERASED_PATTERN[i % 4])
}

fn first_mismatch(expected: &[u8], actual: &[u8]) -> Option<usize> {
    expected
        .iter()
        .zip(actual)
        .enumerate()
        .find(|&(i, (a, b))| i % 4 != 3 && a != b)
        .map(|(i, _)| i)
}

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")?
            .progress_chars("##-"),
    );
    Ok(bar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_image() {
        let padded = pad_image(&[0x01, 0x02, 0x03, 0x00, 0x04]);
        assert_eq!(padded.len(), WRITE_BLOCK_SIZE);
        assert_eq!(&padded[..5], &[0x01, 0x02, 0x03, 0x00, 0x04]);
        assert_eq!(&padded[5..8], &[0xff, 0xff, 0x00]);
        assert_eq!(&padded[8..12], &ERASED_PATTERN);

        assert_eq!(pad_image(&[0; WRITE_BLOCK_SIZE]).len(), WRITE_BLOCK_SIZE);
        assert!(pad_image(&[]).is_empty());
    }

    #[test]
    fn test_is_erased_ignores_phantom() {
        let mut block = pad_image(&[]);
        block.resize(WRITE_BLOCK_SIZE, 0);
        assert!(!is_erased(&block));

        let block = pad_image(&[0xff]);
        assert!(is_erased(&block));
        let mut block = block;
        block[3] = 0x5a;
        assert!(is_erased(&block));
        block[4] = 0;
        assert!(!is_erased(&block));
    }

    #[test]
    fn test_first_mismatch() {
        let a = [1, 2, 3, 0, 5, 6, 7, 0];
        let mut b = a;
        b[3] = 9;
        assert_eq!(first_mismatch(&a, &b), None);
        b[5] = 0;
        assert_eq!(first_mismatch(&a, &b), Some(5));
    }

    #[test]
    fn test_failed_detection_returns_transport() {
        let sim = SimTarget::new(SimConfig {
            device_id: 0x1234,
            ..SimConfig::default()
        });
        let Err((sim, e)) = Flashing::detect(sim, None) else {
            panic!("unknown device was accepted");
        };
        assert!(e.to_string().contains("No supported chip"));
        let families = ChipDB::load().unwrap().families().len();
        assert_eq!(sim.stats().enters, families);
        assert_eq!(sim.stats().exits, families);
        assert!(!sim.powered());
    }
}
