//! Firmware file formats
//!
//! Images are addressed the way PIC24 toolchains emit hex files: byte
//! address = 2 × program address, 4 bytes per instruction word with a zero
//! phantom byte on top.
use std::path::Path;
use std::str;

use anyhow::Result;

use crate::flashing::ERASED_PATTERN;

/// Refuse images that would not fit any PIC24 program space.
const MAX_IMAGE_SIZE: u32 = 0x0200_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    Binary,
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::PlainHex => Ok(hex::decode(
            raw.into_iter()
                .filter(|&c| c != b'\r' && c != b'\n')
                .collect::<Vec<u8>>(),
        )?),
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::Binary => Ok(raw),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else if !raw.is_empty()
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;

                records.push((offset, value));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    merge_sections(records)
}

/// Intel HEX of `data` placed at byte address `base`.
pub fn write_ihex(base: u32, data: &[u8]) -> Result<String> {
    use ihex::Record;

    let mut records = vec![];
    let mut segment = None;
    for (i, chunk) in data.chunks(16).enumerate() {
        let addr = base + (i * 16) as u32;
        let upper = (addr >> 16) as u16;
        if segment != Some(upper) {
            records.push(Record::ExtendedLinearAddress(upper));
            segment = Some(upper);
        }
        records.push(Record::Data {
            offset: addr as u16,
            value: chunk.to_vec(),
        });
    }
    records.push(Record::EndOfFile);
    Ok(ihex::create_object_file_representation(&records)?)
}

/// Lay sections out from address 0, gaps read as erased flash.
fn merge_sections(mut sections: Vec<(u32, Vec<u8>)>) -> Result<Vec<u8>> {
    sections.sort(); // order by start address

    let mut end_address = None;
    for (addr, data) in &sections {
        let end = u32::try_from(data.len())
            .ok()
            .and_then(|len| addr.checked_add(len))
            .ok_or_else(|| anyhow::format_err!("section at 0x{:x} runs past 4GiB", addr))?;
        end_address = end_address.max(Some(end));
    }
    let end_address =
        end_address.ok_or_else(|| anyhow::format_err!("firmware contains no data"))?;
    anyhow::ensure!(
        end_address <= MAX_IMAGE_SIZE,
        "firmware ends at 0x{:x}, beyond program memory",
        end_address
    );

    let mut binary: Vec<u8> = (0..end_address as usize)
        .map(|i| ERASED_PATTERN[i % 4])
        .collect();
    for (addr, sect) in sections {
        let start = addr as usize;
        binary[start..start + sect.len()].copy_from_slice(&sect);
    }
    Ok(binary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_ihex_with_gap() {
        // two words at 0x0000 and one at 0x0010
        let hex = ":080000000004040000000000F0\n\
                   :04001000AA550100EC\n\
                   :00000001FF\n";
        let image = read_ihex(hex).unwrap();
        assert_eq!(image.len(), 0x14);
        assert_eq!(&image[..8], &[0x00, 0x04, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&image[8..12], &ERASED_PATTERN);
        assert_eq!(&image[0x10..], &[0xaa, 0x55, 0x01, 0x00]);
    }

    #[test]
    fn test_ihex_roundtrip_across_segment() {
        let data: Vec<u8> = (0..48).map(|i| i as u8).collect();
        let text = write_ihex(0xfff0, &data).unwrap();
        assert!(text.to_uppercase().contains(":020000040001F9"));

        let image = read_ihex(&text).unwrap();
        assert_eq!(&image[0xfff0..], &data[..]);
    }

    #[test]
    fn test_guess_format() {
        let p = Path::new("fw.bin");
        assert_eq!(guess_format(Path::new("fw.hex"), b"xx"), FirmwareFormat::IntelHex);
        assert_eq!(guess_format(p, b":00000001FF\n"), FirmwareFormat::IntelHex);
        assert_eq!(guess_format(p, b"0004040000\n"), FirmwareFormat::PlainHex);
        assert_eq!(guess_format(p, &[0x00, 0x04, 0x04]), FirmwareFormat::Binary);
        assert_eq!(guess_format(p, &[]), FirmwareFormat::Binary);
    }

    #[test]
    fn test_section_at_top_of_address_space() {
        let text = write_ihex(0xffff_fff0, &[0; 16]).unwrap();
        assert!(read_ihex(&text).is_err());
    }

    #[test]
    fn test_empty_ihex_rejected() {
        assert!(read_ihex(":00000001FF\n").is_err());
    }
}
