//! PIC24 chip definitions, with family-wide ICSP parameters.
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// How a family enters programming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IcspEntry {
    /// MCLR pulse plus the 32-bit key, target at VDD.
    Lvp,
    /// VPP on MCLR, no key.
    Hvp,
}

/// Per-family ICSP capabilities the protocol depends on.
pub trait IcspFamily {
    /// 32-bit key clocked in while MCLR is held low.
    fn entry_key(&self) -> u32;
    fn entry(&self) -> IcspEntry;
    /// Settle time after a bulk erase completes.
    fn erase_delay(&self) -> Duration;
    /// NVMCON value for a row write.
    fn nvmcon_write(&self) -> u16;
    /// NVMCON value for a bulk erase.
    fn nvmcon_erase(&self) -> u16;
}

/// MCU Family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub icsp_key: u32,
    #[serde(default = "default_entry")]
    pub icsp_entry: IcspEntry,
    #[serde(default)]
    pub erase_delay_ms: u64,
    #[serde(deserialize_with = "parse_register")]
    pub nvmcon_write: u16,
    #[serde(deserialize_with = "parse_register")]
    pub nvmcon_erase: u16,
    pub description: String,
    pub variants: Vec<Chip>,
}

/// Represents an MCU chip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chip {
    pub name: String,
    #[serde(deserialize_with = "parse_register")]
    pub device_id: u16,
    /// Marketing flash size, in bytes.
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub flash_size: u32,
    /// Exclusive end of program memory, in program-space address units.
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub program_end: u32,

    /// Filled in from the owning family.
    #[serde(skip)]
    pub family: String,
}

impl ::std::fmt::Display for Chip {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "{}(0x{:04x})", self.name, self.device_id)
    }
}

impl Chip {
    /// Size of a full program image in hex-file byte addressing,
    /// 4 bytes per instruction word.
    pub const fn image_size(&self) -> usize {
        self.program_end as usize * 2
    }

    pub const fn instruction_words(&self) -> u32 {
        self.program_end / 2
    }
}

impl IcspFamily for Family {
    fn entry_key(&self) -> u32 {
        self.icsp_key
    }

    fn entry(&self) -> IcspEntry {
        self.icsp_entry
    }

    fn erase_delay(&self) -> Duration {
        Duration::from_millis(self.erase_delay_ms)
    }

    fn nvmcon_write(&self) -> u16 {
        self.nvmcon_write
    }

    fn nvmcon_erase(&self) -> u16 {
        self.nvmcon_erase
    }
}

pub struct ChipDB {
    families: Vec<Family>,
}

impl ChipDB {
    pub fn load() -> Result<Self> {
        Ok(ChipDB {
            families: vec![
                serde_yaml::from_str(include_str!("../devices/PIC24FJ-GA002.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/PIC24FJ-GA010.yaml"))?,
            ],
        })
    }

    pub fn families(&self) -> &[Family] {
        &self.families
    }

    /// Match a DEVID against one family.
    pub fn find_in_family(family: &Family, device_id: u16) -> Option<Chip> {
        let mut chip = family
            .variants
            .iter()
            .find(|c| c.device_id == device_id)
            .cloned()?;
        chip.family = family.name.clone();
        Some(chip)
    }

    pub fn find_chip(&self, device_id: u16) -> Result<(Family, Chip)> {
        self.families
            .iter()
            .find_map(|f| Self::find_in_family(f, device_id).map(|c| (f.clone(), c)))
            .ok_or_else(|| anyhow::format_err!("Device ID 0x{:04x} not found", device_id))
    }

    pub fn find_chip_by_name(&self, name: &str) -> Result<(Family, Chip)> {
        for family in &self.families {
            if let Some(chip) = family
                .variants
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
            {
                log::debug!("Find chip family: {}", family.name);
                let mut chip = chip.clone();
                chip.family = family.name.clone();
                return Ok((family.clone(), chip));
            }
        }
        anyhow::bail!("Cannot find chip named {}", name)
    }
}

fn default_entry() -> IcspEntry {
    IcspEntry::Lvp
}

fn parse_register<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = parse_address_and_offset(deserializer)?;
    u16::try_from(value)
        .map_err(|_| serde::de::Error::custom(format!("0x{:x} does not fit in 16 bits", value)))
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    parse_number(&s).map_err(serde::de::Error::custom)
}

/// `0x` hex, decimal, or a `K`/`KB`/`KiB` suffixed size.
pub fn parse_number(s: &str) -> std::result::Result<u32, String> {
    let err = |e: std::num::ParseIntError| format!("error while parsing {:?}: {}", s, e);
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(err)
    } else if let Some(kib) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix("K"))
    {
        kib.trim()
            .parse::<u32>()
            .map_err(err)?
            .checked_mul(1024)
            .ok_or_else(|| format!("{:?} does not fit in 32 bits", s))
    } else {
        s.parse().map_err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0xAC00"), Ok(0xac00));
        assert_eq!(parse_number("64K"), Ok(65536));
        assert_eq!(parse_number("16KiB"), Ok(16384));
        assert_eq!(parse_number("32KB"), Ok(32768));
        assert_eq!(parse_number("1234"), Ok(1234));
        assert!(parse_number("0xZZ").is_err());
        assert!(parse_number("4194304K").is_err());
    }

    #[test]
    fn test_load_database() {
        let db = ChipDB::load().unwrap();
        assert!(!db.families().is_empty());
        for family in db.families() {
            assert_eq!(family.entry_key(), 0x4d43_4851);
            assert_eq!(family.entry(), IcspEntry::Lvp);
            assert!(!family.variants.is_empty());
        }
    }

    #[test]
    fn test_find_chip() {
        let db = ChipDB::load().unwrap();
        let (family, chip) = db.find_chip(0x0447).unwrap();
        assert_eq!(chip.name, "PIC24FJ64GA002");
        assert_eq!(chip.family, family.name);
        assert_eq!(family.nvmcon_write(), 0x4001);
        assert_eq!(family.nvmcon_erase(), 0x404f);
        assert_eq!(chip.program_end, 0xac00);
        assert_eq!(chip.image_size(), 0x15800);

        let (_, by_name) = db.find_chip_by_name("pic24fj64ga002").unwrap();
        assert_eq!(by_name.device_id, 0x0447);

        assert!(db.find_chip(0xbeef).is_err());
        assert!(db.find_chip_by_name("PIC16F84").is_err());
    }

    #[test]
    fn test_family_yaml() {
        let yaml = r#"
name: Test
icsp_key: "0x4D434851"
icsp_entry: hvp
erase_delay_ms: 20
nvmcon_write: "0x4001"
nvmcon_erase: "0x404F"
description: test family
variants:
  - name: T1
    device_id: "0x1234"
    flash_size: 16K
    program_end: "0x2C00"
"#;
        let family: Family = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(family.entry(), IcspEntry::Hvp);
        assert_eq!(family.erase_delay(), Duration::from_millis(20));
        assert_eq!(family.variants[0].flash_size, 16 * 1024);

        let bad = yaml.replace("\"0x4001\"", "\"0x14001\"");
        assert!(serde_yaml::from_str::<Family>(&bad).is_err());
    }
}
