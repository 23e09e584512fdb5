//! Bus Pirate in binary bit-bang mode as an ICSP line driver.
//!
//! Wiring: CLK = PGC, MOSI = PGD, CS = MCLR, the on-board supply powers
//! the target. Every pin command is answered with one byte holding the
//! sampled pin levels.
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{Error, Result};
use serialport::SerialPort;

use super::Pins;

const SERIAL_TIMEOUT_MS: u64 = 100;
const BAUDRATE: u32 = 115200;
const HANDSHAKE_TRIES: usize = 20;
const BITBANG_VERSION: &[u8; 5] = b"BBIO1";

const CMD_RESET_TERMINAL: u8 = 0b0000_1111;
const CMD_DIRECTION: u8 = 0b0100_0000;
const CMD_PINS: u8 = 0b1000_0000;

/// Pin bits, shared by the state and the direction commands.
mod pin {
    pub const POWER: u8 = 1 << 6;
    pub const MOSI: u8 = 1 << 3;
    pub const CLK: u8 = 1 << 2;
    pub const MISO: u8 = 1 << 1;
    pub const CS: u8 = 1 << 0;
}

pub struct BusPirate {
    serial_port: Box<dyn SerialPort>,
    /// Output levels, `CMD_PINS` layout.
    state: u8,
    /// Inputs set to 1, `CMD_DIRECTION` layout.
    direction: u8,
}

impl BusPirate {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str) -> Result<Self> {
        log::info!("Opening Bus Pirate on \"{}\" @ {} baud", port, BAUDRATE);
        let serial_port = serialport::new(port, BAUDRATE)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        let mut bp = BusPirate {
            serial_port,
            state: 0,
            direction: pin::MISO,
        };
        bp.enter_bitbang()?;
        bp.command(CMD_DIRECTION | bp.direction)?;
        bp.command(CMD_PINS | bp.state)?;
        Ok(bp)
    }

    pub fn open_any() -> Result<Self> {
        let ports = serialport::available_ports()?;
        match ports.first() {
            Some(port) => Self::open(&port.port_name),
            None => Err(Error::msg("No serial ports found!")),
        }
    }

    /// Leave bit-bang mode, back to the user terminal.
    pub fn close(mut self) -> Result<()> {
        self.serial_port.write_all(&[CMD_RESET_TERMINAL])?;
        self.serial_port.flush()?;
        Ok(())
    }

    /// Send NULs until the firmware answers with its bit-bang banner.
    fn enter_bitbang(&mut self) -> Result<()> {
        self.serial_port.clear(serialport::ClearBuffer::Input)?;
        for _ in 0..HANDSHAKE_TRIES {
            self.serial_port.write_all(&[0x00])?;
            self.serial_port.flush()?;

            let mut banner = [0u8; 5];
            match self.serial_port.read_exact(&mut banner) {
                Ok(()) if &banner == BITBANG_VERSION => {
                    log::debug!("Bus Pirate entered binary bit-bang mode");
                    self.serial_port.clear(serialport::ClearBuffer::Input)?;
                    return Ok(());
                }
                Ok(()) => log::debug!("unexpected banner: {}", hex::encode(banner)),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!("Bus Pirate did not enter bit-bang mode")
    }

    /// One command byte out, one pin-state byte back.
    fn command(&mut self, cmd: u8) -> Result<u8> {
        self.serial_port.write_all(&[cmd])?;
        let mut reply = [0u8; 1];
        self.serial_port.read_exact(&mut reply)?;
        Ok(reply[0])
    }

    fn set_pin(&mut self, mask: u8, high: bool) -> Result<u8> {
        if high {
            self.state |= mask;
        } else {
            self.state &= !mask;
        }
        self.command(CMD_PINS | self.state)
    }

    fn set_input(&mut self, mask: u8, input: bool) -> Result<()> {
        let direction = if input {
            self.direction | mask
        } else {
            self.direction & !mask
        };
        if direction != self.direction {
            self.direction = direction;
            self.command(CMD_DIRECTION | direction)?;
        }
        Ok(())
    }
}

impl Pins for BusPirate {
    fn set_power(&mut self, on: bool) -> Result<()> {
        self.set_pin(pin::POWER, on).map(|_| ())
    }

    fn set_pgc(&mut self, high: bool) -> Result<()> {
        self.set_pin(pin::CLK, high).map(|_| ())
    }

    fn set_pgd(&mut self, high: bool) -> Result<()> {
        self.set_input(pin::MOSI, false)?;
        self.set_pin(pin::MOSI, high).map(|_| ())
    }

    fn set_mclr(&mut self, high: bool) -> Result<()> {
        self.set_pin(pin::CS, high).map(|_| ())
    }

    fn release_pgd(&mut self) -> Result<()> {
        self.set_input(pin::MOSI, true)
    }

    fn read_pgd(&mut self) -> Result<bool> {
        let levels = self.command(CMD_PINS | self.state)?;
        Ok(levels & pin::MOSI != 0)
    }
}
