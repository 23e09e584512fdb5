use std::{thread::sleep, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};

use pic24prog::device::parse_number;
use pic24prog::transport::BusPirate;
use pic24prog::{ChipDB, Flashing, Transport};

#[derive(Parser)]
#[command(
    name = "pic24prog",
    about = "In-Circuit Serial Programming for PIC24 microcontrollers over a Bus Pirate"
)]
struct Cli {
    /// Serial port of the Bus Pirate, first available port if omitted
    #[arg(long, short, global = true)]
    port: Option<String>,
    /// Use a simulated target instead of hardware
    #[arg(long, global = true)]
    dummy: bool,
    /// Chip name, skips auto-detection
    #[arg(long, short, global = true)]
    chip: Option<String>,
    /// Print protocol-level debug output
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get info about current connected chip
    Info {},
    /// Bulk erase program memory
    Erase {},
    /// Erase, program and verify
    Flash {
        /// The path to the firmware to be programmed
        path: String,
        /// Do not read back after programming
        #[arg(long)]
        no_verify: bool,
    },
    /// Verify program memory against a firmware file
    Verify { path: String },
    /// Dump program memory to an Intel HEX file
    Read {
        path: String,
        /// Start byte address, as in hex files
        #[arg(long, value_parser = parse_number, default_value = "0")]
        address: u32,
        /// Bytes to read, whole chip if omitted
        #[arg(long, value_parser = parse_number)]
        length: Option<u32>,
    },
    /// List supported chips
    Chips {},
    /// List serial ports
    Ports {},
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = simplelog::TermLogger::init(
        if cli.verbose {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match cli.command {
        Commands::Chips {} => {
            let db = ChipDB::load()?;
            for family in db.families() {
                println!("{} - {}", family.name, family.description);
                for chip in &family.variants {
                    println!("  {} ({}KiB)", chip, chip.flash_size / 1024);
                }
            }
            return Ok(());
        }
        Commands::Ports {} => {
            for port in BusPirate::scan_ports()? {
                println!("{}", port);
            }
            return Ok(());
        }
        _ => {}
    }

    let chip = cli.chip.as_deref();
    if cli.dummy {
        let mut flashing = Flashing::new_dummy(chip)?;
        run(&mut flashing, cli.command)
    } else {
        let mut flashing = Flashing::new_from_buspirate(cli.port.as_deref(), chip)?;
        let result = run(&mut flashing, cli.command);
        // hand the Bus Pirate back to its terminal
        flashing.into_transport().into_inner().close()?;
        result
    }
}

fn run<T: Transport>(flashing: &mut Flashing<T>, command: Commands) -> Result<()> {
    match command {
        Commands::Info {} => {
            flashing.dump_info()?;
        }
        Commands::Erase {} => {
            flashing.erase()?;
        }
        Commands::Flash { path, no_verify } => {
            flashing.dump_info()?;
            let binary = pic24prog::format::read_firmware_from_file(path)?;
            log::info!("Firmware size: {}", binary.len());
            flashing.erase()?;
            flashing.flash(&binary)?;
            if !no_verify {
                sleep(Duration::from_millis(100));
                flashing.verify(&binary)?;
                log::info!("Verified!");
            }
        }
        Commands::Verify { path } => {
            let binary = pic24prog::format::read_firmware_from_file(path)?;
            log::info!("Firmware size: {}", binary.len());
            flashing.verify(&binary)?;
            log::info!("Verified!");
        }
        Commands::Read {
            path,
            address,
            length,
        } => {
            let image_size = flashing.chip().image_size() as u32;
            let length = length.unwrap_or(image_size.saturating_sub(address));
            let data = flashing.read(address, length as usize)?;
            std::fs::write(&path, pic24prog::format::write_ihex(address, &data)?)?;
            log::info!("Wrote {} bytes to {}", data.len(), path);
        }
        Commands::Chips {} | Commands::Ports {} => unreachable!("handled before connecting"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_accepts_sizes() {
        let cli = Cli::try_parse_from([
            "pic24prog", "read", "dump.hex", "--address", "0x800", "--length", "16KiB",
        ])
        .unwrap();
        match cli.command {
            Commands::Read {
                address, length, ..
            } => {
                assert_eq!(address, 0x800);
                assert_eq!(length, Some(16 * 1024));
            }
            _ => panic!("parsed as another command"),
        }
    }
}
