mod flash;

use std::{cell::Cell, path::PathBuf, process::ExitCode, time::Instant};

use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand, ValueEnum};
use clap_num::maybe_hex;
use emds::{Emds, Entry, FlashCaps, FlashParameters};
use log::{debug, error, info, warn};
use memory_regions::MemoryRegions;
use rand_core::{OsRng, RngCore};

use flash::SimFlash;

/// Host simulation of emergency data storage on a board's flash layout.
#[derive(Parser, Debug)]
#[command(about, author, disable_version_flag = true)]
struct Args {
    /// Print version information.
    #[arg(short = 'V', long)]
    version: bool,

    /// Flash image (default: use RAM).
    #[arg(short, long)]
    flash: Option<PathBuf>,

    /// Board memory layout.
    #[arg(short, long, value_enum, default_value_t)]
    layout: Layout,

    /// Registered entry as ID=HEX, e.g. 0x10=cafe.
    ///
    /// The hex string sets both the entry length and the value written by `store`.
    #[arg(short, long = "entry", value_parser = parse_entry)]
    entries: Vec<EntryArg>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the layout, the store estimates and the freshest snapshot.
    Info,
    /// Load the freshest snapshot and print the registered entries.
    Load,
    /// Store snapshots of the registered entries, then reboot and load.
    Store {
        /// Fill entries with random bytes instead of the given values.
        #[arg(short, long)]
        random: bool,

        /// Number of consecutive load/prepare/store cycles.
        #[arg(short, long, default_value_t = 1)]
        count: u32,

        /// Cut power after this many bytes of the last store.
        #[arg(long, value_parser = maybe_hex::<usize>)]
        power_cut: Option<usize>,
    },
    /// Erase both partitions.
    Clear,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum Layout {
    /// NOR flash with 4 KiB pages and word writes.
    #[default]
    Nrf52,
    /// RRAM with 16 byte write buffers.
    Nrf54l,
}

impl Layout {
    fn regions(self) -> MemoryRegions {
        match self {
            Self::Nrf52 => MemoryRegions::NRF52,
            Self::Nrf54l => MemoryRegions::NRF54L,
        }
    }

    fn parameters(self) -> FlashParameters {
        match self {
            Self::Nrf52 => FlashParameters {
                write_block_size: 4,
                erase_value: 0xff,
                caps: FlashCaps::WordWrite,
            },
            Self::Nrf54l => FlashParameters {
                write_block_size: 16,
                erase_value: 0xff,
                caps: FlashCaps::BufferedCommit,
            },
        }
    }
}

#[derive(Clone, Debug)]
struct EntryArg {
    id: u16,
    value: Vec<u8>,
}

fn parse_entry(s: &str) -> Result<EntryArg, String> {
    let (id, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=HEX, got {s:?}"))?;
    let id = maybe_hex::<u16>(id)?;
    if !value.is_ascii() || value.len() % 2 != 0 {
        return Err(format!("expected pairs of hex digits, got {value:?}"));
    }
    let value = (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16))
        .collect::<Result<_, _>>()
        .map_err(|err| format!("invalid hex value {value:?}: {err}"))?;
    Ok(EntryArg { id, value })
}

fn emds_error(err: emds::Error) -> anyhow::Error {
    anyhow!("emds: {:?} (errno {})", err, err.errno())
}

fn on_store() {
    debug!("store callback");
}

fn hex(cells: &[Cell<u8>]) -> String {
    cells.iter().map(|cell| format!("{:02x}", cell.get())).collect()
}

fn print_entries(table: &[Entry<'_>]) {
    for entry in table {
        println!("  {:#06x} = {}", entry.id, hex(entry.data));
    }
}

fn print_snapshot<F: emds::FlashDevice>(emds: &Emds<'_, F>) {
    match emds.snapshot() {
        Some(snapshot) => println!(
            "snapshot {} in partition {}: data {:#x}+{:#x}, metadata at {:#x}",
            snapshot.fresh_cnt(),
            snapshot.partition,
            snapshot.metadata.data_instance_off,
            snapshot.metadata.data_instance_len,
            snapshot.metadata_off,
        ),
        None => println!("no snapshot"),
    }
}

/// Like `load`, but an empty flash is not an error.
fn sync<F: emds::FlashDevice>(emds: &mut Emds<'_, F>) -> anyhow::Result<()> {
    match emds.load() {
        Err(emds::Error::NotFound) => Ok(()),
        result => result.map_err(emds_error),
    }
}

fn run<const PAGE: usize>(args: &Args, command: &Command) -> anyhow::Result<()> {
    let regions = args.layout.regions();
    let params = args.layout.parameters();
    let origin = regions.emds.start as u32;
    let size = regions.emds.len();
    let flash = match &args.flash {
        Some(path) => SimFlash::<PAGE>::file(path, origin, size, params)
            .with_context(|| format!("flash image {}", path.display()))?,
        None => SimFlash::<PAGE>::ram(origin, size, params),
    };
    let partitions = regions.emds_partitions();

    let buffers: Vec<Vec<Cell<u8>>> = args
        .entries
        .iter()
        .map(|entry| entry.value.iter().copied().map(Cell::new).collect())
        .collect();
    let table: Vec<Entry<'_>> = args
        .entries
        .iter()
        .zip(&buffers)
        .map(|(entry, buffer)| Entry::new(entry.id, buffer))
        .collect();

    let mut emds = Emds::new(flash, partitions.clone(), &table);
    emds.init(Some(on_store)).map_err(emds_error)?;

    match command {
        Command::Info => {
            println!("layout {:?}: {:?}", args.layout, params);
            println!("partitions {:#x?}", partitions);
            println!(
                "store size {} bytes, estimated time {} us",
                emds.store_size_get(),
                emds.store_time_get()
            );
            sync(&mut emds)?;
            print_snapshot(&emds);
        }
        Command::Load => {
            sync(&mut emds)?;
            print_snapshot(&emds);
            print_entries(&table);
        }
        Command::Clear => {
            emds.clear().map_err(emds_error)?;
            info!("erased {:#x?}", partitions);
        }
        Command::Store {
            random,
            count,
            power_cut,
        } => {
            for cycle in 1..=*count {
                sync(&mut emds)?;
                if *random {
                    for buffer in &buffers {
                        let mut bytes = vec![0; buffer.len()];
                        OsRng.fill_bytes(&mut bytes);
                        buffer.iter().zip(bytes).for_each(|(cell, byte)| cell.set(byte));
                    }
                } else {
                    for (buffer, entry) in buffers.iter().zip(&args.entries) {
                        buffer.iter().zip(&entry.value).for_each(|(cell, byte)| cell.set(*byte));
                    }
                }
                emds.prepare().map_err(emds_error)?;

                let cut = if cycle == *count { *power_cut } else { None };
                if let Some(bytes) = cut {
                    emds.flash_mut().power_cut_after_bytes(bytes);
                }

                let programmed = emds.flash().programmed();
                let started = Instant::now();
                let result = emds.store();
                let elapsed = started.elapsed();
                info!(
                    "store {}/{}: {} bytes in {} us, estimated {} us",
                    cycle,
                    count,
                    emds.flash().programmed() - programmed,
                    elapsed.as_micros(),
                    emds.store_time_get()
                );

                match result {
                    Err(_err) if cut.is_some() => {
                        warn!("power cut during store: {:?}", _err);
                        emds.flash_mut().power_restore();
                    }
                    result => result.map_err(emds_error)?,
                }
            }

            // reboot with zeroed buffers and read back what survived
            let flash = emds.release();
            let restored: Vec<Vec<Cell<u8>>> = buffers
                .iter()
                .map(|buffer| vec![Cell::new(0); buffer.len()])
                .collect();
            let table: Vec<Entry<'_>> = args
                .entries
                .iter()
                .zip(&restored)
                .map(|(entry, buffer)| Entry::new(entry.id, buffer))
                .collect();
            let mut emds = Emds::new(flash, partitions, &table);
            emds.init(None).map_err(emds_error)?;
            sync(&mut emds)?;
            print_snapshot(&emds);
            print_entries(&table);
        }
    }
    Ok(())
}

fn print_version() {
    let name = clap::crate_name!();
    let version = clap::crate_version!();
    println!("{} {}", name, version);
    println!("  emds layouts: nrf52, nrf54l");
}

fn main() -> ExitCode {
    pretty_env_logger::init();

    let args = Args::parse();
    if args.version {
        print_version();
        return ExitCode::SUCCESS;
    }
    let Some(command) = &args.command else {
        error!("no command given, see --help");
        return ExitCode::FAILURE;
    };

    debug!("{:?}", args);
    let result = match args.layout {
        Layout::Nrf52 => run::<4096>(&args, command),
        Layout::Nrf54l => run::<16>(&args, command),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serial_test::serial;

    const IMAGE_PATH: &str = "/tmp/emds-sim.cli.bin";

    fn run_cli(argv: &[&str]) -> anyhow::Result<()> {
        let args = Args::try_parse_from(argv)?;
        let command = args.command.as_ref().context("no command")?;
        run::<4096>(&args, command)
    }

    #[test]
    #[serial]
    fn failures_name_their_source() {
        std::fs::write(IMAGE_PATH, [0u8; 16]).unwrap();
        let err = run_cli(&["emds-sim", "-f", IMAGE_PATH, "info"]).unwrap_err();
        assert!(format!("{err:#}").starts_with("flash image /tmp/emds-sim.cli.bin"));
        std::fs::remove_file(IMAGE_PATH).unwrap();

        let err = run_cli(&["emds-sim", "-e", "0xffff=00", "load"]).unwrap_err();
        assert_eq!(err.to_string(), "emds: InvalidConfig (errno -22)");
    }

    #[test]
    #[serial]
    fn store_then_load_from_an_image() {
        let _ = std::fs::remove_file(IMAGE_PATH);
        run_cli(&["emds-sim", "-f", IMAGE_PATH, "-e", "1=cafe", "store", "-c", "3"]).unwrap();
        run_cli(&["emds-sim", "-f", IMAGE_PATH, "-e", "1=0000", "load"]).unwrap();
        run_cli(&["emds-sim", "-f", IMAGE_PATH, "clear"]).unwrap();
        std::fs::remove_file(IMAGE_PATH).unwrap();
    }

    #[test]
    fn entries_parse_as_id_and_hex() {
        let entry = parse_entry("0x10=cafe01").unwrap();
        assert_eq!(entry.id, 0x10);
        assert_eq!(entry.value, [0xca, 0xfe, 0x01]);

        let entry = parse_entry("7=").unwrap();
        assert_eq!((entry.id, entry.value.len()), (7, 0));

        assert!(parse_entry("7").is_err());
        assert!(parse_entry("7=abc").is_err());
        assert!(parse_entry("7=zz").is_err());
        assert!(parse_entry("0x10000=00").is_err());
    }

    #[test]
    fn layouts_match_their_partitions() {
        for layout in [Layout::Nrf52, Layout::Nrf54l] {
            let block = layout.parameters().write_block_size as u32;
            for partition in layout.regions().emds_partitions() {
                assert_eq!(partition.start % block, 0);
                assert_eq!(partition.end % block, 0);
            }
        }
    }
}
