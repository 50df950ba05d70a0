//! bulkctl
//!
//! Operator tool for the vendor bulk interface of a composite USB device.
//! Opens the device through the same backend selection the driver uses and
//! exchanges raw bulk packets with it.

use anyhow::{Context, Result};
use bulkctl::commands::{self, format_hex, parse_payload};
use bulkctl::config::parse_hex_id;
use bulkctl::{CliConfig, setup_logging};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bulkctl")]
#[command(author, version, about = "Bulk channel tool for composite USB devices")]
#[command(long_about = "
Opens the vendor bulk interface (interface 1) of a composite USB device and
exchanges raw packets with it. On Windows the WinUSB driver path is tried
first; libusb is used everywhere else and as the fallback.

EXAMPLES:
    # List devices from the configured vendor
    bulkctl list

    # Show which backend and endpoints would be used
    bulkctl probe --json

    # Send a command and read the response
    bulkctl send \"02 91 01 04\" --response 64

    # Use another device and debug logging
    bulkctl --vid 057e --pid 2066 --log-level debug probe

CONFIGURATION:
    bulkctl looks for configuration in the following order:
    1. Path specified with --config
    2. <config dir>/bulk-usb/bulkctl.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Vendor id override (hex)
    #[arg(long, value_name = "VID", global = true)]
    vid: Option<String>,

    /// Product id override (hex)
    #[arg(long, value_name = "PID", global = true)]
    pid: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List USB devices and their vendor bulk endpoints
    List {
        /// Include devices from every vendor
        #[arg(long)]
        all: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Open the device and report the selected backend
    Probe {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Write a hex payload to the bulk OUT endpoint
    Send {
        /// Payload bytes in hex, e.g. "02 91 01 04"
        payload: String,

        /// Write timeout in milliseconds
        #[arg(short, long, default_value_t = 100)]
        timeout_ms: u32,

        /// Read up to this many response bytes afterwards (0 = none)
        #[arg(short, long, default_value_t = 0)]
        response: usize,
    },

    /// Read from the bulk IN endpoint
    Read {
        /// Maximum bytes to read
        #[arg(short = 'n', long, default_value_t = 64)]
        len: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = CliConfig::default();
        let path = CliConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        CliConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        CliConfig::load_or_default()
    };

    if let Some(ref vid) = args.vid {
        config.device.vendor_id = parse_hex_id(vid, "vendor_id")?;
    }
    if let Some(ref pid) = args.pid {
        config.device.product_id = parse_hex_id(pid, "product_id")?;
    }

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level)
        .to_string();
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("bulkctl v{}", env!("CARGO_PKG_VERSION"));

    match args.command.unwrap_or(Command::Probe { json: false }) {
        Command::List { all, json } => list(&config, all, json),
        Command::Probe { json } => probe(&config, json),
        Command::Send {
            payload,
            timeout_ms,
            response,
        } => {
            let payload = parse_payload(&payload)?;
            let mut transport = commands::open_transport(&config)?;
            let data = commands::send(&mut transport, &payload, timeout_ms, response)?;
            println!("Sent {} bytes", payload.len());
            if !data.is_empty() {
                println!("{}", format_hex(&data));
            }
            Ok(())
        }
        Command::Read { len } => {
            let mut transport = commands::open_transport(&config)?;
            let data = commands::read(&mut transport, len)?;
            println!("Received {} bytes", data.len());
            if !data.is_empty() {
                println!("{}", format_hex(&data));
            }
            Ok(())
        }
    }
}

fn list(config: &CliConfig, all: bool, json: bool) -> Result<()> {
    let vendor = (!all).then_some(config.device.vendor_id);
    let devices = commands::list_devices(vendor)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No matching USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let bulk = match device.bulk_endpoints {
            Some((out_ep, in_ep)) => format!("bulk out {:#04x}, in {:#04x}", out_ep, in_ep),
            None => "no vendor bulk interface".to_string(),
        };
        println!(
            "  Bus {:03} Device {:03}: {:04x}:{:04x}  {}",
            device.bus, device.address, device.vendor_id, device.product_id, bulk
        );
    }

    Ok(())
}

fn probe(config: &CliConfig, json: bool) -> Result<()> {
    let mut transport = commands::open_transport(config)?;
    let report = commands::probe_report(config, &transport)
        .context("Transport reported no active backend")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{:04x}:{:04x} via {} backend",
            report.vendor_id, report.product_id, report.backend
        );
        println!(
            "  interface {}, out {:#04x}, in {:#04x}",
            report.interface, report.out_endpoint, report.in_endpoint
        );
    }

    transport.close();
    Ok(())
}
