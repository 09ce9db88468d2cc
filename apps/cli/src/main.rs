use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use usbhelper_core::{CloseOutcome, HelperConfig, NusbHost, UsbDevice, UsbSession};

#[derive(Parser, Debug)]
#[command(author, version, about = "Single-device USB bulk helper (nusb backend)", long_about = None)]
struct Args {
    /// Vendor ID in hex (overrides config)
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Product ID in hex (overrides config)
    #[arg(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Path to a TOML config file
    #[arg(long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every attached USB device
    List,
    /// Look for the configured device
    Find,
    /// Check (and if needed request) permission for the configured device
    Check,
    /// Send hex bytes to the OUT endpoint
    Write {
        /// Payload as hex, e.g. "01ff20"
        data: String,
    },
    /// Read one packet from the IN endpoint
    Read,
    /// Write hex bytes, then read one reply packet
    Exchange {
        /// Payload as hex, e.g. "01ff20"
        data: String,
    },
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id '{}': {}", s, e))
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&digits).with_context(|| format!("invalid hex payload '{}'", s))
}

fn load_config(args: &Args) -> Result<HelperConfig> {
    let mut config = match &args.config {
        Some(path) => HelperConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path))?,
        None => HelperConfig::default(),
    };
    if let Some(vid) = args.vid {
        config.vendor_id = vid;
    }
    if let Some(pid) = args.pid {
        config.product_id = pid;
    }
    Ok(config)
}

/// Find the device, make sure we may use it, and open it.
fn connect(session: &mut UsbSession<NusbHost>) -> Result<()> {
    let device = session.require_device()?;
    let timeout = session.config().permission_timeout();
    session
        .ensure_permission(&device, timeout)
        .with_context(|| format!("no access to {}", device.name()))?;
    session.open(Some(&device))?;
    Ok(())
}

fn report_close(session: &mut UsbSession<NusbHost>) {
    if let CloseOutcome::ClosedWithWarnings(warnings) = session.close() {
        for w in warnings {
            warn!("Close: {}", w);
        }
    }
}

fn read_and_print(session: &mut UsbSession<NusbHost>) -> Result<()> {
    let timeout = session.config().read_timeout();
    match session.read(timeout)? {
        Some(data) => println!("{}", hex::encode(data)),
        None => println!("no data"),
    }
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let mut session = UsbSession::new(NusbHost::new(), config);

    match &args.command {
        Command::List => {
            for device in session.list_devices()? {
                println!(
                    "{}  {:04X}:{:04X}",
                    device.name(),
                    device.vendor_id(),
                    device.product_id()
                );
            }
        }
        Command::Find => match session.find_device()? {
            Some(device) => println!("found {}", device.name()),
            None => println!("not found ({})", session.config().device_id()),
        },
        Command::Check => {
            let device = session.require_device()?;
            if session.check_permission(&device) {
                println!("permission held");
            } else {
                let timeout = session.config().permission_timeout();
                let outcome = session.request_permission_blocking(&device, timeout)?;
                println!("permission {}", outcome);
            }
        }
        Command::Write { data } => {
            let payload = parse_hex_bytes(data)?;
            connect(&mut session)?;
            let timeout = session.config().write_timeout();
            let written = session.write(&payload, payload.len(), timeout);
            report_close(&mut session);
            println!("wrote {} bytes", written?);
        }
        Command::Read => {
            connect(&mut session)?;
            let result = read_and_print(&mut session);
            report_close(&mut session);
            result?;
        }
        Command::Exchange { data } => {
            let payload = parse_hex_bytes(data)?;
            connect(&mut session)?;
            let timeout = session.config().write_timeout();
            let result = session
                .write(&payload, payload.len(), timeout)
                .map_err(anyhow::Error::from)
                .and_then(|_| read_and_print(&mut session));
            report_close(&mut session);
            result?;
        }
    }

    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting usbhelper (nusb backend)...");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u16() {
        assert_eq!(parse_hex_u16("0x2d40"), Ok(0x2D40));
        assert_eq!(parse_hex_u16("00B7"), Ok(0x00B7));
        assert!(parse_hex_u16("zz").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("01 ff20").unwrap(), vec![0x01, 0xFF, 0x20]);
        assert_eq!(parse_hex_bytes("DEADbeef").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
        assert!(parse_hex_bytes("é1").is_err());
    }
}
