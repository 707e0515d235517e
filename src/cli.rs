// CLI definitions using clap

use clap::{Parser, ValueEnum};

#[derive(Parser)]
#[command(name = "ctapble-bridge")]
#[command(author, version, about = "BLE FIDO2 authenticator to USB HID bridge")]
pub struct Cli {
    /// Log level for the bridge itself
    #[arg(short = 'l', long = "log-level", default_value = "warn")]
    pub log_level: LogLevel,

    /// Log level scoped to the virtual HID (uhid) subsystem
    #[arg(long = "uhid-log-level", default_value = "error")]
    pub uhid_log_level: LogLevel,

    /// Idle-disconnect deadline for BLE sessions, in milliseconds
    #[arg(long = "idle-timeout-ms", default_value = "3000")]
    pub idle_timeout_ms: u64,

    /// Overall GATT connect timeout, in milliseconds
    #[arg(long = "connect-timeout-ms", default_value = "5000")]
    pub connect_timeout_ms: u64,

    /// Virtual HID device vendor id (hex, e.g. AAAA)
    #[arg(long = "vendor-id", default_value = "AAAA", value_parser = parse_hex_u16)]
    pub vendor_id: u16,

    /// Virtual HID device product id (hex, e.g. AAAA)
    #[arg(long = "product-id", default_value = "AAAA", value_parser = parse_hex_u16)]
    pub product_id: u16,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| format!("invalid hex value '{s}': {e}"))
}
