//! `ctapble-bridge`: user-space bridge presenting paired BLE FIDO2
//! authenticators as USB HID FIDO2 authenticators.
//!
//! Wires the CLI (§6), `tracing` logging, and the supervisor's discover →
//! pair → hot-plug → shutdown lifecycle (§4.5) together. All protocol logic
//! lives in `ctapble-transport`; `hid_endpoint`/`supervisor`/`channel` here
//! are the virtual-HID and orchestration surface that consumes it.

mod channel;
mod cli;
mod hid_endpoint;
mod supervisor;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use ctapble_transport::discovery::BlueZDiscovery;
use ctapble_transport::types::SessionTimings;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use supervisor::Supervisor;

/// Invalid argument, matching `spec.md` §6's CLI exit codes.
const EXIT_INVALID_ARGUMENT: u8 = 1;
/// Fatal transport init failure (no Bluetooth adapter, no `/dev/uhid`, ...).
const EXIT_TRANSPORT_INIT_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap's own exit code (2) doesn't match `spec.md` §6's
            // invalid-argument code (1); print clap's formatted message
            // ourselves and exit with the spec's code instead of letting
            // `Parser::parse` call `process::exit` for us.
            let _ = e.print();
            return ExitCode::from(EXIT_INVALID_ARGUMENT);
        }
    };

    init_logging(&cli);

    let timings = SessionTimings {
        idle_timeout: Duration::from_millis(cli.idle_timeout_ms),
        connect_timeout: Duration::from_millis(cli.connect_timeout_ms),
        ..SessionTimings::default()
    };

    let discovery = match BlueZDiscovery::new().await {
        Ok(discovery) => std::sync::Arc::new(discovery),
        Err(e) => {
            error!(error = %e, "could not initialize BlueZ discovery");
            return ExitCode::from(EXIT_TRANSPORT_INIT_FAILURE);
        }
    };
    discovery.spawn_hotplug_watcher();

    let supervisor = Supervisor::new(discovery, timings, cli.vendor_id, cli.product_id);

    if let Err(e) = supervisor.run(shutdown_signal()).await {
        error!(error = %e, "supervisor exited with an error");
        return ExitCode::from(EXIT_TRANSPORT_INIT_FAILURE);
    }

    info!("bridge shut down cleanly");
    ExitCode::SUCCESS
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},uhid_virt={}",
            cli.log_level.as_str(),
            cli.uhid_log_level.as_str()
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves once SIGINT or SIGTERM is received, driving the supervisor's
/// clean shutdown path (`spec.md` §4.5).
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn default_timings_match_spec_defaults() {
        let cli = Cli::parse_from(["ctapble-bridge"]);
        assert_eq!(cli.idle_timeout_ms, 3000);
        assert_eq!(cli.connect_timeout_ms, 5000);
        assert_eq!(cli.vendor_id, 0xAAAA);
        assert_eq!(cli.product_id, 0xAAAA);
    }

    #[test]
    fn invalid_argument_exit_code_is_one() {
        assert_eq!(EXIT_INVALID_ARGUMENT, 1);
    }
}
