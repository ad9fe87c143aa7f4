use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn, LevelFilter};

use sony_ptp_bridge::bridge::{Bridge, ClaimRegistry};
use sony_ptp_bridge::finder::{self, DeviceRecord};
use sony_ptp_bridge::transport::Transport;
use sony_ptp_bridge::ws::{Dispatcher, DispatcherFactory, WsServer};

/// WebSocket bridge exposing a USB-attached Sony PTP camera as a network service.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// TCP port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// USB bus number to bind to. 0 selects the first matching device on any bus.
    #[arg(long, default_value_t = 0)]
    bus: u8,

    /// USB device address to bind to. 0 selects the first matching device on the chosen bus.
    #[arg(long, default_value_t = 0)]
    device: u8,

    /// Increase log verbosity. Repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity. Repeatable (-q, -qq).
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,
}

fn level_filter(verbose: u8, quiet: u8) -> LevelFilter {
    let base = LevelFilter::Info as i8;
    let shifted = base + verbose as i8 - quiet as i8;
    match shifted.clamp(LevelFilter::Off as i8, LevelFilter::Trace as i8) {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Picks the device to serve: the first Sony PTP device matching `bus`/`device` (0 meaning "any
/// value of this field matches").
fn select_device(bus: u8, device: u8) -> Option<DeviceRecord> {
    finder::list_all_sony()
        .into_iter()
        .find(|d| (bus == 0 || d.bus == bus) && (device == 0 || d.address == device))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(level_filter(cli.verbose, cli.quiet))
        .init();

    let device = match select_device(cli.bus, cli.device) {
        Some(d) => d,
        None => {
            error!("no matching Sony PTP device found (bus={}, device={})", cli.bus, cli.device);
            return ExitCode::FAILURE;
        }
    };

    info!(
        "serving {} (bus={}, address={}) on port {}",
        device.product_name, device.bus, device.address, cli.port
    );

    let claims = ClaimRegistry::new();

    let factory_device = device.clone();
    let factory_claims = claims.clone();
    let factory: Arc<DispatcherFactory> = Arc::new(move || -> Box<Dispatcher> {
        let device = factory_device.clone();
        let claims = factory_claims.clone();
        let mut bridge: Bridge<rusb::Context> = Bridge::new(device.clone(), claims);

        Box::new(move |message: &str| {
            let bus = device.bus;
            let address = device.address;
            bridge.dispatch(message, move || {
                let handle = finder::open(bus, address)?;
                Ok(Transport::open(Arc::new(handle))?)
            })
        })
    });

    let server = WsServer::new(factory);

    let stop_handle = Arc::new(server);
    let ctrlc_handle = stop_handle.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("received interrupt, shutting down");
        ctrlc_handle.stop();
    }) {
        error!("failed to register signal handler: {}", e);
        return ExitCode::FAILURE;
    }

    match stop_handle.run(cli.port) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
