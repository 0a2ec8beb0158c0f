use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use log::{error, info, warn};
use uuid::Uuid;

use ble_session::core::bluetooth::bluest_transport::{BluestTransport, default_adapter};
use ble_session::{BluetoothSession, DeviceId, ScanState, SessionConfig, logging};

#[derive(Debug, Parser)]
#[command(about = "Scan for a BLE peripheral, connect to it and print its notifications")]
struct Args {
    #[arg(short, long, default_value = "session.json", help = "Path of the JSON session config")]
    config: PathBuf,
    #[arg(short, long, help = "Overrides the service UUID of the config")]
    service: Option<Uuid>,
    #[arg(short, long, help = "Connects to this device instead of the first one found")]
    device: Option<String>,
    #[arg(long, help = "Subscribes to this characteristic once connected")]
    notify: Option<Uuid>,
    #[arg(long, help = "Writes the effective config back to --config")]
    save: bool,
    #[arg(long, help = "Enables debug logging")]
    debug: bool,
}

/// Waits until the scan yields a device to connect to.
async fn find_device(session: &BluetoothSession, wanted: Option<&DeviceId>) -> Result<DeviceId> {
    let mut states = session.scan_states();
    session.start_scan()?;

    while let Some(state) = states.recv().await {
        match state {
            ScanState::Scanning(devices) => {
                let found = devices
                    .iter()
                    .find(|device| wanted.is_none_or(|id| &device.id == id));
                if let Some(device) = found {
                    info!("Selected {} ({})", device.display_name(), device.id);
                    session.stop_scan()?;
                    return Ok(device.id.clone());
                }
            }
            ScanState::Stopped => bail!("Scan finished without finding a device"),
            ScanState::Error(e) => bail!("Scan failed: {}", e),
            ScanState::Idle => {}
        }
    }
    bail!("Session closed while scanning")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = SessionConfig::load_config(&args.config).await?;
    if let Some(service) = args.service {
        config.service_uuid = service;
    }
    if let Some(characteristic) = args.notify {
        config = config.with_auto_notify(characteristic);
    }
    config.debug_logging |= args.debug;
    logging::init_logger(config.debug_logging);
    config.validate()?;
    if args.save {
        config.save_config(&args.config).await?;
    }

    let adapter = default_adapter().await?;
    let session = BluetoothSession::spawn(&config, |sink| BluestTransport::new(adapter, sink))?;

    let wanted = args.device.map(DeviceId::from);
    let device = find_device(&session, wanted.as_ref()).await?;
    session.connect(device.clone()).await?;
    info!("Connected to {}, press Ctrl-C to quit", device);

    let mut notifications = session.notifications();
    let mut states = session.connection_states();
    loop {
        tokio::select! {
            Some(notification) = notifications.recv() => {
                println!("{} {:02x?}", notification.characteristic, notification.value);
            }
            Some(state) = states.recv() => {
                info!("Connection is {}", state);
                if state == ble_session::ConnectionState::Disconnected {
                    warn!("Peripheral is gone");
                    break;
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    session.close().await?;
    Ok(())
}
