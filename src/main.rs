use anyhow::{Context, Result};
use ble_sensor_viewer::domain::models::{AppEvent, DeviceAddress, RawMeasurement};
use ble_sensor_viewer::domain::settings::{Settings, SettingsService};
use ble_sensor_viewer::infrastructure::bluetooth::protocol::{parse_uuid, ProtocolRegistry};
use ble_sensor_viewer::infrastructure::bluetooth::service::{BluetoothService, ServiceConfig};
use ble_sensor_viewer::infrastructure::bluetooth::native_backend;
use ble_sensor_viewer::infrastructure::logging::init_logger;
use ble_sensor_viewer::presentation::console::{
    format_device, format_event, format_measurement, DeviceTable,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "ble-sensor-viewer",
    version,
    about = "Connect to a BLE sensor and print its decoded measurements"
)]
struct Cli {
    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List advertising devices
    Scan {
        /// Scan duration, defaults to the configured value
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Connect, subscribe and print measurements until Ctrl-C
    Connect {
        /// AA:BB:CC:DD:EE:FF, AA-BB-CC-DD-EE-FF or 0xAABBCCDDEEFF
        address: DeviceAddress,
    },
    /// Decode a hex payload without a device
    Decode {
        /// Service UUID, defaults to the configured Motion service
        #[arg(long)]
        service: Option<String>,
        /// Characteristic UUID, defaults to the configured Motion characteristic
        #[arg(long)]
        characteristic: Option<String>,
        /// Payload bytes as hex
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings_service = SettingsService::new().context("Failed to load settings")?;
    // First run leaves an editable settings file behind
    let wrote_defaults = !settings_service.path().exists();
    if wrote_defaults {
        settings_service
            .save()
            .context("Failed to write default settings")?;
    }
    if let Some(level) = cli.log_level {
        settings_service.get_mut().log_settings.level = level;
    }
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)?;
    info!(
        "Starting BLE Sensor Viewer (settings: {})",
        settings_service.path().display()
    );
    if wrote_defaults {
        info!("Wrote default settings");
    }

    let registry = ProtocolRegistry::from_settings(&settings)?;

    match cli.command {
        Command::Scan { seconds } => {
            let duration = seconds
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings.scan_duration());
            scan(&settings, registry, duration).await
        }
        Command::Connect { address } => connect(&settings, registry, address).await,
        Command::Decode {
            service,
            characteristic,
            payload,
        } => decode(
            &settings,
            &registry,
            service.as_deref(),
            characteristic.as_deref(),
            &payload,
        ),
    }
}

fn build_service(
    settings: &Settings,
    registry: ProtocolRegistry,
) -> Result<(BluetoothService, mpsc::UnboundedReceiver<AppEvent>)> {
    let backend = native_backend().context("Failed to initialise Bluetooth")?;
    let (tx, rx) = mpsc::unbounded_channel();
    let service = BluetoothService::new(
        backend.platform,
        backend.watcher,
        registry,
        tx,
        ServiceConfig::from_settings(settings),
    );
    Ok((service, rx))
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::MeasurementReceived(measurement) => {
            println!("{}", format_measurement(measurement))
        }
        other => {
            if let Some(line) = format_event(other) {
                eprintln!("{}", line);
            }
        }
    }
}

async fn scan(settings: &Settings, registry: ProtocolRegistry, duration: Duration) -> Result<()> {
    let (mut service, mut events) = build_service(settings, registry)?;
    service.start_scan()?;

    let mut table = DeviceTable::new();
    let deadline = tokio::time::sleep(duration);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(deadline, ctrl_c);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Some(AppEvent::DeviceDiscovered(device)) => {
                    if table.observe(device.clone()) {
                        eprintln!("{}", format_device(&device));
                    }
                }
                Some(other) => print_event(&other),
                None => break,
            },
        }
    }

    service.stop_scan()?;
    if table.is_empty() {
        eprintln!("No devices found");
        return Ok(());
    }
    eprintln!("{} device(s) found, strongest signal first:", table.len());
    for device in table.by_signal() {
        println!("{}", format_device(device));
    }
    Ok(())
}

async fn connect(settings: &Settings, registry: ProtocolRegistry, address: DeviceAddress) -> Result<()> {
    let (mut service, mut events) = build_service(settings, registry)?;

    // Ctrl-C during connect/subscribe cancels the operation so it can clean up
    let cancel = service.cancellation_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let response = service
        .connect(address)
        .await
        .with_context(|| format!("Could not connect to {}", address))?;
    for message in &response.messages {
        eprintln!("  {}", message);
    }

    if let Err(e) = service.subscribe().await {
        interrupt.abort();
        if let Err(disconnect_error) = service.disconnect().await {
            warn!("Disconnect after failed subscribe: {}", disconnect_error);
        }
        return Err(e).context("Could not subscribe to notifications");
    }
    interrupt.abort();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
        }
    }

    info!("Shutting down");
    if let Err(e) = service.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    Ok(())
}

fn decode(
    settings: &Settings,
    registry: &ProtocolRegistry,
    service: Option<&str>,
    characteristic: Option<&str>,
    payload: &str,
) -> Result<()> {
    let service_id = parse_uuid(service.unwrap_or(&settings.motion_service_uuid))?;
    let characteristic_id =
        parse_uuid(characteristic.unwrap_or(&settings.motion_characteristic_uuid))?;
    let bytes = hex::decode(payload.trim().replace([' ', ':', '-'], ""))
        .context("Payload is not valid hex")?;

    let decoded = registry.decode(&RawMeasurement::new(
        Utc::now(),
        service_id,
        characteristic_id,
        bytes,
    ));
    println!("{}", format_measurement(&decoded));
    Ok(())
}
