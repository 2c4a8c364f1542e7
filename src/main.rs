use anyhow::Context;
use clap::{Parser, Subcommand};
use monocle::domain::scripts;
use monocle::infrastructure::logging::init_logger;
use monocle::{
    ConnectionConfig, DeviceAddress, Driver, DriverOptions, LivenessPolicy, PlatformTransport,
    ScanFilter, Session, Settings, SettingsService, Transport,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "monocle")]
#[command(about = "Drive a Monocle display over Bluetooth LE")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seconds to scan before giving up, 0 to scan forever
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Only connect to the device with this address
    #[arg(long, global = true, value_name = "ADDR")]
    address: Option<DeviceAddress>,

    /// Timezone offset set on the device, e.g. -8:00
    #[arg(long, global = true, value_name = "OFFSET", allow_hyphen_values = true)]
    timezone: Option<String>,

    /// Require the configured device name, not just the UART service
    #[arg(long, global = true)]
    named: bool,

    /// Log filter, overrides RUST_LOG and the settings file
    #[arg(long, global = true, value_name = "FILTER")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set the device clock and show it on the display
    Clock {
        /// Display brightness
        #[arg(long)]
        brightness: Option<u8>,
    },
    /// Print the time and battery level from the device, polling to keep the link up
    Battery {
        /// What to do when a poll fails
        #[arg(long, value_enum)]
        liveness: Option<LivenessPolicy>,
    },
    /// Send a command and print what the device answers
    Send {
        /// Text to send; a trailing newline is added
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        command: Option<String>,

        /// Send the contents of this file instead
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,

        /// Seconds to keep printing output after sending
        #[arg(long, default_value_t = 5)]
        listen: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("monocle: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match init_logger(&settings.log_settings, cli.log_level.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("monocle: failed to initialize logging: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Settings file plus command line overrides
fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let service = match &cli.config {
        Some(path) => SettingsService::from_path(path),
        None => SettingsService::new()?,
    };
    let mut settings = service.get().clone();

    if let Some(timeout) = cli.timeout {
        settings.ble.scan_timeout_secs = timeout;
    }
    if let Some(timezone) = &cli.timezone {
        settings.driver.timezone = timezone.clone();
    }
    match &cli.command {
        Command::Clock {
            brightness: Some(brightness),
        } => settings.driver.brightness = *brightness,
        Command::Battery {
            liveness: Some(policy),
        } => settings.driver.liveness_policy = *policy,
        _ => {}
    }
    Ok(settings)
}

fn scan_filter(cli: &Cli, settings: &Settings) -> ScanFilter {
    let service_uuid = settings.ble.service_uuid;
    if let Some(address) = &cli.address {
        return ScanFilter::address(service_uuid, address.clone());
    }
    match cli.command {
        // the clock only needs a UART peer, whatever it is called
        Command::Clock { .. } if !cli.named => ScanFilter::any_service(service_uuid),
        _ => ScanFilter::named(service_uuid, settings.ble.device_name.clone()),
    }
}

async fn run(cli: Cli, settings: Settings) -> anyhow::Result<()> {
    let options = DriverOptions {
        filter: scan_filter(&cli, &settings),
        scan_timeout: Duration::from_secs(settings.ble.scan_timeout_secs),
        liveness_interval: Duration::from_secs(settings.driver.liveness_interval_secs),
        liveness_policy: settings.driver.liveness_policy,
    };

    let transport = Arc::new(PlatformTransport::new());
    let session = Session::new(transport, ConnectionConfig::from(&settings.ble)).await?;

    let (output, mut lines) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            println!("{}", line);
        }
    });

    let driver = Driver::new(session, options, output);
    let result = execute(&driver, cli.command, &settings).await;
    driver.shutdown().await;

    // backend notification tasks may still hold a sender, so the channel is
    // not guaranteed to close
    drop(driver);
    let _ = tokio::time::timeout(Duration::from_millis(250), printer).await;

    result
}

async fn execute<T: Transport>(
    driver: &Driver<T>,
    command: Command,
    settings: &Settings,
) -> anyhow::Result<()> {
    driver.start().await?;
    info!("Connected");

    match command {
        Command::Clock { .. } => {
            let script = scripts::clock_script(
                scripts::unix_now(),
                &settings.driver.timezone,
                settings.driver.brightness,
            );
            driver.upload(&script).await?;
            tokio::time::sleep(Duration::from_secs(settings.driver.settle_secs)).await;
        }
        Command::Battery { .. } => {
            let script = scripts::battery_script(scripts::unix_now(), &settings.driver.timezone);
            driver.upload(&script).await?;

            tokio::select! {
                result = driver.poll_liveness() => result?,
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        Command::Send {
            command,
            file,
            listen,
        } => {
            let mut text = match (command, file) {
                (_, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (Some(command), None) => command,
                (None, None) => String::new(),
            };
            if !text.ends_with('\n') {
                text.push('\n');
            }
            driver.send(&text).await?;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(listen)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
    }

    Ok(())
}
