use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;

use voxpen::transport::UsbTransport;
use voxpen::{DeviceSession, RecordingQuality, SessionEvent};

#[derive(clap::Parser)]
#[clap(
    name = "VoxPen CLI",
    about = "Command-line companion for VoxPen USB voice recorders"
)]
enum Cli {
    /// Show device identity, storage and settings
    Info {},
    /// List recordings on the device
    Files {},
    /// Download a recording
    Download {
        /// Recording name as shown by `files`
        name: String,
        /// Output path, defaults to the recording name
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a recording
    Delete { name: String },
    /// Show storage usage
    Storage {},
    /// Show device settings, or change the ones passed as flags
    Settings {
        /// Start recording automatically on power-on (true/false)
        #[clap(long)]
        auto_record: Option<bool>,
        /// Play back a recording as soon as it is selected (true/false)
        #[clap(long)]
        auto_play: Option<bool>,
        /// Audible tone on Bluetooth connect/disconnect (true/false)
        #[clap(long)]
        bluetooth_tone: Option<bool>,
        /// Notification sounds (true/false)
        #[clap(long)]
        notification_sound: Option<bool>,
        /// Recording quality: low, standard or high
        #[clap(long)]
        quality: Option<String>,
    },
    /// Show the device clock, or sync it to the host
    Time {
        #[clap(long)]
        sync: bool,
    },
    /// Erase the storage card
    Format {
        /// Required confirmation
        #[clap(long)]
        yes: bool,
    },
    /// Restore factory defaults
    FactoryReset {
        #[clap(long)]
        yes: bool,
    },
    /// Scan for Bluetooth audio devices (BT models only)
    BtScan {},
    /// Show the Bluetooth link state (BT models only)
    BtStatus {},
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let matches = Cli::parse();
    let session = DeviceSession::new();
    let info = session.connect(UsbTransport::open_any()?).await?;

    let result = run(&session, matches, &info).await;
    session.disconnect().await;
    result
}

async fn run(
    session: &DeviceSession<UsbTransport>,
    matches: Cli,
    info: &voxpen::DeviceInfo,
) -> Result<()> {
    match matches {
        Cli::Info {} => {
            let model = session
                .model()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "unknown".into());
            let storage = session.storage_info().await?;
            let settings = session.settings().await?;
            log::info!("Model: {model}");
            log::info!("Device: {info}");
            log::info!(
                "Storage: {} MiB free of {} MiB (health 0x{:02x})",
                storage.free_bytes / (1024 * 1024),
                storage.total_bytes / (1024 * 1024),
                storage.health
            );
            log::info!("Settings: {settings:?}");
        }
        Cli::Files {} => {
            let files = session.list_files().await?;
            log::info!("{} recording(s)", files.len());
            for f in files {
                log::info!(
                    "  {}  {} bytes  {} s  created {}",
                    f.name,
                    f.size,
                    f.duration_secs,
                    f.created_unix
                );
            }
        }
        Cli::Download { name, output } => {
            let files = session.list_files().await?;
            let entry = files
                .iter()
                .find(|f| f.name == name)
                .ok_or_else(|| anyhow::anyhow!("no recording named {name:?} on device"))?;

            let bar = indicatif::ProgressBar::new(entry.size as u64);
            let mut events = session.events();
            let progress = tokio::spawn({
                let bar = bar.clone();
                async move {
                    while let Ok(event) = events.recv().await {
                        if let SessionEvent::DownloadProgress { received, .. } = event {
                            bar.set_position(received as u64);
                        }
                    }
                }
            });
            let data = session.download_file(&name, entry.size).await?;
            bar.finish();
            progress.abort();

            let path = output.unwrap_or_else(|| PathBuf::from(&name));
            std::fs::write(&path, &data)?;
            log::info!("saved {} bytes to {}", data.len(), path.display());
        }
        Cli::Delete { name } => {
            session.delete_file(&name).await?;
            log::info!("deleted {name}");
        }
        Cli::Storage {} => {
            let storage = session.storage_info().await?;
            log::info!(
                "Storage: {} MiB free of {} MiB (health 0x{:02x})",
                storage.free_bytes / (1024 * 1024),
                storage.total_bytes / (1024 * 1024),
                storage.health
            );
        }
        Cli::Settings {
            auto_record,
            auto_play,
            bluetooth_tone,
            notification_sound,
            quality,
        } => {
            let mut settings = session.settings().await?;
            let mut changed = false;
            for (slot, flag) in [
                (&mut settings.auto_record, auto_record),
                (&mut settings.auto_play, auto_play),
                (&mut settings.bluetooth_tone, bluetooth_tone),
                (&mut settings.notification_sound, notification_sound),
            ] {
                if let Some(value) = flag {
                    *slot = value;
                    changed = true;
                }
            }
            if let Some(quality) = quality {
                settings.quality = match quality.as_str() {
                    "low" => RecordingQuality::Low,
                    "standard" => RecordingQuality::Standard,
                    "high" => RecordingQuality::High,
                    other => anyhow::bail!(
                        "unknown quality {other:?}, expected low, standard or high"
                    ),
                };
                changed = true;
            }
            if changed {
                session.apply_settings(settings).await?;
                log::info!("settings updated: {settings:?}");
            } else {
                log::info!("Settings: {settings:?}");
            }
        }
        Cli::Time { sync } => {
            if sync {
                let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
                session.set_device_time(now).await?;
                log::info!("device clock set to {now}");
            } else {
                log::info!("device clock: {}", session.device_time().await?);
            }
        }
        Cli::Format { yes } => {
            anyhow::ensure!(yes, "formatting erases every recording; pass --yes to confirm");
            session.format_storage().await?;
            log::info!("storage formatted");
        }
        Cli::FactoryReset { yes } => {
            anyhow::ensure!(yes, "factory reset wipes all settings; pass --yes to confirm");
            session.factory_reset().await?;
            log::info!("factory reset done");
        }
        Cli::BtScan {} => {
            for device in session.bt_scan().await? {
                log::info!("  {}  {}", device.addr_string(), device.name);
            }
        }
        Cli::BtStatus {} => {
            log::info!("bluetooth: {:?}", session.bt_status().await?);
        }
    }
    Ok(())
}
