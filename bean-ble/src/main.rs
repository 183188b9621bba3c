//! Command line tool for LightBlue Bean devices
//!
//! Scans for Beans, talks to the sketch over serial, and programs sketches
//! and radio firmware.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bean_ble_controller::ble::{self, BtleplugDiscovery, BtleplugTransport};
use bean_ble_controller::{BeanConfig, BeanEvent, Connection, Session, UploadEvent, UploadOutcome};
use bean_proto::firmware::{FirmwareBundle, FirmwareImage, version_from_name};
use bean_proto::{LedColor, parse_intel_hex};
use btleplug::platform::Adapter;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "bean-ble")]
#[command(about = "Talk to and program LightBlue Bean devices")]
struct Cli {
    /// JSON configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for Beans
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Show versions, sketch and sensor readings
    Info {
        /// Device name or address to connect to
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Send text to the sketch and print what it writes back
    Serial {
        #[arg(short, long)]
        device: Option<String>,
        /// Text to send
        #[arg(short, long)]
        send: Option<String>,
        /// Seconds to listen for serial output
        #[arg(short, long, default_value = "5")]
        listen: u64,
    },
    /// Read the LED, or set it to R,G,B
    Led {
        #[arg(short, long)]
        device: Option<String>,
        /// Color as R,G,B (0-255 each)
        #[arg(long)]
        rgb: Option<String>,
    },
    /// Program a sketch from an Intel hex or raw binary file
    ProgramSketch {
        #[arg(short, long)]
        device: Option<String>,
        /// Sketch name stored on the device (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
        file: PathBuf,
    },
    /// Update the radio firmware with an A/B image bundle
    ProgramFirmware {
        #[arg(short, long)]
        device: Option<String>,
        /// Approve the update without asking
        #[arg(short, long)]
        yes: bool,
        /// Image files, e.g. 201507230001_A.bin 201507230001_B.bin
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
}

const SCAN_TIME: Duration = Duration::from_secs(5);
const REDISCOVERY_TIME: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let adapter = ble::get_adapter().await?;

    match cli.command {
        Commands::Scan { duration } => {
            scan_devices(&adapter, duration).await?;
        }
        Commands::Info { device } => {
            let bean = open(&adapter, device.as_deref(), &config).await?;
            show_info(&bean).await?;
            bean.disconnect().await?;
        }
        Commands::Serial {
            device,
            send,
            listen,
        } => {
            let bean = open(&adapter, device.as_deref(), &config).await?;
            serial(&bean, send.as_deref(), listen).await?;
            bean.disconnect().await?;
        }
        Commands::Led { device, rgb } => {
            let bean = open(&adapter, device.as_deref(), &config).await?;
            match rgb {
                Some(rgb) => bean.set_led(parse_rgb(&rgb)?).await?,
                None => {
                    let color = bean.read_led().await?;
                    println!("LED: {},{},{}", color.red, color.green, color.blue);
                }
            }
            bean.disconnect().await?;
        }
        Commands::ProgramSketch { device, name, file } => {
            let image = read_sketch(&file)?;
            let name = name.unwrap_or_else(|| {
                file.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            let bean = open(&adapter, device.as_deref(), &config).await?;
            program_sketch(&bean, &name, image).await?;
            bean.disconnect().await?;
        }
        Commands::ProgramFirmware {
            device,
            yes,
            images,
        } => {
            let bundle = read_bundle(&images)?;
            let bean = open(&adapter, device.as_deref(), &config).await?;
            program_firmware(&bean, bundle, yes).await?;
            bean.disconnect().await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<BeanConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        }
        None => Ok(BeanConfig::default()),
    }
}

async fn scan_devices(adapter: &Adapter, duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    println!("Scanning for Beans ({} seconds)...", duration);
    let devices = ble::scan(adapter, Duration::from_secs(duration)).await?;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "N/A".to_string());
        let marker = if device.is_bean { " [BEAN]" } else { "" };
        println!("  {} ({}) RSSI: {}{}", device.name, device.address, rssi, marker);
    }
    Ok(())
}

async fn open(
    adapter: &Adapter,
    target: Option<&str>,
    config: &BeanConfig,
) -> Result<Connection, Box<dyn std::error::Error>> {
    println!("Scanning for Beans...");
    let peripheral = ble::find_device(adapter, target, SCAN_TIME).await?;

    let transport = BtleplugTransport::new(adapter.clone(), peripheral);
    let discovery = BtleplugDiscovery::new(adapter.clone(), transport.address(), REDISCOVERY_TIME);
    let bean = Session::spawn_with_discovery(transport, discovery, config.clone());

    println!("Connecting...");
    bean.connect().await?;
    println!("Connected!");
    Ok(bean)
}

async fn show_info(bean: &Connection) -> Result<(), Box<dyn std::error::Error>> {
    println!("Firmware: {}", bean.read_firmware_version().await?);
    println!("Hardware: {}", bean.read_hardware_version().await?);
    println!("Software: {}", bean.read_software_version().await?);

    let sketch = bean.read_sketch_metadata().await?;
    println!(
        "Sketch:   {} ({} bytes, crc32 {:08x}, uploaded {})",
        sketch.name, sketch.size, sketch.crc32, sketch.timestamp
    );
    println!("Battery:  {}%", bean.read_battery_level().await?);
    println!("Temp:     {} C", bean.read_temperature().await?);

    let accel = bean.read_acceleration().await?;
    println!("Accel:    x {:.2} y {:.2} z {:.2} g", accel.x, accel.y, accel.z);
    Ok(())
}

async fn serial(
    bean: &Connection,
    send: Option<&str>,
    listen: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = bean.events();
    if let Some(text) = send {
        bean.send_serial(text.as_bytes()).await?;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(listen));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(BeanEvent::SerialData(data)) => {
                    print!("{}", String::from_utf8_lossy(&data));
                    std::io::stdout().flush()?;
                }
                Ok(BeanEvent::Disconnected) => {
                    println!("\nDevice disconnected");
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => log::warn!("missed {} events", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }
    println!();
    Ok(())
}

fn parse_rgb(rgb: &str) -> Result<LedColor, Box<dyn std::error::Error>> {
    let parts = rgb
        .split(',')
        .map(|part| part.trim().parse::<u8>())
        .collect::<Result<Vec<u8>, _>>()?;
    match parts.as_slice() {
        [red, green, blue] => Ok(LedColor::new(*red, *green, *blue)),
        _ => Err("expected R,G,B".into()),
    }
}

fn read_sketch(file: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let is_hex = file
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("hex"));
    if is_hex {
        Ok(parse_intel_hex(&std::fs::read_to_string(file)?)?)
    } else {
        Ok(std::fs::read(file)?)
    }
}

fn read_bundle(paths: &[PathBuf]) -> Result<FirmwareBundle, Box<dyn std::error::Error>> {
    let mut images = Vec::new();
    for path in paths {
        let data = std::fs::read(path)?;
        images.push(FirmwareImage::parse(path.display().to_string(), data)?);
    }

    let version = paths
        .first()
        .and_then(|path| path.file_name())
        .and_then(|name| version_from_name(&name.to_string_lossy()));
    let bundle = match version {
        Some(version) => FirmwareBundle::with_version(images, version)?,
        None => FirmwareBundle::new(images)?,
    };
    Ok(bundle)
}

async fn program_sketch(
    bean: &Connection,
    name: &str,
    image: Vec<u8>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Programming sketch {:?} ({} bytes)...", name, image.len());
    let mut upload = bean.program_sketch(name, image).await?;

    while let Some(event) = upload.next_event().await {
        match event {
            UploadEvent::Progress(progress) => {
                print!(
                    "\r  {}/{} blocks ({:.0}%)",
                    progress.blocks_sent,
                    progress.total_blocks,
                    progress.percent()
                );
                std::io::stdout().flush()?;
            }
            UploadEvent::Finished(result) => {
                result?;
                println!("\nSketch programmed!");
            }
            UploadEvent::ApprovalRequired { .. } => {}
        }
    }
    Ok(())
}

async fn program_firmware(
    bean: &Connection,
    bundle: FirmwareBundle,
    yes: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "Checking firmware against bundle version {}...",
        bundle.version()
    );
    let mut upload = bean.program_firmware(bundle).await?;

    while let Some(event) = upload.next_event().await {
        match event {
            UploadEvent::ApprovalRequired {
                device_version,
                bundle_version,
            } => {
                println!("Device runs {:?}, bundle is {}", device_version, bundle_version);
                if yes || confirm("Flash the new firmware? [y/N] ")? {
                    upload.approve().await?;
                } else {
                    upload.reject().await?;
                }
            }
            UploadEvent::Progress(progress) => {
                print!(
                    "\r  {}/{} blocks ({:.0}%)",
                    progress.blocks_sent,
                    progress.total_blocks,
                    progress.percent()
                );
                std::io::stdout().flush()?;
            }
            UploadEvent::Finished(Ok(UploadOutcome::Updated)) => {
                println!("\nFirmware updated!");
            }
            UploadEvent::Finished(Ok(UploadOutcome::AlreadyUpToDate)) => {
                println!("Firmware is already up to date.");
            }
            UploadEvent::Finished(Err(e)) => return Err(e.into()),
        }
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool, Box<dyn std::error::Error>> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
