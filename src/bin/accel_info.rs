//! Accelerator info - lists devices, codec capabilities and probe results
//!
//! Usage: accel-info [OPTIONS]
//!
//! Options:
//!   --config <file>      Load config JSON instead of the standard locations
//!   --emulated <n>       Use <n> emulated devices instead of the hardware driver
//!   --no-probe           Skip the encode probe
//!   --json               Print the probe report as JSON
//!
//! Examples:
//!   accel-info                       # hardware driver, falls back to one emulated device
//!   accel-info --emulated 2 --json

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use accelcodec::driver::emulated::{EmulatedDevice, EmulatedDriver};
use accelcodec::driver::{self, Driver};
use accelcodec::{AccelConfig, Codec, DeviceRegistry};
use anyhow::{Context, Result};
use serde_json::json;

struct Args {
    config: Option<PathBuf>,
    emulated: Option<u32>,
    probe: bool,
    json: bool,
}

fn parse_args() -> Option<Args> {
    let args: Vec<String> = env::args().collect();
    let mut config = None;
    let mut emulated = None;
    let mut probe = true;
    let mut json = false;
    let mut i = 1;

    while i < args.len() {
        let arg = &args[i];

        if arg == "--config" {
            if i + 1 < args.len() {
                config = Some(PathBuf::from(&args[i + 1]));
                i += 2;
                continue;
            } else {
                eprintln!("Error: --config requires a file argument");
                return None;
            }
        }

        if arg == "--emulated" {
            match args.get(i + 1).and_then(|n| n.parse::<u32>().ok()) {
                Some(n) => {
                    emulated = Some(n);
                    i += 2;
                    continue;
                }
                None => {
                    eprintln!("Error: --emulated requires a device count");
                    return None;
                }
            }
        }

        if arg == "--no-probe" {
            probe = false;
            i += 1;
            continue;
        }

        if arg == "--json" {
            json = true;
            i += 1;
            continue;
        }

        if arg == "--help" || arg == "-h" {
            return None;
        }

        eprintln!("Error: unknown argument {}", arg);
        return None;
    }

    Some(Args {
        config,
        emulated,
        probe,
        json,
    })
}

fn print_usage() {
    println!("Usage: accel-info [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <file>      Load config JSON instead of the standard locations");
    println!("  --emulated <n>       Use <n> emulated devices instead of the hardware driver");
    println!("  --no-probe           Skip the encode probe");
    println!("  --json               Print the probe report as JSON");
}

fn emulated(count: u32) -> Arc<dyn Driver> {
    let devices = (0..count.max(1))
        .map(|i| EmulatedDevice::new(format!("Emulated GPU {}", i)).pci_bus_id(format!("0000:{:02x}:00.0", i + 1)))
        .collect();
    Arc::new(EmulatedDriver::new(devices))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("accelcodec=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let Some(args) = parse_args() else {
        print_usage();
        return Ok(());
    };

    let config = match &args.config {
        Some(path) => AccelConfig::read_file(path)?
            .with_context(|| format!("config file {} not found", path.display()))?,
        None => AccelConfig::load()?,
    };

    let driver = match args.emulated {
        Some(count) => emulated(count),
        None => driver::hardware_driver().unwrap_or_else(|| {
            tracing::warn!("no hardware driver, using one emulated device");
            emulated(1)
        }),
    };

    let (major, minor) = driver.api_version().map_err(|s| anyhow::anyhow!("api version: {}", s))?;
    let (req_major, req_minor) = driver.required_api_version();
    println!("Driver: {} (API {}.{}, requires {}.{})", driver.name(), major, minor, req_major, req_minor);

    let registry = Arc::new(DeviceRegistry::new(driver, config));
    let devices = registry.enumerate().context("enumerating devices")?;
    println!("Devices: {}", devices.len());
    for device in devices {
        let props = &device.properties;
        let memory = registry.driver().memory_info(props.ordinal).ok();
        println!(
            "  [{}] {} - compute {}.{}, {} MB{}",
            props.ordinal,
            props,
            props.compute_capability.0,
            props.compute_capability.1,
            props.total_memory >> 20,
            memory.map(|m| format!(" ({}% free)", m.free_percent())).unwrap_or_default()
        );
        for codec in Codec::ALL {
            match registry.codec_caps(props.ordinal, codec)? {
                Some(caps) => println!(
                    "      {:<5} {}x{}..{}x{} layouts {:?} lossless {} presets {}",
                    codec.name(),
                    caps.min_width,
                    caps.min_height,
                    caps.max_width,
                    caps.max_height,
                    caps.layouts,
                    caps.lossless,
                    caps.presets.iter().map(|p| p.name()).collect::<Vec<_>>().join(",")
                ),
                None => println!("      {:<5} not supported", codec.name()),
            }
        }
    }

    if !args.probe {
        return Ok(());
    }
    let report = accelcodec::init_module(&registry).context("module probe")?;
    if args.json {
        let out = json!({
            "api_version": [report.api_version.0, report.api_version.1],
            "devices": report.devices,
            "codec": report.codec.map(|c| c.name()),
            "yuv444": report.flags.yuv444,
            "lossless": report.flags.lossless,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "Probe: codec {}, YUV444 {}, lossless {}",
            report.codec.map(|c| c.name()).unwrap_or("none"),
            report.flags.yuv444,
            report.flags.lossless
        );
    }
    Ok(())
}
