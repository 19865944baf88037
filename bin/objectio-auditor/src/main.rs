//! ObjectIO auditor - object integrity daemon
//!
//! Periodically reads back every object on the node's devices and
//! quarantines the ones whose content no longer matches their metadata.

use anyhow::Result;
use clap::Parser;
use objectio_auditor::ObjectAuditor;
use objectio_common::Config;
use objectio_diskfile::{DiskFileManager, StoragePolicyCollection};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "objectio-auditor")]
#[command(about = "ObjectIO Object Auditor")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/objectio/auditor.toml")]
    config: String,

    /// Root directory of the devices
    #[arg(long)]
    devices: Option<PathBuf>,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// Run only the zero-byte-file pass at this rate
    #[arg(long)]
    zero_byte_fps: Option<f64>,

    /// Audit only these devices (comma separated)
    #[arg(long, value_delimiter = ',')]
    device_dirs: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)?;
        toml::from_str(&config_str).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {}", e);
            Config::default()
        })
    } else {
        Config::default()
    };

    // CLI takes precedence
    if let Some(devices) = args.devices {
        config.diskfile.devices = devices;
    }
    let log_level = if args.log_level == "info" {
        config.logging.level.clone()
    } else {
        args.log_level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ObjectIO auditor");
    info!("Devices: {}", config.diskfile.devices.display());

    let policies = StoragePolicyCollection::new(&config.policies)?;
    let manager = DiskFileManager::new(config.diskfile, config.hash_path, policies);
    let auditor = ObjectAuditor::new(manager, config.auditor);

    let shutdown = auditor.shutdown();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        shutdown.trigger();
    });

    if args.once {
        let device_dirs = (!args.device_dirs.is_empty()).then_some(args.device_dirs);
        let reports = auditor.run_once(args.zero_byte_fps, device_dirs).await?;
        for report in &reports {
            info!(
                "{} pass: {} passed, {} quarantined, {} errors in {:.02}s",
                report.audit_type,
                report.totals.passes,
                report.totals.quarantines,
                report.totals.errors,
                report.elapsed.as_secs_f64()
            );
        }
    } else {
        auditor.run_forever().await;
    }

    Ok(())
}
