use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use falcon_haptic_runtime::config::RuntimeConfig;
use falcon_haptic_runtime::strategy::StrategyKind;

/// Run a force-feedback effect on a Falcon haptic controller
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Effect to render
    #[arg(value_enum, default_value_t = StrategyKind::Box)]
    strategy: StrategyKind,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port (overrides the config file)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (overrides the config file)
    #[arg(short, long)]
    baudrate: Option<u32>,

    /// Keep the firmware in homing mode
    #[arg(long)]
    homing: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match RuntimeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Config error ({}): {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => RuntimeConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(baudrate) = args.baudrate {
        config.baudrate = baudrate;
    }
    config.homing |= args.homing;

    match falcon_haptic_runtime::runtime::run(config, args.strategy).await {
        Ok(stats) => info!("Done: {} commands dispatched", stats.dispatched),
        Err(e) => {
            eprintln!("Runtime error: {}", e);
            std::process::exit(1);
        }
    }
}
