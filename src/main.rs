//! Tunnel Proto - CLI Entry Point
//!
//! Runs the inbounds listed in a YAML configuration file.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tunnel_proto::{Config, Gateway, VERSION};

#[derive(Parser, Debug)]
#[command(name = "tunnel-proto")]
#[command(version = VERSION)]
#[command(about = "Shadowsocks, SOCKS5 and Trojan inbound server")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    // Install aws-lc-rs as the default crypto provider for rustls
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("tunnel-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match Config::load_async(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("tunnel_proto={}", config.log_level).parse()?),
        )
        .init();

    info!("Tunnel Proto v{}", VERSION);
    info!("Loaded configuration from: {}", args.config.display());

    // Test mode
    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to initialize gateway: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
