//! Meridian world server entry point.
//!
//! Loads the configuration, sets up logging, starts every configured
//! listener and runs until a termination signal or a remote shutdown request
//! arrives. Exit codes: `0` clean stop, `-1` configuration error, `-2`
//! logging or initialization error, `-3` server start failure.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::Result;
use cli::CliArgs;
use config::AppConfig;
use meridian_server::WorldServer;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// Why startup was abandoned, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartupFailure {
    Config,
    Initialization,
    Start,
}

impl StartupFailure {
    fn code(self) -> i32 {
        match self {
            StartupFailure::Config => -1,
            StartupFailure::Initialization => -2,
            StartupFailure::Start => -3,
        }
    }
}

struct Application {
    config: AppConfig,
    server: WorldServer,
}

impl Application {
    async fn new(args: CliArgs) -> Result<Self, StartupFailure> {
        let config = load_config(&args).await.map_err(|e| {
            eprintln!("❌ Configuration error: {e:#}");
            StartupFailure::Config
        })?;

        logging::setup_logging(&config.logging, args.json_logs).map_err(|e| {
            eprintln!("❌ Failed to initialize logging: {e:#}");
            StartupFailure::Initialization
        })?;

        let server_config = config.to_server_config().map_err(|e| {
            error!("❌ Configuration error: {:#}", e);
            StartupFailure::Config
        })?;

        info!(
            "🌟 Meridian World Server v{} | config: {}",
            env!("CARGO_PKG_VERSION"),
            args.config_path.display()
        );

        Ok(Self {
            config,
            server: WorldServer::with_defaults(server_config),
        })
    }

    async fn run(self) -> Result<(), StartupFailure> {
        let server_config = self.server.config();
        info!("📋 Configuration Summary:");
        info!("  🧵 I/O partitions: {}", server_config.partitions);
        info!("  📦 Max frame size: {} bytes", server_config.max_frame_size);
        info!("  👥 Max connections per listener: {}", server_config.max_connections);
        info!(
            "  ⏱️ Timeouts: bootstrap {}s, idle {}s, shutdown grace {}s",
            self.config.server.bootstrap_timeout_secs,
            self.config.server.idle_timeout_secs,
            self.config.server.shutdown_grace_secs
        );

        if let Err(e) = self.server.start().await {
            error!("❌ Server start failed: {}", e);
            return Err(StartupFailure::Start);
        }
        for listener in &server_config.listeners {
            if let Some(addr) = self.server.local_addr(listener.kind) {
                info!("  🔌 {} listener on {}", listener.kind, addr);
            }
        }
        info!("✅ Meridian is now running, press Ctrl+C to shut down");

        let registry = self.server.registry().clone();
        tokio::select! {
            signal = signals::wait_for_termination() => {
                if let Err(e) = signal {
                    warn!("Signal handling failed, shutting down: {}", e);
                }
            }
            _ = registry.shutdown_requested() => {
                info!("🛑 Remote shutdown requested");
            }
        }

        self.server.shutdown().await;
        info!("👋 Meridian World Server stopped");
        Ok(())
    }
}

async fn load_config(args: &CliArgs) -> Result<AppConfig> {
    let mut config = AppConfig::load_from_file(&args.config_path).await?;

    if let Some(bind_address) = &args.bind_address {
        config.listeners.game = Some(bind_address.clone());
    }
    if let Some(partitions) = args.partitions {
        config.server.partitions = partitions;
    }
    if let Some(log_level) = &args.log_level {
        config.logging.level = log_level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let outcome = match Application::new(args).await {
        Ok(app) => app.run().await,
        Err(failure) => Err(failure),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            // Negative codes wrap to their unsigned byte, as with exit(-1).
            ExitCode::from(failure.code() as u8)
        }
    }
}
