//! Demo server for waddle-reloader.
//!
//! ```bash
//! waddle-reload-demo --listen 127.0.0.1:8080 --mode http &
//! curl http://127.0.0.1:8080/pid
//! kill -HUP $!                     # restart without dropping connections
//! curl http://127.0.0.1:8080/pid   # answered by the new process
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, info_span, Instrument};
use waddle_reloader::{Reloader, ReloaderConfig};

mod http;
mod raw;
mod telemetry;

/// Zero-downtime restart demo: send SIGHUP to hand the socket to a new process
#[derive(Parser, Debug)]
#[command(name = "waddle-reload-demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to bind on a fresh start (default: RELOADER_LISTEN or 127.0.0.1:8080)
    #[arg(short, long)]
    listen: Option<String>,

    /// Protocol to serve on the listener
    #[arg(short, long, value_enum, default_value_t = Mode::Http)]
    mode: Mode,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// axum app with graceful shutdown
    Http,
    /// line echo over the tracked listener
    Raw,
}

impl Cli {
    fn reloader_config(&self) -> ReloaderConfig {
        let mut config = ReloaderConfig::from_env();
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init(cli.json_logs)
        .map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;

    let pid = std::process::id();
    run(cli).instrument(info_span!("process", pid)).await?;

    telemetry::shutdown();
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    info!("Reload demo starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = cli.reloader_config();
    config.log_config();

    let reloader = Reloader::from_config(&config);
    reloader
        .bind()
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;

    if reloader.is_resumed() {
        info!("Took over listener from previous process");
    }
    info!(
        addr = %reloader.local_addr()?,
        mode = ?cli.mode,
        "Ready; send SIGHUP to restart, SIGTERM to stop"
    );

    match cli.mode {
        Mode::Http => reloader.serve(http::router()).await?,
        Mode::Raw => raw::serve(&reloader).await?,
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["waddle-reload-demo"]).unwrap();
        assert_eq!(cli.mode, Mode::Http);
        assert!(cli.listen.is_none());
        assert!(!cli.json_logs);
    }

    #[test]
    fn test_listen_flag_overrides_config() {
        let cli =
            Cli::try_parse_from(["waddle-reload-demo", "--listen", "127.0.0.1:9001", "-m", "raw"])
                .unwrap();
        assert_eq!(cli.mode, Mode::Raw);
        assert_eq!(cli.reloader_config().listen, "127.0.0.1:9001");
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["waddle-reload-demo", "--mode", "grpc"]).is_err());
    }
}
