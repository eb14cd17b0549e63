mod server;

use anyhow::{Context, Result};
use clap::Parser;
use sotto_sfu::logging::{self, LoggingConfig};
use std::path::PathBuf;

/// Anonymous low-latency voice chat SFU.
#[derive(Debug, Parser)]
#[command(name = "sotto", version)]
struct Cli {
    /// HTTP port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Admin panel secret key
    #[arg(long, env = "ADMIN_KEY", default_value = "change-me-123")]
    admin_key: String,

    /// WebRTC ICE UDP port (0 = ephemeral ports, no mux)
    #[arg(long, env = "RTC_UDP_PORT", default_value_t = 50000)]
    rtc_udp_port: u16,

    /// TURN server URL (e.g. turn:your-server.com:3478)
    #[arg(long, env = "TURN_SERVER")]
    turn_server: Option<String>,

    /// TURN server username
    #[arg(long, env = "TURN_USER")]
    turn_user: Option<String>,

    /// TURN server password
    #[arg(long, env = "TURN_PASS")]
    turn_pass: Option<String>,

    /// Directory for persisted state (ban list)
    #[arg(long, env = "DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Optional log file, appended to alongside stdout
    #[arg(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_ring = logging::init_logging(&LoggingConfig {
        level: cli.log_level.clone(),
        file_path: cli.log_file.clone(),
    })
    .context("failed to init logger")?;

    server::run(cli, log_ring).await
}
