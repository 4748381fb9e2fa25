//! Server configuration

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "driftbox", about = "Sandbox orchestration and realtime event streaming")]
pub struct Config {
    /// Address to bind the HTTP/WebSocket listener on
    #[arg(long, env = "DRIFTBOX_BIND", default_value = "127.0.0.1:4000")]
    pub bind: SocketAddr,

    /// SQLite database path (defaults to ~/.driftbox/driftbox.db)
    #[arg(long, env = "DRIFTBOX_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Base URL of the sandbox provisioning API
    #[arg(long, env = "DRIFTBOX_PROVIDER_URL", default_value = "http://127.0.0.1:8700")]
    pub provider_url: String,

    /// Bearer token for the provisioning API
    #[arg(long, env = "DRIFTBOX_PROVIDER_API_KEY", default_value = "", hide_env_values = true)]
    pub provider_api_key: String,

    /// Base URL of the snapshot storage gateway
    #[arg(long, env = "DRIFTBOX_SNAPSHOT_URL", default_value = "http://127.0.0.1:8701")]
    pub snapshot_url: String,

    /// Max build requests per user+project per window
    #[arg(long, env = "DRIFTBOX_RATE_LIMIT_MAX", default_value_t = 10)]
    pub rate_limit_max: u32,

    /// Rate-limit window in seconds
    #[arg(long, env = "DRIFTBOX_RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    pub rate_limit_window_secs: u64,

    /// Recreate expired sandboxes automatically during health polls
    #[arg(long, env = "DRIFTBOX_AUTO_RESTART", default_value_t = true)]
    pub auto_restart: bool,
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".driftbox")
                .join("driftbox.db")
        })
    }
}
