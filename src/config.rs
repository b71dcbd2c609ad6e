use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Server settings. Every flag can also come from its `SPOTTER_*` variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "spotter", version, about = "Trainer availability and booking server")]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "SPOTTER_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "SPOTTER_PORT", default_value_t = 7878)]
    pub port: u16,

    /// Directory holding the write-ahead log.
    #[arg(long, env = "SPOTTER_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "SPOTTER_MAX_CONNECTIONS", default_value_t = 256)]
    pub max_connections: usize,

    /// WAL appends after which the compactor rewrites the log.
    #[arg(long, env = "SPOTTER_COMPACT_THRESHOLD", default_value_t = 1000)]
    pub compact_threshold: u64,

    /// Prometheus exporter port; metrics are off when unset.
    #[arg(long, env = "SPOTTER_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Upper bound on each calendar sync call, in milliseconds.
    #[arg(long, env = "SPOTTER_SYNC_TIMEOUT_MS", default_value_t = 5000)]
    pub sync_timeout_ms: u64,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("spotter.wal")
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}
