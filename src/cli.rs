use std::time::Duration;

use clap::Parser;
use tracing::Level;

use crate::config::ServerConfig;
use crate::error::ChatError;

/// Line-oriented chat server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub addr: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = ServerConfig::DEFAULT_PORT)]
    pub port: u16,

    /// Lines queued per client before senders have to wait
    #[arg(long, default_value_t = 64)]
    pub sink_capacity: usize,

    /// Milliseconds a write to a client, or a wait for room in its queue, may take
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Longest accepted screen name, in characters
    #[arg(long, default_value_t = 32)]
    pub max_name_len: usize,

    /// Longest accepted input line, in bytes
    #[arg(long, default_value_t = 8192)]
    pub max_line_len: usize,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(long, default_value = "info")]
    pub log_level: Level,
}

impl Cli {
    pub fn to_config(&self) -> Result<ServerConfig, ChatError> {
        ServerConfig::builder()
            .addr(&self.addr)
            .port(self.port)
            .sink_capacity(self.sink_capacity)
            .write_timeout(Duration::from_millis(self.write_timeout_ms))
            .max_name_len(self.max_name_len)
            .max_line_len(self.max_line_len)
            .build()
    }
}
