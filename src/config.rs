use std::time::Duration;

use crate::error::ChatError;

/// Server configuration. Builder pattern: chain setters, validate at
/// build time.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub port: u16,
    /// Lines queued per session before it counts as lagging.
    pub sink_capacity: usize,
    /// Upper bound on one socket write to a peer.
    pub write_timeout: Duration,
    pub max_name_len: usize,
    /// Longest accepted input line in bytes, terminator excluded.
    pub max_line_len: usize,
}

pub struct ServerConfigBuilder {
    addr: String,
    port: u16,
    sink_capacity: usize,
    write_timeout: Duration,
    max_name_len: usize,
    max_line_len: usize,
}

impl ServerConfig {
    pub const DEFAULT_PORT: u16 = 9001;

    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder {
            addr: "0.0.0.0".to_string(),
            port: Self::DEFAULT_PORT,
            sink_capacity: 64,
            write_timeout: Duration::from_secs(5),
            max_name_len: 32,
            max_line_len: 8192,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

impl ServerConfigBuilder {
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = capacity;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn max_name_len(mut self, len: usize) -> Self {
        self.max_name_len = len;
        self
    }

    pub fn max_line_len(mut self, len: usize) -> Self {
        self.max_line_len = len;
        self
    }

    pub fn build(self) -> Result<ServerConfig, ChatError> {
        if self.addr.trim().is_empty() {
            return Err(ChatError::Config("listen address is empty".into()));
        }
        if self.sink_capacity == 0 {
            return Err(ChatError::Config("sink capacity must be at least 1".into()));
        }
        if self.write_timeout.is_zero() {
            return Err(ChatError::Config("write timeout must be non-zero".into()));
        }
        if self.max_name_len == 0 {
            return Err(ChatError::Config("max name length must be at least 1".into()));
        }
        if self.max_line_len < self.max_name_len {
            return Err(ChatError::Config(
                "max line length must be at least the max name length".into(),
            ));
        }

        Ok(ServerConfig {
            addr: self.addr,
            port: self.port,
            sink_capacity: self.sink_capacity,
            write_timeout: self.write_timeout,
            max_name_len: self.max_name_len,
            max_line_len: self.max_line_len,
        })
    }
}
