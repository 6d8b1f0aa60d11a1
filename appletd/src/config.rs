//! Bridge timeouts and buffer sizes.

use std::time::Duration;

/// Maximum bytes carried by one `PutData` frame.
pub const DEFAULT_WRITE_CHUNK: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a positive number, got {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Wait for the host to answer an `eval` script event.
    pub eval_timeout: Duration,
    /// Wait for ticketed script calls and security confirmations.
    pub call_timeout: Duration,
    /// Wait for a tunneled job to report connected.
    pub connect_timeout: Duration,
    /// Wait for the host to accept data on a forced flush.
    pub flush_timeout: Duration,
    pub write_chunk: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            eval_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(20),
            flush_timeout: Duration::from_secs(10),
            write_chunk: DEFAULT_WRITE_CHUNK,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `APPLETD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let secs = |var: &'static str| -> Result<Option<Duration>, ConfigError> {
            let Some(value) = lookup(var) else {
                return Ok(None);
            };
            match value.trim().parse::<f64>() {
                Ok(s) if s.is_finite() && s > 0.0 => Ok(Some(Duration::from_secs_f64(s))),
                _ => Err(ConfigError::Invalid { var, value }),
            }
        };

        if let Some(d) = secs("APPLETD_EVAL_TIMEOUT_SECS")? {
            config.eval_timeout = d;
        }
        if let Some(d) = secs("APPLETD_CALL_TIMEOUT_SECS")? {
            config.call_timeout = d;
        }
        if let Some(d) = secs("APPLETD_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = d;
        }
        if let Some(d) = secs("APPLETD_FLUSH_TIMEOUT_SECS")? {
            config.flush_timeout = d;
        }
        if let Some(value) = lookup("APPLETD_WRITE_CHUNK") {
            config.write_chunk = match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "APPLETD_WRITE_CHUNK",
                        value,
                    });
                }
            };
        }
        Ok(config)
    }

    pub fn with_eval_timeout(mut self, timeout: Duration) -> Self {
        self.eval_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn with_write_chunk(mut self, bytes: usize) -> Self {
        self.write_chunk = bytes.max(1);
        self
    }
}
