use crate::error::{Result, YamuxError};
use std::time::Duration;

/// Configuration for a yamux session.
///
/// `Config` contains all the tunable parameters for a session: accept
/// backlog, keepalive behavior, window sizing, and frame chunking. The
/// defaults match the reference implementation.
///
/// # Examples
///
/// ## Using default configuration
///
/// ```rust
/// use tiny_yamux::Config;
///
/// let config = Config::default();
/// assert_eq!(config.max_stream_window_size, 256 * 1024);
/// assert!(config.enable_keepalive);
/// ```
///
/// ## Creating custom configuration
///
/// ```rust
/// use tiny_yamux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .keepalive_interval(Duration::from_secs(30))
///     .max_stream_window_size(64 * 1024)
///     .build()
///     .expect("Valid configuration");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Streams allowed to sit in the accept queue; a SYN past this limit is
    /// answered with RST.
    pub accept_backlog: usize,
    /// Whether the session emits keepalive pings on its own.
    pub enable_keepalive: bool,
    pub keepalive_interval: Duration,
    /// Bound on a single transport write before it is treated as fatal.
    pub connection_write_timeout: Duration,
    /// Receive window advertised for new streams and enforced against the
    /// peer; also caps replenishment.
    pub max_stream_window_size: u32,
    /// Largest DATA frame body emitted when chunking writes.
    pub max_data_frame_size: u32,
    /// Cap on concurrently live streams per session.
    pub max_num_streams: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accept_backlog: 256,
            enable_keepalive: true,
            keepalive_interval: Duration::from_secs(60),
            connection_write_timeout: Duration::from_secs(30),
            max_stream_window_size: 256 * 1024, // 256KB
            max_data_frame_size: 16 * 1024,     // 16KB
            max_num_streams: 8192,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.accept_backlog == 0 {
            return Err(YamuxError::Config(
                "Accept backlog cannot be 0".to_string(),
            ));
        }

        if self.enable_keepalive && self.keepalive_interval.is_zero() {
            return Err(YamuxError::Config(
                "Keepalive interval cannot be 0 when keepalive is enabled".to_string(),
            ));
        }

        if self.connection_write_timeout.is_zero() {
            return Err(YamuxError::Config(
                "Connection write timeout cannot be 0".to_string(),
            ));
        }

        if self.max_stream_window_size == 0 {
            return Err(YamuxError::Config(
                "Max stream window size cannot be 0".to_string(),
            ));
        }

        if self.max_data_frame_size == 0 {
            return Err(YamuxError::Config(
                "Max data frame size cannot be 0".to_string(),
            ));
        }

        if self.max_num_streams == 0 {
            return Err(YamuxError::Config(
                "Max number of streams cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for creating custom `Config` instances.
///
/// Starts from the defaults and allows selective overriding of specific
/// settings; `build` validates the result.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.config.accept_backlog = backlog;
        self
    }

    pub fn enable_keepalive(mut self, enable: bool) -> Self {
        self.config.enable_keepalive = enable;
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    pub fn connection_write_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_write_timeout = timeout;
        self
    }

    pub fn max_stream_window_size(mut self, size: u32) -> Self {
        self.config.max_stream_window_size = size;
        self
    }

    pub fn max_data_frame_size(mut self, size: u32) -> Self {
        self.config.max_data_frame_size = size;
        self
    }

    pub fn max_num_streams(mut self, max: usize) -> Self {
        self.config.max_num_streams = max;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
