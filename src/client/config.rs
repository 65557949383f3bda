use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::handshake::{DEFAULT_MAX_PORT, DEFAULT_MIN_PORT};
use crate::mux::MuxConfig;

/// Default time to wait for the handshake line (60 seconds).
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

/// Receives each line the plugin writes to stderr, newline included.
pub type LineSink = Arc<dyn Fn(&str) + Send + Sync>;

/// How to launch and talk to one plugin process.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use buildplug::client::PluginClientConfig;
///
/// let config = PluginClientConfig::new("buildplug-plugin-amazon")
///     .args(["start", "builder", "ebs"])
///     .managed(true)
///     .start_timeout(Duration::from_secs(30));
/// assert_eq!(config.args, vec!["start", "builder", "ebs"]);
/// ```
#[derive(Clone)]
pub struct PluginClientConfig {
    /// Executable; bare names are looked up on `PATH`, then next to the
    /// current executable.
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Register with the shutdown coordinator so `kill_all` reaches it.
    pub managed: bool,
    pub min_port: u16,
    pub max_port: u16,
    pub start_timeout: Duration,
    pub stderr: Option<LineSink>,
    pub mux: MuxConfig,
}

impl PluginClientConfig {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            managed: false,
            min_port: DEFAULT_MIN_PORT,
            max_port: DEFAULT_MAX_PORT,
            start_timeout: DEFAULT_START_TIMEOUT,
            stderr: None,
            mux: MuxConfig::default(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn managed(mut self, managed: bool) -> Self {
        self.managed = managed;
        self
    }

    pub fn port_range(mut self, min: u16, max: u16) -> Self {
        self.min_port = min;
        self.max_port = max;
        self
    }

    pub fn start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn stderr(mut self, sink: LineSink) -> Self {
        self.stderr = Some(sink);
        self
    }

    pub fn mux_config(mut self, mux: MuxConfig) -> Self {
        self.mux = mux;
        self
    }
}

impl fmt::Debug for PluginClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginClientConfig")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("managed", &self.managed)
            .field("min_port", &self.min_port)
            .field("max_port", &self.max_port)
            .field("start_timeout", &self.start_timeout)
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PluginClientConfig::new("plugin");
        assert_eq!(config.min_port, 10000);
        assert_eq!(config.max_port, 25000);
        assert_eq!(config.start_timeout, DEFAULT_START_TIMEOUT);
        assert!(!config.managed);
        assert!(config.stderr.is_none());
    }

    #[test]
    fn test_fluent_setters() {
        let config = PluginClientConfig::new("plugin")
            .port_range(12000, 12010)
            .managed(true)
            .stderr(Arc::new(|_line: &str| {}));
        assert_eq!((config.min_port, config.max_port), (12000, 12010));
        assert!(config.managed);
        assert!(format!("{config:?}").contains("stderr: true"));
    }
}
