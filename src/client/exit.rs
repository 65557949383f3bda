//! Classification of transport failures on calls into a plugin.
//!
//! A transport failure means one of two things: the plugin is gone because
//! we are shutting down (expected, quiet), or something broke while it was
//! supposed to be alive (a real failure that must be reported as fatal).

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error};

use super::ShutdownCoordinator;
use crate::error::{PluginError, Result};

/// Runs when a call fails after the plugin process already exited.
pub type ExitCleanup = Arc<dyn Fn() + Send + Sync>;

/// Applies the exit policy to results of calls into one plugin.
#[derive(Clone)]
pub struct ExitMonitor {
    plugin: Arc<str>,
    exited: watch::Receiver<bool>,
    coordinator: Arc<ShutdownCoordinator>,
    cleanup: Option<ExitCleanup>,
}

impl ExitMonitor {
    pub fn new(
        plugin: &str,
        exited: watch::Receiver<bool>,
        coordinator: Arc<ShutdownCoordinator>,
    ) -> Self {
        Self {
            plugin: Arc::from(plugin),
            exited,
            coordinator,
            cleanup: None,
        }
    }

    /// Run `cleanup` instead of reporting when a call fails because the
    /// plugin exited.
    pub fn with_cleanup(mut self, cleanup: ExitCleanup) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn plugin_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Classify the result of `call`.
    ///
    /// - application errors pass through, annotated with `call`
    /// - transport errors after the plugin exited, with a cleanup callback:
    ///   the callback runs and the error is non-fatal
    /// - transport errors while not shutting down are fatal
    /// - transport errors during shutdown are non-fatal
    pub fn check<T>(&self, call: &'static str, result: Result<T>) -> Result<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_transport() {
            return Err(PluginError::Call {
                call,
                source: Box::new(err),
            });
        }

        let message = format!("{call}: {err}");
        if self.plugin_exited() {
            if let Some(cleanup) = &self.cleanup {
                debug!(plugin = %self.plugin, call, "plugin exited, running cleanup");
                cleanup();
                return Err(PluginError::Transport {
                    fatal: false,
                    message,
                });
            }
        }

        if !self.coordinator.is_shutting_down() {
            error!(
                plugin = %self.plugin,
                call,
                error = %err,
                exited = self.plugin_exited(),
                "plugin connection failed outside of shutdown"
            );
            return Err(PluginError::Transport {
                fatal: true,
                message,
            });
        }

        debug!(plugin = %self.plugin, call, error = %err, "plugin connection failed during shutdown");
        Err(PluginError::Transport {
            fatal: false,
            message,
        })
    }
}

impl fmt::Debug for ExitMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitMonitor")
            .field("plugin", &self.plugin)
            .field("exited", &self.plugin_exited())
            .field("shutting_down", &self.coordinator.is_shutting_down())
            .finish()
    }
}
