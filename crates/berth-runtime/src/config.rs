//! Runtime configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use berth_common::{BerthPaths, LaunchResult};
use berth_sandbox::{Isolation, Launcher, NamespaceConfig};

/// Default time to wait for a killed process to be reaped.
pub const DEFAULT_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Paths for images, volumes and scratch data.
    pub paths: BerthPaths,
    /// Launcher selection.
    pub isolation: Isolation,
    /// Give processes a private network namespace with loopback only.
    pub isolate_network: bool,
    /// Overrides every supervised command's grace period.
    pub grace_period: Option<Duration>,
    /// How long to wait for a `SIGKILL`ed child before giving up on it.
    pub reap_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: BerthPaths::new(),
            isolation: Isolation::Auto,
            isolate_network: false,
            grace_period: None,
            reap_timeout: DEFAULT_REAP_TIMEOUT,
        }
    }
}

impl RuntimeConfig {
    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = BerthPaths::with_root(root);
        self
    }

    /// Set the isolation level.
    #[must_use]
    pub const fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Isolate the network.
    #[must_use]
    pub const fn with_network_isolation(mut self) -> Self {
        self.isolate_network = true;
        self
    }

    /// Override the grace period of supervised commands.
    #[must_use]
    pub const fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    /// Set the reap timeout.
    #[must_use]
    pub const fn with_reap_timeout(mut self, timeout: Duration) -> Self {
        self.reap_timeout = timeout;
        self
    }

    /// Build the configured launcher.
    ///
    /// # Errors
    ///
    /// Returns an error when the isolation level is unavailable.
    pub fn launcher(&self) -> LaunchResult<Arc<dyn Launcher>> {
        berth_sandbox::launcher(
            self.isolation,
            NamespaceConfig {
                isolate_network: self.isolate_network,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.isolation, Isolation::Auto);
        assert!(!config.isolate_network);
        assert_eq!(config.reap_timeout, DEFAULT_REAP_TIMEOUT);
    }

    #[test]
    fn builder_pattern() {
        let config = RuntimeConfig::default()
            .with_root("/custom/root")
            .with_isolation(Isolation::Host)
            .with_grace_period(Duration::from_millis(300))
            .with_reap_timeout(Duration::from_secs(1));

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.grace_period, Some(Duration::from_millis(300)));
        assert_eq!(config.launcher().unwrap().name(), "host");
    }
}
