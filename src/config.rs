//! Scheduler-level configuration.
//!
//! Compiled-in defaults via `figment::providers::Serialized`,
//! overlaid by an optional TOML file,
//! overlaid by `CMDSCHED_`-prefixed environment variables. This crate does
//! not parse per-command run-configs (that's the out-of-scope Config
//! Factory) — only the scheduler's own knobs.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SchedulerError, SchedulerResult};

/// Scheduler-level tunables, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on how long the scheduling loop waits between match
    /// attempts when no wake event arrives (default 60s).
    #[serde(with = "humantime_serde")]
    pub max_poll_interval: Duration,

    /// Default invocation timeout applied when a run-config does not
    /// specify one. Zero means "no timeout".
    #[serde(with = "humantime_serde")]
    pub default_invocation_timeout: Duration,

    /// Default delay between loop-mode iterations when a run-config does
    /// not specify one.
    #[serde(with = "humantime_serde")]
    pub default_loop_delay: Duration,

    /// Default per-device battery cutoff percentage (0-100) applied when a
    /// run-config does not specify one.
    pub default_battery_cutoff_percent: u8,

    /// How long a force-stop waits for the invocation's "allow-interrupt"
    /// gate to open before treating it as open anyway (§5). Zero means
    /// immediate.
    #[serde(with = "humantime_serde")]
    pub force_stop_grace_window: Duration,

    /// Capacity of the internal wake/command mpsc channels.
    pub channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_poll_interval: Duration::from_secs(60),
            default_invocation_timeout: Duration::from_secs(0),
            default_loop_delay: Duration::from_secs(0),
            default_battery_cutoff_percent: 10,
            force_stop_grace_window: Duration::from_secs(0),
            channel_capacity: 64,
        }
    }
}

impl SchedulerConfig {
    /// Loads configuration from (in increasing precedence) compiled-in
    /// defaults, an optional TOML file at `path`, and `CMDSCHED_`-prefixed
    /// environment variables.
    pub fn load(path: Option<&str>) -> SchedulerResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(SchedulerConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("CMDSCHED_"));

        let config: SchedulerConfig = figment
            .extract()
            .map_err(|e| SchedulerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> SchedulerResult<()> {
        if self.default_battery_cutoff_percent > 100 {
            return Err(SchedulerError::Config(
                "default_battery_cutoff_percent must be <= 100".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(SchedulerError::Config(
                "channel_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_with_no_file_uses_defaults() {
        let cfg = SchedulerConfig::load(None).expect("defaults should load");
        assert_eq!(cfg.max_poll_interval, Duration::from_secs(60));
    }

    #[test]
    fn rejects_invalid_battery_cutoff() {
        let mut cfg = SchedulerConfig::default();
        cfg.default_battery_cutoff_percent = 255;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_overlays_toml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile should create");
        writeln!(file, "default_battery_cutoff_percent = 42").expect("write should succeed");
        let cfg = SchedulerConfig::load(file.path().to_str()).expect("file overlay should load");
        assert_eq!(cfg.default_battery_cutoff_percent, 42);
        // Fields untouched by the file keep their compiled-in default.
        assert_eq!(cfg.max_poll_interval, Duration::from_secs(60));
    }

    // Mutates process-wide environment state, so this must not run
    // concurrently with another test doing the same.
    #[test]
    #[serial]
    fn env_var_overlay_wins_over_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile should create");
        writeln!(file, "channel_capacity = 7").expect("write should succeed");
        std::env::set_var("CMDSCHED_CHANNEL_CAPACITY", "99");
        let cfg = SchedulerConfig::load(file.path().to_str()).expect("overlay should load");
        std::env::remove_var("CMDSCHED_CHANNEL_CAPACITY");
        assert_eq!(cfg.channel_capacity, 99);
    }
}
