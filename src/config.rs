use std::{env, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::backoff::ReconnectBackoff;

/// Limits and timeouts for the synchronization layer.
///
/// Loadable from a TOML file with `DINESYNC_*` environment overrides, or built
/// programmatically via `SyncConfig::default()`. Validated at construction,
/// not at first use.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Hard cap on pooled transport channels.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    /// Soft cap on subscriptions multiplexed onto one channel. Exceeded only
    /// under forced reuse when the pool itself is full.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_channel: usize,
    /// Reconnect attempts before a channel is declared terminally failed.
    #[serde(default = "default_max_reconnects")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long an empty channel lingers before teardown, absorbing
    /// subscribe/unsubscribe churn from UI re-renders.
    #[serde(default = "default_idle_teardown_ms")]
    pub idle_teardown_ms: u64,
    /// How long an optimistic patch may wait for its authoritative event
    /// before it is rolled back and reported stale.
    #[serde(default = "default_patch_timeout_ms")]
    pub patch_timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,
}

fn default_max_channels() -> usize {
    10
}

fn default_max_subscriptions() -> usize {
    20
}

fn default_max_reconnects() -> u32 {
    10
}

fn default_join_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

fn default_idle_teardown_ms() -> u64 {
    300_000
}

fn default_patch_timeout_ms() -> u64 {
    10_000
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_jitter_ms() -> u64 {
    1_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_channels: default_max_channels(),
            max_subscriptions_per_channel: default_max_subscriptions(),
            max_reconnect_attempts: default_max_reconnects(),
            join_timeout_ms: default_join_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            idle_teardown_ms: default_idle_teardown_ms(),
            patch_timeout_ms: default_patch_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data =
            fs::read_to_string(path.as_ref()).with_context(|| "Failed to read config file")?;
        let mut raw: toml::Value =
            toml::from_str(&data).with_context(|| "Failed to parse TOML config")?;
        // Support a nested [dinesync] table or top-level entries.
        let table = if let Some(table) = raw
            .get_mut("dinesync")
            .and_then(|v| v.as_table_mut())
            .cloned()
        {
            table
        } else {
            raw.try_into()
                .map_err(|_| anyhow::anyhow!("Invalid dinesync config structure"))?
        };
        let mut cfg: SyncConfig = toml::from_str(&toml::to_string(&table)?)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        override_usize("DINESYNC_MAX_CHANNELS", &mut self.max_channels);
        override_usize(
            "DINESYNC_MAX_SUBSCRIPTIONS_PER_CHANNEL",
            &mut self.max_subscriptions_per_channel,
        );
        override_u32(
            "DINESYNC_MAX_RECONNECT_ATTEMPTS",
            &mut self.max_reconnect_attempts,
        );
        override_u64("DINESYNC_JOIN_TIMEOUT_MS", &mut self.join_timeout_ms);
        override_u64(
            "DINESYNC_HEARTBEAT_INTERVAL_MS",
            &mut self.heartbeat_interval_ms,
        );
        override_u64("DINESYNC_IDLE_TEARDOWN_MS", &mut self.idle_teardown_ms);
        override_u64("DINESYNC_PATCH_TIMEOUT_MS", &mut self.patch_timeout_ms);
        override_u64("DINESYNC_BACKOFF_BASE_MS", &mut self.backoff_base_ms);
        override_u64("DINESYNC_BACKOFF_MAX_MS", &mut self.backoff_max_ms);
        override_u64("DINESYNC_BACKOFF_JITTER_MS", &mut self.backoff_jitter_ms);
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_channels > 0, "max_channels must be at least 1");
        anyhow::ensure!(
            self.max_subscriptions_per_channel > 0,
            "max_subscriptions_per_channel must be at least 1"
        );
        anyhow::ensure!(
            self.max_reconnect_attempts > 0,
            "max_reconnect_attempts must be at least 1"
        );
        anyhow::ensure!(self.join_timeout_ms > 0, "join_timeout_ms must be non-zero");
        anyhow::ensure!(
            self.heartbeat_interval_ms > 0,
            "heartbeat_interval_ms must be non-zero"
        );
        anyhow::ensure!(
            self.patch_timeout_ms > 0,
            "patch_timeout_ms must be non-zero"
        );
        anyhow::ensure!(
            self.backoff_max_ms >= self.backoff_base_ms,
            "backoff_max_ms must be >= backoff_base_ms"
        );
        Ok(())
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_teardown(&self) -> Duration {
        Duration::from_millis(self.idle_teardown_ms)
    }

    pub fn patch_timeout(&self) -> Duration {
        Duration::from_millis(self.patch_timeout_ms)
    }

    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff {
            base: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            jitter: Duration::from_millis(self.backoff_jitter_ms),
        }
    }
}

fn override_usize(key: &str, field: &mut usize) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<usize>() {
            *field = parsed;
        }
    }
}

fn override_u32(key: &str, field: &mut u32) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u32>() {
            *field = parsed;
        }
    }
}

fn override_u64(key: &str, field: &mut u64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u64>() {
            *field = parsed;
        }
    }
}
