use std::time::Duration;
use thiserror::Error;

/// A configuration value failed validation.
#[derive(Debug, Error)]
#[error("invalid config: {0}")]
pub struct ConfigError(pub String);

/// Tunables recognised by the core. Defaults match production settings; any
/// field can be overridden from the environment via `from_env`.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Upper bound on tasks dispatched concurrently across all BMCs.
    pub global_concurrency: usize,
    /// Upper bound on tasks dispatched concurrently against one BMC.
    pub per_bmc_concurrency: usize,
    /// Total attempts per task, including the first.
    pub retry_attempts: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    /// Per-task deadline from enqueue through verification.
    pub transition_deadline: Duration,
    pub verification_window: Duration,
    pub verification_poll: Duration,
    pub mapping_sync_interval: Duration,
    /// Run a mapping sync immediately when the loop starts.
    pub sync_on_startup: bool,
    /// Applied to endpoints that arrive from topology without a credential.
    pub default_credential_id: Option<String>,
    /// How long shutdown waits for in-flight tasks to drain.
    pub shutdown_grace: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 32,
            per_bmc_concurrency: 2,
            retry_attempts: 3,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(30),
            transition_deadline: Duration::from_secs(300),
            verification_window: Duration::from_secs(60),
            verification_poll: Duration::from_secs(2),
            mapping_sync_interval: Duration::from_secs(300),
            sync_on_startup: true,
            default_credential_id: None,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

fn env_usize(key: &str, current: usize) -> Result<usize, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError(format!("{key} must be an integer, got {v:?}"))),
        Err(_) => Ok(current),
    }
}

fn env_u32(key: &str, current: u32) -> Result<u32, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError(format!("{key} must be an integer, got {v:?}"))),
        Err(_) => Ok(current),
    }
}

fn env_duration_ms(key: &str, current: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError(format!("{key} must be milliseconds, got {v:?}"))),
        Err(_) => Ok(current),
    }
}

fn env_bool(key: &str, current: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(v) => match v.as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            _ => Err(ConfigError(format!("{key} must be true/false, got {v:?}"))),
        },
        Err(_) => Ok(current),
    }
}

impl CoreConfig {
    /// Defaults overridden by `POWERCTL_*` environment variables. Durations
    /// are milliseconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let cfg = Self {
            global_concurrency: env_usize("POWERCTL_GLOBAL_CONCURRENCY", d.global_concurrency)?,
            per_bmc_concurrency: env_usize("POWERCTL_PER_BMC_CONCURRENCY", d.per_bmc_concurrency)?,
            retry_attempts: env_u32("POWERCTL_RETRY_ATTEMPTS", d.retry_attempts)?,
            retry_backoff_base: env_duration_ms(
                "POWERCTL_RETRY_BACKOFF_BASE_MS",
                d.retry_backoff_base,
            )?,
            retry_backoff_max: env_duration_ms(
                "POWERCTL_RETRY_BACKOFF_MAX_MS",
                d.retry_backoff_max,
            )?,
            transition_deadline: env_duration_ms(
                "POWERCTL_TRANSITION_DEADLINE_MS",
                d.transition_deadline,
            )?,
            verification_window: env_duration_ms(
                "POWERCTL_VERIFICATION_WINDOW_MS",
                d.verification_window,
            )?,
            verification_poll: env_duration_ms(
                "POWERCTL_VERIFICATION_POLL_MS",
                d.verification_poll,
            )?,
            mapping_sync_interval: env_duration_ms(
                "POWERCTL_MAPPING_SYNC_INTERVAL_MS",
                d.mapping_sync_interval,
            )?,
            sync_on_startup: env_bool("POWERCTL_SYNC_ON_STARTUP", d.sync_on_startup)?,
            default_credential_id: std::env::var("POWERCTL_DEFAULT_CREDENTIAL_ID")
                .ok()
                .filter(|v| !v.is_empty())
                .or(d.default_credential_id),
            shutdown_grace: env_duration_ms("POWERCTL_SHUTDOWN_GRACE_MS", d.shutdown_grace)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_concurrency == 0 {
            return Err(ConfigError("global_concurrency must be > 0".into()));
        }
        if self.per_bmc_concurrency == 0 {
            return Err(ConfigError("per_bmc_concurrency must be > 0".into()));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError("retry_attempts must be >= 1".into()));
        }
        for (name, d) in [
            ("retry_backoff_base", self.retry_backoff_base),
            ("transition_deadline", self.transition_deadline),
            ("verification_window", self.verification_window),
            ("verification_poll", self.verification_poll),
            ("mapping_sync_interval", self.mapping_sync_interval),
        ] {
            if d.is_zero() {
                return Err(ConfigError(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = CoreConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.global_concurrency, 32);
        assert_eq!(cfg.per_bmc_concurrency, 2);
        assert_eq!(cfg.retry_attempts, 3);
        assert_eq!(cfg.transition_deadline, Duration::from_secs(300));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let cfg = CoreConfig {
            global_concurrency: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_poll_rejected() {
        let cfg = CoreConfig {
            verification_poll: Duration::ZERO,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
