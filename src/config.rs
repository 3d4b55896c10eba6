use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::retry::BackoffPolicy;

const ENV_PREFIX: &str = "JOBS_";

/// Overwrite `$target` when `$source` holds a value
macro_rules! apply_opt {
    ($target:expr, $source:expr) => {
        if let Some(v) = $source {
            $target = v;
        }
    };
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub queue: Option<QueueSection>,
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub database: Option<DatabaseSection>,
    #[serde(default)]
    pub logging: Option<LoggingSection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueSection {
    #[serde(default)]
    pub max_concurrent_jobs: Option<usize>,
    #[serde(default)]
    pub polling_interval_seconds: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub per_job_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub progress_retention_hours: Option<f64>,
    #[serde(default)]
    pub sweep_interval_seconds: Option<u64>,
    #[serde(default)]
    pub stale_claim_threshold_seconds: Option<u64>,
    #[serde(default)]
    pub progress_batch_limit: Option<usize>,
    #[serde(default)]
    pub store_retry: Option<StoreRetrySection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StoreRetrySection {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DatabaseSection {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: Option<bool>,
}

/// Tuning knobs for the queue, workers and sweeper.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Size of the worker pool
    pub max_concurrent_jobs: usize,
    /// Idle sleep when the ready queue is empty
    pub polling_interval: Duration,
    /// Retries after the first attempt before a job is dead-lettered
    pub max_retries: u32,
    /// Default handler timeout, handlers may override it at registration
    pub per_job_timeout: Duration,
    pub progress_retention: Duration,
    pub sweep_interval: Duration,
    /// Age after which a claim is considered abandoned. Must exceed every
    /// handler timeout or live jobs get reclaimed.
    pub stale_claim_threshold: Duration,
    pub progress_batch_limit: usize,
    pub store_retry: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            polling_interval: Duration::from_secs(5),
            max_retries: 3,
            per_job_timeout: Duration::from_secs(300),
            progress_retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5),
            stale_claim_threshold: Duration::from_secs(15 * 60),
            progress_batch_limit: 50,
            store_retry: BackoffPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.max_concurrent_jobs == 0 {
            return fail("max_concurrent_jobs must be at least 1");
        }
        if self.polling_interval.is_zero() {
            return fail("polling_interval must be positive");
        }
        if self.sweep_interval.is_zero() {
            return fail("sweep_interval must be positive");
        }
        if self.per_job_timeout.is_zero() {
            return fail("per_job_timeout must be positive");
        }
        if self.progress_retention.is_zero() {
            return fail("progress_retention must be positive");
        }
        if self.stale_claim_threshold <= self.per_job_timeout {
            return fail("stale_claim_threshold must be greater than per_job_timeout");
        }
        if self.progress_batch_limit == 0 {
            return fail("progress_batch_limit must be at least 1");
        }
        if self.store_retry.max_attempts == 0 {
            return fail("store_retry.max_attempts must be at least 1");
        }
        Ok(())
    }

    fn apply_section(&mut self, section: QueueSection) -> Result<(), ConfigError> {
        apply_opt!(self.max_concurrent_jobs, section.max_concurrent_jobs);
        apply_opt!(self.polling_interval, section.polling_interval_seconds.map(Duration::from_secs));
        apply_opt!(self.max_retries, section.max_retries);
        apply_opt!(self.per_job_timeout, section.per_job_timeout_seconds.map(Duration::from_secs));
        if let Some(hours) = section.progress_retention_hours {
            self.progress_retention = hours_to_duration("progress_retention_hours", hours)?;
        }
        apply_opt!(self.sweep_interval, section.sweep_interval_seconds.map(Duration::from_secs));
        apply_opt!(
            self.stale_claim_threshold,
            section.stale_claim_threshold_seconds.map(Duration::from_secs)
        );
        apply_opt!(self.progress_batch_limit, section.progress_batch_limit);

        if let Some(retry) = section.store_retry {
            apply_opt!(self.store_retry.max_attempts, retry.max_attempts);
            apply_opt!(self.store_retry.initial_delay, retry.initial_delay_ms.map(Duration::from_millis));
            apply_opt!(self.store_retry.max_delay, retry.max_delay_ms.map(Duration::from_millis));
        }
        Ok(())
    }
}

/// Everything the standalone server needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub queue: QueueConfig,
    pub listen_addr: String,
    /// `None` runs on the in-process stores
    pub database_url: Option<String>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            listen_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Settings {
    /// Defaults, then the file (if any), then `JOBS_*` environment variables.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let raw = match path {
            Some(p) => load_raw_from_file(p)?,
            None => RawConfigFile::default(),
        };
        let mut settings = Self::from_raw(raw)?;
        settings.apply_env_overrides(|key| env::var(key).ok())?;
        settings.queue.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let raw: RawConfigFile = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfigFile) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();

        if let Some(queue) = raw.queue {
            settings.queue.apply_section(queue)?;
        }
        if let Some(server) = raw.server {
            apply_opt!(settings.listen_addr, server.listen_addr);
        }
        if let Some(db) = raw.database {
            if db.url.is_some() {
                settings.database_url = db.url;
            }
        }
        if let Some(logging) = raw.logging {
            apply_opt!(settings.log_level, logging.level);
            apply_opt!(settings.log_json, logging.json);
        }
        Ok(settings)
    }

    /// Apply overrides from `lookup`, which maps full variable names
    /// (`JOBS_MAX_RETRIES`) to values.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };
        let q = &mut self.queue;

        apply_opt!(q.max_concurrent_jobs, env.parse("MAX_CONCURRENT_JOBS")?);
        apply_opt!(q.polling_interval, env.parse("POLLING_INTERVAL_SECONDS")?.map(Duration::from_secs));
        apply_opt!(q.max_retries, env.parse("MAX_RETRIES")?);
        apply_opt!(q.per_job_timeout, env.parse("PER_JOB_TIMEOUT_SECONDS")?.map(Duration::from_secs));
        if let Some(hours) = env.parse::<f64>("PROGRESS_RETENTION_HOURS")? {
            q.progress_retention = hours_to_duration("JOBS_PROGRESS_RETENTION_HOURS", hours)?;
        }
        apply_opt!(q.sweep_interval, env.parse("SWEEP_INTERVAL_SECONDS")?.map(Duration::from_secs));
        apply_opt!(
            q.stale_claim_threshold,
            env.parse("STALE_CLAIM_THRESHOLD_SECONDS")?.map(Duration::from_secs)
        );
        apply_opt!(q.progress_batch_limit, env.parse("PROGRESS_BATCH_LIMIT")?);
        apply_opt!(q.store_retry.max_attempts, env.parse("STORE_RETRY_MAX_ATTEMPTS")?);
        apply_opt!(
            q.store_retry.initial_delay,
            env.parse("STORE_RETRY_INITIAL_DELAY_MS")?.map(Duration::from_millis)
        );
        apply_opt!(
            q.store_retry.max_delay,
            env.parse("STORE_RETRY_MAX_DELAY_MS")?.map(Duration::from_millis)
        );

        apply_opt!(self.listen_addr, env.string("LISTEN_ADDR"));
        if let Some(url) = env.string("DATABASE_URL") {
            self.database_url = Some(url);
        }
        apply_opt!(self.log_level, env.string("LOG_LEVEL"));
        if let Some(v) = env.string("LOG_JSON") {
            self.log_json = parse_bool(&v)
                .ok_or_else(|| ConfigError::Parse(format!("invalid {ENV_PREFIX}LOG_JSON")))?;
        }
        Ok(())
    }
}

/// Load a raw TOML config file.
pub fn load_raw_from_file<P: AsRef<Path>>(path: P) -> Result<RawConfigFile, ConfigError> {
    let s = fs::read_to_string(path)?;
    toml::from_str(&s).map_err(|e| ConfigError::Parse(e.to_string()))
}

struct EnvSource<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvSource<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(v) => v
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::Parse(format!("invalid {ENV_PREFIX}{key}: {e}"))),
            None => Ok(None),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Some(true),
        "0" | "false" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn hours_to_duration(key: &str, hours: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(hours * 3600.0)
        .map_err(|e| ConfigError::Validation(format!("{key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = QueueConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_concurrent_jobs, 10);
        assert_eq!(cfg.polling_interval, Duration::from_secs(5));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.per_job_timeout, Duration::from_secs(300));
        assert_eq!(cfg.progress_retention, Duration::from_secs(86_400));
        assert_eq!(cfg.progress_batch_limit, 50);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [queue]
            max_concurrent_jobs = 4
            max_retries = 5
            progress_retention_hours = 0.5

            [queue.store_retry]
            max_attempts = 2

            [server]
            listen_addr = "127.0.0.1:9000"

            [database]
            url = "sqlite://jobs.db"
            "#,
        )
        .unwrap();

        assert_eq!(settings.queue.max_concurrent_jobs, 4);
        assert_eq!(settings.queue.max_retries, 5);
        assert_eq!(settings.queue.progress_retention, Duration::from_secs(1800));
        assert_eq!(settings.queue.store_retry.max_attempts, 2);
        assert_eq!(settings.queue.polling_interval, Duration::from_secs(5));
        assert_eq!(settings.listen_addr, "127.0.0.1:9000");
        assert_eq!(settings.database_url.as_deref(), Some("sqlite://jobs.db"));
    }

    #[test]
    fn env_wins_over_file() {
        let mut settings = Settings::from_toml_str("[queue]\nmax_retries = 5\n").unwrap();
        settings
            .apply_env_overrides(env_of(&[
                ("JOBS_MAX_RETRIES", "1"),
                ("JOBS_POLLING_INTERVAL_SECONDS", "2"),
                ("JOBS_LOG_JSON", "true"),
            ]))
            .unwrap();

        assert_eq!(settings.queue.max_retries, 1);
        assert_eq!(settings.queue.polling_interval, Duration::from_secs(2));
        assert!(settings.log_json);
    }

    #[test]
    fn bad_env_value_is_a_parse_error() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env_overrides(env_of(&[("JOBS_MAX_CONCURRENT_JOBS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(msg) if msg.contains("JOBS_MAX_CONCURRENT_JOBS")));
    }

    #[test]
    fn validation_catches_unsafe_values() {
        let cfg = QueueConfig {
            max_concurrent_jobs: 0,
            ..QueueConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let cfg = QueueConfig {
            stale_claim_threshold: Duration::from_secs(60),
            per_job_timeout: Duration::from_secs(300),
            ..QueueConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        assert!(Settings::from_toml_str("[queue]\nprogress_retention_hours = -1.0\n").is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nsweep_interval_seconds = 1\n[logging]\nlevel = \"debug\"").unwrap();

        let raw = load_raw_from_file(file.path()).unwrap();
        let settings = Settings::from_raw(raw).unwrap();
        assert_eq!(settings.queue.sweep_interval, Duration::from_secs(1));
        assert_eq!(settings.log_level, "debug");
    }
}
