use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default per-client quota of concurrently Confirmed appointments.
pub const DEFAULT_QUOTA: u32 = 3;

pub const DEFAULT_REPOSITORY_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;

/// How the quota applies when an existing appointment is moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RescheduleQuota {
    /// Reschedules never hit the quota.
    Skip,
    /// Count the owner's other appointments, not the one being moved.
    #[default]
    ExcludeSelf,
    /// Count every Confirmed appointment of the owner, including the one being moved.
    IncludeSelf,
}

impl FromStr for RescheduleQuota {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(RescheduleQuota::Skip),
            "exclude-self" | "exclude_self" => Ok(RescheduleQuota::ExcludeSelf),
            "include-self" | "include_self" => Ok(RescheduleQuota::IncludeSelf),
            _ => Err(ConfigError::Invalid {
                var: "BOOKD_RESCHEDULE_QUOTA",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Max Confirmed appointments per non-administrator client (Q).
    pub quota: u32,
    pub reschedule_quota: RescheduleQuota,
    /// Upper bound on any single repository call.
    pub repository_timeout: Duration,
    pub data_dir: PathBuf,
    /// WAL appends between compactions; 0 disables compaction.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quota: DEFAULT_QUOTA,
            reschedule_quota: RescheduleQuota::default(),
            repository_timeout: DEFAULT_REPOSITORY_TIMEOUT,
            data_dir: PathBuf::from("./data"),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(v) = lookup("BOOKD_QUOTA") {
            config.quota = parse_var("BOOKD_QUOTA", &v)?;
        }
        if let Some(v) = lookup("BOOKD_RESCHEDULE_QUOTA") {
            config.reschedule_quota = v.parse()?;
        }
        if let Some(v) = lookup("BOOKD_REPOSITORY_TIMEOUT_MS") {
            let ms: u64 = parse_var("BOOKD_REPOSITORY_TIMEOUT_MS", &v)?;
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    var: "BOOKD_REPOSITORY_TIMEOUT_MS",
                    value: v,
                });
            }
            config.repository_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("BOOKD_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BOOKD_COMPACT_THRESHOLD") {
            config.compact_threshold = parse_var("BOOKD_COMPACT_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("BOOKD_METRICS_PORT") {
            config.metrics_port = Some(parse_var("BOOKD_METRICS_PORT", &v)?);
        }

        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookd.wal")
    }
}

fn parse_var<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}
