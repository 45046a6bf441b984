//! Configuration types for nzb-repair
//!
//! The config file is YAML. Every field has a default so a minimal file
//! only needs provider descriptors; worker counts default to the sum of
//! the respective providers' connection limits.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const PROVIDER_MAX_CONNECTIONS_DEFAULT: usize = 10;
const PROVIDER_MAX_IDLE_SECONDS_DEFAULT: u64 = 2400;
const WORKERS_DEFAULT: usize = 10;

/// One configured Usenet provider endpoint
///
/// Immutable after config load; zero values for `max_connections` and
/// `max_idle_seconds` are replaced with defaults during merge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for plain, 563 for TLS)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Number of connections to maintain (default: 10)
    #[serde(default)]
    pub max_connections: usize,

    /// Seconds an idle connection may be reused before reconnecting (default: 2400)
    #[serde(default)]
    pub max_idle_seconds: u64,

    /// Use implicit TLS
    #[serde(default)]
    pub tls: bool,
}

fn default_port() -> u16 {
    119
}

/// How re-posted articles are labelled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObfuscationPolicy {
    /// Keep the original filename and a conventional subject line
    #[default]
    None,
    /// Replace filename and subject with fresh random strings
    Full,
}

/// Upload behavior settings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Obfuscation policy for re-posted segments (default: none)
    #[serde(default)]
    pub obfuscation_policy: ObfuscationPolicy,
}

/// Main configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Concurrent download tasks per file (default: sum of download
    /// providers' `max_connections`, fallback 10)
    #[serde(default)]
    pub download_workers: usize,

    /// Concurrent upload tasks per file (default: sum of upload
    /// providers' `max_connections`, fallback 10)
    #[serde(default)]
    pub upload_workers: usize,

    /// Base folder for per-job working directories (default: "./")
    #[serde(default = "default_download_folder")]
    pub download_folder: PathBuf,

    /// Providers used for fetching article bodies
    #[serde(default)]
    pub download_providers: Vec<ProviderConfig>,

    /// Providers used for posting repaired segments
    #[serde(default)]
    pub upload_providers: Vec<ProviderConfig>,

    /// Path to the par2 executable (downloaded when unset)
    #[serde(default)]
    pub par2_exe: Option<PathBuf>,

    /// Upload behavior
    #[serde(default)]
    pub upload: UploadConfig,

    /// Interval between recursive scans in watch mode (default: 5 minutes)
    #[serde(default = "default_scan_interval", with = "duration_serde")]
    pub scan_interval: Duration,

    /// Failed-job retries before the file is moved to the broken folder (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,

    /// Folder that exhausted failed files are moved into (default: "broken")
    #[serde(default = "default_broken_folder")]
    pub broken_folder: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_workers: WORKERS_DEFAULT,
            upload_workers: WORKERS_DEFAULT,
            download_folder: default_download_folder(),
            download_providers: Vec::new(),
            upload_providers: Vec::new(),
            par2_exe: None,
            upload: UploadConfig::default(),
            scan_interval: default_scan_interval(),
            max_retries: default_max_retries(),
            broken_folder: default_broken_folder(),
        }
    }
}

impl Config {
    /// Load a config file and apply defaulting
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let cfg: Config = serde_yaml::from_str(&data)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        Ok(cfg.merge_with_defaults())
    }

    /// Replace zero values with defaults and derive worker counts from
    /// provider connection limits
    pub fn merge_with_defaults(mut self) -> Self {
        let mut download_connections = 0;
        for p in &mut self.download_providers {
            merge_provider_defaults(p);
            download_connections += p.max_connections;
        }
        if self.download_workers == 0 {
            self.download_workers = if download_connections > 0 {
                download_connections
            } else {
                WORKERS_DEFAULT
            };
        }

        let mut upload_connections = 0;
        for p in &mut self.upload_providers {
            merge_provider_defaults(p);
            upload_connections += p.max_connections;
        }
        if self.upload_workers == 0 {
            self.upload_workers = if upload_connections > 0 {
                upload_connections
            } else {
                WORKERS_DEFAULT
            };
        }

        if self.scan_interval.is_zero() {
            self.scan_interval = default_scan_interval();
        }
        if self.max_retries == 0 {
            self.max_retries = default_max_retries();
        }
        if self.broken_folder.as_os_str().is_empty() {
            self.broken_folder = default_broken_folder();
        }

        self
    }
}

fn merge_provider_defaults(p: &mut ProviderConfig) {
    if p.max_connections == 0 {
        p.max_connections = PROVIDER_MAX_CONNECTIONS_DEFAULT;
    }
    if p.max_idle_seconds == 0 {
        p.max_idle_seconds = PROVIDER_MAX_IDLE_SECONDS_DEFAULT;
    }
}

fn default_download_folder() -> PathBuf {
    PathBuf::from("./")
}

fn default_scan_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_max_retries() -> i64 {
    3
}

fn default_broken_folder() -> PathBuf {
    PathBuf::from("broken")
}

/// Serde helper for durations: serializes as whole seconds, deserializes
/// either an integer number of seconds or a duration string like "5m",
/// "90s", "1h30m".
mod duration_serde {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text).map_err(D::Error::custom),
        }
    }

    pub(super) fn parse_duration(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty duration".to_string());
        }

        let mut total = Duration::ZERO;
        let mut number = String::new();
        for c in text.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }
            let value: u64 = number
                .parse()
                .map_err(|_| format!("invalid duration {text:?}"))?;
            number.clear();
            let unit = match c {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                other => return Err(format!("unknown duration unit {other:?} in {text:?}")),
            };
            total += Duration::from_secs(value * unit);
        }
        if !number.is_empty() {
            // Bare number: seconds
            let value: u64 = number
                .parse()
                .map_err(|_| format!("invalid duration {text:?}"))?;
            total += Duration::from_secs(value);
        }
        Ok(total)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn provider(max_connections: usize) -> ProviderConfig {
        ProviderConfig {
            host: "news.example.com".to_string(),
            port: 563,
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            max_connections,
            max_idle_seconds: 0,
            tls: true,
        }
    }

    #[test]
    fn provider_defaults_are_applied() {
        let cfg = Config {
            download_providers: vec![provider(0)],
            ..Default::default()
        }
        .merge_with_defaults();

        assert_eq!(cfg.download_providers[0].max_connections, 10);
        assert_eq!(cfg.download_providers[0].max_idle_seconds, 2400);
    }

    #[test]
    fn worker_counts_default_to_sum_of_provider_connections() {
        let cfg = Config {
            download_workers: 0,
            upload_workers: 0,
            download_providers: vec![provider(4), provider(6)],
            upload_providers: vec![provider(3)],
            ..Default::default()
        }
        .merge_with_defaults();

        assert_eq!(cfg.download_workers, 10);
        assert_eq!(cfg.upload_workers, 3);
    }

    #[test]
    fn worker_counts_fall_back_to_ten_without_providers() {
        let cfg = Config {
            download_workers: 0,
            upload_workers: 0,
            download_providers: vec![],
            upload_providers: vec![],
            ..Default::default()
        }
        .merge_with_defaults();

        assert_eq!(cfg.download_workers, 10);
        assert_eq!(cfg.upload_workers, 10);
    }

    #[test]
    fn explicit_worker_counts_are_preserved() {
        let cfg = Config {
            download_workers: 2,
            download_providers: vec![provider(50)],
            ..Default::default()
        }
        .merge_with_defaults();

        assert_eq!(cfg.download_workers, 2);
    }

    #[test]
    fn parses_yaml_with_duration_string_and_policy() {
        let yaml = r#"
download_providers:
  - host: news.example.com
    port: 563
    username: u
    password: p
    max_connections: 20
    tls: true
upload_providers:
  - host: post.example.com
upload:
  obfuscation_policy: full
scan_interval: 10m
max_retries: 5
broken_folder: dead
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let cfg = cfg.merge_with_defaults();

        assert_eq!(cfg.download_workers, 20);
        assert_eq!(cfg.upload_workers, 10);
        assert_eq!(cfg.upload.obfuscation_policy, ObfuscationPolicy::Full);
        assert_eq!(cfg.scan_interval, Duration::from_secs(600));
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.broken_folder, PathBuf::from("dead"));
        assert_eq!(cfg.upload_providers[0].port, 119);
        assert!(!cfg.upload_providers[0].tls);
    }

    #[test]
    fn scan_interval_defaults_to_five_minutes() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        let cfg = cfg.merge_with_defaults();
        assert_eq!(cfg.scan_interval, Duration::from_secs(300));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.broken_folder, PathBuf::from("broken"));
        assert_eq!(cfg.download_folder, PathBuf::from("./"));
    }

    #[test]
    fn parse_duration_accepts_compound_and_bare_values() {
        use super::duration_serde::parse_duration;

        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("").is_err());
    }
}
