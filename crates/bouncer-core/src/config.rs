use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::debug;

use crate::error::BouncerError;

pub const DEFAULT_TOTAL_RETRIES: i32 = 3;
pub const LOG_FILE_NAME: &str = "crowdsec-custom-bouncer.log";

/// Snapshot of the bouncer configuration. Loaded once at startup and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BouncerConfig {
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub bin_path: PathBuf,
    #[serde(default)]
    pub bin_args: Vec<String>,
    #[serde(default)]
    pub feed_via_stdin: bool,
    #[serde(default = "default_total_retries")]
    pub total_retries: i32,
    #[serde(
        default = "default_update_frequency",
        deserialize_with = "crate::duration::deserialize",
        skip_serializing
    )]
    pub update_frequency: Duration,
    #[serde(
        default = "default_cache_retention",
        deserialize_with = "crate::duration::deserialize",
        skip_serializing
    )]
    pub cache_retention_duration: Duration,
    #[serde(default, alias = "include_scenarios_containing")]
    pub scenarios_containing: Vec<String>,
    #[serde(default, alias = "exclude_scenarios_containing")]
    pub scenarios_not_containing: Vec<String>,
    #[serde(default, alias = "only_include_decisions_from")]
    pub origins: Vec<String>,
    #[serde(flatten)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_mode: LogMode,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    Stdout,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl LoggingConfig {
    pub fn log_file(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/log/"))
            .join(LOG_FILE_NAME)
    }
}

/// How the bouncer authenticates to the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    Certificate { cert_path: PathBuf, key_path: PathBuf },
}

/// How many times the enforcement program may be respawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    Limited(u32),
    Unlimited,
}

fn default_total_retries() -> i32 {
    DEFAULT_TOTAL_RETRIES
}

fn default_update_frequency() -> Duration {
    Duration::from_secs(10)
}

fn default_cache_retention() -> Duration {
    Duration::from_secs(10)
}

impl BouncerConfig {
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: BouncerConfig = serde_yaml::from_str(contents).context("parse config YAML")?;
        if config.update_frequency.is_zero() {
            return Err(BouncerError::InvalidConfig(
                "update_frequency must be greater than zero".to_string(),
            )
            .into());
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let merged = merged_yaml(path)?;
        Self::from_yaml_str(&merged)
    }

    /// Startup validation. Runs before any network or process activity and
    /// is never retried.
    pub fn validate(&self) -> Result<Credentials, BouncerError> {
        if self.bin_path.as_os_str().is_empty() {
            return Err(BouncerError::BinPathNotSet);
        }
        if !self.bin_path.exists() {
            return Err(BouncerError::BinaryNotFound(self.bin_path.clone()));
        }
        self.credentials()
    }

    /// An API key wins over a certificate pair when both are present.
    pub fn credentials(&self) -> Result<Credentials, BouncerError> {
        if let Some(key) = self.api_key.as_deref().filter(|key| !key.is_empty()) {
            return Ok(Credentials::ApiKey(key.to_string()));
        }
        match (&self.cert_path, &self.key_path) {
            (Some(cert_path), Some(key_path)) => Ok(Credentials::Certificate {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            _ => Err(BouncerError::MissingCredential),
        }
    }

    pub fn retry_budget(&self) -> RetryBudget {
        if self.total_retries < 0 {
            RetryBudget::Unlimited
        } else {
            RetryBudget::Limited(self.total_retries as u32)
        }
    }
}

/// Returns the configuration text with `<path>.local` merged over it, if
/// such a file exists.
pub fn merged_yaml(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read config at {}", path.display()))?;
    let local_path = local_overlay_path(path);
    if !local_path.exists() {
        return Ok(contents);
    }
    debug!("merging config overlay {}", local_path.display());

    let overlay = fs::read_to_string(&local_path)
        .with_context(|| format!("read config overlay at {}", local_path.display()))?;
    let mut base: Value = serde_yaml::from_str(&contents).context("parse config YAML")?;
    let overlay: Value = serde_yaml::from_str(&overlay)
        .with_context(|| format!("parse config overlay {}", local_path.display()))?;
    merge_values(&mut base, overlay);
    let output = serde_yaml::to_string(&base).context("render merged config YAML")?;
    Ok(output)
}

fn local_overlay_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".local");
    PathBuf::from(name)
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
api_url: http://localhost:8080/
api_key: secret
bin_path: /bin/sh
";

    #[test]
    fn test_defaults() {
        let config = BouncerConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.total_retries, DEFAULT_TOTAL_RETRIES);
        assert_eq!(config.update_frequency, Duration::from_secs(10));
        assert_eq!(config.cache_retention_duration, Duration::from_secs(10));
        assert!(!config.feed_via_stdin);
        assert!(config.bin_args.is_empty());
        assert_eq!(config.logging.log_mode, LogMode::Stdout);
        assert_eq!(config.logging.log_level, LogLevel::Info);
    }

    #[test]
    fn test_dollar_in_api_key_is_literal() {
        let config = BouncerConfig::from_yaml_str(
            "api_url: http://localhost/\napi_key: foo$bar\nbin_path: /bin/sh\n",
        )
        .unwrap();
        assert_eq!(
            config.credentials().unwrap(),
            Credentials::ApiKey("foo$bar".to_string())
        );
    }

    #[test]
    fn test_unknown_keys_and_legacy_names() {
        let config = BouncerConfig::from_yaml_str(
            "
api_url: http://localhost/
api_key: k
bin_path: /bin/sh
update_frequency: 0.1s
total_retries: -1
daemonize: false
prometheus:
  enabled: false
include_scenarios_containing: [ssh]
exclude_scenarios_containing: [http]
only_include_decisions_from: [cscli, crowdsec]
",
        )
        .unwrap();
        assert_eq!(config.update_frequency, Duration::from_millis(100));
        assert_eq!(config.retry_budget(), RetryBudget::Unlimited);
        assert_eq!(config.scenarios_containing, vec!["ssh"]);
        assert_eq!(config.scenarios_not_containing, vec!["http"]);
        assert_eq!(config.origins, vec!["cscli", "crowdsec"]);
    }

    #[test]
    fn test_zero_update_frequency_rejected() {
        let result = BouncerConfig::from_yaml_str(
            "api_url: http://localhost/\nbin_path: /bin/sh\nupdate_frequency: 0s\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_huge_update_frequency_rejected() {
        let result = BouncerConfig::from_yaml_str(
            "api_url: http://localhost/\nbin_path: /bin/sh\nupdate_frequency: 99999999999999999999999h\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_credential() {
        let mut config = BouncerConfig::from_yaml_str(MINIMAL).unwrap();
        config.api_key = None;
        assert!(matches!(config.validate(), Err(BouncerError::MissingCredential)));

        config.api_key = Some(String::new());
        assert!(matches!(config.validate(), Err(BouncerError::MissingCredential)));

        config.cert_path = Some(PathBuf::from("/tmp/bouncer.crt"));
        assert!(matches!(config.validate(), Err(BouncerError::MissingCredential)));

        config.key_path = Some(PathBuf::from("/tmp/bouncer.key"));
        assert!(matches!(
            config.validate(),
            Ok(Credentials::Certificate { .. })
        ));
    }

    #[test]
    fn test_missing_binary_checked_first() {
        let mut config = BouncerConfig::from_yaml_str(MINIMAL).unwrap();
        config.api_key = None;
        config.bin_path = PathBuf::from("/does/not/exist");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, BouncerError::BinaryNotFound(_)));
        assert_eq!(err.to_string(), "binary '/does/not/exist' doesn't exist");

        config.bin_path = PathBuf::new();
        assert!(matches!(config.validate(), Err(BouncerError::BinPathNotSet)));
    }

    #[test]
    fn test_local_overlay_is_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bouncer.yaml");
        fs::write(
            &path,
            "api_url: http://localhost/\napi_key: from-main\nbin_path: /bin/sh\nbin_args: [a, b]\nprometheus:\n  enabled: false\n  listen_port: 60602\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("bouncer.yaml.local"),
            "api_key: from-local\nbin_args: [c]\nprometheus:\n  enabled: true\n",
        )
        .unwrap();

        let merged: Value = serde_yaml::from_str(&merged_yaml(&path).unwrap()).unwrap();
        assert_eq!(merged["prometheus"]["listen_port"], Value::from(60602));
        assert_eq!(merged["prometheus"]["enabled"], Value::from(true));

        let config = BouncerConfig::load(&path).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("from-local"));
        assert_eq!(config.bin_args, vec!["c"]);
    }

    #[test]
    fn test_log_file_location() {
        let config = BouncerConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(
            config.logging.log_file(),
            PathBuf::from("/var/log/crowdsec-custom-bouncer.log")
        );
    }
}
