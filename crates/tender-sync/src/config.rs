//! Run configuration: defaults, then `tender.yaml`, then `TENDER_*` environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tender_core::{ErrorKind, FilterError, SearchFilters};
use tender_storage::BackoffPolicy;
use thiserror::Error;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://tender.nprocure.com";
pub const DEFAULT_CONFIG_FILE: &str = "tender.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidVar { key: String, value: String },
    #[error("unknown output format {0:?} (expected json, ndjson, parquet or postgres)")]
    UnknownFormat(String),
    #[error("invalid base url {url:?}: {message}")]
    BaseUrl { url: String, message: String },
    #[error("postgres output requires DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("reading config file {}: {message}", path.display())]
    File { path: PathBuf, message: String },
    #[error("invalid search filters: {0}")]
    Filters(#[from] FilterError),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigurationError
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Ndjson,
    Parquet,
    Postgres,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Ndjson => "ndjson",
            Self::Parquet => "parquet",
            Self::Postgres => "postgres",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "ndjson" | "jsonl" => Ok(Self::Ndjson),
            "parquet" => Ok(Self::Parquet),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(ConfigError::UnknownFormat(s.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    pub concurrency: usize,
    pub rate_limit_secs: f64,
    pub max_retries: usize,
    pub timeout_secs: u64,
    pub limit: Option<usize>,
    pub output_format: OutputFormat,
    pub output_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub user_agent: String,
    /// Never serialized into run metadata; it may carry credentials.
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
    pub dry_run: bool,
    pub save_raw_pages: bool,
    pub keep_raw_snippet: bool,
    pub filters: SearchFilters,
    pub scraper_version: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            concurrency: 3,
            rate_limit_secs: 1.0,
            max_retries: 3,
            timeout_secs: 30,
            limit: None,
            output_format: OutputFormat::Json,
            output_dir: PathBuf::from("data/output"),
            metadata_dir: PathBuf::from("data/metadata"),
            artifacts_dir: PathBuf::from("data/artifacts"),
            user_agent: format!("tender-bot/{}", env!("CARGO_PKG_VERSION")),
            database_url: None,
            dry_run: false,
            save_raw_pages: false,
            keep_raw_snippet: false,
            filters: SearchFilters::default(),
            scraper_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(key).filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidVar {
            key: key.to_string(),
            value: raw,
        })
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

impl SyncConfig {
    /// Defaults, the YAML file named by `TENDER_CONFIG` (or `tender.yaml` when
    /// present), then process environment. Call after `.env` has been loaded.
    pub fn from_env() -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let mut config = match lookup("TENDER_CONFIG") {
            Some(path) => Self::from_yaml_file(Path::new(&path))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_yaml_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::File {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_yaml_str(&text).map_err(|err| match err {
            ConfigError::File { message, .. } => ConfigError::File {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Keys missing from the document keep their defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|err| ConfigError::File {
            path: PathBuf::from(DEFAULT_CONFIG_FILE),
            message: err.to_string(),
        })
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("TENDER_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.base_url = v.trim().to_string();
        }
        if let Some(v) = parse_var(&lookup, "TENDER_CONCURRENCY")? {
            self.concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "TENDER_RATE_LIMIT_SECS")? {
            self.rate_limit_secs = v;
        }
        if let Some(v) = parse_var(&lookup, "TENDER_MAX_RETRIES")? {
            self.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "TENDER_TIMEOUT_SECS")? {
            self.timeout_secs = v;
        }
        if let Some(v) = parse_var::<PathBuf>(&lookup, "TENDER_OUTPUT_DIR")? {
            self.output_dir = v;
        }
        if let Some(v) = parse_var::<PathBuf>(&lookup, "TENDER_METADATA_DIR")? {
            self.metadata_dir = v;
        }
        if let Some(v) = parse_var::<PathBuf>(&lookup, "TENDER_ARTIFACTS_DIR")? {
            self.artifacts_dir = v;
        }
        if let Some(v) = lookup("TENDER_USER_AGENT").filter(|v| !v.trim().is_empty()) {
            self.user_agent = v;
        }
        if let Some(v) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.database_url = Some(v);
        }
        Ok(())
    }

    /// Checked before any worker starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("concurrency", self.concurrency as f64, 1.0, 10.0)?;
        check_range("rate_limit_secs", self.rate_limit_secs, 0.1, 10.0)?;
        check_range("max_retries", self.max_retries as f64, 1.0, 10.0)?;
        check_range("timeout_secs", self.timeout_secs as f64, 5.0, 300.0)?;
        self.base_url()?;
        if self.output_format == OutputFormat::Postgres
            && !self.dry_run
            && self.database_url.as_deref().map_or(true, |url| url.trim().is_empty())
        {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        self.filters.validate()?;
        Ok(())
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url).map_err(|err| ConfigError::BaseUrl {
            url: self.base_url.clone(),
            message: err.to_string(),
        })
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            attempt_timeout: Duration::from_secs(self.timeout_secs),
            ..BackoffPolicy::default()
        }
    }

    /// Snapshot stored in `RunMetadata.config`.
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_default()
    }
}
