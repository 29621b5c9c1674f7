use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Deserializer, Serialize, de};
use tracing::{debug, warn};

use crate::core::Outcome;
use crate::error::HookError;
use crate::monitor::RetryPolicy;

/// Shared config file, synced across the cluster by the host platform.
pub const DEFAULT_ENV_FILE: &str = "/etc/pve/healthchecks/variables.env";

/// Prefix of every configuration key, in the env file and the environment.
const KEY_PREFIX: &str = "HC_";

#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    #[serde(default, deserialize_with = "lenient")]
    pub base_domain: String,
    #[serde(default, deserialize_with = "lenient")]
    pub ping_domain: String,
    #[serde(default, deserialize_with = "lenient")]
    pub rw_api_key: String,
    #[serde(default, deserialize_with = "lenient")]
    pub ping_key: String,

    #[serde(default = "default_job_id", deserialize_with = "lenient")]
    pub job_id: String,

    /// Overrides for host discovery.
    #[serde(default, deserialize_with = "lenient_opt")]
    pub node: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt")]
    pub cluster: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt")]
    pub domain: Option<String>,

    #[serde(default = "default_timeout_secs", deserialize_with = "lenient")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_max_attempts", deserialize_with = "lenient")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms", deserialize_with = "lenient")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_factor", deserialize_with = "lenient")]
    pub retry_factor: f64,
    #[serde(default = "default_retry_max_delay_ms", deserialize_with = "lenient")]
    pub retry_max_delay_ms: u64,

    #[serde(default, deserialize_with = "lenient_opt")]
    pub target_outcome: Option<Outcome>,

    #[serde(default, deserialize_with = "lenient")]
    pub simulation: bool,
}

fn default_job_id() -> String {
    "job".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

impl HookConfig {
    /// Load configuration, lowest to highest precedence: env file, process
    /// environment (`HC_*`), command line overrides.
    pub fn load(env_file: &Path, overrides: &impl Serialize) -> Result<Self, HookError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(read_env_file(env_file)))
            .merge(Serialized::defaults(env_values()))
            .merge(Serialized::defaults(overrides));

        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, HookError> {
        let config: Self = figment.extract()?;
        config.validate()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            factor: self.retry_factor,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            request_timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    fn validate(mut self) -> Result<Self, HookError> {
        let missing: Vec<&str> = [
            ("HC_BASE_DOMAIN", &self.base_domain),
            ("HC_PING_DOMAIN", &self.ping_domain),
            ("HC_RW_API_KEY", &self.rw_api_key),
            ("HC_PING_KEY", &self.ping_key),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(HookError::Config(format!(
                "missing required configuration: {}",
                missing.join(", ")
            )));
        }

        self.base_domain = normalize_base_url("HC_BASE_DOMAIN", &self.base_domain)?;
        self.ping_domain = normalize_base_url("HC_PING_DOMAIN", &self.ping_domain)?;
        self.rw_api_key = self.rw_api_key.trim().to_string();
        self.ping_key = self.ping_key.trim().to_string();

        if self.job_id.trim().is_empty() {
            return Err(HookError::Config("HC_JOB_ID must not be empty".into()));
        }
        if self.retry_max_attempts == 0 {
            return Err(HookError::Config(
                "HC_RETRY_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        if !(self.retry_factor >= 1.0) {
            return Err(HookError::Config(
                "HC_RETRY_FACTOR must be at least 1.0".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(HookError::Config("HC_TIMEOUT_SECS must be positive".into()));
        }

        Ok(self)
    }
}

fn normalize_base_url(name: &str, value: &str) -> Result<String, HookError> {
    let trimmed = value.trim().trim_end_matches('/');
    let url = reqwest::Url::parse(trimmed)
        .map_err(|e| HookError::Config(format!("{} is not a valid URL: {}", name, e)))?;

    match url.scheme() {
        "http" | "https" => Ok(trimmed.to_string()),
        other => Err(HookError::Config(format!(
            "{} must use http or https, got {}",
            name, other
        ))),
    }
}

/// `HC_*` variables from the process environment, kept as raw strings.
///
/// Merging `Env` directly would type the values, so `HC_JOB_ID=007` would
/// arrive as the number 7 and yield a different slug than the env file.
fn env_values() -> BTreeMap<String, String> {
    Env::prefixed(KEY_PREFIX)
        .iter()
        .map(|(key, value)| (key.as_str().to_lowercase(), value))
        .collect()
}

/// Read the shared env file. A missing or unreadable file yields no values;
/// required keys are still enforced by validation.
fn read_env_file(path: &Path) -> BTreeMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_env_file(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No env file, using environment only");
            BTreeMap::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read env file");
            BTreeMap::new()
        }
    }
}

/// Parse `KEY=VALUE` lines. Only `HC_*` keys are kept, stripped of the prefix
/// and lowercased to line up with the environment provider.
pub fn parse_env_file(content: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        let Some(key) = key.trim().strip_prefix(KEY_PREFIX) else {
            continue;
        };

        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        values.insert(key.to_lowercase(), value.to_string());
    }

    values
}

/// Scalar as produced by any provider: env values are typed leniently, the
/// env file only yields strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<Scalar> for String {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::Bool(b) => b.to_string(),
            Scalar::UInt(n) => n.to_string(),
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(n) => n.to_string(),
            Scalar::Str(s) => s,
        }
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = String::from(Scalar::deserialize(deserializer)?);
    raw.trim().parse().map_err(de::Error::custom)
}

fn lenient_opt<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match Option::<Scalar>::deserialize(deserializer)? {
        None => Ok(None),
        Some(scalar) => {
            let raw = String::from(scalar);
            let raw = raw.trim();
            if raw.is_empty() {
                Ok(None)
            } else {
                raw.parse().map(Some).map_err(de::Error::custom)
            }
        }
    }
}
