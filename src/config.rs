use crate::acquisition::{ConcurrencyPolicy, DispatchMode, RetryPolicy};
use crate::error::{AppError, Result};
use crate::models::Location;
use crate::plan::Chunking;
use crate::tmy::{StatisticalMethod, TmyOptions, TmyType};
use crate::variables::{resolve_variables, ProviderVariable};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_WORKERS: usize = 8;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub project: ProjectConfig,
    pub location: Location,
    pub period: PeriodConfig,
    #[serde(default)]
    pub variables: Vec<String>,
    pub source: SourceConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub tmy: TmyConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    pub directory: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PeriodConfig {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub chunking: Chunking,
}

fn default_timeout_seconds() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcquisitionConfig {
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub inter_request_delay_ms: u64,
    #[serde(default = "default_retry_delays")]
    pub retry_delays_seconds: Vec<u64>,
    #[serde(default)]
    pub allow_partial: bool,
}

fn default_worker_count() -> usize {
    4
}

fn default_retry_delays() -> Vec<u64> {
    vec![30, 60, 120]
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            worker_count: default_worker_count(),
            inter_request_delay_ms: 0,
            retry_delays_seconds: default_retry_delays(),
            allow_partial: false,
        }
    }
}

impl AcquisitionConfig {
    pub fn concurrency_policy(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy {
            mode: self.mode,
            worker_count: self.worker_count,
            inter_request_delay: Duration::from_millis(self.inter_request_delay_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_delays_seconds
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TmyConfig {
    #[serde(default)]
    pub tmy_type: TmyType,
    #[serde(default)]
    pub method: StatisticalMethod,
    #[serde(default = "default_bias_weight")]
    pub extreme_bias_weight: f64,
}

fn default_bias_weight() -> f64 {
    1.0
}

impl Default for TmyConfig {
    fn default() -> Self {
        Self {
            tmy_type: TmyType::default(),
            method: StatisticalMethod::default(),
            extreme_bias_weight: default_bias_weight(),
        }
    }
}

impl TmyConfig {
    pub fn options(&self) -> TmyOptions {
        TmyOptions {
            tmy_type: self.tmy_type,
            method: self.method,
            extreme_bias_weight: self.extreme_bias_weight,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    File,
    Postgres,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackend,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_db_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

/// Custom deserializer that handles port as both number and string
///
/// Accepts:
/// - `port: 5432` (number)
/// - `port: "5432"` (string that parses to number)
/// - `port: ${DB_PORT}` (env var substituted to either)
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        String(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => Ok(n),
        PortValue::String(s) => s
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid port number: '{}'", s))),
    }
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Provider variables the configured selection expands to.
    pub fn provider_variables(&self) -> Result<Vec<ProviderVariable>> {
        resolve_variables(&self.variables)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables
    /// - Coordinates and date ordering
    /// - Worker pool bounds and a non-empty retry schedule
    /// - Valid HTTPS source URL
    /// - Database settings when the postgres backend is selected
    fn validate(&self) -> Result<()> {
        if self.source.api_key.contains("${") || self.source.base_url.contains("${") {
            return Err(AppError::Config(
                "Source environment variables are not set. \
                 Please set them or create a .env file."
                    .to_string(),
            ));
        }

        if !(-90.0..=90.0).contains(&self.location.latitude) {
            return Err(AppError::Config(format!(
                "Latitude {} must be between -90 and 90",
                self.location.latitude
            )));
        }

        if !(-180.0..=180.0).contains(&self.location.longitude) {
            return Err(AppError::Config(format!(
                "Longitude {} must be between -180 and 180",
                self.location.longitude
            )));
        }

        if self.period.start > self.period.end {
            return Err(AppError::Config(format!(
                "Period start {} is after end {}",
                self.period.start, self.period.end
            )));
        }

        if self.acquisition.worker_count == 0 || self.acquisition.worker_count > MAX_WORKERS {
            return Err(AppError::Config(format!(
                "Acquisition worker_count {} must be between 1 and {}",
                self.acquisition.worker_count, MAX_WORKERS
            )));
        }

        if self.acquisition.retry_delays_seconds.is_empty() {
            return Err(AppError::Config(
                "Acquisition retry_delays_seconds must contain at least one delay".to_string(),
            ));
        }

        if self.acquisition.mode == DispatchMode::Sequential
            && self.acquisition.inter_request_delay_ms == 0
        {
            tracing::warn!(
                "Sequential acquisition without inter_request_delay_ms may still hit upstream rate limits"
            );
        }

        if self.source.timeout_seconds == 0 {
            return Err(AppError::Config(
                "Source timeout_seconds must be greater than 0".to_string(),
            ));
        }

        // Validate base URL format
        match url::Url::parse(&self.source.base_url) {
            Err(e) => {
                return Err(AppError::Config(format!(
                    "Invalid source base_url '{}': {}",
                    self.source.base_url, e
                )));
            }
            Ok(parsed) if parsed.scheme() != "https" => {
                return Err(AppError::Config(format!(
                    "Source base_url must use HTTPS, got: {}",
                    parsed.scheme()
                )));
            }
            Ok(_) => {}
        }

        if !self.tmy.extreme_bias_weight.is_finite() || self.tmy.extreme_bias_weight < 0.0 {
            return Err(AppError::Config(format!(
                "TMY extreme_bias_weight {} must be a non-negative number",
                self.tmy.extreme_bias_weight
            )));
        }

        self.provider_variables()?;

        if self.state.backend == StateBackend::Postgres {
            let database = self.database.as_ref().ok_or_else(|| {
                AppError::Config(
                    "State backend 'postgres' requires a database section".to_string(),
                )
            })?;
            database.validate()?;
        }

        Ok(())
    }
}

impl DatabaseConfig {
    fn validate(&self) -> Result<()> {
        let fields_to_check = [
            ("DB_HOST", &self.host),
            ("DB_NAME", &self.name),
            ("DB_USER", &self.user),
            ("DB_PASSWORD", &self.password),
        ];

        for (field_name, value) in &fields_to_check {
            if value.contains("${") {
                return Err(AppError::Config(format!(
                    "{} environment variable is not set. \
                     Please set it or create a .env file.",
                    field_name
                )));
            }
        }

        if self.host.is_empty() || self.name.is_empty() || self.user.is_empty() {
            return Err(AppError::Config(
                "Database host, name and user cannot be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(AppError::Config("Database port cannot be 0".to_string()));
        }

        if self.max_connections == 0 || self.max_connections > 100 {
            return Err(AppError::Config(format!(
                "Database max_connections {} must be between 1 and 100",
                self.max_connections
            )));
        }

        Ok(())
    }
}

/// Substitute `${VAR}` and `${VAR:-default}` references. Comment lines are
/// left untouched.
fn expand_env_vars(content: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .map_err(|e| AppError::Config(format!("Invalid substitution pattern: {}", e)))?;

    let mut missing: Vec<String> = Vec::new();
    let mut expanded = String::with_capacity(content.len());

    for line in content.lines() {
        if line.trim_start().starts_with('#') {
            expanded.push_str(line);
        } else {
            let replaced = re.replace_all(line, |caps: &regex_lite::Captures| {
                match (std::env::var(&caps[1]), caps.get(2)) {
                    (Ok(value), _) => value,
                    (Err(_), Some(default)) => default.as_str().to_string(),
                    (Err(_), None) => {
                        missing.push(caps[1].to_string());
                        String::new()
                    }
                }
            });
            expanded.push_str(&replaced);
        }
        expanded.push('\n');
    }

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(AppError::Config(format!(
            "Config references unset environment variable(s): {}. \
             Export them or add them to a .env file (see .env.example).",
            missing.join(", ")
        )));
    }

    Ok(expanded)
}
