use crate::db::models::ObservationField;
use crate::error::{AppError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "WEATHER_INGEST_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

const MAX_BATCH_SIZE: usize = 2000;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    pub stations: StationsConfig,
    pub report: ReportConfig,
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
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

fn default_db_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    10
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

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Provenance tag stamped on every record of the run.
    pub tag: String,
    /// Source tag -> station id, used for flat readings.
    #[serde(default)]
    pub station_aliases: HashMap<String, String>,
    pub input: InputConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InputConfig {
    Local {
        dir: PathBuf,
        #[serde(default = "default_pattern")]
        pattern: String,
    },
    Http {
        base_url: String,
        #[serde(default = "default_request_delay_ms")]
        request_delay_ms: u64,
    },
}

fn default_pattern() -> String {
    "*.jsonl".to_string()
}

fn default_request_delay_ms() -> u64 {
    500 // 500ms delay between requests
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_failure_sample_size")]
    pub failure_sample_size: usize,
    /// Load into the in-memory store instead of PostgreSQL.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            failure_sample_size: default_failure_sample_size(),
            dry_run: false,
        }
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_failure_sample_size() -> usize {
    10
}

/// Inclusive range; an open side is unbounded.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
pub struct Bound {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl Bound {
    pub const fn between(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub const fn at_least(min: f64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Physical plausibility bands shared by the store constraints and the auditor.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct QualityBounds {
    pub temperature_c: Bound,
    pub humidity_pct: Bound,
    pub pressure_hpa: Bound,
    pub wind_dir_deg: Bound,
    pub cloud_cover_octas: Bound,
}

impl Default for QualityBounds {
    fn default() -> Self {
        Self {
            temperature_c: Bound::between(-60.0, 60.0),
            humidity_pct: Bound::between(0.0, 100.0),
            pressure_hpa: Bound::between(870.0, 1084.0),
            wind_dir_deg: Bound::between(0.0, 360.0),
            cloud_cover_octas: Bound::between(0.0, 8.0),
        }
    }
}

impl QualityBounds {
    /// Band for a numeric field, `None` when the field is unconstrained.
    pub fn for_field(&self, field: ObservationField) -> Option<Bound> {
        match field {
            ObservationField::TemperatureC => Some(self.temperature_c),
            ObservationField::HumidityPct => Some(self.humidity_pct),
            ObservationField::PressureHpa => Some(self.pressure_hpa),
            ObservationField::WindDirDeg => Some(self.wind_dir_deg),
            ObservationField::CloudCoverOctas => Some(self.cloud_cover_octas),
            ObservationField::WindSpeedKmh
            | ObservationField::WindGustKmh
            | ObservationField::PrecipRateMm
            | ObservationField::PrecipAccumMm
            | ObservationField::Precip1hMm
            | ObservationField::Precip3hMm
            | ObservationField::VisibilityM
            | ObservationField::SnowDepthCm
            | ObservationField::UvIndex
            | ObservationField::SolarRadiationWm2 => Some(Bound::at_least(0.0)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QualityConfig {
    #[serde(default)]
    pub bounds: QualityBounds,
    /// Placeholder station ids emitted by upstream extractors.
    #[serde(default = "default_unknown_station_ids")]
    pub unknown_station_ids: Vec<String>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            bounds: QualityBounds::default(),
            unknown_station_ids: default_unknown_station_ids(),
        }
    }
}

fn default_unknown_station_ids() -> Vec<String> {
    ["UNKNOWN", "WU:UNKNOWN", "SRC1:UNKNOWN"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StationsConfig {
    pub registry_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    pub output_path: PathBuf,
    #[serde(default)]
    pub observations_path: Option<PathBuf>,
}

impl Config {
    /// Config file path: `WEATHER_INGEST_CONFIG` if set, else `config/config.yaml`.
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

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

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables
    /// - Non-empty database fields and a usable port
    /// - An HTTPS base URL for remote input
    /// - Batch size limits
    /// - Ordered quality bounds
    fn validate(&self) -> Result<()> {
        let fields_to_check = [
            ("DB_HOST", &self.database.host),
            ("DB_NAME", &self.database.name),
            ("DB_USER", &self.database.user),
            ("DB_PASSWORD", &self.database.password),
        ];

        for (field_name, value) in &fields_to_check {
            if value.contains("${") {
                return Err(AppError::Config(format!(
                    "{} environment variable is not set. \
                     Please set it or create a .env file. \
                     See .env.example for required variables.",
                    field_name
                )));
            }
        }

        if self.database.host.is_empty() {
            return Err(AppError::Config(
                "Database host cannot be empty".to_string(),
            ));
        }

        if self.database.name.is_empty() {
            return Err(AppError::Config(
                "Database name cannot be empty".to_string(),
            ));
        }

        if self.database.user.is_empty() {
            return Err(AppError::Config(
                "Database user cannot be empty".to_string(),
            ));
        }

        // u16 max is 65535, so no upper bound check needed
        if self.database.port == 0 {
            return Err(AppError::Config("Database port cannot be 0".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "Database max_connections must be at least 1".to_string(),
            ));
        }

        if self.database.max_connections > 100 {
            return Err(AppError::Config(format!(
                "Database max_connections {} seems too high, maximum recommended is 100",
                self.database.max_connections
            )));
        }

        if self.database.connect_timeout_seconds == 0 {
            return Err(AppError::Config(
                "Database connect_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.source.tag.trim().is_empty() {
            return Err(AppError::Config("Source tag cannot be empty".to_string()));
        }

        match &self.source.input {
            InputConfig::Http { base_url, .. } => {
                let parsed = url::Url::parse(base_url).map_err(|e| {
                    AppError::Config(format!("Invalid source base_url '{}': {}", base_url, e))
                })?;
                if parsed.scheme() != "https" {
                    return Err(AppError::Config(format!(
                        "Source base_url must use HTTPS, got: {}",
                        parsed.scheme()
                    )));
                }
            }
            InputConfig::Local { pattern, .. } => {
                if let Err(e) = glob::Pattern::new(pattern) {
                    return Err(AppError::Config(format!(
                        "Invalid source pattern '{}': {}",
                        pattern, e
                    )));
                }
            }
        }

        if self.loader.batch_size == 0 || self.loader.batch_size > MAX_BATCH_SIZE {
            return Err(AppError::Config(format!(
                "Loader batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.loader.batch_size
            )));
        }

        if self.loader.batch_size > 1000 {
            tracing::warn!(
                "Loader batch_size of {} is large, a single rejected statement replays that many rows",
                self.loader.batch_size
            );
        }

        for field in ObservationField::numeric() {
            if let Some(Bound {
                min: Some(min),
                max: Some(max),
            }) = self.quality.bounds.for_field(field)
            {
                if min > max {
                    return Err(AppError::Config(format!(
                        "Quality bound for {} is inverted: min {} > max {}",
                        field, min, max
                    )));
                }
            }
        }

        Ok(())
    }
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid substitution pattern: {}", e)))?;

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root (copy .env.example)\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}
