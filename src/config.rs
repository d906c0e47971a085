use std::path::Path;

use chrono::NaiveDate;
use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::session::SessionPolicy;
use crate::signal::ThresholdConfig;

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_data_dir() -> String {
    "./data".into()
}

fn default_provider_name() -> String {
    "yahoo".into()
}

fn default_provider_base_url() -> String {
    "https://query2.finance.yahoo.com".into()
}

fn default_requests_per_second() -> u32 {
    2
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_merge_gap_sessions() -> usize {
    20
}

fn default_timezone() -> String {
    "America/New_York".into()
}

fn default_close_time() -> String {
    "16:00".into()
}

fn default_finalization_delay_minutes() -> i64 {
    60
}

fn default_provisional_ttl_secs() -> u64 {
    300
}

fn default_threshold_version() -> u32 {
    1
}

/// Upper bound on the finalization delay. A longer delay would leave the
/// previous session unfinalized while the current one is already open.
pub const MAX_FINALIZATION_DELAY_MINUTES: i64 = 8 * 60;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Accepted values: `"text"` | `"json"`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Missing dates separated by at most this many present sessions share one request.
    #[serde(default = "default_merge_gap_sessions")]
    pub merge_gap_sessions: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: default_provider_base_url(),
            requests_per_second: default_requests_per_second(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            merge_gap_sessions: default_merge_gap_sessions(),
        }
    }
}

/// When a session's bar becomes final, and how long an in-progress bar is cached.
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// IANA zone of the exchange, e.g. `"America/New_York"`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Regular close in exchange local time, `"HH:MM"`.
    #[serde(default = "default_close_time")]
    pub close_time: String,
    #[serde(default = "default_finalization_delay_minutes")]
    pub finalization_delay_minutes: i64,
    #[serde(default = "default_provisional_ttl_secs")]
    pub provisional_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            close_time: default_close_time(),
            finalization_delay_minutes: default_finalization_delay_minutes(),
            provisional_ttl_secs: default_provisional_ttl_secs(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CalendarConfig {
    /// One-off closures not covered by the holiday rules.
    #[serde(default)]
    pub extra_closures: Vec<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ThresholdsConfig {
    #[serde(default = "default_threshold_version")]
    pub version: u32,
    #[serde(default)]
    pub rules: Vec<ThresholdRuleConfig>,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            version: default_threshold_version(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ThresholdRuleConfig {
    pub indicator: String,
    pub params: Vec<usize>,
    pub bucket: String,
    /// Labels assigned when `value >= bound`.
    #[serde(default)]
    pub upper: Vec<BandConfig>,
    /// Labels assigned when `value <= bound`.
    #[serde(default)]
    pub lower: Vec<BandConfig>,
}

#[derive(Debug, Deserialize)]
pub struct BandConfig {
    pub label: String,
    pub bound: f64,
}

/// Load and validate an `AppConfig` from a TOML file at `path`.
pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;

    Ok(config)
}

const KNOWN_PROVIDERS: &[&str] = &["yahoo"];
const LOG_FORMATS: &[&str] = &["text", "json"];

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_general(config)?;
    validate_provider(config)?;
    validate_session(config)?;
    // Thresholds are fully checked while building the lookup table.
    ThresholdConfig::from_config(&config.thresholds)?;
    Ok(())
}

fn validate_general(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if !LOG_FORMATS.contains(&config.general.log_format.as_str()) {
        return Err(Report::new(ConfigError::Validation {
            field: format!(
                "general.log_format \"{}\" must be one of {LOG_FORMATS:?}",
                config.general.log_format
            ),
        }));
    }
    Ok(())
}

fn validate_provider(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let provider = &config.provider;
    if !KNOWN_PROVIDERS.contains(&provider.name.as_str()) {
        return Err(Report::new(ConfigError::Validation {
            field: format!("provider.name \"{}\" is not a known provider", provider.name),
        }));
    }
    if provider.requests_per_second == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "provider.requests_per_second must be > 0".into(),
        }));
    }
    if provider.request_timeout_secs == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "provider.request_timeout_secs must be > 0".into(),
        }));
    }
    Ok(())
}

fn validate_session(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    SessionPolicy::from_config(&config.session)?;

    if config.session.provisional_ttl_secs == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "session.provisional_ttl_secs must be > 0".into(),
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> AppConfig {
        toml::from_str(toml).expect("parse failed")
    }

    #[test]
    fn valid_full_config_parses() {
        let toml = r#"
[general]
log_level = "debug"
log_format = "json"
data_dir = "/tmp/data"

[provider]
name = "yahoo"
requests_per_second = 4
request_timeout_secs = 10
max_retries = 2
merge_gap_sessions = 5

[session]
timezone = "America/New_York"
close_time = "16:00"
finalization_delay_minutes = 90
provisional_ttl_secs = 120

[calendar]
extra_closures = ["2025-01-09"]

[thresholds]
version = 3

[[thresholds.rules]]
indicator = "rsi"
params = [14]
bucket = "intermediate"
upper = [
    { label = "strong_sell", bound = 80.0 },
    { label = "sell", bound = 70.0 },
]
lower = [
    { label = "strong_buy", bound = 20.0 },
    { label = "buy", bound = 30.0 },
]
"#;
        let config = parse(toml);
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.provider.requests_per_second, 4);
        assert_eq!(config.session.finalization_delay_minutes, 90);
        assert_eq!(
            config.calendar.extra_closures,
            vec![NaiveDate::from_ymd_opt(2025, 1, 9).unwrap()]
        );
        assert_eq!(config.thresholds.version, 3);
        assert_eq!(config.thresholds.rules.len(), 1);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn defaults_applied_when_fields_omitted() {
        let toml = r#"
[general]
"#;
        let config = parse(toml);
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, "text");
        assert_eq!(config.general.data_dir, "./data");
        assert_eq!(config.provider.name, "yahoo");
        assert_eq!(config.provider.max_retries, 3);
        assert_eq!(config.provider.merge_gap_sessions, 20);
        assert_eq!(config.session.timezone, "America/New_York");
        assert_eq!(config.session.close_time, "16:00");
        assert_eq!(config.session.provisional_ttl_secs, 300);
        assert!(config.calendar.extra_closures.is_empty());
        assert_eq!(config.thresholds.version, 1);
        assert!(config.thresholds.rules.is_empty());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn unknown_provider_rejected() {
        let config = parse(
            r#"
[general]

[provider]
name = "bloomberg"
"#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn invalid_timezone_rejected() {
        let config = parse(
            r#"
[general]

[session]
timezone = "Mars/Olympus_Mons"
"#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn invalid_close_time_rejected() {
        let config = parse(
            r#"
[general]

[session]
close_time = "4pm"
"#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn excessive_finalization_delay_rejected() {
        let config = parse(
            r#"
[general]

[session]
finalization_delay_minutes = 1440
"#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_log_format_rejected() {
        let config = parse(
            r#"
[general]
log_format = "xml"
"#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn overlapping_threshold_bands_rejected() {
        let config = parse(
            r#"
[general]

[[thresholds.rules]]
indicator = "rsi"
params = [14]
bucket = "intermediate"
upper = [{ label = "sell", bound = 30.0 }]
lower = [{ label = "buy", bound = 40.0 }]
"#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse(include_str!("../config.example.toml"));
        validate(&config).unwrap();
        assert!(!config.thresholds.rules.is_empty());
        crate::signal::ThresholdConfig::from_config(&config.thresholds).unwrap();
    }
}
