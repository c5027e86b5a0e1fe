//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Credentials and endpoint parameters for one WhatsApp Cloud tenant.
///
/// The two historical provider apps differed only in these values, so a
/// single transport implementation is parameterized by this struct instead
/// of duplicating the integration per tenant.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    /// Bearer token for the Graph API.
    pub access_token: SecretString,
    /// Phone-number id used for message and media endpoints.
    pub phone_number_id: String,
    /// Business-account id used for template lookups.
    pub business_account_id: String,
    /// Graph API version segment, e.g. "v17.0".
    pub api_version: String,
    /// API base, overridable for tests.
    pub base_url: String,
}

impl TenantConfig {
    /// Read tenant credentials from the environment.
    ///
    /// `WA_ACCESS_TOKEN`, `WA_PHONE_NUMBER_ID` and `WA_BUSINESS_ACCOUNT_ID`
    /// are required; version and base URL have defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_token = std::env::var("WA_ACCESS_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("WA_ACCESS_TOKEN".into()))?;
        let phone_number_id = std::env::var("WA_PHONE_NUMBER_ID")
            .map_err(|_| ConfigError::MissingEnvVar("WA_PHONE_NUMBER_ID".into()))?;
        let business_account_id = std::env::var("WA_BUSINESS_ACCOUNT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("WA_BUSINESS_ACCOUNT_ID".into()))?;

        Ok(Self {
            access_token: SecretString::from(access_token),
            phone_number_id,
            business_account_id,
            api_version: std::env::var("WA_API_VERSION").unwrap_or_else(|_| "v17.0".into()),
            base_url: std::env::var("WA_API_BASE")
                .unwrap_or_else(|_| "https://graph.facebook.com".into()),
        })
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// HTTP/WS bind port.
    pub port: u16,
    /// Local database path.
    pub db_path: PathBuf,
    /// Directory for report artifacts.
    pub artifact_dir: PathBuf,
    /// Shared secret echoed during webhook verification.
    pub verify_token: String,
    /// Rows per batch worker chunk.
    pub chunk_size: usize,
    /// Mandatory spacing between consecutive sends in one chunk.
    pub per_row_delay: Duration,
    /// Delay before the finalizer first polls, and between polls.
    pub finalize_poll_delay: Duration,
    /// Whole-chunk retry ceiling for row-slice read failures.
    pub chunk_max_retries: u32,
    /// Per-send retry ceiling inside the transport.
    pub send_max_retries: u32,
    /// Per-request transport timeout.
    pub transport_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/wa-dispatch.db"),
            artifact_dir: PathBuf::from("./data/reports"),
            verify_token: "change-me".to_string(),
            chunk_size: 50,
            per_row_delay: Duration::from_millis(500),
            finalize_poll_delay: Duration::from_secs(10),
            chunk_max_retries: 5,
            send_max_retries: 3,
            transport_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatchConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port = parse_env("WA_DISPATCH_PORT", defaults.port)?;
        let chunk_size: usize = parse_env("WA_DISPATCH_CHUNK_SIZE", defaults.chunk_size)?;
        if chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WA_DISPATCH_CHUNK_SIZE".into(),
                message: "chunk size must be at least 1".into(),
            });
        }

        Ok(Self {
            port,
            db_path: std::env::var("WA_DISPATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            artifact_dir: std::env::var("WA_DISPATCH_REPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_dir),
            verify_token: std::env::var("WA_VERIFY_TOKEN").unwrap_or(defaults.verify_token),
            chunk_size,
            per_row_delay: Duration::from_millis(parse_env(
                "WA_DISPATCH_ROW_DELAY_MS",
                defaults.per_row_delay.as_millis() as u64,
            )?),
            finalize_poll_delay: Duration::from_secs(parse_env(
                "WA_DISPATCH_POLL_SECS",
                defaults.finalize_poll_delay.as_secs(),
            )?),
            chunk_max_retries: parse_env("WA_DISPATCH_CHUNK_RETRIES", defaults.chunk_max_retries)?,
            send_max_retries: parse_env("WA_DISPATCH_SEND_RETRIES", defaults.send_max_retries)?,
            transport_timeout: Duration::from_secs(parse_env(
                "WA_DISPATCH_TRANSPORT_TIMEOUT_SECS",
                defaults.transport_timeout.as_secs(),
            )?),
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}
