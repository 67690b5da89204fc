use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const DEFAULT_PROBE_URL: &str = "https://www.google.com/favicon.ico";
const DEFAULT_CONCURRENCY: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("could not determine home directory")]
    NoHomeDir,
}

/// Application configuration.
/// Loads a .env file when present, then reads `PICSHIFT_*` variables.
#[derive(Clone, Debug)]
pub struct Config {
    /// Migration backend base URL
    pub backend_url: String,
    /// Page agent base URL
    pub agent_url: String,
    /// Sent as `X-Auth-Token` to the backend
    pub auth_token: Option<String>,
    /// Cookie header replayed on source fetches
    pub session_cookie: Option<String>,
    pub probe_url: String,
    /// Where the JSON state files live
    pub state_dir: PathBuf,
    pub transfer: TransferConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        if dotenvy::dotenv().is_ok() {
            info!("Config: loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend_url =
            non_empty("PICSHIFT_BACKEND_URL").ok_or(ConfigError::Missing("PICSHIFT_BACKEND_URL"))?;
        let agent_url =
            non_empty("PICSHIFT_AGENT_URL").ok_or(ConfigError::Missing("PICSHIFT_AGENT_URL"))?;

        let state_dir = match non_empty("PICSHIFT_STATE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .ok_or(ConfigError::NoHomeDir)?
                .join(".picshift"),
        };

        let concurrency = match non_empty("PICSHIFT_CONCURRENCY") {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "PICSHIFT_CONCURRENCY",
                        value,
                    })
                }
            },
            None => DEFAULT_CONCURRENCY,
        };

        Ok(Self {
            backend_url,
            agent_url,
            auth_token: non_empty("PICSHIFT_AUTH_TOKEN"),
            session_cookie: non_empty("PICSHIFT_SESSION_COOKIE"),
            probe_url: non_empty("PICSHIFT_PROBE_URL")
                .unwrap_or_else(|| DEFAULT_PROBE_URL.to_string()),
            state_dir,
            transfer: TransferConfig {
                concurrency,
                ..Default::default()
            },
        })
    }
}

/// Engine constants
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferConfig {
    /// Workers per album
    pub concurrency: usize,
    /// Attempts per file before it is recorded as failed
    pub max_retries: u32,
    /// Backoff after a permanent-class error is `attempt * retry_unit`
    pub retry_unit: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    pub transient_backoff: Duration,
    pub challenge_backoff: Duration,
    pub max_challenge_cycles: u32,
    /// Wait before and after the corrective action in each recovery cycle
    pub challenge_settle: Duration,
    pub network_poll: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: 3,
            retry_unit: Duration::from_millis(500),
            jitter_min: Duration::from_millis(150),
            jitter_max: Duration::from_millis(350),
            transient_backoff: Duration::from_secs(2),
            challenge_backoff: Duration::from_secs(5),
            max_challenge_cycles: 3,
            challenge_settle: Duration::from_secs(10),
            network_poll: Duration::from_secs(2),
        }
    }
}
