use std::{
    collections::VecDeque,
    path::Path,
    str::FromStr,
    sync::Mutex,
    time::Duration,
};

use serde::{de, Deserialize, Deserializer, Serializer};
use serde::Serialize;
use tracing::level_filters::LevelFilter;

const STATUS_BACKEND_URLS_ENV: &str = "STATUS_BACKEND_URLS";
const STATUS_BACKEND_COUNT_ENV: &str = "STATUS_BACKEND_COUNT";

/// Port of the first status-backend container; the others follow.
const FIRST_BACKEND_PORT: u16 = 3314;

fn deserialize_fromstr<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let string = String::deserialize(deserializer)?;
    T::from_str(&string)
        .map_err(|e| de::Error::custom(format!("Error parsing '{}': {}", string, e)))
}

fn serialize_to_string<T: std::fmt::Display, S: Serializer>(
    field: &T,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_str(&field.to_string())
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

fn serialize_duration<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_secs())
}

fn default_rpc_url_statusd() -> String {
    "http://0.0.0.0:3333".to_string()
}

fn default_ws_url_statusd() -> String {
    "ws://0.0.0.0:8354".to_string()
}

fn default_backend_count() -> u16 {
    10
}

fn default_anvil_url() -> String {
    "http://0.0.0.0:8545".to_string()
}

fn default_password() -> String {
    "Strong12345".to_string()
}

fn default_network_id() -> u64 {
    crate::backend::ANVIL_NETWORK_ID
}

fn default_loglevel() -> LevelFilter {
    LevelFilter::INFO
}

fn default_signal_timeout() -> Duration {
    Duration::from_secs(20)
}

pub fn backend_urls(count: u16) -> Vec<String> {
    (0..count)
        .map(|i| format!("http://0.0.0.0:{}", FIRST_BACKEND_PORT + i))
        .collect()
}

/// Everything the functional tests need to know about the environment they
/// run against.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// JSON-RPC endpoint of the standalone statusd node.
    #[serde(default = "default_rpc_url_statusd")]
    pub rpc_url_statusd: String,
    /// Signals endpoint of the standalone statusd node.
    #[serde(default = "default_ws_url_statusd")]
    pub ws_url_statusd: String,
    /// Base URLs of the status-backend containers. When empty, one URL per
    /// container is derived from `status_backend_count`.
    #[serde(default)]
    pub status_backend_urls: Vec<String>,
    #[serde(default = "default_backend_count")]
    pub status_backend_count: u16,
    #[serde(default = "default_anvil_url")]
    pub anvil_url: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default = "default_network_id")]
    pub network_id: u64,
    #[serde(
        deserialize_with = "deserialize_fromstr",
        serialize_with = "serialize_to_string",
        default = "default_loglevel"
    )]
    pub log_level: LevelFilter,
    /// How long to wait for an expected signal.
    #[serde(
        rename = "signal_timeout_secs",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_signal_timeout"
    )]
    pub signal_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url_statusd: default_rpc_url_statusd(),
            ws_url_statusd: default_ws_url_statusd(),
            status_backend_urls: Vec::new(),
            status_backend_count: default_backend_count(),
            anvil_url: default_anvil_url(),
            password: default_password(),
            network_id: default_network_id(),
            log_level: default_loglevel(),
            signal_timeout: default_signal_timeout(),
        }
    }
}

#[derive(PartialEq, Eq, Debug)]
pub enum ConfigError {
    FileNotFound,
    ReadingFile(String),
    InvalidEnv(String),
    Unexpected(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Self::FileNotFound => write!(f, "Could not locate the configuration file."),
            Self::ReadingFile(e) => write!(f, "Failed to read configuration file: {}", e),
            Self::InvalidEnv(e) => write!(f, "Invalid environment variable: {}", e),
            Self::Unexpected(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound,
            _ => Self::ReadingFile(e.to_string()),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Read the configuration from a TOML file. Every setting has a default,
    /// so an empty file is valid.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let config = toml::from_slice::<Config>(&std::fs::read(path)?)
            .map_err(|e| ConfigError::ReadingFile(format!("Parsing configuration file: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Load from an optional file, then apply the environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.check()?;
        Ok(config)
    }

    /// `STATUS_BACKEND_URLS` (comma separated) replaces the URL list,
    /// `STATUS_BACKEND_COUNT` the number of derived URLs.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(urls) = var(STATUS_BACKEND_URLS_ENV) {
            self.status_backend_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(count) = var(STATUS_BACKEND_COUNT_ENV) {
            self.status_backend_count = count.trim().parse().map_err(|e| {
                ConfigError::InvalidEnv(format!("{}='{}': {}", STATUS_BACKEND_COUNT_ENV, count, e))
            })?;
        }
        Ok(())
    }

    /// Make sure the settings are sane.
    pub fn check(&self) -> Result<(), ConfigError> {
        for url in self
            .status_backend_urls
            .iter()
            .chain([&self.rpc_url_statusd, &self.anvil_url])
        {
            check_scheme(url, &["http", "https"])?;
        }
        check_scheme(&self.ws_url_statusd, &["ws", "wss"])?;
        if self.status_backend_urls.is_empty() && self.status_backend_count == 0 {
            return Err(ConfigError::Unexpected(
                "No status-backend URL configured".to_string(),
            ));
        }
        Ok(())
    }

    /// The status-backend URLs to hand out, explicit ones first.
    pub fn backend_urls(&self) -> Vec<String> {
        if self.status_backend_urls.is_empty() {
            backend_urls(self.status_backend_count)
        } else {
            self.status_backend_urls.clone()
        }
    }
}

fn check_scheme(raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = url::Url::parse(raw)
        .map_err(|e| ConfigError::Unexpected(format!("Invalid URL '{}': {}", raw, e)))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Unexpected(format!(
            "URL '{}' must use one of {:?}",
            raw, schemes
        )));
    }
    Ok(())
}

/// The status-backend containers available to a test run. Each one serves a
/// single session, so a URL is handed out at most once.
#[derive(Debug)]
pub struct BackendPool {
    urls: Mutex<VecDeque<String>>,
}

impl BackendPool {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls: Mutex::new(urls.into()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.backend_urls())
    }

    /// Take the next free URL.
    pub fn take(&self) -> Option<String> {
        self.urls.lock().expect("poisoned").pop_front()
    }

    /// Take a specific URL, if it is still free.
    pub fn take_url(&self, url: &str) -> Option<String> {
        let mut urls = self.urls.lock().expect("poisoned");
        let index = urls.iter().position(|u| u == url)?;
        urls.remove(index)
    }

    pub fn remaining(&self) -> usize {
        self.urls.lock().expect("poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn toml_config() {
        let toml_str = r#"
            rpc_url_statusd = "http://127.0.0.1:3333"
            ws_url_statusd = "ws://127.0.0.1:8354"
            status_backend_urls = ["http://127.0.0.1:3314", "http://127.0.0.1:3315"]
            password = "Strong12345"
            network_id = 1
            log_level = "debug"
            signal_timeout_secs = 60
            "#;
        let config = toml::from_str::<Config>(toml_str).expect("Deserializing toml_str");
        assert_eq!(config.log_level, LevelFilter::DEBUG);
        assert_eq!(config.signal_timeout, Duration::from_secs(60));
        assert_eq!(config.network_id, 1);
        assert_eq!(config.password, "Strong12345");
        assert_eq!(config.rpc_url_statusd, "http://127.0.0.1:3333");
        assert_eq!(config.ws_url_statusd, "ws://127.0.0.1:8354");
        assert_eq!(config.backend_urls().len(), 2);
        config.check().unwrap();

        // Everything has a default.
        let config = toml::from_str::<Config>("").expect("Deserializing empty config");
        assert_eq!(config.rpc_url_statusd, "http://0.0.0.0:3333");
        assert_eq!(config.anvil_url, "http://0.0.0.0:8545");
        assert_eq!(config.log_level, LevelFilter::INFO);
        assert_eq!(config.signal_timeout, Duration::from_secs(20));
        assert_eq!(
            config.backend_urls(),
            (3314..3324)
                .map(|port| format!("http://0.0.0.0:{}", port))
                .collect::<Vec<_>>()
        );

        // Round trip
        let serialized = toml::to_string(&config).unwrap();
        let config2 = toml::from_str::<Config>(&serialized).unwrap();
        assert_eq!(config2.log_level, config.log_level);
        assert_eq!(config2.signal_timeout, config.signal_timeout);

        let invalid = r#"log_level = "loud""#;
        toml::from_str::<Config>(invalid).expect_err("Invalid log level");
    }

    #[test]
    fn config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "status_backend_count = 2").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.backend_urls().len(), 2);

        let missing = file.path().with_extension("missing");
        assert_eq!(
            Config::from_file(&missing).unwrap_err(),
            ConfigError::FileNotFound
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ws_url_statusd = \"http://0.0.0.0:8354\"").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Unexpected(_))
        ));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STATUS_BACKEND_URLS", "http://a:1, http://b:2,"),
            ("STATUS_BACKEND_COUNT", "3"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.backend_urls(), vec!["http://a:1", "http://b:2"]);
        assert_eq!(config.status_backend_count, 3);

        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "STATUS_BACKEND_COUNT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv(_)));
    }

    #[test]
    fn pool_hands_out_each_url_once() {
        let pool = BackendPool::new(backend_urls(2));
        assert_eq!(pool.take_url("http://0.0.0.0:3315").as_deref(), Some("http://0.0.0.0:3315"));
        assert_eq!(pool.take_url("http://0.0.0.0:3315"), None);
        assert_eq!(pool.take().as_deref(), Some("http://0.0.0.0:3314"));
        assert_eq!(pool.take(), None);
        assert_eq!(pool.remaining(), 0);
    }
}
