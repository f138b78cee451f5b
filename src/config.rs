use log::{info, warn};
use std::{env, fmt::Display, fs::read_to_string, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Could not read {key} from {path}: {source}")]
    Secret {
        key: &'static str,
        path: String,
        source: std::io::Error,
    },
}

pub struct Config {
    pub bind: String,
    /// `None` opens a temporary database that is dropped on shutdown.
    pub database: Option<PathBuf>,
    pub transaction_timeout: Duration,
    pub bcrypt_cost: u32,
    pub session_ttl: Duration,
    pub allowed_origin: String,
    pub omdb_url: String,
    pub omdb_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(|key| env::var(key).ok())
    }

    pub fn load<F: Fn(&str) -> Option<String>>(var: F) -> Result<Self, ConfigError> {
        let omdb_key = match var("OMDB_API_KEY") {
            Some(key) => Some(key),
            None => match var("OMDB_API_KEY_FILE") {
                Some(path) => Some(read_secret("OMDB_API_KEY_FILE", &path)?),
                None => {
                    warn!("OMDB_API_KEY not set, movie search is disabled");
                    None
                }
            },
        };
        Ok(Config {
            bind: try_load(&var, "MOVIEHUB_BIND", "127.0.0.1:5500")?,
            database: var("MOVIEHUB_DB_PATH").map(PathBuf::from),
            transaction_timeout: Duration::from_millis(try_load(
                &var,
                "MOVIEHUB_TX_TIMEOUT_MS",
                "5000",
            )?),
            bcrypt_cost: try_load(&var, "MOVIEHUB_BCRYPT_COST", "12")?,
            session_ttl: Duration::from_secs(try_load(
                &var,
                "MOVIEHUB_SESSION_TTL_SECS",
                "3600",
            )?),
            allowed_origin: try_load(&var, "MOVIEHUB_ALLOWED_ORIGIN", "http://localhost:3000")?,
            omdb_url: try_load(&var, "OMDB_URL", "http://www.omdbapi.com/")?,
            omdb_key,
        })
    }

    pub fn open_db(&self) -> sled::Result<sled::Db> {
        match &self.database {
            Some(path) => {
                info!("Opening database at {}", path.display());
                sled::Config::new().path(path).open()
            }
            None => {
                warn!("MOVIEHUB_DB_PATH not set, using a temporary database");
                sled::Config::new().temporary(true).open()
            }
        }
    }
}

fn try_load<T, F>(var: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let value = var(key).unwrap_or_else(|| {
        info!("{} not set, using default: {}", key, default);
        default.to_owned()
    });
    value.parse().map_err(|err: T::Err| ConfigError::Invalid {
        key,
        reason: err.to_string(),
        value,
    })
}

fn read_secret(key: &'static str, path: &str) -> Result<String, ConfigError> {
    read_to_string(path)
        .map(|secret| secret.trim().to_owned())
        .map_err(|source| ConfigError::Secret {
            key,
            path: path.to_owned(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::load(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind, "127.0.0.1:5500");
        assert_eq!(config.database, None);
        assert_eq!(config.transaction_timeout, Duration::from_secs(5));
        assert_eq!(config.bcrypt_cost, 12);
        assert_eq!(config.session_ttl, Duration::from_secs(3600));
        assert_eq!(config.omdb_key, None);
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("MOVIEHUB_DB_PATH", "/var/lib/moviehub"),
            ("MOVIEHUB_TX_TIMEOUT_MS", "250"),
            ("MOVIEHUB_SESSION_TTL_SECS", "900"),
            ("OMDB_API_KEY", "abc123"),
        ])
        .unwrap();
        assert_eq!(config.database, Some(PathBuf::from("/var/lib/moviehub")));
        assert_eq!(config.transaction_timeout, Duration::from_millis(250));
        assert_eq!(config.session_ttl, Duration::from_secs(900));
        assert_eq!(config.omdb_key.as_deref(), Some("abc123"));
    }

    #[test]
    fn invalid_number_is_rejected() {
        match load(&[("MOVIEHUB_BCRYPT_COST", "twelve")]) {
            Err(ConfigError::Invalid { key, value, .. }) => {
                assert_eq!(key, "MOVIEHUB_BCRYPT_COST");
                assert_eq!(value, "twelve");
            }
            _ => panic!("expected an invalid value error"),
        }
    }

    #[test]
    fn missing_secret_file_is_rejected() {
        assert!(matches!(
            load(&[("OMDB_API_KEY_FILE", "/nonexistent/omdb_key")]),
            Err(ConfigError::Secret { .. })
        ));
    }
}
