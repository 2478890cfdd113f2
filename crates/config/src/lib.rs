use dotenv::dotenv;
use dotenv::from_path;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {name}: {value:?}")]
    Invalid { name: String, value: String },

    #[error("Failed to load .env file from path {path}: {message}")]
    EnvFile { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub completion_db: PathBuf,
    pub established_conns_per_torrent: usize,
    pub half_open_conns_per_torrent: usize,
    pub torrent_peers_high_water: usize,
    pub torrent_peers_low_water: usize,
    pub chunk_size: u32,
    pub piece_length: u64,
    pub readahead_bytes: u64,
    /// 0 means one worker per available core.
    pub verifier_workers: usize,
    pub connection_grace: Duration,
    pub seed: bool,
    pub log_filter: String,
    /// Local file to seed and verify at startup.
    pub seed_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a specified `.env` file path or default to the
    /// root `.env` file, then read the process environment.
    pub fn from_env(env_path: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(path) = env_path {
            from_path(path).map_err(|e| ConfigError::EnvFile {
                path: path.to_string(),
                message: e.to_string(),
            })?;
        } else {
            dotenv().ok();
        }

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let data_dir = PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| "data".to_string()));
        let completion_db = lookup("COMPLETION_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("completion.db"));

        Ok(Self {
            completion_db,
            established_conns_per_torrent: parse(&lookup, "ESTABLISHED_CONNS_PER_TORRENT", 50)?,
            half_open_conns_per_torrent: parse(&lookup, "HALF_OPEN_CONNS_PER_TORRENT", 25)?,
            torrent_peers_high_water: parse(&lookup, "TORRENT_PEERS_HIGH_WATER", 500)?,
            torrent_peers_low_water: parse(&lookup, "TORRENT_PEERS_LOW_WATER", 50)?,
            chunk_size: positive(&lookup, "CHUNK_SIZE", 16 * 1024)?,
            piece_length: positive(&lookup, "PIECE_LENGTH", 256 * 1024)?,
            readahead_bytes: parse(&lookup, "READAHEAD_BYTES", 5 * 1024 * 1024)?,
            verifier_workers: parse(&lookup, "VERIFIER_WORKERS", 0)?,
            connection_grace: Duration::from_secs(parse(&lookup, "CONNECTION_GRACE_SECONDS", 60)?),
            seed: parse_bool(&lookup, "SEED", true)?,
            log_filter: lookup("LOG_FILTER").unwrap_or_else(|| "info".to_string()),
            seed_path: lookup("SEED_PATH").map(PathBuf::from),
            data_dir,
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn positive<T: FromStr + Default + PartialEq>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    let value = parse(lookup, name, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            name: name.to_string(),
            value: "0".to_string(),
        });
    }
    Ok(value)
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(name) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                name: name.to_string(),
                value,
            }),
        },
        None => Ok(default),
    }
}
