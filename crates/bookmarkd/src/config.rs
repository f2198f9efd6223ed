use crate::protocol::DEFAULT_MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const SNAPSHOT_FILE_NAME: &str = "snapshot.json";

/// Profile configuration
///
/// Every section has defaults, so a partial (or missing) `config.toml` is
/// fine. Relative paths resolve against the profile directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_profile_name")]
    pub profile_name: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub vcs: VcsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Directory the profile lives in; set by the loader, never read from file
    #[serde(skip)]
    pub profile_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_cache_size")]
    pub sqlite_cache_size: i32,
    #[serde(default = "default_busy_timeout")]
    pub sqlite_busy_timeout: i32,
    /// DELETE keeps the database a single file, which is what gets committed
    #[serde(default = "default_journal_mode")]
    pub journal_mode: String,
    #[serde(default = "default_synchronous")]
    pub synchronous: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_profile_name() -> String {
    "default".to_string()
}
fn default_socket_path() -> PathBuf {
    PathBuf::from("ipc.sock")
}
fn default_max_frame_bytes() -> u32 {
    DEFAULT_MAX_FRAME_LEN
}
fn default_db_path() -> PathBuf {
    PathBuf::from("state.db")
}
fn default_cache_size() -> i32 {
    10000
}
fn default_busy_timeout() -> i32 {
    5000
}
fn default_journal_mode() -> String {
    "DELETE".to_string()
}
fn default_synchronous() -> String {
    "FULL".to_string()
}
fn default_pool_size() -> u32 {
    5
}
fn default_branch() -> String {
    "main".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            sqlite_cache_size: default_cache_size(),
            sqlite_busy_timeout: default_busy_timeout(),
            journal_mode: default_journal_mode(),
            synchronous: default_synchronous(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            remote: None,
            branch: default_branch(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Defaults for a profile directory with no config file
    pub fn for_profile<P: AsRef<Path>>(profile_dir: P) -> Self {
        Self {
            profile_name: default_profile_name(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            vcs: VcsConfig::default(),
            logging: LoggingConfig::default(),
            profile_dir: profile_dir.as_ref().to_path_buf(),
        }
    }

    /// Load a config file; its directory becomes the profile directory.
    ///
    /// `BOOKMARKD__SECTION__KEY` environment variables override file values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("BOOKMARKD").separator("__"))
            .build()?;

        let mut cfg: Config = settings.try_deserialize()?;
        cfg.profile_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(cfg)
    }

    /// Load `<profile_dir>/config.toml`, falling back to defaults
    pub fn load_profile<P: AsRef<Path>>(profile_dir: P) -> Result<Self, config::ConfigError> {
        let path = profile_dir.as_ref().join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::for_profile(profile_dir))
        }
    }

    pub fn resolve_path<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.profile_dir.join(path)
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.resolve_path(&self.server.socket_path)
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve_path(&self.storage.db_path)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.profile_dir.join(SNAPSHOT_FILE_NAME)
    }
}
