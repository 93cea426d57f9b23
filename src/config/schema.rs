use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::store::DEFAULT_KEY_PREFIX;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

// ── Credential store ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database holding every session's credentials. Unset means
    /// `credentials.db` next to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    /// Prepended to every session's keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn sessions_dir() -> PathBuf {
    let home = UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
    home.join(".zeroclaw").join("sessions")
}

fn default_db_path() -> PathBuf {
    sessions_dir().join("credentials.db")
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            key_prefix: default_key_prefix(),
        }
    }
}

impl StoreConfig {
    /// The configured database path, or the default under the home directory.
    pub fn database_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(default_db_path)
    }
}

// ── Reconnect ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Backoff base (ms). The first attempt is immediate, the next waits
    /// this long, and each one after doubles it.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for the doubling delay (ms).
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Attempts per close before giving up. 0 = unlimited.
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_reconnect_base_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
            max_attempts: default_reconnect_max_attempts(),
        }
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: sessions_dir().join("config.toml"),
            store: StoreConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        Self::load_or_init_in(&home.join(".zeroclaw").join("sessions"))
    }

    /// Load `config.toml` from `dir`, writing defaults there on first run.
    /// A missing `db_path` defaults to `credentials.db` inside `dir`.
    pub fn load_or_init_in(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");

        if !dir.exists() {
            fs::create_dir_all(dir).context("Failed to create sessions config directory")?;
        }

        let mut config = if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path;
            if config.store.db_path.is_none() {
                config.store.db_path = Some(dir.join("credentials.db"));
            }
            config
        } else {
            let config = Config {
                config_path,
                store: StoreConfig {
                    db_path: Some(dir.join("credentials.db")),
                    key_prefix: default_key_prefix(),
                },
                reconnect: ReconnectConfig::default(),
            };
            config.save()?;
            config
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Database: ZEROCLAW_SESSIONS_DB
        if let Ok(path) = std::env::var("ZEROCLAW_SESSIONS_DB") {
            if !path.is_empty() {
                self.store.db_path = Some(PathBuf::from(path));
            }
        }

        // Key prefix: ZEROCLAW_SESSIONS_PREFIX
        if let Ok(prefix) = std::env::var("ZEROCLAW_SESSIONS_PREFIX") {
            if !prefix.is_empty() {
                self.store.key_prefix = prefix;
            }
        }

        // Reconnect cap: ZEROCLAW_SESSIONS_RECONNECT_MAX_ATTEMPTS
        if let Ok(raw) = std::env::var("ZEROCLAW_SESSIONS_RECONNECT_MAX_ATTEMPTS") {
            if let Ok(attempts) = raw.trim().parse::<u32>() {
                self.reconnect.max_attempts = attempts;
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", std::process::id()));

        let mut temp_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir)?;
        Ok(())
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}
