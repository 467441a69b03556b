use rollcall_core::CallTimeouts;
use rollcall_hw::StillEncoding;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Where attendance records, the directory and enrollment live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// Local SQLite database.
    Sqlite,
    /// Remote ledger gateway over HTTP.
    Http,
}

/// Which message bus the D-Bus service is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration: TOML file first, `ROLLCALL_*` environment on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path, or `synthetic` for the test pattern camera.
    pub camera_device: String,
    /// Frames discarded after opening the camera (auto-exposure settling).
    pub warmup_frames: usize,
    /// Encoding of stills sent to the resolver.
    pub still: StillEncoding,
    /// Base URL of the face resolver service.
    pub resolver_url: String,
    pub ledger_backend: LedgerBackend,
    /// Base URL of the ledger gateway (used when `ledger_backend = "http"`).
    pub ledger_url: String,
    /// SQLite database file (used when `ledger_backend = "sqlite"`).
    pub db_path: PathBuf,
    pub resolver_timeout_secs: u64,
    pub directory_timeout_secs: u64,
    pub ledger_timeout_secs: u64,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let timeouts = CallTimeouts::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            warmup_frames: 4,
            still: StillEncoding::default(),
            resolver_url: "http://127.0.0.1:5000".to_string(),
            ledger_backend: LedgerBackend::Sqlite,
            ledger_url: "http://127.0.0.1:7545".to_string(),
            db_path: data_dir().join("ledger.db"),
            resolver_timeout_secs: timeouts.resolver.as_secs(),
            directory_timeout_secs: timeouts.directory.as_secs(),
            ledger_timeout_secs: timeouts.ledger.as_secs(),
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load the config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Ok(v) = std::env::var("ROLLCALL_RESOLVER_URL") {
            self.resolver_url = v;
        }
        if let Ok(v) = std::env::var("ROLLCALL_LEDGER_URL") {
            self.ledger_url = v;
        }
        if let Ok(v) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        match std::env::var("ROLLCALL_LEDGER_BACKEND").as_deref() {
            Ok("http") => self.ledger_backend = LedgerBackend::Http,
            Ok("sqlite") => self.ledger_backend = LedgerBackend::Sqlite,
            _ => {}
        }
        match std::env::var("ROLLCALL_BUS").as_deref() {
            Ok("system") => self.bus = BusKind::System,
            Ok("session") => self.bus = BusKind::Session,
            _ => {}
        }
        self.warmup_frames = env_usize("ROLLCALL_WARMUP_FRAMES", self.warmup_frames);
        self.resolver_timeout_secs = env_u64("ROLLCALL_RESOLVER_TIMEOUT_SECS", self.resolver_timeout_secs);
        self.directory_timeout_secs = env_u64("ROLLCALL_DIRECTORY_TIMEOUT_SECS", self.directory_timeout_secs);
        self.ledger_timeout_secs = env_u64("ROLLCALL_LEDGER_TIMEOUT_SECS", self.ledger_timeout_secs);
    }

    pub fn timeouts(&self) -> CallTimeouts {
        CallTimeouts {
            resolver: Duration::from_secs(self.resolver_timeout_secs.max(1)),
            directory: Duration::from_secs(self.directory_timeout_secs.max(1)),
            ledger: Duration::from_secs(self.ledger_timeout_secs.max(1)),
        }
    }
}

/// `ROLLCALL_CONFIG`, else `$XDG_CONFIG_HOME/rollcall/rollcalld.toml`.
fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ROLLCALL_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
        .ok()?;
    Some(base.join("rollcall").join("rollcalld.toml"))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::ImageFormat;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.ledger_backend, LedgerBackend::Sqlite);
        assert_eq!(config.timeouts(), CallTimeouts::default());
        assert_eq!(config.still, StillEncoding::default());
    }

    #[test]
    fn test_file_overrides() {
        let config = Config::from_toml(
            r#"
            camera_device = "synthetic"
            ledger_backend = "http"
            ledger_url = "http://ledger.local"
            resolver_timeout_secs = 3
            bus = "system"

            [still]
            format = "png"
            "#,
        )
        .unwrap();

        assert_eq!(config.camera_device, "synthetic");
        assert_eq!(config.ledger_backend, LedgerBackend::Http);
        assert_eq!(config.ledger_url, "http://ledger.local");
        assert_eq!(config.timeouts().resolver, Duration::from_secs(3));
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.still.format, ImageFormat::Png);
        assert_eq!(config.still.jpeg_quality, rollcall_hw::frame::DEFAULT_JPEG_QUALITY);
    }

    #[test]
    fn test_zero_timeouts_are_clamped() {
        let config = Config::from_toml("ledger_timeout_secs = 0").unwrap();
        assert_eq!(config.timeouts().ledger, Duration::from_secs(1));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Config::from_toml(r#"ledger_backend = "postgres""#).is_err());
    }
}
