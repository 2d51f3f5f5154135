use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use lifelink_core::Identity;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// `config.json` is expected to be tiny.
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080/ws";

const MAX_SERVER_URL_LEN: usize = 2048;
const MAX_UID_LEN: usize = 128;
const MAX_DISPLAY_NAME_LEN: usize = 128;
const MAX_EMAIL_LEN: usize = 320;
const APP_DIR_NAME: &str = "LifeLink";

/// Persisted client settings: where to connect and who is signed in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_url: String,
    pub identity: Identity,
    /// Stand-in for a browser user agent when classifying this device.
    #[serde(default)]
    pub device_signature: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Please fix the following:\n\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
    #[error("config file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub fn validate_config(cfg: &ClientConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    let server_url = cfg.server_url.trim();
    if server_url.is_empty() {
        errors.push("Server URL is required.".to_owned());
    } else if server_url.len() > MAX_SERVER_URL_LEN {
        errors.push(format!(
            "Server URL is too long ({} > {} chars).",
            server_url.len(),
            MAX_SERVER_URL_LEN
        ));
    } else {
        match Url::parse(server_url) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
            Ok(_) => errors.push("Server URL must start with ws:// or wss:// (WebSocket).".to_owned()),
            Err(err) => errors.push(format!("Server URL is invalid: {err}")),
        }
    }

    let uid = cfg.identity.uid.trim();
    if uid.is_empty() {
        errors.push("User id is required.".to_owned());
    } else if uid.len() > MAX_UID_LEN {
        errors.push(format!("User id is too long ({} > {} chars).", uid.len(), MAX_UID_LEN));
    }

    if let Some(name) = &cfg.identity.display_name {
        if name.len() > MAX_DISPLAY_NAME_LEN {
            errors.push(format!(
                "Display name is too long ({} > {} chars).",
                name.len(),
                MAX_DISPLAY_NAME_LEN
            ));
        }
    }

    if let Some(email) = &cfg.identity.email {
        if email.len() > MAX_EMAIL_LEN {
            errors.push(format!("Email is too long ({} > {} chars).", email.len(), MAX_EMAIL_LEN));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

/// Directory holding `config.json`. `LIFELINK_CONFIG_DIR` overrides it.
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("LIFELINK_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    app_base_dir()
}

/// Directory holding logs. `LIFELINK_DATA_DIR` overrides it.
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("LIFELINK_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    app_base_dir()
}

fn app_base_dir() -> PathBuf {
    let base = std::env::var_os("LOCALAPPDATA")
        .or_else(|| std::env::var_os("XDG_CONFIG_HOME"))
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(APP_DIR_NAME)
}

pub fn config_path() -> PathBuf {
    let dir = config_dir();
    let _ = fs::create_dir_all(&dir);
    dir.join("config.json")
}

/// Load and validate a saved config. A missing file is `Ok(None)`.
pub fn load_config_from_path(path: &Path) -> Result<Option<ClientConfig>, ConfigError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigError::TooLarge {
            size: meta.len(),
            max: MAX_CONFIG_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: ClientConfig = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    validate_config(&cfg)?;
    Ok(Some(cfg))
}

/// Write through a temporary file so a crash never leaves a torn config.
pub fn save_config_to_path(path: &Path, cfg: &ClientConfig) -> Result<(), ConfigError> {
    validate_config(cfg)?;

    let tmp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(cfg)?;
    fs::write(&tmp_path, payload.as_bytes()).map_err(|source| ConfigError::Write {
        path: tmp_path.clone(),
        source,
    })?;

    // rename replaces an existing target in one step.
    fs::rename(&tmp_path, path).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save_config_with_retry(path: &Path, cfg: &ClientConfig) -> Result<(), ConfigError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt: u32 = 1;
    loop {
        match save_config_to_path(path, cfg) {
            Ok(()) => return Ok(()),
            Err(err @ ConfigError::Invalid(_)) => return Err(err),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(_) => {
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
