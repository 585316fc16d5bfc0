// SPDX-License-Identifier: AGPL-3.0
// CryptPort Core - Client settings
//
// Connection and transfer tuning that outlives a run. The file never holds
// credentials or tokens.

use crate::codec::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_LEN, FRAME_OVERHEAD_ALLOWANCE};
use crate::types::{Endpoint, SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

/// Client settings (frontend-agnostic)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    /// Last used server host
    #[serde(default = "default_host")]
    pub host: String,
    /// Last used server port (default: 9000)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Transfer chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Largest frame payload accepted or sent
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Per round-trip timeout in milliseconds
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    /// Default destination for downloads
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_max_frame_len() -> u32 {
    DEFAULT_MAX_FRAME_LEN
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

fn default_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|d| d.download_dir().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            chunk_size: default_chunk_size(),
            max_frame_len: default_max_frame_len(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            download_dir: default_download_dir(),
        }
    }
}

impl ClientSettings {
    /// Check that the numbers are usable together
    pub fn validate(&self) -> SessionResult<()> {
        if self.chunk_size == 0 {
            return Err(SessionError::InvalidConfig(
                "Chunk size must be greater than zero".to_string(),
            ));
        }
        let needed = self.chunk_size.saturating_add(FRAME_OVERHEAD_ALLOWANCE);
        if (self.max_frame_len as usize) < needed {
            return Err(SessionError::InvalidConfig(format!(
                "Maximum frame length {} is too small for {}-byte chunks (need at least {})",
                self.max_frame_len, self.chunk_size, needed
            )));
        }
        if self.connect_timeout_ms == 0 || self.io_timeout_ms == 0 {
            return Err(SessionError::InvalidConfig(
                "Timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Settings shared by a running client and mirrored to one JSON file
pub struct SettingsStore {
    settings: RwLock<ClientSettings>,
    file_path: PathBuf,
}

impl SettingsStore {
    /// Open the store in the per-user config directory
    pub fn new() -> SessionResult<Self> {
        Self::with_path(default_location()?)
    }

    /// Open the store at `file_path`, writing defaults there if nothing
    /// exists yet
    pub fn with_path(file_path: impl Into<PathBuf>) -> SessionResult<Self> {
        let file_path = file_path.into();
        let existed = file_path.exists();
        let settings = if existed {
            load_or_default(&file_path)?
        } else {
            ClientSettings::default()
        };

        let store = Self {
            settings: RwLock::new(settings),
            file_path,
        };
        if !existed {
            tracing::info!("Writing default client settings to {:?}", store.file_path);
            store.save()?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Snapshot of the current settings
    pub fn get(&self) -> ClientSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the settings after validating them, then save
    pub fn update(&self, new_settings: ClientSettings) -> SessionResult<()> {
        new_settings.validate()?;
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = new_settings;

        self.save().inspect_err(|e| {
            tracing::error!("Client settings kept in memory only: {}", e);
        })
    }

    /// Make `endpoint` the default server for the next start
    pub fn remember_endpoint(&self, endpoint: &Endpoint) -> SessionResult<()> {
        let mut settings = self.get();
        if settings.endpoint() == *endpoint {
            return Ok(());
        }
        tracing::info!("Default server is now {}", endpoint);
        settings.host = endpoint.host.clone();
        settings.port = endpoint.port;
        self.update(settings)
    }

    fn save(&self) -> SessionResult<()> {
        let json = serde_json::to_string_pretty(&self.get())?;
        if let Some(dir) = self.file_path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                SessionError::FileIo(format!("Cannot create {}: {}", dir.display(), e))
            })?;
        }
        fs::write(&self.file_path, json).map_err(|e| {
            SessionError::FileIo(format!(
                "Cannot save settings to {}: {}",
                self.file_path.display(),
                e
            ))
        })
    }
}

/// `settings.json` in the platform config directory for this client
fn default_location() -> SessionResult<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "cryptport", "client").ok_or_else(|| {
        SessionError::FileIo("No home directory to keep client settings in".to_string())
    })?;
    Ok(dirs.config_dir().join("settings.json"))
}

// A damaged or out-of-range file must not keep the client from starting
fn load_or_default(path: &Path) -> SessionResult<ClientSettings> {
    let text = fs::read_to_string(path).map_err(|e| {
        SessionError::FileIo(format!("Cannot read settings {}: {}", path.display(), e))
    })?;

    let parsed = serde_json::from_str::<ClientSettings>(&text)
        .map_err(SessionError::from)
        .and_then(|settings| settings.validate().map(|_| settings));
    match parsed {
        Ok(settings) => {
            tracing::debug!("Loaded client settings from {:?}", path);
            Ok(settings)
        }
        Err(e) => {
            tracing::warn!("Ignoring settings in {:?} ({}), using defaults", path, e);
            Ok(ClientSettings::default())
        }
    }
}
