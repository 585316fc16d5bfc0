// SPDX-License-Identifier: AGPL-3.0
// CryptPort Core - Type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Identifier of a transfer job
pub type JobId = Uuid;

/// Login credentials. Held only for the duration of a login call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Reject empty fields before any I/O happens
    pub fn validate(&self) -> SessionResult<()> {
        if self.email.trim().is_empty() || self.password.is_empty() {
            return Err(SessionError::Validation(
                "Please enter email and password".to_string(),
            ));
        }
        Ok(())
    }
}

// Never print the password
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Account registration form, validated locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm: String,
}

/// Minimum password length accepted at registration
pub const MIN_PASSWORD_LEN: usize = 6;

impl Registration {
    pub fn validate(&self) -> SessionResult<()> {
        let username = self.username.trim();
        let email = self.email.trim();
        let password = self.password.trim();
        let confirm = self.confirm.trim();

        if username.is_empty() || email.is_empty() || password.is_empty() {
            return Err(SessionError::Validation(
                "Please fill in all fields".to_string(),
            ));
        }
        if password != confirm {
            return Err(SessionError::Validation(
                "Passwords do not match".to_string(),
            ));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(SessionError::Validation(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        Ok(())
    }
}

/// A validated host/port pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse user-entered host and port text
    pub fn parse(host: &str, port: &str) -> SessionResult<Self> {
        let host = host.trim();
        let port = port.trim();

        if host.is_empty() || port.is_empty() {
            return Err(SessionError::Validation(
                "Host and port are required".to_string(),
            ));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| SessionError::Validation("Port must be a number".to_string()))?;
        if port == 0 {
            return Err(SessionError::Validation(
                "Port must be between 1 and 65535".to_string(),
            ));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection/authentication status of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    ConnectedUnauthenticated,
    Authenticating,
    Authenticated,
}

impl SessionState {
    /// True while a transport connection is open
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::ConnectedUnauthenticated | Self::Authenticating | Self::Authenticated
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::ConnectedUnauthenticated => "connected (unauthenticated)",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
        };
        f.write_str(label)
    }
}

/// One file on the remote service, as returned by a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFileEntry {
    pub name: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Details of the open connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of one upload or download
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferJob {
    pub id: JobId,
    pub direction: TransferDirection,
    pub local_path: PathBuf,
    pub remote_name: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub status: TransferStatus,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferJob {
    pub fn new(direction: TransferDirection, local_path: PathBuf, remote_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            local_path,
            remote_name,
            total_bytes: 0,
            transferred_bytes: 0,
            status: TransferStatus::Pending,
            message: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Completion ratio in percent (100 for empty files)
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.transferred_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Notifications delivered to frontends
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Outcome of a login attempt
    AuthResult { success: bool, message: String },
    /// Transport connected or disconnected
    ConnectionChanged { connected: bool, reason: String },
    /// Session state transition
    StateChanged { state: SessionState },
    /// Per-chunk transfer progress
    #[serde(rename_all = "camelCase")]
    TransferProgress {
        job_id: JobId,
        transferred_bytes: u64,
        total_bytes: u64,
    },
    /// The single terminal notification of a job
    #[serde(rename_all = "camelCase")]
    TransferFinished {
        job_id: JobId,
        success: bool,
        status: TransferStatus,
        message: String,
    },
    /// Result of a listing
    FileList {
        success: bool,
        entries: Vec<RemoteFileEntry>,
        message: String,
    },
}

/// Error types for the session layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server rejected request: {0}")]
    ServerRejected(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("File I/O error: {0}")]
    FileIo(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionError {
    /// Errors after which the connection is assumed dead
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }
}

// Socket I/O is the only io::Error source that flows through `?`;
// local file errors are mapped to FileIo explicitly.
impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Serialization(err.to_string())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
