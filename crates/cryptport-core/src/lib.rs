// SPDX-License-Identifier: AGPL-3.0
// CryptPort Core - Client session layer for remote file storage
//
// This crate provides:
// - Wire codec for the framed request/response protocol
// - AuthService for login and token custody
// - ServerClient owning the single server connection
// - TransferWorker for chunked uploads and downloads
// - SessionStateMachine and the Session facade frontends drive
// - SettingsStore for persistent client settings
//
// Frontend-specific code lives in separate crates.

pub mod auth;
pub mod client;
pub mod codec;
pub mod events;
pub mod history;
pub mod session;
pub mod settings;
pub mod state;
pub mod transfer;
pub mod types;

// Re-export commonly used items
pub use auth::{AuthService, Authenticator, LocalAuthenticator};
pub use client::{DownloadChunk, JobScope, ServerClient};
pub use codec::{ClientCodec, Command, Request, Response, ServerCodec, Status};
pub use events::EventSink;
pub use history::TransferHistory;
pub use session::Session;
pub use settings::{ClientSettings, SettingsStore};
pub use state::SessionStateMachine;
pub use transfer::{checksum, TransferWorker};
pub use types::{
    ConnectionInfo, Credentials, Endpoint, JobId, Registration, RemoteFileEntry, SessionError,
    SessionEvent, SessionResult, SessionState, TransferDirection, TransferJob, TransferStatus,
};
