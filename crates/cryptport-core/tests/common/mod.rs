#![allow(dead_code)]

pub mod mock_server;

use async_channel::Receiver;
use cryptport_core::{
    Authenticator, ClientSettings, Credentials, JobId, Session, SessionEvent, SessionResult,
    TransferStatus,
};
use futures::future::BoxFuture;
use mock_server::{MockServer, ACCEPTED_TOKEN};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Hands out a fixed token for any credentials
pub struct FixedAuthenticator(pub String);

impl Authenticator for FixedAuthenticator {
    fn authenticate<'a>(
        &'a self,
        _credentials: &'a Credentials,
    ) -> BoxFuture<'a, SessionResult<String>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

pub fn setup_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

pub fn test_settings(download_dir: &Path) -> ClientSettings {
    ClientSettings {
        connect_timeout_ms: 2_000,
        io_timeout_ms: 5_000,
        download_dir: download_dir.to_path_buf(),
        ..ClientSettings::default()
    }
}

pub fn session_with_token(
    download_dir: &Path,
    token: &str,
) -> (Session, Receiver<SessionEvent>) {
    Session::with_authenticator(
        test_settings(download_dir),
        FixedAuthenticator(token.to_string()),
    )
    .expect("valid settings")
}

/// Logged in and authenticated against `server`
pub async fn open_session(
    server: &MockServer,
    download_dir: &Path,
) -> (Session, Receiver<SessionEvent>) {
    let (session, events) = session_with_token(download_dir, ACCEPTED_TOKEN);
    session
        .login("user@example.com", "secret")
        .await
        .expect("login");
    session
        .open("127.0.0.1", server.port)
        .await
        .expect("open session");
    (session, events)
}

/// Outcome of one job as seen on the event channel
#[derive(Debug)]
pub struct JobOutcome {
    pub status: TransferStatus,
    pub success: bool,
    pub message: String,
    pub progress: Vec<u64>,
}

/// Collect events for `job` until its terminal event arrives
pub async fn wait_for_job(events: &Receiver<SessionEvent>, job: JobId) -> JobOutcome {
    let mut progress = Vec::new();
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for transfer events")
            .expect("event channel closed");
        match event {
            SessionEvent::TransferProgress {
                job_id,
                transferred_bytes,
                ..
            } if job_id == job => progress.push(transferred_bytes),
            SessionEvent::TransferFinished {
                job_id,
                success,
                status,
                message,
            } if job_id == job => {
                return JobOutcome {
                    status,
                    success,
                    message,
                    progress,
                }
            }
            _ => {}
        }
    }
}

/// Block until the first progress event of `job`
pub async fn wait_for_progress(events: &Receiver<SessionEvent>, job: JobId) -> u64 {
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for progress")
            .expect("event channel closed");
        if let SessionEvent::TransferProgress {
            job_id,
            transferred_bytes,
            ..
        } = event
        {
            if job_id == job {
                return transferred_bytes;
            }
        }
    }
}

/// Deterministic non-repeating payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Remove everything queued so far
pub fn drain(events: &Receiver<SessionEvent>) -> Vec<SessionEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}
