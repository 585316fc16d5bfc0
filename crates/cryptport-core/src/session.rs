// SPDX-License-Identifier: AGPL-3.0
// CryptPort Core - Session facade
//
// The one object frontends talk to. It wires the auth service, state
// machine, server client and transfer workers together and publishes
// every outcome on a single event channel.

use crate::auth::{AuthService, Authenticator};
use crate::client::{JobScope, ServerClient};
use crate::events::EventSink;
use crate::history::TransferHistory;
use crate::settings::ClientSettings;
use crate::state::SessionStateMachine;
use crate::transfer::{SharedJob, TransferWorker};
use crate::types::{
    ConnectionInfo, JobId, RemoteFileEntry, SessionError, SessionEvent, SessionResult,
    SessionState, TransferDirection, TransferJob,
};
use async_channel::Receiver;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;

struct LiveJob {
    job: SharedJob,
    scope: JobScope,
}

type JobRegistry = Arc<Mutex<HashMap<JobId, LiveJob>>>;

/// Client session: credentials, connection and transfers
pub struct Session {
    auth: Arc<AuthService>,
    state: Arc<SessionStateMachine>,
    client: Arc<ServerClient>,
    jobs: JobRegistry,
    history: Arc<TransferHistory>,
    events: EventSink,
}

impl Session {
    /// Create a session and the receiver its events are delivered to.
    ///
    /// The session keeps no receiver of its own: once the caller drops the
    /// returned one, events are discarded instead of queued.
    pub fn new(settings: ClientSettings) -> SessionResult<(Self, Receiver<SessionEvent>)> {
        Self::build(settings, AuthService::new())
    }

    pub fn with_authenticator(
        settings: ClientSettings,
        authenticator: impl Authenticator + 'static,
    ) -> SessionResult<(Self, Receiver<SessionEvent>)> {
        Self::build(settings, AuthService::with_authenticator(authenticator))
    }

    fn build(
        settings: ClientSettings,
        auth: AuthService,
    ) -> SessionResult<(Self, Receiver<SessionEvent>)> {
        settings.validate()?;
        let (events, event_rx) = EventSink::channel();
        let state = Arc::new(SessionStateMachine::new(events.clone()));
        let client = Arc::new(ServerClient::new(settings, state.clone()));

        let session = Self {
            auth: Arc::new(auth),
            state,
            client,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            history: Arc::new(TransferHistory::new()),
            events,
        };
        Ok((session, event_rx))
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn history(&self) -> &TransferHistory {
        &self.history
    }

    pub fn settings(&self) -> &ClientSettings {
        self.client.settings()
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.client.connection_info()
    }

    // -- Authentication --------------------------------------------------

    pub async fn login(&self, email: &str, password: &str) -> SessionResult<String> {
        let result = self.auth.login(email, password).await;
        let (success, message) = match &result {
            Ok(_) => (true, format!("Logged in as {}", email.trim())),
            Err(e) => (false, e.to_string()),
        };
        self.events.emit(SessionEvent::AuthResult { success, message });
        result
    }

    /// Forget the token and drop any open connection
    pub async fn logout(&self) {
        self.auth.logout();
        if self.state.current() != SessionState::Disconnected {
            self.client.disconnect_with_reason("Logged out").await;
        }
    }

    // -- Connection ------------------------------------------------------

    pub async fn connect(&self, host: &str, port: u16) -> SessionResult<()> {
        self.client.connect(host, port).await
    }

    pub async fn authenticate(&self, token: &str) -> SessionResult<()> {
        self.client.authenticate(token).await
    }

    /// Connect and present the logged-in token in one step
    pub async fn open(&self, host: &str, port: u16) -> SessionResult<()> {
        if !self.auth.is_authenticated() {
            return Err(SessionError::NotAuthenticated);
        }
        self.client.connect(host, port).await?;
        self.client.authenticate(&self.auth.get_token()).await
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    // -- Remote files ----------------------------------------------------

    pub async fn list_files(&self) -> SessionResult<Vec<RemoteFileEntry>> {
        let result = self.client.list_files().await;
        let event = match &result {
            Ok(entries) => SessionEvent::FileList {
                success: true,
                entries: entries.clone(),
                message: String::new(),
            },
            Err(e) => SessionEvent::FileList {
                success: false,
                entries: Vec::new(),
                message: e.to_string(),
            },
        };
        self.events.emit(event);
        result
    }

    pub async fn delete_file(&self, name: &str) -> SessionResult<String> {
        self.client.delete_file(name).await
    }

    // -- Transfers -------------------------------------------------------

    /// Upload a local file under its own name. Must be called from within
    /// a Tokio runtime.
    pub fn start_upload(&self, local_path: impl AsRef<Path>) -> SessionResult<JobId> {
        let local_path = local_path.as_ref().to_path_buf();
        let remote_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| SessionError::Validation("Invalid file path".to_string()))?;

        self.start(TransferDirection::Upload, local_path, remote_name)
    }

    /// Download a remote file. An empty `local_path` saves it under the
    /// configured download directory.
    pub fn start_download(
        &self,
        remote_name: &str,
        local_path: impl AsRef<Path>,
    ) -> SessionResult<JobId> {
        let remote_name = sanitize_remote_name(remote_name)?;
        let local_path = local_path.as_ref();
        let local_path = if local_path.as_os_str().is_empty() {
            self.settings().download_dir.join(&remote_name)
        } else {
            local_path.to_path_buf()
        };

        self.start(TransferDirection::Download, local_path, remote_name)
    }

    fn start(
        &self,
        direction: TransferDirection,
        local_path: PathBuf,
        remote_name: String,
    ) -> SessionResult<JobId> {
        let scope = self.client.job_scope()?;
        let job = TransferJob::new(direction, local_path, remote_name);
        let id = job.id;
        let shared: SharedJob = Arc::new(RwLock::new(job));

        lock_jobs(&self.jobs).insert(
            id,
            LiveJob {
                job: shared.clone(),
                scope: scope.clone(),
            },
        );

        let jobs = self.jobs.clone();
        let history = self.history.clone();
        TransferWorker::new(self.client.clone(), self.events.clone(), shared, scope)
            .on_finish(move |finished| {
                lock_jobs(&jobs).remove(&finished.id);
                history.add(finished.clone());
            })
            .spawn();

        tracing::info!("Queued {:?} job {}", direction, id);
        Ok(id)
    }

    /// Ask a running job to stop at its next chunk boundary
    pub fn cancel_transfer(&self, id: JobId) -> SessionResult<()> {
        let finishing = match lock_jobs(&self.jobs).get(&id) {
            Some(live) => {
                let done = live
                    .job
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .status
                    .is_terminal();
                if !done {
                    tracing::info!("Cancelling transfer {}", id);
                    live.scope.cancel();
                    return Ok(());
                }
                true
            }
            None => false,
        };
        if finishing || self.history.get(&id).is_some() {
            return Err(SessionError::Validation(format!(
                "Transfer {} has already finished",
                id
            )));
        }
        Err(SessionError::Validation(format!("Unknown transfer {}", id)))
    }

    /// Current snapshot of a live or finished job
    pub fn job(&self, id: JobId) -> Option<TransferJob> {
        let live = lock_jobs(&self.jobs)
            .get(&id)
            .map(|live| live.job.read().unwrap_or_else(|e| e.into_inner()).clone());
        live.or_else(|| self.history.get(&id))
    }

    /// Snapshots of jobs that have not finished yet
    pub fn active_jobs(&self) -> Vec<TransferJob> {
        lock_jobs(&self.jobs)
            .values()
            .map(|live| live.job.read().unwrap_or_else(|e| e.into_inner()).clone())
            .collect()
    }
}

fn lock_jobs(jobs: &JobRegistry) -> std::sync::MutexGuard<'_, HashMap<JobId, LiveJob>> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

/// Remote names are flat; reject anything that looks like a path
fn sanitize_remote_name(name: &str) -> SessionResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains('/')
        || trimmed.contains('\\')
    {
        return Err(SessionError::Validation(format!(
            "Invalid remote file name '{}'",
            name
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_remote_name() {
        assert_eq!(sanitize_remote_name(" report.pdf ").unwrap(), "report.pdf");
        assert!(sanitize_remote_name("").is_err());
        assert!(sanitize_remote_name("..").is_err());
        assert!(sanitize_remote_name("../etc/passwd").is_err());
        assert!(sanitize_remote_name("a\\b").is_err());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = ClientSettings::default();
        settings.chunk_size = 0;
        assert!(matches!(
            Session::new(settings),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_transfers_require_authenticated_session() {
        let (session, _events) = Session::new(ClientSettings::default()).unwrap();
        assert!(matches!(
            session.start_upload("/tmp/whatever.bin"),
            Err(SessionError::NotAuthenticated)
        ));
        assert!(matches!(
            session.start_download("a.txt", ""),
            Err(SessionError::NotAuthenticated)
        ));
        assert!(session.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_upload_path_without_file_name_rejected() {
        let (session, _events) = Session::new(ClientSettings::default()).unwrap();
        assert!(matches!(
            session.start_upload("/"),
            Err(SessionError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_open_requires_login() {
        let (session, _events) = Session::new(ClientSettings::default()).unwrap();
        assert!(matches!(
            session.open("127.0.0.1", 9000).await,
            Err(SessionError::NotAuthenticated)
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_login_emits_auth_result() {
        let (session, events) = Session::new(ClientSettings::default()).unwrap();

        assert!(session.login("", "secret").await.is_err());
        let token = session.login("user@example.com", "secret").await.unwrap();
        assert_eq!(session.auth().get_token(), token);

        let results: Vec<bool> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                SessionEvent::AuthResult { success, .. } => Some(success),
                _ => None,
            })
            .collect();
        assert_eq!(results, vec![false, true]);

        session.logout().await;
        assert!(!session.auth().is_authenticated());
    }

    #[tokio::test]
    async fn test_works_after_event_receiver_dropped() {
        let (session, events) = Session::new(ClientSettings::default()).unwrap();
        drop(events);

        session.login("user@example.com", "secret").await.unwrap();
        assert!(session.auth().is_authenticated());
        assert!(session.list_files().await.is_err());
    }

    #[test]
    fn test_cancel_unknown_job() {
        let (session, _events) = Session::new(ClientSettings::default()).unwrap();
        assert!(matches!(
            session.cancel_transfer(uuid::Uuid::new_v4()),
            Err(SessionError::Validation(_))
        ));
    }
}
