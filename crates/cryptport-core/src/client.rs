// SPDX-License-Identifier: AGPL-3.0
// CryptPort Core - Server client
//
// Owns the single transport connection. Every command is one request frame
// followed by one response frame, and the whole round trip runs under the
// connection lock so frames from different operations never interleave.
//
// Transport and protocol failures are fatal: the connection is dropped,
// the session falls back to Disconnected and every job bound to the
// connection is cancelled. A well-formed error response only fails the
// request that caused it.

use crate::auth::redact;
use crate::codec::{keys, ClientCodec, Command, Request, Response};
use crate::settings::ClientSettings;
use crate::state::SessionStateMachine;
use crate::types::{
    ConnectionInfo, Endpoint, RemoteFileEntry, SessionError, SessionResult, SessionState,
};
use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// An open transport plus the token presented on it
struct Connection {
    generation: u64,
    framed: Framed<TcpStream, ClientCodec>,
    token: Option<String>,
}

/// Lock-free view of the current connection, readable while a round trip
/// holds the connection lock
struct Link {
    generation: u64,
    info: ConnectionInfo,
    /// Cancelled when the connection goes away; parent of all job tokens
    closed: CancellationToken,
}

/// Ties a transfer to the connection it started on
#[derive(Debug, Clone)]
pub struct JobScope {
    generation: u64,
    cancel: CancellationToken,
}

impl JobScope {
    /// Request cancellation of this job only
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One step of a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadChunk {
    Data(Bytes),
    End { checksum: String },
}

/// Client for the remote file-storage service
pub struct ServerClient {
    connection: Mutex<Option<Connection>>,
    link: StdMutex<Option<Link>>,
    next_generation: AtomicU64,
    state: Arc<SessionStateMachine>,
    settings: ClientSettings,
}

impl ServerClient {
    pub fn new(settings: ClientSettings, state: Arc<SessionStateMachine>) -> Self {
        Self {
            connection: Mutex::new(None),
            link: StdMutex::new(None),
            next_generation: AtomicU64::new(1),
            state,
            settings,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// Details of the open connection, if any
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.lock_link().as_ref().map(|link| link.info.clone())
    }

    /// Open the transport. On failure the session stays Disconnected.
    pub async fn connect(&self, host: &str, port: u16) -> SessionResult<()> {
        let endpoint = Endpoint {
            host: host.trim().to_string(),
            port,
        };
        if endpoint.host.is_empty() || endpoint.port == 0 {
            return Err(SessionError::Validation(
                "A host and a non-zero port are required".to_string(),
            ));
        }

        self.state.begin_connect()?;
        tracing::info!("Connecting to {}", endpoint);

        let stream = match self.open_stream(&endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Connection to {} failed: {}", endpoint, e);
                self.state.disconnected(&format!("Connection failed: {}", e));
                return Err(e);
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.connection.lock().await;

        // A disconnect may have raced the connect; the stream is dropped then
        self.state
            .connected(&format!("Connected to {}", endpoint))
            .map_err(|_| SessionError::Transport("Connection attempt was cancelled".to_string()))?;

        *self.lock_link() = Some(Link {
            generation,
            info: ConnectionInfo {
                host: endpoint.host.clone(),
                port: endpoint.port,
                connected_at: Utc::now(),
            },
            closed: CancellationToken::new(),
        });
        *guard = Some(Connection {
            generation,
            framed: Framed::new(stream, ClientCodec::new(self.settings.max_frame_len)),
            token: None,
        });

        tracing::info!("Connected to {}", endpoint);
        Ok(())
    }

    async fn open_stream(&self, endpoint: &Endpoint) -> SessionResult<TcpStream> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let stream = timeout(self.settings.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| SessionError::Transport(format!("Connect to {} timed out", addr)))?
            .map_err(|e| SessionError::Transport(format!("Cannot connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    /// Present a token. Any failure closes the connection; a connection is
    /// never left half-authenticated.
    pub async fn authenticate(&self, token: &str) -> SessionResult<()> {
        if token.is_empty() {
            return Err(SessionError::Validation(
                "A session token is required".to_string(),
            ));
        }
        self.state.begin_auth()?;
        tracing::info!("Authenticating with token {}", redact(token));

        let request = Request::new(Command::Auth).with_token(token);
        match self.round_trip(request, None).await {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Authentication failed: {}", e);
                self.close(None, &format!("Authentication failed: {}", e))
                    .await;
                return Err(e);
            }
        }

        {
            let mut guard = self.connection.lock().await;
            match guard.as_mut() {
                Some(conn) => conn.token = Some(token.to_string()),
                None => {
                    return Err(SessionError::Transport(
                        "Connection closed during authentication".to_string(),
                    ))
                }
            }
        }
        if let Err(e) = self.state.authenticated() {
            self.close(None, "Session changed during authentication").await;
            return Err(e);
        }

        tracing::info!("Session authenticated");
        Ok(())
    }

    /// List the files stored on the server
    pub async fn list_files(&self) -> SessionResult<Vec<RemoteFileEntry>> {
        self.state.require_authenticated()?;
        let response = self.round_trip(Request::new(Command::List), None).await?;

        match serde_json::from_slice::<Vec<RemoteFileEntry>>(&response.body) {
            Ok(entries) => {
                tracing::debug!("Listed {} remote files", entries.len());
                Ok(entries)
            }
            Err(e) => Err(self
                .protocol_failure(None, format!("Malformed file list: {}", e))
                .await),
        }
    }

    /// Delete one remote file, returning the server's message
    pub async fn delete_file(&self, name: &str) -> SessionResult<String> {
        if name.trim().is_empty() {
            return Err(SessionError::Validation("A file name is required".to_string()));
        }
        self.state.require_authenticated()?;

        let request = Request::new(Command::Delete).with_meta(keys::NAME, name);
        let response = self.round_trip(request, None).await?;
        tracing::info!("Deleted remote file {}", name);
        Ok(if response.message.is_empty() {
            format!("Deleted {}", name)
        } else {
            response.message
        })
    }

    /// Close the connection and cancel its jobs. Always ends Disconnected.
    pub async fn disconnect(&self) {
        self.close(None, "Disconnected").await;
    }

    /// Same as `disconnect`, with the reason frontends will see
    pub async fn disconnect_with_reason(&self, reason: &str) {
        self.close(None, reason).await;
    }

    /// Bind a new job to the current authenticated connection
    pub fn job_scope(&self) -> SessionResult<JobScope> {
        self.state.require_authenticated()?;
        let link = self.lock_link();
        let link = link.as_ref().ok_or(SessionError::NotAuthenticated)?;
        Ok(JobScope {
            generation: link.generation,
            cancel: link.closed.child_token(),
        })
    }

    pub async fn upload_begin(
        &self,
        scope: &JobScope,
        transfer_id: &str,
        name: &str,
        size: u64,
    ) -> SessionResult<()> {
        let request = Request::new(Command::UploadBegin)
            .with_meta(keys::TRANSFER, transfer_id)
            .with_meta(keys::NAME, name)
            .with_meta(keys::SIZE, size);
        self.round_trip(request, Some(scope)).await.map(|_| ())
    }

    pub async fn upload_chunk(
        &self,
        scope: &JobScope,
        transfer_id: &str,
        offset: u64,
        data: Bytes,
    ) -> SessionResult<()> {
        let request = Request::new(Command::UploadChunk)
            .with_meta(keys::TRANSFER, transfer_id)
            .with_meta(keys::OFFSET, offset)
            .with_body(data);
        self.round_trip(request, Some(scope)).await.map(|_| ())
    }

    pub async fn upload_end(
        &self,
        scope: &JobScope,
        transfer_id: &str,
        checksum: &str,
    ) -> SessionResult<String> {
        let request = Request::new(Command::UploadEnd)
            .with_meta(keys::TRANSFER, transfer_id)
            .with_meta(keys::CHECKSUM, checksum);
        let response = self.round_trip(request, Some(scope)).await?;
        Ok(response.message)
    }

    /// Start a download, returning the announced size
    pub async fn download_begin(
        &self,
        scope: &JobScope,
        transfer_id: &str,
        name: &str,
    ) -> SessionResult<u64> {
        let request = Request::new(Command::DownloadBegin)
            .with_meta(keys::TRANSFER, transfer_id)
            .with_meta(keys::NAME, name);
        let response = self.round_trip(request, Some(scope)).await?;
        match response.meta_u64(keys::SIZE) {
            Ok(size) => Ok(size),
            Err(e) => Err(self.protocol_failure(Some(scope), e.to_string()).await),
        }
    }

    pub async fn download_chunk(
        &self,
        scope: &JobScope,
        transfer_id: &str,
        offset: u64,
    ) -> SessionResult<DownloadChunk> {
        let request = Request::new(Command::DownloadChunk)
            .with_meta(keys::TRANSFER, transfer_id)
            .with_meta(keys::OFFSET, offset);
        let response = self.round_trip(request, Some(scope)).await?;

        if response.meta(keys::END) == Some("true") {
            return match response.meta(keys::CHECKSUM) {
                Some(checksum) => Ok(DownloadChunk::End {
                    checksum: checksum.to_string(),
                }),
                None => Err(self
                    .protocol_failure(Some(scope), "End marker without checksum".to_string())
                    .await),
            };
        }
        if response.body.is_empty() {
            return Err(self
                .protocol_failure(Some(scope), "Empty download chunk".to_string())
                .await);
        }
        Ok(DownloadChunk::Data(response.body))
    }

    /// True while the connection a job started on is still open
    pub fn is_live(&self, scope: &JobScope) -> bool {
        self.lock_link()
            .as_ref()
            .is_some_and(|link| link.generation == scope.generation && !link.closed.is_cancelled())
    }

    /// Tear down the connection a job is bound to. Used after a protocol
    /// violation of its own or a user cancel, since the server has no way
    /// to hear that a transfer was abandoned.
    pub async fn abort(&self, scope: &JobScope, reason: &str) {
        self.close(Some(scope.generation), reason).await;
    }

    async fn protocol_failure(&self, scope: Option<&JobScope>, message: String) -> SessionError {
        tracing::error!("Protocol violation: {}", message);
        self.close(
            scope.map(|s| s.generation),
            &format!("Protocol error: {}", message),
        )
        .await;
        SessionError::Protocol(message)
    }

    /// Send one request and wait for its response under the connection lock
    async fn round_trip(
        &self,
        mut request: Request,
        scope: Option<&JobScope>,
    ) -> SessionResult<Response> {
        let mut guard = self.connection.lock().await;

        if let Some(scope) = scope {
            let bound = guard
                .as_ref()
                .is_some_and(|conn| conn.generation == scope.generation);
            if scope.is_cancelled() || !bound {
                return Err(SessionError::Cancelled);
            }
        }

        let conn = guard
            .as_mut()
            .ok_or_else(|| SessionError::Transport("Not connected".to_string()))?;
        if request.token.is_none() {
            request.token = conn.token.clone();
        }

        let command = request.command;
        let generation = conn.generation;
        let closed = self
            .lock_link()
            .as_ref()
            .filter(|link| link.generation == generation)
            .map(|link| link.closed.clone())
            .unwrap_or_default();

        // Whoever cancelled `closed` owns the teardown; jobs just stop
        let outcome = tokio::select! {
            _ = closed.cancelled() => Err(match scope {
                Some(_) => SessionError::Cancelled,
                None => SessionError::Transport("Connection closed".to_string()),
            }),
            result = timeout(self.settings.io_timeout(), exchange(&mut conn.framed, request)) => {
                result.unwrap_or_else(|_| {
                    Err(SessionError::Transport(format!("{} timed out", command)))
                })
            }
        };

        match outcome {
            Ok(response) => response.into_result(),
            Err(e) => {
                if e.is_fatal() {
                    tracing::error!("{} failed, dropping connection: {}", command, e);
                    *guard = None;
                    drop(guard);
                    self.detach(generation, &e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Close the current connection, or only the given generation
    async fn close(&self, generation: Option<u64>, reason: &str) {
        let detached = {
            let mut link = self.lock_link();
            let targeted = match (link.as_ref(), generation) {
                (Some(current), Some(wanted)) => current.generation == wanted,
                _ => true,
            };
            if targeted {
                link.take()
            } else {
                None
            }
        };

        let Some(link) = detached else {
            if generation.is_none() {
                self.state.disconnected(reason);
            }
            return;
        };

        link.closed.cancel();
        self.state.disconnected(reason);
        tracing::info!(
            "Closed connection to {}:{} ({})",
            link.info.host,
            link.info.port,
            reason
        );

        let mut guard = self.connection.lock().await;
        if guard
            .as_ref()
            .is_some_and(|conn| conn.generation == link.generation)
        {
            *guard = None;
        }
    }

    /// Forget a connection whose stream has already been dropped
    fn detach(&self, generation: u64, reason: &str) {
        let link = {
            let mut link = self.lock_link();
            if link.as_ref().is_some_and(|l| l.generation == generation) {
                link.take()
            } else {
                None
            }
        };
        if let Some(link) = link {
            link.closed.cancel();
            self.state.disconnected(reason);
        }
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn exchange(
    framed: &mut Framed<TcpStream, ClientCodec>,
    request: Request,
) -> SessionResult<Response> {
    framed.send(request).await?;
    match framed.next().await {
        Some(response) => response,
        None => Err(SessionError::Transport(
            "Connection closed by server".to_string(),
        )),
    }
}
