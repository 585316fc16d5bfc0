// SPDX-License-Identifier: AGPL-3.0
// CryptPort Core - Transfer worker
//
// Runs one upload or download on its own task. Progress is published once
// per chunk, and every job ends with exactly one TransferFinished event.
// Cancellation is checked at each chunk boundary and closes the connection.

use crate::client::{DownloadChunk, JobScope, ServerClient};
use crate::events::EventSink;
use crate::types::{
    SessionError, SessionEvent, SessionResult, TransferDirection, TransferJob, TransferStatus,
};
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

/// Shared, live view of a job
pub type SharedJob = Arc<RwLock<TransferJob>>;

/// Called with the final snapshot just before the terminal event
pub type FinishHook = Box<dyn FnOnce(&TransferJob) + Send + Sync + 'static>;

/// Lowercase hex SHA-256 of a whole payload
pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Executes exactly one transfer job
pub struct TransferWorker {
    client: Arc<ServerClient>,
    events: EventSink,
    job: SharedJob,
    scope: JobScope,
    chunk_size: usize,
    on_finish: Option<FinishHook>,
}

impl TransferWorker {
    pub fn new(
        client: Arc<ServerClient>,
        events: EventSink,
        job: SharedJob,
        scope: JobScope,
    ) -> Self {
        let chunk_size = client.settings().chunk_size.max(1);
        Self {
            client,
            events,
            job,
            scope,
            chunk_size,
            on_finish: None,
        }
    }

    pub fn on_finish(mut self, hook: impl FnOnce(&TransferJob) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Box::new(hook));
        self
    }

    /// Run on a new task; resolves to the final job snapshot
    pub fn spawn(self) -> JoinHandle<TransferJob> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> TransferJob {
        let (direction, remote_name) = {
            let mut job = self.write_job();
            job.status = TransferStatus::Running;
            (job.direction, job.remote_name.clone())
        };
        tracing::info!("Starting {:?} of {}", direction, remote_name);

        let outcome = match direction {
            TransferDirection::Upload => self.upload().await,
            TransferDirection::Download => self.download().await,
        };

        self.finish(outcome).await
    }

    async fn upload(&self) -> SessionResult<String> {
        let (id, local_path, remote_name) = self.identity();

        let mut file = File::open(&local_path)
            .await
            .map_err(|e| SessionError::FileIo(format!("Failed to open file: {}", e)))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| SessionError::FileIo(format!("Failed to get file metadata: {}", e)))?
            .len();
        self.write_job().total_bytes = total;

        self.checkpoint()?;
        self.client
            .upload_begin(&self.scope, &id, &remote_name, total)
            .await?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut sent: u64 = 0;

        while sent < total {
            self.checkpoint()?;

            let want = (total - sent).min(self.chunk_size as u64) as usize;
            let read = read_chunk(&mut file, &mut buf[..want])
                .await
                .map_err(|e| SessionError::FileIo(format!("Failed to read file: {}", e)))?;
            if read < want {
                return Err(SessionError::FileIo(
                    "File shrank while uploading".to_string(),
                ));
            }

            hasher.update(&buf[..read]);
            self.client
                .upload_chunk(&self.scope, &id, sent, Bytes::copy_from_slice(&buf[..read]))
                .await?;

            sent += read as u64;
            self.progress(sent, total);
        }

        self.checkpoint()?;
        let digest = format!("{:x}", hasher.finalize());
        let reply = self.client.upload_end(&self.scope, &id, &digest).await?;

        Ok(if reply.is_empty() {
            format!("Uploaded {} ({} bytes)", remote_name, total)
        } else {
            reply
        })
    }

    /// Chunks land in `<name>.part` next to the destination, which is only
    /// replaced once the checksum matched
    async fn download(&self) -> SessionResult<String> {
        let (_, local_path, _) = self.identity();
        let part_path = part_path(&local_path)?;
        let mut created = false;

        let result = self.receive(&local_path, &part_path, &mut created).await;
        if result.is_err() && created {
            match fs::remove_file(&part_path).await {
                Ok(()) => tracing::info!("Removed partial download {:?}", part_path),
                Err(e) => tracing::warn!("Failed to remove partial download {:?}: {}", part_path, e),
            }
        }
        result
    }

    async fn receive(
        &self,
        local_path: &Path,
        part_path: &Path,
        created: &mut bool,
    ) -> SessionResult<String> {
        let (id, _, remote_name) = self.identity();

        self.checkpoint()?;
        let total = self
            .client
            .download_begin(&self.scope, &id, &remote_name)
            .await?;
        self.write_job().total_bytes = total;

        let mut hasher = Sha256::new();
        let mut file: Option<File> = None;
        let mut received: u64 = 0;

        loop {
            self.checkpoint()?;

            match self.client.download_chunk(&self.scope, &id, received).await? {
                DownloadChunk::Data(data) => {
                    let len = data.len() as u64;
                    if len > self.chunk_size as u64 || received + len > total {
                        return Err(self
                            .protocol_violation(format!(
                                "Server sent {} bytes at offset {} of {}",
                                len, received, total
                            ))
                            .await);
                    }

                    if file.is_none() {
                        file = Some(create_destination(part_path).await?);
                        *created = true;
                    }
                    if let Some(out) = file.as_mut() {
                        out.write_all(&data).await.map_err(|e| {
                            SessionError::FileIo(format!("Failed to write file: {}", e))
                        })?;
                    }

                    hasher.update(&data);
                    received += len;
                    self.progress(received, total);
                }
                DownloadChunk::End { checksum } => {
                    if received != total {
                        return Err(self
                            .protocol_violation(format!(
                                "Download ended after {} of {} bytes",
                                received, total
                            ))
                            .await);
                    }
                    let digest = format!("{:x}", hasher.finalize());
                    if !digest.eq_ignore_ascii_case(&checksum) {
                        return Err(self
                            .protocol_violation("Checksum mismatch".to_string())
                            .await);
                    }

                    let mut out = match file.take() {
                        Some(out) => out,
                        None => {
                            let out = create_destination(part_path).await?;
                            *created = true;
                            out
                        }
                    };
                    out.flush()
                        .await
                        .map_err(|e| SessionError::FileIo(format!("Failed to write file: {}", e)))?;
                    out.sync_all()
                        .await
                        .map_err(|e| SessionError::FileIo(format!("Failed to write file: {}", e)))?;
                    drop(out);

                    fs::rename(part_path, local_path).await.map_err(|e| {
                        SessionError::FileIo(format!(
                            "Failed to move download into {}: {}",
                            local_path.display(),
                            e
                        ))
                    })?;

                    return Ok(format!(
                        "Downloaded {} to {} ({} bytes)",
                        remote_name,
                        local_path.display(),
                        total
                    ));
                }
            }
        }
    }

    async fn protocol_violation(&self, message: String) -> SessionError {
        tracing::error!("Download protocol violation: {}", message);
        self.client
            .abort(&self.scope, &format!("Protocol error: {}", message))
            .await;
        SessionError::Protocol(message)
    }

    /// Stop at a chunk boundary once cancellation was requested
    fn checkpoint(&self) -> SessionResult<()> {
        if self.scope.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn progress(&self, transferred: u64, total: u64) {
        let id = {
            let mut job = self.write_job();
            job.transferred_bytes = job.transferred_bytes.max(transferred);
            job.id
        };
        self.events.emit(SessionEvent::TransferProgress {
            job_id: id,
            transferred_bytes: transferred,
            total_bytes: total,
        });
    }

    async fn finish(mut self, outcome: SessionResult<String>) -> TransferJob {
        let (status, message) = match outcome {
            Ok(summary) => (TransferStatus::Succeeded, summary),
            // A user cancel leaves the server mid-transfer, so the job
            // drops its connection; a teardown by someone else already did
            Err(SessionError::Cancelled) if self.client.is_live(&self.scope) => {
                self.client.abort(&self.scope, "Transfer cancelled").await;
                (TransferStatus::Cancelled, "Transfer cancelled".to_string())
            }
            Err(SessionError::Cancelled) => (
                TransferStatus::Cancelled,
                "Transfer cancelled: connection closed".to_string(),
            ),
            Err(e) => (TransferStatus::Failed, e.to_string()),
        };

        let snapshot = {
            let mut job = self.write_job();
            job.status = status;
            job.message = Some(message.clone());
            job.finished_at = Some(Utc::now());
            job.clone()
        };

        match status {
            TransferStatus::Succeeded => tracing::info!("Transfer {} finished: {}", snapshot.id, message),
            _ => tracing::warn!("Transfer {} {:?}: {}", snapshot.id, status, message),
        }

        if let Some(hook) = self.on_finish.take() {
            hook(&snapshot);
        }

        self.events.emit(SessionEvent::TransferFinished {
            job_id: snapshot.id,
            success: status == TransferStatus::Succeeded,
            status,
            message,
        });
        snapshot
    }

    fn identity(&self) -> (String, std::path::PathBuf, String) {
        let job = self.read_job();
        (
            job.id.to_string(),
            job.local_path.clone(),
            job.remote_name.clone(),
        )
    }

    fn read_job(&self) -> std::sync::RwLockReadGuard<'_, TransferJob> {
        self.job.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_job(&self) -> std::sync::RwLockWriteGuard<'_, TransferJob> {
        self.job.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sibling path downloads are written to before the final rename
fn part_path(local_path: &Path) -> SessionResult<PathBuf> {
    let name = local_path.file_name().ok_or_else(|| {
        SessionError::Validation(format!(
            "Invalid download destination {}",
            local_path.display()
        ))
    })?;
    let mut part = name.to_os_string();
    part.push(".part");
    Ok(local_path.with_file_name(part))
}

async fn create_destination(path: &Path) -> SessionResult<File> {
    File::create(path)
        .await
        .map_err(|e| SessionError::FileIo(format!("Failed to create {}: {}", path.display(), e)))
}

/// Fill `buf` unless the file ends first
async fn read_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
