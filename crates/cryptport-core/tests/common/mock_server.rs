// In-process storage server speaking the framed protocol through ServerCodec

use bytes::Bytes;
use chrono::{DateTime, Utc};
use cryptport_core::codec::{keys, DEFAULT_CHUNK_SIZE};
use cryptport_core::{checksum, Command, RemoteFileEntry, Request, Response, ServerCodec};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

pub const ACCEPTED_TOKEN: &str = "test-token";

/// Fault injection knobs
#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Close the connection instead of answering once this many download
    /// chunks were served on it
    pub drop_after_download_chunks: Option<usize>,
    /// Close the connection instead of answering the n-th (1-based)
    /// request of the given command
    pub drop_on: Option<(Command, usize)>,
    /// Delay before answering every request
    pub delay: Option<Duration>,
    /// Announce a wrong checksum at the end of downloads
    pub corrupt_checksum: bool,
}

#[derive(Debug, Clone)]
struct StoredFile {
    data: Bytes,
    modified_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingUpload {
    name: String,
    size: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct ServerState {
    files: HashMap<String, StoredFile>,
    requests: Vec<(Command, Option<String>)>,
}

pub struct MockServer {
    pub port: u16,
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with(MockOptions::default()).await
    }

    pub async fn start_with(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(Mutex::new(ServerState::default()));

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone(), options.clone()));
            }
        });

        Self { port, state }
    }

    pub fn put_file(&self, name: &str, data: impl Into<Bytes>) {
        self.lock().files.insert(
            name.to_string(),
            StoredFile {
                data: data.into(),
                modified_at: Utc::now(),
            },
        );
    }

    pub fn file(&self, name: &str) -> Option<Bytes> {
        self.lock().files.get(name).map(|f| f.data.clone())
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().files.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every request seen so far with the token it carried
    pub fn requests(&self) -> Vec<(Command, Option<String>)> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().expect("mock state")
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<ServerState>>, options: MockOptions) {
    let mut framed = Framed::new(stream, ServerCodec::default());
    let mut uploads: HashMap<String, PendingUpload> = HashMap::new();
    let mut downloads: HashMap<String, Bytes> = HashMap::new();
    let mut chunks_served = 0usize;
    let mut seen: HashMap<Command, usize> = HashMap::new();

    while let Some(Ok(request)) = framed.next().await {
        if let Some(delay) = options.delay {
            tokio::time::sleep(delay).await;
        }

        state
            .lock()
            .expect("mock state")
            .requests
            .push((request.command, request.token.clone()));

        let count = seen.entry(request.command).or_default();
        *count += 1;
        if options.drop_on == Some((request.command, *count)) {
            return;
        }

        if request.command == Command::DownloadChunk {
            if let Some(limit) = options.drop_after_download_chunks {
                if chunks_served >= limit {
                    return;
                }
            }
        }

        let response = handle(
            &request,
            &state,
            &options,
            &mut uploads,
            &mut downloads,
            &mut chunks_served,
        );
        if framed.send(response).await.is_err() {
            return;
        }
    }
}

fn handle(
    request: &Request,
    state: &Arc<Mutex<ServerState>>,
    options: &MockOptions,
    uploads: &mut HashMap<String, PendingUpload>,
    downloads: &mut HashMap<String, Bytes>,
    chunks_served: &mut usize,
) -> Response {
    if request.token.as_deref() != Some(ACCEPTED_TOKEN) {
        return Response::error("Invalid token");
    }
    let transfer = request.meta(keys::TRANSFER).unwrap_or_default().to_string();
    let mut state = state.lock().expect("mock state");

    match request.command {
        Command::Auth => Response::ok().with_message("Welcome"),
        Command::List => {
            let mut entries: Vec<RemoteFileEntry> = state
                .files
                .iter()
                .map(|(name, file)| RemoteFileEntry {
                    name: name.clone(),
                    size: file.data.len() as u64,
                    modified_at: file.modified_at,
                })
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            let body = serde_json::to_vec(&entries).expect("encode listing");
            Response::ok().with_body(body)
        }
        Command::Delete => {
            let name = request.meta(keys::NAME).unwrap_or_default();
            match state.files.remove(name) {
                Some(_) => Response::ok().with_message(format!("Deleted {}", name)),
                None => Response::error(format!("No such file: {}", name)),
            }
        }
        Command::UploadBegin => {
            let name = request.meta(keys::NAME).unwrap_or_default().to_string();
            let size = request
                .meta(keys::SIZE)
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            uploads.insert(
                transfer,
                PendingUpload {
                    name,
                    size,
                    data: Vec::new(),
                },
            );
            Response::ok()
        }
        Command::UploadChunk => {
            let offset: Option<u64> = request.meta(keys::OFFSET).and_then(|s| s.parse().ok());
            match uploads.get_mut(&transfer) {
                Some(upload) if offset == Some(upload.data.len() as u64) => {
                    upload.data.extend_from_slice(&request.body);
                    Response::ok()
                }
                Some(_) => Response::error("Unexpected offset"),
                None => Response::error("Unknown transfer"),
            }
        }
        Command::UploadEnd => {
            let Some(upload) = uploads.remove(&transfer) else {
                return Response::error("Unknown transfer");
            };
            if upload.data.len() as u64 != upload.size {
                return Response::error("Size mismatch");
            }
            if request.meta(keys::CHECKSUM) != Some(checksum(&upload.data).as_str()) {
                return Response::error("Checksum mismatch");
            }
            let message = format!("Stored {}", upload.name);
            state.files.insert(
                upload.name,
                StoredFile {
                    data: Bytes::from(upload.data),
                    modified_at: Utc::now(),
                },
            );
            Response::ok().with_message(message)
        }
        Command::DownloadBegin => {
            let name = request.meta(keys::NAME).unwrap_or_default();
            match state.files.get(name) {
                Some(file) => {
                    downloads.insert(transfer, file.data.clone());
                    Response::ok().with_meta(keys::SIZE, file.data.len())
                }
                None => Response::error(format!("No such file: {}", name)),
            }
        }
        Command::DownloadChunk => {
            let Some(data) = downloads.get(&transfer) else {
                return Response::error("Unknown transfer");
            };
            let offset = request
                .meta(keys::OFFSET)
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or_default()
                .min(data.len());

            if offset == data.len() {
                let digest = if options.corrupt_checksum {
                    checksum(b"something else")
                } else {
                    checksum(data)
                };
                downloads.remove(&transfer);
                return Response::ok()
                    .with_meta(keys::END, "true")
                    .with_meta(keys::CHECKSUM, digest);
            }

            let end = (offset + DEFAULT_CHUNK_SIZE).min(data.len());
            *chunks_served += 1;
            Response::ok().with_body(data.slice(offset..end))
        }
    }
}
