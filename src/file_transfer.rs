//! Chunked file transfers layered on the transport.
//!
//! Protocol: the sender issues a `FileRequest` and, once the request is on
//! the wire, streams `FileChunk` messages in index order. The receiver writes
//! each chunk at `index * chunk_size`, answers with `FileComplete` when the
//! byte count reaches the announced size, and may refuse the request up
//! front with a negative `FileComplete`. A rejection arriving mid-stream
//! removes the sender's transfer record, which stops the streaming task at
//! its next step.
//!
//! Transfers in both directions are keyed by `(peer, file id)` where the
//! file id is the file's final name component, so both ends agree on the key
//! regardless of their local paths.

use std::collections::HashMap;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::models::message::Message;
use crate::models::message::MessageBody;
use crate::models::peer::FileTransferStatus;
use crate::models::peer::PeerId;
use crate::transport::InboundMessage;
use crate::transport::Transport;
use crate::transport::TransportError;

/// Chunk payload size. Identical on both ends; the final chunk may be short.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Incoming files land in `<cwd>/downloads` unless configured otherwise.
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";

/// Progress observer: `(peer, local file path, fraction in [0, 1])`.
pub type ProgressCallback = Arc<dyn Fn(PeerId, &Path, f64) + Send + Sync>;

/// Completion observer: `(peer, local file path, success, error text)`.
pub type CompletedCallback = Arc<dyn Fn(PeerId, &Path, bool, &str) + Send + Sync>;

/// Asked before accepting an incoming request: `(peer, filename, size)`.
/// Returning false refuses the transfer. Unset means accept everything.
pub type RequestCallback = Arc<dyn Fn(PeerId, &str, u64) -> bool + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum FileTransferError {
    #[error("cannot read {path}: {source}")]
    Source {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("path has no file name: {0}")]
    InvalidPath(PathBuf),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Snapshot row returned by [`FileTransferManager::ongoing_transfers`].
#[derive(Clone, Debug)]
pub struct TransferSnapshot {
    pub peer_id: PeerId,
    pub file_path: PathBuf,
    pub status: FileTransferStatus,
    pub progress: f64,
}

type TransferKey = (PeerId, String);

/// Per-direction transfer state. Created on `send_file` (outgoing) or on an
/// accepted request (incoming); removed on any terminal status, with the
/// stream handle closed first.
struct TransferRecord {
    file_path: PathBuf,
    file_size: u64,
    bytes_transferred: u64,
    next_chunk_index: u32,
    received_chunks: HashSet<u32>,
    status: FileTransferStatus,
    started: Instant,
    file: Option<fs::File>,
}

#[derive(Default)]
struct TransferTables {
    outgoing: HashMap<TransferKey, TransferRecord>,
    incoming: HashMap<TransferKey, TransferRecord>,
}

struct FileTransferInner {
    transport: Transport,
    chunk_size: usize,
    download_dir: PathBuf,
    transfers: tokio::sync::Mutex<TransferTables>,
    progress_callback: StdMutex<Option<ProgressCallback>>,
    completed_callback: StdMutex<Option<CompletedCallback>>,
    request_callback: StdMutex<Option<RequestCallback>>,
}

#[derive(Clone)]
pub struct FileTransferManager {
    inner: Arc<FileTransferInner>,
}

impl FileTransferManager {
    /// Manager with the default chunk size and download directory. Must be
    /// called from within a tokio runtime: the inbound handler task is
    /// spawned here.
    pub fn new(transport: Transport) -> Self {
        Self::with_settings(
            transport,
            DEFAULT_CHUNK_SIZE,
            PathBuf::from(DEFAULT_DOWNLOAD_DIR),
        )
    }

    pub fn with_settings(transport: Transport, chunk_size: usize, download_dir: PathBuf) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");

        let mut inbound = transport.subscribe();
        let manager = Self {
            inner: Arc::new(FileTransferInner {
                transport,
                chunk_size,
                download_dir,
                transfers: tokio::sync::Mutex::new(TransferTables::default()),
                progress_callback: StdMutex::new(None),
                completed_callback: StdMutex::new(None),
                request_callback: StdMutex::new(None),
            }),
        };

        let handler = manager.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                handler.handle_message(message).await;
            }
        });
        manager
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.inner.progress_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_completed_callback(&self, callback: CompletedCallback) {
        *self.inner.completed_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_request_callback(&self, callback: RequestCallback) {
        *self.inner.request_callback.lock().unwrap() = Some(callback);
    }

    /// Offer a file to a peer and start streaming chunks.
    ///
    /// A successfully sent request is treated as permission to stream; a
    /// refusal from the receiver tears the transfer down when it arrives.
    pub async fn send_file(
        &self,
        peer_id: PeerId,
        file_path: &Path,
    ) -> Result<(), FileTransferError> {
        let metadata = fs::metadata(file_path)
            .await
            .map_err(|source| FileTransferError::Source {
                path: file_path.to_owned(),
                source,
            })?;
        let file_size = metadata.len();
        let file_id = file_id_for(file_path)
            .ok_or_else(|| FileTransferError::InvalidPath(file_path.to_owned()))?;

        let request = Message::new(
            self.inner.transport.self_id(),
            MessageBody::FileRequest {
                filename: file_id.clone(),
                file_size,
            },
        );
        self.inner.transport.send(peer_id, request).await?;

        {
            let mut tables = self.inner.transfers.lock().await;
            tables.outgoing.insert(
                (peer_id, file_id.clone()),
                TransferRecord {
                    file_path: file_path.to_owned(),
                    file_size,
                    bytes_transferred: 0,
                    next_chunk_index: 0,
                    received_chunks: HashSet::new(),
                    status: FileTransferStatus::Pending,
                    started: Instant::now(),
                    file: None,
                },
            );
        }
        info!("file transfer request sent for {file_id} ({file_size} bytes) to peer {peer_id}");

        let streamer = self.clone();
        tokio::spawn(async move {
            streamer.run_chunk_stream(peer_id, file_id).await;
        });
        Ok(())
    }

    /// Abort a transfer in either direction and notify the peer. A missing
    /// record only logs a warning.
    pub async fn cancel_transfer(&self, peer_id: PeerId, file_path: &Path) {
        let Some(file_id) = file_id_for(file_path) else {
            warn!(
                "no active transfer found for cancellation: {}",
                file_path.display()
            );
            return;
        };
        let key = (peer_id, file_id.clone());

        enum Direction {
            Outgoing,
            Incoming,
        }
        let cancelled = {
            let mut tables = self.inner.transfers.lock().await;
            if tables.outgoing.remove(&key).is_some() {
                Some(Direction::Outgoing)
            } else if let Some(mut record) = tables.incoming.remove(&key) {
                if let Some(mut file) = record.file.take() {
                    let _ = file.flush().await;
                }
                Some(Direction::Incoming)
            } else {
                None
            }
        };

        match cancelled {
            Some(Direction::Outgoing) => {
                self.send_completion(peer_id, &file_id, false, "transfer cancelled by sender")
                    .await;
                info!("outgoing file transfer cancelled: {}", file_path.display());
            }
            Some(Direction::Incoming) => {
                self.send_completion(peer_id, &file_id, false, "transfer cancelled by receiver")
                    .await;
                info!("incoming file transfer cancelled: {}", file_path.display());
            }
            None => warn!(
                "no active transfer found for cancellation: {}",
                file_path.display()
            ),
        }
    }

    /// Snapshot of every live transfer in both directions.
    pub async fn ongoing_transfers(&self) -> Vec<TransferSnapshot> {
        let tables = self.inner.transfers.lock().await;
        tables
            .outgoing
            .iter()
            .chain(tables.incoming.iter())
            .map(|((peer_id, _), record)| TransferSnapshot {
                peer_id: *peer_id,
                file_path: record.file_path.clone(),
                status: record.status,
                progress: transfer_progress(record.bytes_transferred, record.file_size),
            })
            .collect()
    }

    async fn handle_message(&self, inbound: InboundMessage) {
        let peer_id = inbound.peer_id;
        match inbound.message.body {
            MessageBody::FileRequest {
                filename,
                file_size,
            } => self.handle_file_request(peer_id, filename, file_size).await,
            MessageBody::FileChunk {
                file_id,
                chunk_index,
                data,
            } => {
                self.handle_file_chunk(peer_id, file_id, chunk_index, data)
                    .await
            }
            MessageBody::FileComplete {
                file_id,
                success,
                error,
            } => {
                self.handle_file_complete(peer_id, file_id, success, error)
                    .await
            }
            _ => {}
        }
    }

    async fn handle_file_request(&self, peer_id: PeerId, filename: String, file_size: u64) {
        info!("file transfer request from peer {peer_id}: {filename} ({file_size} bytes)");

        let accept = {
            let callback = self.inner.request_callback.lock().unwrap().clone();
            match callback {
                Some(callback) => callback(peer_id, &filename, file_size),
                None => true,
            }
        };
        if !accept {
            info!("file transfer request rejected");
            self.send_completion(peer_id, &filename, false, "transfer rejected by receiver")
                .await;
            return;
        }

        // A remote-supplied name must not escape the download directory.
        let Some(safe_name) = Path::new(&filename).file_name() else {
            warn!("refusing file request with unusable name {filename:?}");
            self.send_completion(peer_id, &filename, false, "invalid file name")
                .await;
            return;
        };

        if let Err(e) = fs::create_dir_all(&self.inner.download_dir).await {
            warn!(
                "failed to create download directory {}: {e}",
                self.inner.download_dir.display()
            );
            self.send_completion(peer_id, &filename, false, "failed to create output file")
                .await;
            return;
        }

        let output_path = self.inner.download_dir.join(safe_name);
        let file = match fs::File::create(&output_path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("failed to create output file {}: {e}", output_path.display());
                self.send_completion(peer_id, &filename, false, "failed to create output file")
                    .await;
                return;
            }
        };

        {
            let mut tables = self.inner.transfers.lock().await;
            tables.incoming.insert(
                (peer_id, filename),
                TransferRecord {
                    file_path: output_path.clone(),
                    file_size,
                    bytes_transferred: 0,
                    next_chunk_index: 0,
                    received_chunks: HashSet::new(),
                    status: FileTransferStatus::InProgress,
                    started: Instant::now(),
                    file: Some(file),
                },
            );
        }
        info!("file transfer accepted: {}", output_path.display());
    }

    async fn handle_file_chunk(
        &self,
        peer_id: PeerId,
        file_id: String,
        chunk_index: u32,
        data: Vec<u8>,
    ) {
        enum ChunkOutcome {
            Ignored,
            Accepted { path: PathBuf, progress: f64 },
            Finished { path: PathBuf, elapsed_ms: u128 },
            WriteFailed { path: PathBuf },
        }

        let key = (peer_id, file_id.clone());
        let mut tables = self.inner.transfers.lock().await;
        let outcome = match tables.incoming.get_mut(&key) {
            None => {
                warn!("received chunk {chunk_index} for unknown transfer {file_id} from peer {peer_id}");
                ChunkOutcome::Ignored
            }
            Some(record) if record.received_chunks.contains(&chunk_index) => {
                debug!("ignoring duplicate chunk {chunk_index} for {file_id}");
                ChunkOutcome::Ignored
            }
            Some(record) => {
                let offset = chunk_index as u64 * self.inner.chunk_size as u64;
                let write_result = match record.file.as_mut() {
                    Some(file) => write_chunk(file, offset, &data).await,
                    None => Err(std::io::Error::other("output stream is closed")),
                };
                match write_result {
                    Err(e) => {
                        warn!(
                            "failed to write chunk to {}: {e}",
                            record.file_path.display()
                        );
                        record.status = FileTransferStatus::Failed;
                        record.file = None;
                        ChunkOutcome::WriteFailed {
                            path: record.file_path.clone(),
                        }
                    }
                    Ok(()) => {
                        record.received_chunks.insert(chunk_index);
                        record.bytes_transferred += data.len() as u64;
                        if record.bytes_transferred >= record.file_size {
                            record.status = FileTransferStatus::Completed;
                            if let Some(mut file) = record.file.take() {
                                let _ = file.flush().await;
                            }
                            ChunkOutcome::Finished {
                                path: record.file_path.clone(),
                                elapsed_ms: record.started.elapsed().as_millis(),
                            }
                        } else {
                            ChunkOutcome::Accepted {
                                path: record.file_path.clone(),
                                progress: transfer_progress(
                                    record.bytes_transferred,
                                    record.file_size,
                                ),
                            }
                        }
                    }
                }
            }
        };
        if matches!(
            outcome,
            ChunkOutcome::Finished { .. } | ChunkOutcome::WriteFailed { .. }
        ) {
            tables.incoming.remove(&key);
        }
        drop(tables);

        match outcome {
            ChunkOutcome::Ignored => {}
            ChunkOutcome::Accepted { path, progress } => {
                self.notify_progress(peer_id, &path, progress);
            }
            ChunkOutcome::Finished { path, elapsed_ms } => {
                info!(
                    "file transfer complete: {} in {elapsed_ms} ms",
                    path.display()
                );
                self.send_completion(peer_id, &file_id, true, "").await;
                self.notify_progress(peer_id, &path, 1.0);
                self.notify_completed(peer_id, &path, true, "");
            }
            ChunkOutcome::WriteFailed { path } => {
                self.send_completion(peer_id, &file_id, false, "failed to write to output file")
                    .await;
                self.notify_completed(peer_id, &path, false, "failed to write to output file");
            }
        }
    }

    async fn handle_file_complete(
        &self,
        peer_id: PeerId,
        file_id: String,
        success: bool,
        error: String,
    ) {
        let removed = {
            let mut tables = self.inner.transfers.lock().await;
            tables.outgoing.remove(&(peer_id, file_id.clone()))
        };
        let Some(record) = removed else {
            // The stream may already have finished and dropped the record.
            debug!("completion for unknown transfer {file_id} from peer {peer_id}");
            return;
        };

        if success {
            info!(
                "file transfer confirmed complete by receiver: {}",
                record.file_path.display()
            );
        } else {
            warn!(
                "file transfer failed: {}: {error}",
                record.file_path.display()
            );
        }
        self.notify_completed(peer_id, &record.file_path, success, &error);
    }

    /// Stream chunks for one outgoing transfer until it completes, fails, or
    /// its record disappears (cancellation or a refusal from the receiver).
    async fn run_chunk_stream(self, peer_id: PeerId, file_id: String) {
        enum Step {
            Vanished,
            Done { path: PathBuf, elapsed_ms: u128 },
            Failed { path: PathBuf, reason: &'static str },
            Chunk { index: u32, data: Vec<u8>, path: PathBuf },
        }

        let key = (peer_id, file_id.clone());
        let chunk_size = self.inner.chunk_size;

        loop {
            let mut tables = self.inner.transfers.lock().await;
            let step = match tables.outgoing.get_mut(&key) {
                None => Step::Vanished,
                Some(record) => {
                    record.status = FileTransferStatus::InProgress;
                    if record.bytes_transferred >= record.file_size {
                        record.status = FileTransferStatus::Completed;
                        Step::Done {
                            path: record.file_path.clone(),
                            elapsed_ms: record.started.elapsed().as_millis(),
                        }
                    } else {
                        if record.file.is_none() {
                            match fs::File::open(&record.file_path).await {
                                Ok(file) => record.file = Some(file),
                                Err(e) => {
                                    warn!(
                                        "failed to open {} for reading: {e}",
                                        record.file_path.display()
                                    );
                                    record.status = FileTransferStatus::Failed;
                                }
                            }
                        }
                        match record.file.as_mut() {
                            None => Step::Failed {
                                path: record.file_path.clone(),
                                reason: "failed to open file for reading",
                            },
                            Some(file) => {
                                let index = record.next_chunk_index;
                                let offset = index as u64 * chunk_size as u64;
                                match read_chunk(file, offset, chunk_size).await {
                                    Err(e) => {
                                        warn!(
                                            "failed to read from {}: {e}",
                                            record.file_path.display()
                                        );
                                        record.status = FileTransferStatus::Failed;
                                        Step::Failed {
                                            path: record.file_path.clone(),
                                            reason: "failed to read from file",
                                        }
                                    }
                                    Ok(data) if data.is_empty() => {
                                        // The file shrank under us.
                                        record.status = FileTransferStatus::Failed;
                                        Step::Failed {
                                            path: record.file_path.clone(),
                                            reason: "unexpected end of file",
                                        }
                                    }
                                    Ok(data) => Step::Chunk {
                                        index,
                                        data,
                                        path: record.file_path.clone(),
                                    },
                                }
                            }
                        }
                    }
                }
            };
            if matches!(step, Step::Done { .. } | Step::Failed { .. }) {
                tables.outgoing.remove(&key);
            }
            drop(tables);

            match step {
                Step::Vanished => return,
                Step::Done { path, elapsed_ms } => {
                    info!("file sending complete: {} in {elapsed_ms} ms", path.display());
                    self.notify_completed(peer_id, &path, true, "");
                    return;
                }
                Step::Failed { path, reason } => {
                    self.send_completion(peer_id, &file_id, false, reason).await;
                    self.notify_completed(peer_id, &path, false, reason);
                    return;
                }
                Step::Chunk { index, data, path } => {
                    let data_len = data.len() as u64;
                    let chunk = Message::new(
                        self.inner.transport.self_id(),
                        MessageBody::FileChunk {
                            file_id: file_id.clone(),
                            chunk_index: index,
                            data,
                        },
                    );
                    if self.inner.transport.send(peer_id, chunk).await.is_err() {
                        let removed = {
                            let mut tables = self.inner.transfers.lock().await;
                            tables.outgoing.remove(&key)
                        };
                        if removed.is_some() {
                            self.send_completion(
                                peer_id,
                                &file_id,
                                false,
                                "failed to send file chunk",
                            )
                            .await;
                            self.notify_completed(peer_id, &path, false, "failed to send file chunk");
                        }
                        return;
                    }

                    let progress = {
                        let mut tables = self.inner.transfers.lock().await;
                        match tables.outgoing.get_mut(&key) {
                            // Cancelled between the send and the bookkeeping.
                            None => return,
                            Some(record) => {
                                record.bytes_transferred += data_len;
                                record.next_chunk_index = index + 1;
                                transfer_progress(record.bytes_transferred, record.file_size)
                            }
                        }
                    };
                    self.notify_progress(peer_id, &path, progress);
                }
            }
        }
    }

    async fn send_completion(&self, peer_id: PeerId, file_id: &str, success: bool, error: &str) {
        let message = Message::new(
            self.inner.transport.self_id(),
            MessageBody::FileComplete {
                file_id: file_id.to_string(),
                success,
                error: error.to_string(),
            },
        );
        if let Err(e) = self.inner.transport.send(peer_id, message).await {
            debug!("could not send transfer completion to peer {peer_id}: {e}");
        }
    }

    fn notify_progress(&self, peer_id: PeerId, path: &Path, progress: f64) {
        let callback = self.inner.progress_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(peer_id, path, progress);
        }
    }

    fn notify_completed(&self, peer_id: PeerId, path: &Path, success: bool, error: &str) {
        let callback = self.inner.completed_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(peer_id, path, success, error);
        }
    }
}

/// Both ends key a transfer by the file's final name component.
fn file_id_for(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn transfer_progress(bytes_transferred: u64, file_size: u64) -> f64 {
    if file_size == 0 {
        return 0.0;
    }
    (bytes_transferred as f64 / file_size as f64).min(1.0)
}

async fn read_chunk(file: &mut fs::File, offset: u64, max: usize) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; max];
    let mut filled = 0;
    while filled < max {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

async fn write_chunk(file: &mut fs::File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await
}
