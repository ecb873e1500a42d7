use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    errors::ClientError,
    protocol::{
        MAX_MESSAGE_SIZE, PackageRecord, Request, RequestEnvelope, Response, ResponseData,
        decode_response, encode_envelope,
    },
};

pub type Result<T> = std::result::Result<T, ClientError>;

/// Bounded channel capacity for the client writer task.
const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Async client for the enumeration service.
///
/// Requests are multiplexed over one Unix stream: a writer task serializes
/// outgoing frames, a reader task dispatches responses to pending oneshots.
/// When the stream dies the reader drops every pending sender (waiters see
/// `Disconnected`) and flips the `closed` watch so owners can observe
/// unexpected service death.
pub struct Client {
    writer_tx: mpsc::Sender<Vec<u8>>,
    pending: Arc<DashMap<u64, oneshot::Sender<Response>>>,
    next_id: AtomicU64,
    closed_rx: watch::Receiver<bool>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Client {
    /// Connect to the enumeration service at the given socket path
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(ClientError::Connect)?;

        let (read_half, mut write_half) = stream.into_split();

        let pending: Arc<DashMap<u64, oneshot::Sender<Response>>> = Arc::new(DashMap::new());
        let (closed_tx, closed_rx) = watch::channel(false);

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);

        let writer_handle = tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!("Client writer error: {}", e);
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let reader_pending = pending.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = read_half;

            loop {
                let mut len_buf = [0u8; 4];
                if let Err(e) = reader.read_exact(&mut len_buf).await {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        debug!("Service disconnected (EOF)");
                    } else {
                        debug!("Client reader error: {}", e);
                    }
                    break;
                }
                let msg_len = u32::from_be_bytes(len_buf) as usize;

                if msg_len > MAX_MESSAGE_SIZE {
                    debug!("Service response exceeds maximum size");
                    break;
                }

                let mut payload = vec![0u8; msg_len];
                if let Err(e) = reader.read_exact(&mut payload).await {
                    debug!("Client reader error: {}", e);
                    break;
                }

                match decode_response(&payload) {
                    Ok(envelope) => {
                        if let Some((_, tx)) = reader_pending.remove(&envelope.id) {
                            let _ = tx.send(envelope.response);
                        } else {
                            debug!("Received response for unknown request id={}", envelope.id);
                        }
                    }
                    Err(e) => {
                        debug!("Failed to decode service response: {}", e);
                    }
                }
            }

            // Drop all pending senders so waiters get RecvError → Disconnected
            reader_pending.clear();
            let _ = closed_tx.send(true);
        });

        Ok(Self {
            writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed_rx,
            reader_handle,
            writer_handle,
        })
    }

    /// A watch that flips to `true` once the service connection is dead.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Send a request and await its response
    pub async fn request(&self, request: Request) -> Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.insert(id, response_tx);

        let envelope = RequestEnvelope { id, request };
        let bytes = match encode_envelope(&envelope) {
            Ok(b) => b,
            Err(e) => {
                self.pending.remove(&id);
                return Err(e.into());
            }
        };

        if self.writer_tx.send(bytes).await.is_err() {
            self.pending.remove(&id);
            return Err(ClientError::Disconnected);
        }
        response_rx.await.map_err(|_| ClientError::Disconnected)
    }

    /// Size of the service's aggregated package cache
    pub async fn package_count(&self) -> Result<u32> {
        match self.request(Request::PackageCount).await? {
            Response::Ok { data: Some(ResponseData::PackageCount(count)), .. } => Ok(count),
            Response::Error { message } => Err(ClientError::Rejected(message)),
            _ => Err(ClientError::UnexpectedPayload("PackageCount")),
        }
    }

    /// One page of the aggregated package list; empty signals exhaustion
    pub async fn packages(&self, start: u32, max_count: u32) -> Result<Vec<PackageRecord>> {
        match self.request(Request::Packages { start, max_count }).await? {
            Response::Ok { data: Some(ResponseData::Packages(page)), .. } => Ok(page),
            Response::Error { message } => Err(ClientError::Rejected(message)),
            _ => Err(ClientError::UnexpectedPayload("Packages")),
        }
    }

    /// Liveness check
    pub async fn ping(&self) -> Result<()> {
        match self.request(Request::Ping).await? {
            Response::Ok { .. } => Ok(()),
            Response::Error { message } => Err(ClientError::Rejected(message)),
        }
    }

    /// Ask the service to exit
    pub async fn shutdown(&self) -> Result<()> {
        match self.request(Request::Shutdown).await? {
            Response::Ok { .. } => Ok(()),
            Response::Error { message } => Err(ClientError::Rejected(message)),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Tear the stream down promptly so the service sees EOF
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}
