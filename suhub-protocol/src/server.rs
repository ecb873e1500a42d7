#[cfg(not(unix))]
compile_error!("suhub-protocol server requires a unix target for socket security (peer credentials, file permissions)");

use std::{future::Future, path::PathBuf, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::{mpsc, watch},
};
use tracing::{debug, error, info, warn};

use crate::{
    errors::ServerError,
    protocol::{
        MAX_MESSAGE_SIZE, Request, Response, ResponseEnvelope, decode_envelope, encode_response,
    },
};

pub type Result<T> = std::result::Result<T, ServerError>;
pub type ShutdownTx = mpsc::Sender<()>;

/// Bounded channel capacity for the per-connection writer task.
const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Which peers may talk to the service.
///
/// Root and the service's own euid are always accepted; `allow_uid` admits
/// exactly one additional uid — the manager app this service was spawned for.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientPolicy {
    pub allow_uid: Option<u32>,
}

impl ClientPolicy {
    fn permits(&self, peer_uid: u32) -> bool {
        // SAFETY: geteuid() is always safe to call
        let own_uid = unsafe { libc::geteuid() };
        peer_uid == 0 || peer_uid == own_uid || self.allow_uid == Some(peer_uid)
    }

    fn socket_mode(&self) -> u32 {
        if self.allow_uid.is_some() { 0o666 } else { 0o600 }
    }
}

pub struct Server<F, Fut>
where
    F: Fn(Request, ShutdownTx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send,
{
    socket_path: PathBuf,
    policy: ClientPolicy,
    handler: Arc<F>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
    closing_tx: watch::Sender<bool>,
}

impl<F, Fut> Server<F, Fut>
where
    F: Fn(Request, ShutdownTx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send,
{
    pub fn new(socket_path: PathBuf, policy: ClientPolicy, handler: F) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (closing_tx, _) = watch::channel(false);
        Self {
            socket_path,
            policy,
            handler: Arc::new(handler),
            shutdown_tx,
            shutdown_rx,
            closing_tx,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        // Reject symlinked socket path before any operations
        if self.socket_path.exists() {
            let meta = std::fs::symlink_metadata(&self.socket_path).map_err(|e| {
                ServerError::StaleSocket {
                    socket_path: self.socket_path.clone(),
                    source: e,
                }
            })?;
            if meta.file_type().is_symlink() {
                return Err(ServerError::SocketSymlink {
                    socket_path: self.socket_path.clone(),
                });
            }
        }

        // Remove stale socket file
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ServerError::StaleSocket {
                    socket_path: self.socket_path.clone(),
                    source: e,
                });
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| ServerError::Bind {
            socket_path: self.socket_path.clone(),
            source: e,
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &self.socket_path,
                std::fs::Permissions::from_mode(self.policy.socket_mode()),
            )
            .map_err(|e| ServerError::SocketPermissions {
                socket_path: self.socket_path.clone(),
                source: e,
            })?;
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let shutdown_tx = self.shutdown_tx.clone();
                            let handler = Arc::clone(&self.handler);
                            let policy = self.policy;
                            let closing_rx = self.closing_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_client(handler, policy, stream, shutdown_tx, closing_rx).await {
                                    debug!("Client handler error: {}", e);
                                }
                            });
                        },
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        },
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Enumeration service shutting down");
                    // Drop open connections so clients observe EOF promptly
                    let _ = self.closing_tx.send(true);
                    break;
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

async fn handle_client<F, Fut>(
    handler: Arc<F>,
    policy: ClientPolicy,
    stream: UnixStream,
    shutdown_tx: mpsc::Sender<()>,
    mut closing_rx: watch::Receiver<bool>,
) -> Result<()>
where
    F: Fn(Request, ShutdownTx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send,
{
    debug!("Client connected");

    let cred = stream.peer_cred().map_err(ServerError::PeerCredentials)?;
    if !policy.permits(cred.uid()) {
        warn!("Unauthorized connection attempt from UID {}", cred.uid());
        return Err(ServerError::Unauthorized { client_uid: cred.uid() });
    }
    debug!("Peer credentials verified: UID {}", cred.uid());

    let (read_half, mut write_half) = stream.into_split();

    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = write_rx.recv().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                warn!("Failed to write to client: {}", e);
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut reader = read_half;

    loop {
        let mut len_buf = [0u8; 4];
        let read = tokio::select! {
            read = reader.read_exact(&mut len_buf) => read,
            _ = closing_rx.changed() => {
                debug!("Dropping connection for service shutdown");
                // Brief grace so in-flight handlers can queue their response
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                drop(write_tx);
                let _ = writer_task.await;
                return Ok(());
            }
        };
        if let Err(e) = read {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                debug!("Client disconnected (EOF)");
                drop(write_tx);
                let _ = writer_task.await;
                return Ok(());
            }
            return Err(ServerError::Receive(e));
        }
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len > MAX_MESSAGE_SIZE {
            debug!("Request exceeds maximum message size: {} bytes", msg_len);
            let envelope = ResponseEnvelope {
                id: 0,
                response: Response::error(format!(
                    "Request exceeds maximum message size of {} bytes",
                    MAX_MESSAGE_SIZE
                )),
            };
            if let Ok(bytes) = encode_response(&envelope) {
                let _ = write_tx.send(bytes).await;
            }
            drop(write_tx);
            let _ = writer_task.await;
            return Err(ServerError::MessageTooLarge);
        }

        let mut payload = vec![0u8; msg_len];
        reader.read_exact(&mut payload).await.map_err(ServerError::Receive)?;

        let envelope = match decode_envelope(&payload) {
            Ok(env) => env,
            Err(e) => {
                warn!("Failed to parse request envelope: {}", e);
                // We don't know the ID, use 0
                let envelope = ResponseEnvelope {
                    id: 0,
                    response: Response::error("Invalid request format"),
                };
                if let Ok(bytes) = encode_response(&envelope) {
                    let _ = write_tx.send(bytes).await;
                }
                continue;
            }
        };

        let request_id = envelope.id;
        debug!("Received request id={}: {}", request_id, envelope.request.variant_name());

        let handler = Arc::clone(&handler);
        let shutdown_tx = shutdown_tx.clone();
        let write_tx = write_tx.clone();
        tokio::spawn(async move {
            let response = handler(envelope.request, shutdown_tx).await;
            let envelope = ResponseEnvelope { id: request_id, response };
            match encode_response(&envelope) {
                Ok(bytes) => {
                    if let Err(e) = write_tx.send(bytes).await {
                        debug!("Failed to send response for request {}: {}", request_id, e);
                    }
                }
                Err(e) => {
                    error!("Failed to encode response for request {}: {}", request_id, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::protocol::{PackageRecord, ResponseData};

    fn records(n: u32) -> Vec<PackageRecord> {
        (0..n)
            .map(|i| PackageRecord {
                package_name: format!("com.example.app{}", i),
                uid: 10_000 + i,
                label: format!("App {}", i),
                install_time: 0,
                system: false,
                icon_path: None,
            })
            .collect()
    }

    async fn spawn_server(socket: PathBuf, data: Vec<PackageRecord>) {
        let data = Arc::new(data);
        let server = Server::new(socket, ClientPolicy::default(), move |request, shutdown_tx| {
            let data = Arc::clone(&data);
            async move {
                match request {
                    Request::PackageCount => {
                        Response::ok_with_data(ResponseData::PackageCount(data.len() as u32))
                    }
                    Request::Packages { start, max_count } => {
                        let start = start as usize;
                        let end = (start + max_count as usize).min(data.len());
                        let page = if start >= data.len() {
                            Vec::new()
                        } else {
                            data[start..end].to_vec()
                        };
                        Response::ok_with_data(ResponseData::Packages(page))
                    }
                    Request::Ping => Response::ok_with_message("pong"),
                    Request::Shutdown => {
                        let _ = shutdown_tx.send(()).await;
                        Response::ok_with_message("shutting down")
                    }
                }
            }
        });
        tokio::spawn(server.run());
    }

    async fn wait_for_socket(path: &std::path::Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("server socket never appeared at {:?}", path);
    }

    #[tokio::test]
    async fn count_and_paging_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("suhub.sock");
        spawn_server(socket.clone(), records(25)).await;
        wait_for_socket(&socket).await;

        let client = Client::connect(&socket).await.unwrap();
        assert_eq!(client.package_count().await.unwrap(), 25);

        let page = client.packages(0, 10).await.unwrap();
        assert_eq!(page.len(), 10);
        assert_eq!(page[0].package_name, "com.example.app0");

        let tail = client.packages(20, 10).await.unwrap();
        assert_eq!(tail.len(), 5);

        // Out-of-range start yields an empty page, not an error
        let empty = client.packages(25, 10).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn ping_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("suhub.sock");
        spawn_server(socket.clone(), records(1)).await;
        wait_for_socket(&socket).await;

        let client = Client::connect(&socket).await.unwrap();
        client.ping().await.unwrap();
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn client_observes_service_death() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("suhub.sock");
        spawn_server(socket.clone(), records(1)).await;
        wait_for_socket(&socket).await;

        let client = Client::connect(&socket).await.unwrap();
        let mut closed = client.closed();
        assert!(!*closed.borrow());

        client.shutdown().await.unwrap();
        // The server drops the stream after shutdown; the reader flips the watch
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !*closed.borrow_and_update() {
                closed.changed().await.unwrap();
            }
        })
        .await
        .expect("closed watch never flipped");
    }
}
