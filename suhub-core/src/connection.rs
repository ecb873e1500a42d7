use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use suhub_protocol::client::Client;
use suhub_protocol::protocol::PackageRecord;
use tracing::{debug, warn};

use crate::errors::{ManagerError, Result};

/// Owns at most one live connection to the enumeration service.
///
/// `connect` force-drops any previous connection first, so a retry after a
/// wedged service never leaks a half-dead stream. Connection death is
/// observed through the client's closed watch and clears the published
/// handle; the identity check guards against a watcher for an old
/// connection clearing a newer one.
pub struct ServiceConnection {
    socket_path: PathBuf,
    connect_timeout: Duration,
    current: Mutex<Option<Arc<Client>>>,
}

impl ServiceConnection {
    pub fn new(socket_path: PathBuf, connect_timeout: Duration) -> Self {
        Self {
            socket_path,
            connect_timeout,
            current: Mutex::new(None),
        }
    }

    pub async fn connect(self: Arc<Self>) -> Result<EnumerationHandle> {
        self.disconnect();

        let client = tokio::time::timeout(self.connect_timeout, Client::connect(&self.socket_path))
            .await
            .map_err(|_| ManagerError::ConnectTimeout(self.connect_timeout))??;
        let client = Arc::new(client);
        *self.current.lock() = Some(Arc::clone(&client));
        debug!("Connected to enumeration service at {:?}", self.socket_path);

        let conn = Arc::downgrade(&self);
        let watched = Arc::clone(&client);
        let mut closed = client.closed();
        tokio::spawn(async move {
            while !*closed.borrow_and_update() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
            let Some(conn) = conn.upgrade() else { return };
            let mut current = conn.current.lock();
            // Only clear if this is still the connection we watched
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &watched)) {
                warn!("Enumeration service connection lost");
                *current = None;
            }
        });

        Ok(EnumerationHandle { client })
    }

    /// Drop the current connection, if any. Synchronous and idempotent so it
    /// can run from a drop guard.
    pub fn disconnect(&self) {
        if self.current.lock().take().is_some() {
            debug!("Disconnected from enumeration service");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current.lock().is_some()
    }
}

/// Borrowed view of one live connection.
///
/// Holding a handle keeps the underlying client alive even if the
/// connection manager moves on, so an in-flight enumeration pass never has
/// its stream torn down mid-page by a reconnect.
pub struct EnumerationHandle {
    client: Arc<Client>,
}

impl EnumerationHandle {
    pub async fn package_count(&self) -> Result<u32> {
        Ok(self.client.package_count().await?)
    }

    pub async fn packages(&self, start: u32, max_count: u32) -> Result<Vec<PackageRecord>> {
        Ok(self.client.packages(start, max_count).await?)
    }
}
