use std::sync::Arc;

use suhub_protocol::protocol::{Request, Response, ResponseData};
use suhub_protocol::server::ShutdownTx;
use tracing::info;

use crate::enumeration::{PackageCache, PackageQuery};

/// Request dispatch shared by the binary and the integration tests.
pub async fn handle_request<Q: PackageQuery + 'static>(
    cache: Arc<PackageCache<Q>>,
    request: Request,
    shutdown_tx: ShutdownTx,
) -> Response {
    match request {
        Request::Ping => Response::ok_with_message("pong"),

        Request::PackageCount => {
            // Enumeration hits the filesystem; keep it off the reactor.
            let result = tokio::task::spawn_blocking(move || cache.count()).await;
            match result {
                Ok(Ok(count)) => Response::ok_with_data(ResponseData::PackageCount(count)),
                Ok(Err(e)) => Response::error(e.to_string()),
                Err(e) => Response::error(format!("Enumeration task failed: {}", e)),
            }
        }

        Request::Packages { start, max_count } => {
            let result = tokio::task::spawn_blocking(move || cache.page(start, max_count)).await;
            match result {
                Ok(Ok(page)) => Response::ok_with_data(ResponseData::Packages(page)),
                Ok(Err(e)) => Response::error(e.to_string()),
                Err(e) => Response::error(format!("Enumeration task failed: {}", e)),
            }
        }

        Request::Shutdown => {
            info!("Shutdown requested");
            let _ = shutdown_tx.send(()).await;
            Response::ok_with_message("Service shutting down")
        }
    }
}
