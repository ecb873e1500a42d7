use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use suhub_daemon::enumeration::PackageCache;
use suhub_daemon::provider::SystemPackageQuery;
use suhub_daemon::service::handle_request;
use suhub_protocol::server::{ClientPolicy, Server};
use tracing::info;

/// Privileged package enumeration service for the suhub manager
#[derive(Parser)]
#[command(name = "suhubd", about = "suhub package enumeration service")]
struct Args {
    /// Socket path (defaults to the state directory)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Package registry file
    #[arg(long, default_value = "/data/system/packages.list")]
    registry: PathBuf,

    /// Directory whose numeric subdirectories name the user profiles
    #[arg(long, default_value = "/data/system/users")]
    users_dir: PathBuf,

    /// Additional uid permitted to connect (the manager app)
    #[arg(long)]
    client_uid: Option<u32>,

    /// Run without root (registry access will likely fail; useful for testing)
    #[arg(long)]
    allow_unprivileged: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting suhub enumeration service");

    // The registry is root-only; refuse to start degraded unless asked to.
    // SAFETY: geteuid() is always safe to call
    if unsafe { libc::geteuid() } != 0 {
        if !args.allow_unprivileged {
            eprintln!("Error: the enumeration service must run as root.");
            eprintln!("Use --allow-unprivileged to override (for testing only).");
            std::process::exit(1);
        }
        tracing::warn!("Running without root; package enumeration will likely fail");
    }

    let socket_path = args.socket.unwrap_or_else(suhub_daemon::socket_path);
    if let Some(dir) = socket_path.parent() {
        use std::os::unix::fs::DirBuilderExt;
        // Traversable when a manager uid must reach the socket, private otherwise
        let mode = if args.client_uid.is_some() { 0o711 } else { 0o700 };
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(dir)?;
    }

    let cache = Arc::new(PackageCache::new(SystemPackageQuery::new(
        args.registry,
        args.users_dir,
    )));

    let handler = move |request, shutdown_tx| {
        let cache = Arc::clone(&cache);
        async move { handle_request(cache, request, shutdown_tx).await }
    };

    let policy = ClientPolicy {
        allow_uid: args.client_uid,
    };
    let server = Server::new(socket_path.clone(), policy, handler);

    info!("Service listening on {:?}", socket_path);
    server.run().await?;

    info!("Service exited");
    Ok(())
}
