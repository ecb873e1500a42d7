use std::path::{Path, PathBuf};
use std::sync::Arc;

use suhub_daemon::enumeration::PackageCache;
use suhub_daemon::provider::SystemPackageQuery;
use suhub_daemon::service::handle_request;
use suhub_protocol::client::Client;
use suhub_protocol::server::{ClientPolicy, Server};

fn write_registry(dir: &Path, packages: u32) -> PathBuf {
    let mut contents = String::new();
    for i in 0..packages {
        contents.push_str(&format!(
            "com.example.app{} {} 0 /nonexistent/app{} default 3003\n",
            i,
            10_000 + i,
            i
        ));
    }
    let path = dir.join("packages.list");
    std::fs::write(&path, contents).unwrap();
    path
}

async fn spawn_service(socket: PathBuf, registry: PathBuf, users_dir: PathBuf) {
    let cache = Arc::new(PackageCache::new(SystemPackageQuery::new(registry, users_dir)));
    let handler = move |request, shutdown_tx| {
        let cache = Arc::clone(&cache);
        async move { handle_request(cache, request, shutdown_tx).await }
    };
    let server = Server::new(socket, ClientPolicy::default(), handler);
    tokio::spawn(server.run());
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("service socket never appeared at {:?}", path);
}

#[tokio::test]
async fn serves_registry_packages_in_pages() {
    let dir = tempfile::tempdir().unwrap();
    let registry = write_registry(dir.path(), 7);
    let socket = dir.path().join("suhubd.sock");
    spawn_service(socket.clone(), registry, dir.path().join("users")).await;
    wait_for_socket(&socket).await;

    let client = Client::connect(&socket).await.unwrap();
    assert_eq!(client.package_count().await.unwrap(), 7);

    let first = client.packages(0, 5).await.unwrap();
    assert_eq!(first.len(), 5);
    assert_eq!(first[0].package_name, "com.example.app0");
    assert_eq!(first[0].uid, 10_000);

    let rest = client.packages(5, 5).await.unwrap();
    assert_eq!(rest.len(), 2);

    assert!(client.packages(7, 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn multi_user_registry_is_aggregated() {
    let dir = tempfile::tempdir().unwrap();
    let registry = write_registry(dir.path(), 2);
    let users = dir.path().join("users");
    std::fs::create_dir_all(users.join("0")).unwrap();
    std::fs::create_dir_all(users.join("10")).unwrap();

    let socket = dir.path().join("suhubd.sock");
    spawn_service(socket.clone(), registry, users).await;
    wait_for_socket(&socket).await;

    let client = Client::connect(&socket).await.unwrap();
    assert_eq!(client.package_count().await.unwrap(), 4);

    let all = client.packages(0, 10).await.unwrap();
    assert_eq!(all[0].uid, 10_000);
    assert_eq!(all[2].uid, 1_010_000);
}

#[tokio::test]
async fn missing_registry_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("suhubd.sock");
    spawn_service(
        socket.clone(),
        dir.path().join("no-packages.list"),
        dir.path().join("users"),
    )
    .await;
    wait_for_socket(&socket).await;

    let client = Client::connect(&socket).await.unwrap();
    let err = client.package_count().await.unwrap_err();
    assert!(err.to_string().contains("registry"));
}

#[tokio::test]
async fn shutdown_closes_connections() {
    let dir = tempfile::tempdir().unwrap();
    let registry = write_registry(dir.path(), 1);
    let socket = dir.path().join("suhubd.sock");
    spawn_service(socket.clone(), registry, dir.path().join("users")).await;
    wait_for_socket(&socket).await;

    let client = Client::connect(&socket).await.unwrap();
    let mut closed = client.closed();
    client.shutdown().await.unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !*closed.borrow_and_update() {
            closed.changed().await.unwrap();
        }
    })
    .await
    .expect("connection never closed after shutdown");
}
