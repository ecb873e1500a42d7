use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("message exceeds maximum size")]
    MessageTooLarge,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to service socket: {0}")]
    Connect(#[source] std::io::Error),

    #[error("service disconnected")]
    Disconnected,

    #[error("service rejected request: {0}")]
    Rejected(String),

    #[error("unexpected response payload for {0}")]
    UnexpectedPayload(&'static str),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("stale socket found at {socket_path} cannot be deleted: {source}")]
    StaleSocket {
        socket_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing symlinked socket path {socket_path}")]
    SocketSymlink { socket_path: PathBuf },

    #[error("cannot bind unix socket at {socket_path}: {source}")]
    Bind {
        socket_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set socket permissions at {socket_path}: {source}")]
    SocketPermissions {
        socket_path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to verify peer credentials: {0}")]
    PeerCredentials(#[source] std::io::Error),

    #[error("unauthorized connection: UID {client_uid} is not permitted")]
    Unauthorized { client_uid: u32 },

    #[error("failed to receive request: {0}")]
    Receive(#[source] std::io::Error),

    #[error("message exceeds maximum size")]
    MessageTooLarge,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
