use std::time::Duration;

use thiserror::Error;

use crate::oracle::OracleError;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("enumeration service unavailable: {0}")]
    Service(#[from] suhub_protocol::errors::ClientError),

    #[error("timed out connecting to enumeration service after {0:?}")]
    ConnectTimeout(Duration),

    #[error("not connected to the enumeration service")]
    NotConnected,

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, ManagerError>;
