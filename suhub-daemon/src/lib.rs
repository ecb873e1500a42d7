use std::path::PathBuf;

pub mod enumeration;
pub mod errors;
pub mod provider;
pub mod service;

const DEFAULT_STATE_DIR: &str = "/data/adb/suhub";

/// Directory holding the service socket and runtime state.
///
/// Overridable via SUHUB_STATE_DIR so tests and non-Android hosts can
/// relocate it.
pub fn state_dir() -> PathBuf {
    std::env::var_os("SUHUB_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}

pub fn socket_path() -> PathBuf {
    state_dir().join("suhubd.sock")
}
