use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use thiserror::Error;

use crate::profile::{NON_ROOT_DEFAULT_KEY, NOBODY_UID, Profile};

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("policy backend unavailable: {0}")]
    Unavailable(#[source] std::io::Error),

    #[error("failed to read profile for {key} (uid {uid}): {source}")]
    Read {
        key: String,
        uid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write profile for {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, OracleError>;

/// Authoritative source of per-app security profiles.
///
/// All methods block; callers on the async runtime go through
/// `spawn_blocking`. A missing profile is not an error: `app_profile`
/// returns the defaults for that key. `set_app_profile` returns `Ok(false)`
/// when the backend understood the request but refused to apply it, which
/// callers surface per package instead of aborting a batch.
pub trait PolicyOracle: Send + Sync {
    fn app_profile(&self, key: &str, uid: u32) -> Result<Profile>;

    fn set_app_profile(&self, profile: &Profile) -> Result<bool>;

    /// Human name for a uid, if the platform knows one.
    fn user_name(&self, uid: u32) -> Option<String>;

    fn default_umount_modules(&self) -> bool;

    fn set_default_umount_modules(&self, value: bool) -> Result<()>;
}

impl dyn PolicyOracle {
    /// The shared profile applied to apps without su that follow the default.
    pub fn non_root_default_profile(&self) -> Result<Profile> {
        self.app_profile(NON_ROOT_DEFAULT_KEY, NOBODY_UID)
    }
}

/// In-memory oracle for tests and for hosts without the policy backend.
///
/// `fail_reads` and `refuse_writes` let tests simulate the two backend
/// failure modes per key.
#[derive(Default)]
pub struct MemoryOracle {
    profiles: Mutex<HashMap<String, Profile>>,
    user_names: Mutex<HashMap<u32, String>>,
    fail_reads: Mutex<HashSet<String>>,
    refuse_writes: Mutex<HashSet<String>>,
    default_umount: Mutex<bool>,
}

impl MemoryOracle {
    pub fn new() -> Self {
        Self {
            default_umount: Mutex::new(true),
            ..Self::default()
        }
    }

    pub fn insert_profile(&self, profile: Profile) {
        self.profiles.lock().insert(profile.name.clone(), profile);
    }

    pub fn insert_user_name(&self, uid: u32, name: impl Into<String>) {
        self.user_names.lock().insert(uid, name.into());
    }

    pub fn fail_reads_for(&self, key: impl Into<String>) {
        self.fail_reads.lock().insert(key.into());
    }

    pub fn refuse_writes_for(&self, key: impl Into<String>) {
        self.refuse_writes.lock().insert(key.into());
    }

    pub fn stored_profile(&self, key: &str) -> Option<Profile> {
        self.profiles.lock().get(key).cloned()
    }
}

impl PolicyOracle for MemoryOracle {
    fn app_profile(&self, key: &str, uid: u32) -> Result<Profile> {
        if self.fail_reads.lock().contains(key) {
            return Err(OracleError::Read {
                key: key.to_string(),
                uid,
                source: std::io::Error::new(std::io::ErrorKind::Other, "simulated read failure"),
            });
        }
        Ok(self
            .profiles
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_else(|| Profile::new_default(key, uid)))
    }

    fn set_app_profile(&self, profile: &Profile) -> Result<bool> {
        if self.refuse_writes.lock().contains(&profile.name) {
            return Ok(false);
        }
        self.profiles
            .lock()
            .insert(profile.name.clone(), profile.clone());
        Ok(true)
    }

    fn user_name(&self, uid: u32) -> Option<String> {
        self.user_names.lock().get(&uid).cloned()
    }

    fn default_umount_modules(&self) -> bool {
        *self.default_umount.lock()
    }

    fn set_default_umount_modules(&self, value: bool) -> Result<()> {
        *self.default_umount.lock() = value;
        Ok(())
    }
}
