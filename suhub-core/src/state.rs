use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::model::{AppGroup, AppInfo};
use crate::profile::Profile;

/// One immutable published generation of the app list.
#[derive(Clone, Default)]
pub struct Snapshot {
    pub apps: Arc<Vec<Arc<AppInfo>>>,
    pub groups: Arc<Vec<AppGroup>>,
}

/// Published app/group state.
///
/// Readers take cheap `Snapshot` clones and never observe a half-updated
/// generation: apps and their derived groups swap together under one lock.
/// The version watch ticks once per publish or patch so views can
/// re-render without polling.
pub struct AppListStore {
    snapshot: Mutex<Snapshot>,
    version: watch::Sender<u64>,
    loaded: AtomicBool,
}

impl AppListStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            snapshot: Mutex::new(Snapshot::default()),
            version,
            loaded: AtomicBool::new(false),
        }
    }

    /// Replace both lists atomically.
    pub fn publish(&self, apps: Vec<Arc<AppInfo>>, groups: Vec<AppGroup>) {
        {
            let mut snapshot = self.snapshot.lock();
            *snapshot = Snapshot {
                apps: Arc::new(apps),
                groups: Arc::new(groups),
            };
        }
        self.loaded.store(true, Ordering::Release);
        self.bump();
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().clone()
    }

    /// Whether an enumeration pass has ever completed.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn find_app(&self, package_name: &str) -> Option<Arc<AppInfo>> {
        self.snapshot
            .lock()
            .apps
            .iter()
            .find(|a| a.package_name() == package_name)
            .cloned()
    }

    /// Rewrite one package's profile in place, waiting for the lock.
    pub fn patch_profile(&self, package_name: &str, profile: &Profile) {
        let mut snapshot = self.snapshot.lock();
        Self::apply_patch(&mut snapshot, package_name, profile);
        drop(snapshot);
        self.bump();
    }

    /// Like `patch_profile` but gives up if the store is busy. The next full
    /// resolution pass restores the authoritative value, so dropping one
    /// local patch is acceptable where stalling the caller is not.
    pub fn try_patch_profile(&self, package_name: &str, profile: &Profile) -> bool {
        let Some(mut snapshot) = self.snapshot.try_lock() else {
            warn!("Store busy, dropping local profile patch for {}", package_name);
            return false;
        };
        Self::apply_patch(&mut snapshot, package_name, profile);
        drop(snapshot);
        self.bump();
        true
    }

    fn apply_patch(snapshot: &mut Snapshot, package_name: &str, profile: &Profile) {
        let Some(pos) = snapshot
            .apps
            .iter()
            .position(|a| a.package_name() == package_name)
        else {
            debug!("Profile patch for unknown package {}", package_name);
            return;
        };

        let mut apps: Vec<Arc<AppInfo>> = snapshot.apps.as_ref().clone();
        let patched = Arc::new(apps[pos].with_profile(Some(profile.clone())));
        let uid = patched.uid();
        apps[pos] = Arc::clone(&patched);

        let mut groups: Vec<AppGroup> = snapshot.groups.as_ref().clone();
        for group in groups.iter_mut().filter(|g| g.uid == uid) {
            for member in group.apps.iter_mut() {
                if member.package_name() == package_name {
                    *member = Arc::clone(&patched);
                }
            }
            // Shared-uid packages share one policy entry
            group.profile = Some(profile.clone());
        }

        snapshot.apps = Arc::new(apps);
        snapshot.groups = Arc::new(groups);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl Default for AppListStore {
    fn default() -> Self {
        Self::new()
    }
}
