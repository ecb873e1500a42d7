use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use suhub_protocol::protocol::PackageRecord;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::connection::ServiceConnection;
use crate::errors::Result;
use crate::model::{AppGroup, AppInfo, group_by_uid};
use crate::oracle::PolicyOracle;
use crate::profile::Profile;
use crate::state::{AppListStore, Snapshot};

/// Sizing for profile resolution work.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    /// Cap on concurrently running resolution batches.
    pub workers: usize,
    /// Apps per resolution batch and per batch-edit chunk.
    pub batch_size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            batch_size: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Our own package name; excluded from the managed list.
    pub own_package: String,
    pub socket_path: PathBuf,
    /// Packages fetched per enumeration page.
    pub page_size: u32,
    pub connect_timeout: Duration,
    pub pool: WorkerPoolConfig,
}

impl ManagerConfig {
    pub fn new(own_package: impl Into<String>, socket_path: PathBuf) -> Self {
        Self {
            own_package: own_package.into(),
            socket_path,
            page_size: 100,
            connect_timeout: Duration::from_secs(5),
            pool: WorkerPoolConfig::default(),
        }
    }
}

type ProfileListener = Box<dyn Fn(&str) + Send + Sync>;

/// Orchestrates the managed app list.
///
/// Full enumeration (`fetch_app_list`) pulls pages from the privileged
/// service and resolves a profile per app; `refresh_profiles` re-resolves
/// profiles for the already-published list without touching the service.
/// Both publish atomically into the [`AppListStore`]. At most one
/// enumeration runs at a time; a second request while one is in flight is
/// a no-op rather than an error, matching pull-to-refresh semantics.
pub struct SuperuserManager {
    config: ManagerConfig,
    connection: Arc<ServiceConnection>,
    oracle: Arc<dyn PolicyOracle>,
    store: Arc<AppListStore>,

    refresh_gate: tokio::sync::Mutex<()>,
    refreshing_tx: watch::Sender<bool>,
    progress_tx: watch::Sender<f32>,

    selected: Mutex<HashSet<String>>,
    batch_actions: AtomicBool,
    listeners: Mutex<Vec<ProfileListener>>,
}

impl SuperuserManager {
    pub fn new(config: ManagerConfig, oracle: Arc<dyn PolicyOracle>) -> Self {
        let connection = Arc::new(ServiceConnection::new(
            config.socket_path.clone(),
            config.connect_timeout,
        ));
        let (refreshing_tx, _) = watch::channel(false);
        let (progress_tx, _) = watch::channel(0.0);
        Self {
            config,
            connection,
            oracle,
            store: Arc::new(AppListStore::new()),
            refresh_gate: tokio::sync::Mutex::new(()),
            refreshing_tx,
            progress_tx,
            selected: Mutex::new(HashSet::new()),
            batch_actions: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<AppListStore> {
        &self.store
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn is_refreshing(&self) -> bool {
        *self.refreshing_tx.borrow()
    }

    pub fn subscribe_refreshing(&self) -> watch::Receiver<bool> {
        self.refreshing_tx.subscribe()
    }

    /// Enumeration progress in `[0.0, 1.0]`. Conflated; observers only see
    /// the latest value.
    pub fn subscribe_progress(&self) -> watch::Receiver<f32> {
        self.progress_tx.subscribe()
    }

    /// Full enumeration pass: connect, page through the service's package
    /// list, resolve a profile per app, publish.
    ///
    /// Progress advances once per fetched page. Our own package is skipped;
    /// a failed profile lookup leaves that app unresolved rather than
    /// aborting the pass. On any error or cancellation the connection is
    /// dropped and the refreshing flag cleared; the previously published
    /// list stays intact.
    pub async fn fetch_app_list(&self) -> Result<()> {
        let Ok(_gate) = self.refresh_gate.try_lock() else {
            debug!("Enumeration already in progress, ignoring request");
            return Ok(());
        };

        let _ = self.refreshing_tx.send(true);
        let _ = self.progress_tx.send(0.0);
        let _flag = ResetFlag {
            tx: &self.refreshing_tx,
        };

        let handle = Arc::clone(&self.connection).connect().await?;
        let _disconnect = DisconnectGuard {
            connection: Arc::clone(&self.connection),
        };

        let total = handle.package_count().await?;
        debug!("Service reports {} packages", total);

        let mut apps: Vec<Arc<AppInfo>> = Vec::with_capacity(total as usize);
        let mut offset = 0u32;
        while offset < total {
            let page = handle.packages(offset, self.config.page_size).await?;
            if page.is_empty() {
                // The list shrank underneath us; treat it as exhausted
                break;
            }
            offset += page.len() as u32;

            let oracle = Arc::clone(&self.oracle);
            let own_package = self.config.own_package.clone();
            let resolved =
                tokio::task::spawn_blocking(move || resolve_page(&*oracle, &own_package, page))
                    .await?;
            apps.extend(resolved);

            let _ = self
                .progress_tx
                .send((offset as f32 / total.max(1) as f32).min(1.0));
        }

        let groups = self.regroup(&apps).await?;
        self.store.publish(apps, groups);
        let _ = self.progress_tx.send(1.0);

        let snapshot = self.store.snapshot();
        info!(
            "Enumeration complete: {} apps in {} groups",
            snapshot.apps.len(),
            snapshot.groups.len()
        );
        Ok(())
    }

    /// Re-resolve every published app's profile in bounded-parallel batches
    /// and publish the result as one new generation.
    ///
    /// Batches run concurrently up to the worker cap but reassemble in list
    /// order. A batch that fails outright keeps its previous entries; a
    /// single failed lookup keeps that app's previous profile.
    pub async fn refresh_profiles(&self) -> Result<()> {
        let snapshot = self.store.snapshot();
        if snapshot.apps.is_empty() {
            return Ok(());
        }

        let batch_size = self.config.pool.batch_size.max(1);
        let semaphore = Arc::new(Semaphore::new(self.config.pool.workers.max(1)));

        let batches: Vec<Vec<Arc<AppInfo>>> = snapshot
            .apps
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let total_batches = batches.len();
        let _ = self.progress_tx.send(0.0);

        let mut join_set = JoinSet::new();
        for (index, batch) in batches.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let oracle = Arc::clone(&self.oracle);
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, None);
                };
                match tokio::task::spawn_blocking(move || refresh_batch(&*oracle, batch)).await {
                    Ok(refreshed) => (index, Some(refreshed)),
                    Err(e) => {
                        warn!("Profile refresh batch {} failed: {}", index, e);
                        (index, None)
                    }
                }
            });
        }

        let mut slots: Vec<Option<Vec<Arc<AppInfo>>>> = (0..total_batches).map(|_| None).collect();
        let mut completed = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, refreshed)) => slots[index] = refreshed,
                Err(e) => warn!("Profile refresh worker failed: {}", e),
            }
            completed += 1;
            let _ = self
                .progress_tx
                .send(completed as f32 / total_batches as f32);
        }

        // Reassemble in list order; failed batches fall back to their
        // previous entries
        let mut apps: Vec<Arc<AppInfo>> = Vec::with_capacity(snapshot.apps.len());
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(refreshed) => apps.extend(refreshed),
                None => {
                    let start = index * batch_size;
                    let end = (start + batch_size).min(snapshot.apps.len());
                    apps.extend(snapshot.apps[start..end].iter().cloned());
                }
            }
        }

        let groups = self.regroup(&apps).await?;
        self.store.publish(apps, groups);
        Ok(())
    }

    /// Apply one permission edit to every selected package.
    ///
    /// Packages are processed in chunks; each gets its live profile from the
    /// oracle, the edit applied, and the result written back. A refused or
    /// failed write reports
    /// `false` for that package and leaves its published profile untouched.
    /// Afterwards the selection and batch mode are cleared and a full
    /// profile refresh reconciles the list with what the oracle accepted.
    pub async fn update_batch_permissions(
        &self,
        allow_su: bool,
        umount_modules: Option<bool>,
    ) -> Result<Vec<(String, bool)>> {
        let selected: Vec<String> = {
            let mut names: Vec<String> = self.selected.lock().iter().cloned().collect();
            names.sort();
            names
        };
        if selected.is_empty() {
            self.batch_actions.store(false, Ordering::Release);
            return Ok(Vec::new());
        }
        info!(
            "Applying batch edit (allow_su={}) to {} packages",
            allow_su,
            selected.len()
        );

        let batch_size = self.config.pool.batch_size.max(1);
        let mut outcomes = Vec::with_capacity(selected.len());

        for chunk in selected.chunks(batch_size) {
            // Only packages still present in the published list are edited; a
            // selection can outlive an uninstall, and an unresolvable name
            // must not reach the oracle
            let jobs: Vec<(String, Option<u32>)> = chunk
                .iter()
                .map(|package| {
                    let uid = self.store.find_app(package).map(|a| a.uid());
                    (package.clone(), uid)
                })
                .collect();

            let oracle = Arc::clone(&self.oracle);
            let store = Arc::clone(&self.store);
            let chunk_outcomes = tokio::task::spawn_blocking(move || {
                apply_batch_edit(&*oracle, &store, jobs, allow_su, umount_modules)
            })
            .await?;

            for (package, applied) in &chunk_outcomes {
                if *applied {
                    self.notify_listeners(package);
                }
            }
            outcomes.extend(chunk_outcomes);
        }

        self.selected.lock().clear();
        self.batch_actions.store(false, Ordering::Release);

        self.refresh_profiles().await?;
        Ok(outcomes)
    }

    /// Write one profile through the oracle and patch the published list on
    /// success. Returns whether the oracle accepted it.
    pub async fn set_app_profile(&self, profile: Profile) -> Result<bool> {
        let oracle = Arc::clone(&self.oracle);
        let to_write = profile.clone();
        let applied =
            tokio::task::spawn_blocking(move || oracle.set_app_profile(&to_write)).await??;
        if applied {
            self.store.patch_profile(&profile.name, &profile);
            self.notify_listeners(&profile.name);
        }
        Ok(applied)
    }

    /// Optimistically patch the published list without consulting the
    /// oracle. Skipped when the store is busy; the next refresh restores
    /// the authoritative value either way.
    pub fn update_app_profile_locally(&self, profile: &Profile) -> bool {
        let patched = self.store.try_patch_profile(&profile.name, profile);
        if patched {
            self.notify_listeners(&profile.name);
        }
        patched
    }

    /// The shared profile for apps without su that follow the default.
    pub async fn non_root_default_profile(&self) -> Result<Profile> {
        let oracle = Arc::clone(&self.oracle);
        Ok(tokio::task::spawn_blocking(move || oracle.non_root_default_profile()).await??)
    }

    pub fn toggle_selection(&self, package_name: &str) {
        let mut selected = self.selected.lock();
        if !selected.remove(package_name) {
            selected.insert(package_name.to_string());
        }
    }

    pub fn is_selected(&self, package_name: &str) -> bool {
        self.selected.lock().contains(package_name)
    }

    pub fn selected_packages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.selected.lock().iter().cloned().collect();
        names.sort();
        names
    }

    pub fn clear_selection(&self) {
        self.selected.lock().clear();
        self.batch_actions.store(false, Ordering::Release);
    }

    pub fn set_batch_mode(&self, enabled: bool) {
        self.batch_actions.store(enabled, Ordering::Release);
        if !enabled {
            self.selected.lock().clear();
        }
    }

    pub fn in_batch_mode(&self) -> bool {
        self.batch_actions.load(Ordering::Acquire)
    }

    /// Register for per-package profile change notifications.
    pub fn add_profile_listener(&self, listener: ProfileListener) {
        self.listeners.lock().push(listener);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn notify_listeners(&self, package_name: &str) {
        for listener in self.listeners.lock().iter() {
            listener(package_name);
        }
    }

    async fn regroup(&self, apps: &[Arc<AppInfo>]) -> Result<Vec<AppGroup>> {
        let oracle = Arc::clone(&self.oracle);
        let apps = apps.to_vec();
        Ok(tokio::task::spawn_blocking(move || group_by_uid(&apps, &*oracle)).await?)
    }
}

fn resolve_page(
    oracle: &dyn PolicyOracle,
    own_package: &str,
    page: Vec<PackageRecord>,
) -> Vec<Arc<AppInfo>> {
    let mut resolved = Vec::with_capacity(page.len());
    for record in page {
        if record.package_name == own_package {
            continue;
        }
        let app = AppInfo::new(record);
        let profile = match oracle.app_profile(app.package_name(), app.uid()) {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!("Profile lookup failed for {}: {}", app.package_name(), e);
                None
            }
        };
        resolved.push(Arc::new(app.with_profile(profile)));
    }
    resolved
}

fn refresh_batch(oracle: &dyn PolicyOracle, batch: Vec<Arc<AppInfo>>) -> Vec<Arc<AppInfo>> {
    batch
        .into_iter()
        .map(|app| match oracle.app_profile(app.package_name(), app.uid()) {
            Ok(profile) => Arc::new(app.with_profile(Some(profile))),
            Err(e) => {
                // Keep the previous profile rather than regressing to None
                warn!("Profile refresh failed for {}: {}", app.package_name(), e);
                app
            }
        })
        .collect()
}

fn apply_batch_edit(
    oracle: &dyn PolicyOracle,
    store: &AppListStore,
    jobs: Vec<(String, Option<u32>)>,
    allow_su: bool,
    umount_modules: Option<bool>,
) -> Vec<(String, bool)> {
    let mut outcomes = Vec::with_capacity(jobs.len());
    for (package, uid) in jobs {
        let Some(uid) = uid else {
            warn!("Skipping batch edit for unknown package {}", package);
            outcomes.push((package, false));
            continue;
        };
        // Edit against the oracle's live answer, not the possibly stale
        // published copy
        let mut profile = match oracle.app_profile(&package, uid) {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Cannot read profile for {}: {}", package, e);
                outcomes.push((package, false));
                continue;
            }
        };

        profile.allow_su = allow_su;
        if let Some(umount) = umount_modules {
            profile.umount_modules = umount;
        }
        // An explicit edit pins this app's non-root side
        profile.non_root_use_default = false;

        let applied = match oracle.set_app_profile(&profile) {
            Ok(applied) => applied,
            Err(e) => {
                warn!("Profile write failed for {}: {}", package, e);
                false
            }
        };
        if applied {
            store.patch_profile(&package, &profile);
        }
        outcomes.push((package, applied));
    }
    outcomes
}

struct ResetFlag<'a> {
    tx: &'a watch::Sender<bool>,
}

impl Drop for ResetFlag<'_> {
    fn drop(&mut self) {
        let _ = self.tx.send(false);
    }
}

struct DisconnectGuard {
    connection: Arc<ServiceConnection>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}
