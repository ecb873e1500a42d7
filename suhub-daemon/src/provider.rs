use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use suhub_protocol::protocol::PackageRecord;
use tracing::{debug, warn};

use crate::enumeration::PackageQuery;
use crate::errors::{DaemonError, Result};

/// App ids below this are shared-system packages rather than installed apps.
const FIRST_APPLICATION_APP_ID: u32 = 10_000;

/// Multiplier separating the user profile from the app id inside a uid.
const PER_USER_RANGE: u32 = 100_000;

/// Reads the platform package registry directly.
///
/// The registry is one line per package (`name appid debuggable data-dir
/// seinfo gids`); user profiles are the numeric directory names under
/// `users_dir`. Going straight to these files keeps the service independent
/// of any framework process that may not be running yet at boot.
pub struct SystemPackageQuery {
    registry: PathBuf,
    users_dir: PathBuf,
}

impl SystemPackageQuery {
    pub fn new(registry: PathBuf, users_dir: PathBuf) -> Self {
        Self { registry, users_dir }
    }

    fn read_registry(&self) -> Result<String> {
        std::fs::read_to_string(&self.registry).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DaemonError::RegistryNotFound(self.registry.clone())
            } else {
                DaemonError::RegistryRead {
                    path: self.registry.clone(),
                    source: e,
                }
            }
        })
    }
}

impl PackageQuery for SystemPackageQuery {
    fn user_ids(&self) -> Result<Vec<u32>> {
        let entries = match std::fs::read_dir(&self.users_dir) {
            Ok(entries) => entries,
            Err(e) => {
                // A single-user device without a users directory still has
                // profile 0.
                debug!("No users directory at {:?}: {}", self.users_dir, e);
                return Ok(vec![0]);
            }
        };

        let mut ids: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        if ids.is_empty() {
            ids.push(0);
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn packages_for_user(&self, user_id: u32) -> Result<Vec<PackageRecord>> {
        let contents = self.read_registry()?;

        let mut records = Vec::new();
        for line in contents.lines() {
            match parse_registry_line(line, user_id) {
                Some(record) => records.push(record),
                None => {
                    if !line.trim().is_empty() {
                        warn!("Skipping malformed registry line: {:?}", line);
                    }
                }
            }
        }
        Ok(records)
    }
}

fn parse_registry_line(line: &str, user_id: u32) -> Option<PackageRecord> {
    let mut fields = line.split_whitespace();
    let package_name = fields.next()?;
    let app_id: u32 = fields.next()?.parse().ok()?;
    let _debuggable = fields.next()?;
    let data_dir = fields.next()?;

    Some(PackageRecord {
        package_name: package_name.to_string(),
        uid: user_id * PER_USER_RANGE + app_id,
        label: default_label(package_name),
        install_time: data_dir_install_time(Path::new(data_dir)),
        system: app_id < FIRST_APPLICATION_APP_ID,
        icon_path: None,
    })
}

/// Last dotted segment of the package name; the manager replaces this with
/// the real label once it resolves the app locally.
fn default_label(package_name: &str) -> String {
    package_name
        .rsplit('.')
        .next()
        .unwrap_or(package_name)
        .to_string()
}

/// Install time approximated by the data directory's mtime, epoch millis.
/// Zero when the directory is unreadable.
fn data_dir_install_time(data_dir: &Path) -> i64 {
    std::fs::metadata(data_dir)
        .and_then(|m| m.modified())
        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
        .unwrap_or(0)
}
