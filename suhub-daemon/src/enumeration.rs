use std::sync::Arc;

use parking_lot::Mutex;
use suhub_protocol::protocol::PackageRecord;
use tracing::{debug, warn};

use crate::errors::Result;

/// Source of installed-package data, one call per user profile.
///
/// Implementations read whatever registry the platform provides; tests
/// substitute an in-memory fixture.
pub trait PackageQuery: Send + Sync {
    /// User profile ids to enumerate, in the order their packages should
    /// appear in the aggregated list.
    fn user_ids(&self) -> Result<Vec<u32>>;

    /// All packages installed for one user profile.
    fn packages_for_user(&self, user_id: u32) -> Result<Vec<PackageRecord>>;
}

/// Aggregated package list, built once and served in pages.
///
/// The full enumeration is the expensive part, so the first read walks every
/// user profile and the result is kept until the process exits. A user whose
/// query fails is logged and omitted rather than failing the whole list.
pub struct PackageCache<Q> {
    query: Q,
    cached: Mutex<Option<Arc<Vec<PackageRecord>>>>,
}

impl<Q: PackageQuery> PackageCache<Q> {
    pub fn new(query: Q) -> Self {
        Self {
            query,
            cached: Mutex::new(None),
        }
    }

    /// The full aggregated list, enumerating on first use.
    pub fn all(&self) -> Result<Arc<Vec<PackageRecord>>> {
        if let Some(cached) = self.cached.lock().as_ref() {
            return Ok(Arc::clone(cached));
        }

        let mut records = Vec::new();
        for user_id in self.query.user_ids()? {
            match self.query.packages_for_user(user_id) {
                Ok(mut page) => {
                    debug!("Enumerated {} packages for user {}", page.len(), user_id);
                    records.append(&mut page);
                }
                Err(e) => {
                    warn!("Skipping user {}: {}", user_id, e);
                }
            }
        }

        let records = Arc::new(records);
        let mut cached = self.cached.lock();
        // Another task may have filled the cache while we enumerated; the
        // first published list wins so pagination stays stable.
        if let Some(existing) = cached.as_ref() {
            return Ok(Arc::clone(existing));
        }
        *cached = Some(Arc::clone(&records));
        Ok(records)
    }

    pub fn count(&self) -> Result<u32> {
        Ok(self.all()?.len() as u32)
    }

    /// One page of the aggregated list. A `start` at or past the end yields
    /// an empty page, which clients treat as exhaustion.
    pub fn page(&self, start: u32, max_count: u32) -> Result<Vec<PackageRecord>> {
        let all = self.all()?;
        let start = start as usize;
        if start >= all.len() {
            return Ok(Vec::new());
        }
        let end = (start + max_count as usize).min(all.len());
        Ok(all[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DaemonError;

    struct FixtureQuery {
        users: Vec<u32>,
        failing_user: Option<u32>,
    }

    impl FixtureQuery {
        fn record(user_id: u32, i: u32) -> PackageRecord {
            PackageRecord {
                package_name: format!("com.example.u{}.app{}", user_id, i),
                uid: user_id * 100_000 + 10_000 + i,
                label: format!("App {}", i),
                install_time: 1_700_000_000_000 + i as i64,
                system: false,
                icon_path: None,
            }
        }
    }

    impl PackageQuery for FixtureQuery {
        fn user_ids(&self) -> Result<Vec<u32>> {
            Ok(self.users.clone())
        }

        fn packages_for_user(&self, user_id: u32) -> Result<Vec<PackageRecord>> {
            if self.failing_user == Some(user_id) {
                return Err(DaemonError::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "denied",
                )));
            }
            Ok((0..3).map(|i| Self::record(user_id, i)).collect())
        }
    }

    #[test]
    fn pages_cover_the_whole_list() {
        let cache = PackageCache::new(FixtureQuery {
            users: vec![0, 10],
            failing_user: None,
        });

        assert_eq!(cache.count().unwrap(), 6);

        let mut seen = Vec::new();
        let mut start = 0;
        loop {
            let page = cache.page(start, 4).unwrap();
            if page.is_empty() {
                break;
            }
            start += page.len() as u32;
            seen.extend(page);
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[0].package_name, "com.example.u0.app0");
        assert_eq!(seen[5].package_name, "com.example.u10.app2");
    }

    #[test]
    fn out_of_range_start_is_empty_not_error() {
        let cache = PackageCache::new(FixtureQuery {
            users: vec![0],
            failing_user: None,
        });
        assert!(cache.page(3, 10).unwrap().is_empty());
        assert!(cache.page(1000, 10).unwrap().is_empty());
    }

    #[test]
    fn failing_user_is_omitted() {
        let cache = PackageCache::new(FixtureQuery {
            users: vec![0, 10, 11],
            failing_user: Some(10),
        });
        let all = cache.all().unwrap();
        assert_eq!(all.len(), 6);
        assert!(all.iter().all(|r| !r.package_name.contains(".u10.")));
    }
}
