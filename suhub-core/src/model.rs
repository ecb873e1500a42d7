use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use suhub_protocol::protocol::PackageRecord;

use crate::oracle::PolicyOracle;
use crate::profile::Profile;

/// One installed package plus its resolved policy profile.
///
/// `profile` is `None` until a resolution pass has run (or when the last
/// lookup for this app failed and no earlier value exists).
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub record: Arc<PackageRecord>,
    pub profile: Option<Profile>,
}

impl AppInfo {
    pub fn new(record: PackageRecord) -> Self {
        Self {
            record: Arc::new(record),
            profile: None,
        }
    }

    pub fn package_name(&self) -> &str {
        &self.record.package_name
    }

    pub fn uid(&self) -> u32 {
        self.record.uid
    }

    pub fn label(&self) -> &str {
        &self.record.label
    }

    pub fn allow_su(&self) -> bool {
        self.profile.as_ref().is_some_and(|p| p.allow_su)
    }

    pub fn with_profile(&self, profile: Option<Profile>) -> Self {
        Self {
            record: Arc::clone(&self.record),
            profile,
        }
    }
}

/// Apps sharing one uid, presented as a single policy unit.
///
/// Shared-uid packages are indistinguishable to the policy layer, so the
/// profile lives on the group and `main_app` fronts for it in lists.
#[derive(Debug, Clone)]
pub struct AppGroup {
    pub uid: u32,
    pub apps: Vec<Arc<AppInfo>>,
    pub profile: Option<Profile>,
    pub user_name: Option<String>,
}

impl AppGroup {
    /// First app by case-insensitive label; groups are built non-empty.
    pub fn main_app(&self) -> &Arc<AppInfo> {
        &self.apps[0]
    }

    pub fn allow_su(&self) -> bool {
        self.profile.as_ref().is_some_and(|p| p.allow_su)
    }

    pub fn has_custom_profile(&self) -> bool {
        self.profile.as_ref().is_some_and(|p| p.is_custom())
    }

    /// Display key: the platform user name when known, the uid otherwise.
    pub fn display_key(&self) -> String {
        self.user_name
            .clone()
            .unwrap_or_else(|| self.uid.to_string())
    }

    fn sort_priority(&self) -> u8 {
        if self.allow_su() {
            0
        } else if self.has_custom_profile() {
            1
        } else {
            2
        }
    }
}

/// Case-insensitive ordering without allocating lowercased copies.
///
/// This compares Unicode lowercase forms, not locale-aware collation, so
/// non-ASCII labels may order differently than a platform collator would.
pub fn caseless_cmp(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

/// Build uid groups from a flat app list.
///
/// Within a group apps sort by label; the group profile is the first app's
/// resolved profile (shared-uid packages share one kernel entry, so any
/// member's answer stands for the group). Groups order granted first, then
/// customized, then everything else, ties broken by display key and main
/// label.
pub fn group_by_uid(apps: &[Arc<AppInfo>], oracle: &dyn PolicyOracle) -> Vec<AppGroup> {
    let mut by_uid: BTreeMap<u32, Vec<Arc<AppInfo>>> = BTreeMap::new();
    for app in apps {
        by_uid.entry(app.uid()).or_default().push(Arc::clone(app));
    }

    let mut groups: Vec<AppGroup> = by_uid
        .into_iter()
        .map(|(uid, mut members)| {
            members.sort_by(|a, b| caseless_cmp(a.label(), b.label()));
            let profile = members[0].profile.clone();
            AppGroup {
                uid,
                apps: members,
                profile,
                user_name: oracle.user_name(uid),
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        a.sort_priority()
            .cmp(&b.sort_priority())
            .then_with(|| caseless_cmp(&a.display_key(), &b.display_key()))
            .then_with(|| caseless_cmp(a.main_app().label(), b.main_app().label()))
    });
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MemoryOracle;
    use crate::profile::Profile;

    fn app(package: &str, uid: u32, label: &str) -> Arc<AppInfo> {
        Arc::new(AppInfo::new(PackageRecord {
            package_name: package.to_string(),
            uid,
            label: label.to_string(),
            install_time: 0,
            system: false,
            icon_path: None,
        }))
    }

    fn app_with_profile(package: &str, uid: u32, label: &str, edit: impl Fn(&mut Profile)) -> Arc<AppInfo> {
        let base = app(package, uid, label);
        let mut profile = Profile::new_default(package, uid);
        edit(&mut profile);
        Arc::new(base.with_profile(Some(profile)))
    }

    #[test]
    fn shared_uid_apps_collapse_into_one_group() {
        let oracle = MemoryOracle::new();
        let apps = vec![
            app("com.example.b", 10_001, "Beta"),
            app("com.example.a", 10_001, "alpha"),
            app("com.example.c", 10_002, "Gamma"),
        ];
        let groups = group_by_uid(&apps, &oracle);
        assert_eq!(groups.len(), 2);

        let shared = groups.iter().find(|g| g.uid == 10_001).unwrap();
        assert_eq!(shared.apps.len(), 2);
        // Case-insensitive label order decides the main app
        assert_eq!(shared.main_app().package_name(), "com.example.a");
    }

    #[test]
    fn granted_groups_sort_first_then_custom() {
        let oracle = MemoryOracle::new();
        let apps = vec![
            app("com.plain", 10_001, "Plain"),
            app_with_profile("com.granted", 10_002, "Granted", |p| p.allow_su = true),
            app_with_profile("com.custom", 10_003, "Custom", |p| {
                p.non_root_use_default = false
            }),
        ];
        let groups = group_by_uid(&apps, &oracle);
        let order: Vec<&str> = groups.iter().map(|g| g.main_app().package_name()).collect();
        assert_eq!(order, vec!["com.granted", "com.custom", "com.plain"]);
    }

    #[test]
    fn display_key_prefers_user_name() {
        let oracle = MemoryOracle::new();
        oracle.insert_user_name(10_001, "u0_a1");
        let apps = vec![app("com.a", 10_001, "A"), app("com.b", 10_002, "B")];
        let groups = group_by_uid(&apps, &oracle);
        assert_eq!(groups[0].display_key(), "u0_a1");
        assert_eq!(groups[1].display_key(), "10002");
    }

    #[test]
    fn caseless_order_mixes_cases() {
        let mut labels = vec!["zsh", "Alpha", "beta", "ALPHA2"];
        labels.sort_by(|a, b| caseless_cmp(a, b));
        assert_eq!(labels, vec!["Alpha", "ALPHA2", "beta", "zsh"]);
    }
}
