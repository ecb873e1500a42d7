use crate::model::{AppGroup, caseless_cmp};

/// Shell's uid; always listed even when system apps are hidden, since it is
/// the group most users came to manage.
pub const SHELL_UID: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppCategory {
    #[default]
    All,
    /// Groups with su granted.
    Root,
    /// Groups with a customized profile but no grant.
    Custom,
    /// Everything still on the defaults.
    Default,
}

impl AppCategory {
    fn matches(self, group: &AppGroup) -> bool {
        match self {
            Self::All => true,
            Self::Root => group.allow_su(),
            Self::Custom => !group.allow_su() && group.has_custom_profile(),
            Self::Default => !group.allow_su() && !group.has_custom_profile(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortType {
    #[default]
    NameAsc,
    NameDesc,
    InstallTimeNew,
    InstallTimeOld,
}

impl SortType {
    /// Stable key for persisting the choice.
    pub fn persist_key(self) -> &'static str {
        match self {
            Self::NameAsc => "name_asc",
            Self::NameDesc => "name_desc",
            Self::InstallTimeNew => "install_time_new",
            Self::InstallTimeOld => "install_time_old",
        }
    }

    pub fn from_persist_key(key: &str) -> Option<Self> {
        match key {
            "name_asc" => Some(Self::NameAsc),
            "name_desc" => Some(Self::NameDesc),
            "install_time_new" => Some(Self::InstallTimeNew),
            "install_time_old" => Some(Self::InstallTimeOld),
            _ => None,
        }
    }
}

/// Apply search, category, and system visibility to a group list.
///
/// The search matches labels, package names, and the group's display key,
/// all case-insensitively. Hidden system groups stay visible when they
/// carry a grant or a custom profile, so hiding never hides an active
/// policy.
pub fn filter_groups(
    groups: &[AppGroup],
    search: &str,
    category: AppCategory,
    show_system: bool,
) -> Vec<AppGroup> {
    let needle = search.trim().to_lowercase();
    groups
        .iter()
        .filter(|group| category.matches(group))
        .filter(|group| {
            show_system
                || group.uid == SHELL_UID
                || group.allow_su()
                || group.has_custom_profile()
                || !group.main_app().record.system
        })
        .filter(|group| {
            if needle.is_empty() {
                return true;
            }
            group.display_key().to_lowercase().contains(&needle)
                || group.apps.iter().any(|app| {
                    app.label().to_lowercase().contains(&needle)
                        || app.package_name().to_lowercase().contains(&needle)
                })
        })
        .cloned()
        .collect()
}

/// Reorder groups for display. Runs after [`filter_groups`] and deliberately
/// drops the grant-first ordering when the user picks an explicit sort.
pub fn sort_groups(groups: &mut [AppGroup], sort: SortType) {
    match sort {
        SortType::NameAsc => {
            groups.sort_by(|a, b| caseless_cmp(a.main_app().label(), b.main_app().label()));
        }
        SortType::NameDesc => {
            groups.sort_by(|a, b| caseless_cmp(b.main_app().label(), a.main_app().label()));
        }
        SortType::InstallTimeNew => {
            groups.sort_by_key(|g| std::cmp::Reverse(g.main_app().record.install_time));
        }
        SortType::InstallTimeOld => {
            groups.sort_by_key(|g| g.main_app().record.install_time);
        }
    }
}
