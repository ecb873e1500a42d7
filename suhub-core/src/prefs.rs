use std::collections::HashMap;

use parking_lot::Mutex;

use crate::filter::SortType;

const KEY_SORT: &str = "list_sort";
const KEY_SHOW_SYSTEM: &str = "show_system_apps";

/// Minimal string key-value store for view settings. The frontend provides
/// the durable implementation; [`MemoryPreferences`] backs tests.
pub trait Preferences: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str);
}

#[derive(Default)]
pub struct MemoryPreferences {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Preferences for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }
}

/// Persisted list view settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewSettings {
    pub sort: SortType,
    pub show_system: bool,
}

impl ViewSettings {
    /// Unknown or missing values fall back to the defaults.
    pub fn load(prefs: &dyn Preferences) -> Self {
        let sort = prefs
            .get(KEY_SORT)
            .and_then(|key| SortType::from_persist_key(&key))
            .unwrap_or_default();
        let show_system = prefs
            .get(KEY_SHOW_SYSTEM)
            .is_some_and(|v| v == "true");
        Self { sort, show_system }
    }

    pub fn store(&self, prefs: &dyn Preferences) {
        prefs.put(KEY_SORT, self.sort.persist_key());
        prefs.put(KEY_SHOW_SYSTEM, if self.show_system { "true" } else { "false" });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let prefs = MemoryPreferences::new();
        let settings = ViewSettings {
            sort: SortType::InstallTimeNew,
            show_system: true,
        };
        settings.store(&prefs);
        assert_eq!(ViewSettings::load(&prefs), settings);
    }

    #[test]
    fn missing_or_garbage_values_use_defaults() {
        let prefs = MemoryPreferences::new();
        assert_eq!(ViewSettings::load(&prefs), ViewSettings::default());

        prefs.put("list_sort", "not-a-sort");
        prefs.put("show_system_apps", "maybe");
        assert_eq!(ViewSettings::load(&prefs), ViewSettings::default());
    }
}
