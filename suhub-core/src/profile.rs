use serde::{Deserialize, Serialize};

/// Uid granted by an allow-su profile by default.
pub const ROOT_UID: u32 = 0;

/// Placeholder uid carried by the shared non-root default profile.
pub const NOBODY_UID: u32 = 9999;

/// Key under which the shared non-root default profile is stored. Not a
/// valid package name, so it can never collide with a per-app profile.
pub const NON_ROOT_DEFAULT_KEY: &str = "$";

/// Security context granted root sessions unless a profile overrides it.
pub const SU_DOMAIN: &str = "u:r:su:s0";

/// Mount namespace a root session runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Namespace {
    /// Stay in the caller's namespace.
    #[default]
    Inherited,
    /// Join the global namespace.
    Global,
    /// Fresh namespace per session.
    Individual,
}

/// Per-app security policy.
///
/// `name` is the package name the profile is keyed by (or
/// [`NON_ROOT_DEFAULT_KEY`] for the shared non-root default) and
/// `current_uid` the uid it was resolved for. The root-side fields
/// (`uid` through `namespace`) only apply while `allow_su` is set;
/// `umount_modules` only applies while it is not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub current_uid: u32,
    pub allow_su: bool,

    pub root_use_default: bool,
    pub root_template: Option<String>,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub capabilities: Vec<u64>,
    pub context: String,
    pub namespace: Namespace,

    pub non_root_use_default: bool,
    pub umount_modules: bool,

    /// Free-form policy rules, stored verbatim on behalf of the frontend.
    pub rules: String,
}

impl Profile {
    /// The profile an app has before anyone touches it.
    pub fn new_default(name: impl Into<String>, current_uid: u32) -> Self {
        Self {
            name: name.into(),
            current_uid,
            allow_su: false,
            root_use_default: true,
            root_template: None,
            uid: ROOT_UID,
            gid: 0,
            groups: Vec::new(),
            capabilities: Vec::new(),
            context: SU_DOMAIN.to_string(),
            namespace: Namespace::default(),
            non_root_use_default: true,
            umount_modules: true,
            rules: String::new(),
        }
    }

    /// Whether the relevant side of the profile deviates from the defaults.
    /// An allow-su profile is custom once it stops following the root
    /// template; a denied one once it stops following the shared non-root
    /// default.
    pub fn is_custom(&self) -> bool {
        if self.allow_su {
            !self.root_use_default
        } else {
            !self.non_root_use_default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_is_not_custom() {
        let p = Profile::new_default("com.example.app", 10_001);
        assert!(!p.allow_su);
        assert!(!p.is_custom());
    }

    #[test]
    fn custom_tracks_the_active_side() {
        let mut p = Profile::new_default("com.example.app", 10_001);

        // Tweaking the non-root side while denied makes it custom
        p.non_root_use_default = false;
        assert!(p.is_custom());

        // Granting su switches which side counts
        p.allow_su = true;
        assert!(!p.is_custom());
        p.root_use_default = false;
        assert!(p.is_custom());
    }
}
