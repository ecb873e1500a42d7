use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::oracle::{OracleError, PolicyOracle, Result};
use crate::profile::{Namespace, Profile};

/// Character device exposed by the policy driver.
pub const POLICY_DEVICE: &str = "/dev/suhub";

const PROFILE_VERSION: u32 = 2;
const KEY_LEN: usize = 256;
const CONTEXT_LEN: usize = 64;
const MAX_GROUPS: usize = 32;

// ioctl request encoding, asm-generic layout: dir<<30 | size<<16 | type<<8 | nr
const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;
const IOC_MAGIC: libc::c_ulong = b'U' as libc::c_ulong;

const fn iowr(nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    ((IOC_READ | IOC_WRITE) << 30) | ((size as libc::c_ulong) << 16) | (IOC_MAGIC << 8) | nr
}

const GET_APP_PROFILE: libc::c_ulong = iowr(1, std::mem::size_of::<RawProfile>());
const SET_APP_PROFILE: libc::c_ulong = iowr(2, std::mem::size_of::<RawProfile>());
const GET_DEFAULT_UMOUNT: libc::c_ulong = iowr(3, std::mem::size_of::<u32>());
const SET_DEFAULT_UMOUNT: libc::c_ulong = iowr(4, std::mem::size_of::<u32>());

/// Wire layout shared with the policy driver. Field order and sizes are ABI.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawProfile {
    version: u32,
    key: [u8; KEY_LEN],
    current_uid: u32,
    allow_su: u32,

    root_use_default: u32,
    root_template: [u8; KEY_LEN],
    uid: u32,
    gid: u32,
    groups_count: u32,
    groups: [u32; MAX_GROUPS],
    capabilities: [u64; 2],
    context: [u8; CONTEXT_LEN],
    namespace: u32,

    non_root_use_default: u32,
    umount_modules: u32,
}

impl RawProfile {
    fn query(key: &str, current_uid: u32) -> Self {
        // SAFETY: RawProfile is repr(C) with no padding requirements beyond
        // zeroes being valid for every field
        let mut raw: RawProfile = unsafe { std::mem::zeroed() };
        raw.version = PROFILE_VERSION;
        copy_str(&mut raw.key, key);
        raw.current_uid = current_uid;
        raw
    }

    fn from_profile(profile: &Profile) -> Self {
        let mut raw = Self::query(&profile.name, profile.current_uid);
        raw.allow_su = profile.allow_su as u32;
        raw.root_use_default = profile.root_use_default as u32;
        if let Some(template) = &profile.root_template {
            copy_str(&mut raw.root_template, template);
        }
        raw.uid = profile.uid;
        raw.gid = profile.gid;
        raw.groups_count = profile.groups.len().min(MAX_GROUPS) as u32;
        for (slot, gid) in raw.groups.iter_mut().zip(&profile.groups) {
            *slot = *gid;
        }
        for cap in &profile.capabilities {
            let (word, bit) = (cap / 64, cap % 64);
            if word < 2 {
                raw.capabilities[word as usize] |= 1u64 << bit;
            }
        }
        copy_str(&mut raw.context, &profile.context);
        raw.namespace = match profile.namespace {
            Namespace::Inherited => 0,
            Namespace::Global => 1,
            Namespace::Individual => 2,
        };
        raw.non_root_use_default = profile.non_root_use_default as u32;
        raw.umount_modules = profile.umount_modules as u32;
        raw
    }

    fn into_profile(self) -> Profile {
        let mut capabilities = Vec::new();
        for (word, bits) in self.capabilities.iter().enumerate() {
            for bit in 0..64 {
                if bits & (1u64 << bit) != 0 {
                    capabilities.push(word as u64 * 64 + bit);
                }
            }
        }
        let root_template = read_str(&self.root_template);
        Profile {
            name: read_str(&self.key).unwrap_or_default(),
            current_uid: self.current_uid,
            allow_su: self.allow_su != 0,
            root_use_default: self.root_use_default != 0,
            root_template,
            uid: self.uid,
            gid: self.gid,
            groups: self.groups[..self.groups_count.min(MAX_GROUPS as u32) as usize].to_vec(),
            capabilities,
            context: read_str(&self.context).unwrap_or_default(),
            namespace: match self.namespace {
                1 => Namespace::Global,
                2 => Namespace::Individual,
                _ => Namespace::Inherited,
            },
            non_root_use_default: self.non_root_use_default != 0,
            umount_modules: self.umount_modules != 0,
            rules: String::new(),
        }
    }
}

fn copy_str(dest: &mut [u8], src: &str) {
    // Leave room for the NUL terminator the driver expects
    let len = src.len().min(dest.len() - 1);
    dest[..len].copy_from_slice(&src.as_bytes()[..len]);
}

fn read_str(src: &[u8]) -> Option<String> {
    let end = src.iter().position(|b| *b == 0).unwrap_or(src.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&src[..end]).into_owned())
}

/// Oracle backed by the policy driver's ioctl interface.
///
/// The driver stores everything except `rules`, which are a frontend
/// concern; those live in an overlay here and are merged back on reads.
pub struct KernelOracle {
    device: PathBuf,
    rules: Mutex<HashMap<String, String>>,
}

impl KernelOracle {
    pub fn new() -> Self {
        Self::at(PathBuf::from(POLICY_DEVICE))
    }

    pub fn at(device: PathBuf) -> Self {
        Self {
            device,
            rules: Mutex::new(HashMap::new()),
        }
    }

    fn open(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device)
            .map_err(OracleError::Unavailable)
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T) -> Result<std::io::Result<()>> {
        let file = self.open()?;
        // SAFETY: arg is a valid, exclusively borrowed T for the duration of
        // the call and request encodes exactly size_of::<T>()
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg as *mut T) };
        if rc < 0 {
            return Ok(Err(std::io::Error::last_os_error()));
        }
        Ok(Ok(()))
    }
}

impl Default for KernelOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyOracle for KernelOracle {
    fn app_profile(&self, key: &str, uid: u32) -> Result<Profile> {
        let mut raw = RawProfile::query(key, uid);
        match self.ioctl(GET_APP_PROFILE, &mut raw)? {
            Ok(()) => {}
            // No stored profile means the defaults apply
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                debug!("No stored profile for {} (uid {})", key, uid);
                return Ok(Profile::new_default(key, uid));
            }
            Err(e) => {
                return Err(OracleError::Read {
                    key: key.to_string(),
                    uid,
                    source: e,
                });
            }
        }

        let mut profile = raw.into_profile();
        // The driver echoes the key back NUL-trimmed; keep the caller's form
        profile.name = key.to_string();
        profile.current_uid = uid;
        if let Some(rules) = self.rules.lock().get(key) {
            profile.rules = rules.clone();
        }
        Ok(profile)
    }

    fn set_app_profile(&self, profile: &Profile) -> Result<bool> {
        let mut raw = RawProfile::from_profile(profile);
        match self.ioctl(SET_APP_PROFILE, &mut raw)? {
            Ok(()) => {
                self.rules
                    .lock()
                    .insert(profile.name.clone(), profile.rules.clone());
                Ok(true)
            }
            // The driver vets profiles and refuses ones it cannot enforce
            Err(e) if matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::EPERM)) => {
                warn!("Policy driver refused profile for {}: {}", profile.name, e);
                Ok(false)
            }
            Err(e) => Err(OracleError::Write {
                key: profile.name.clone(),
                source: e,
            }),
        }
    }

    fn user_name(&self, uid: u32) -> Option<String> {
        // SAFETY: passwd is a plain C struct; all-zeroes is a valid initial value
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = [0u8; 512];
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        // SAFETY: pwd, buf, and result outlive the call; buf capacity is
        // passed alongside its pointer
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut pwd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                &mut result,
            )
        };
        if rc != 0 || result.is_null() {
            return None;
        }
        // SAFETY: on success pw_name points at a NUL-terminated string in buf
        let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
        Some(name.to_string_lossy().into_owned())
    }

    fn default_umount_modules(&self) -> bool {
        let mut value: u32 = 1;
        match self.ioctl(GET_DEFAULT_UMOUNT, &mut value) {
            Ok(Ok(())) => value != 0,
            Ok(Err(e)) => {
                debug!("Failed to read default umount flag, assuming on: {}", e);
                true
            }
            Err(e) => {
                debug!("Policy device unavailable, assuming umount on: {}", e);
                true
            }
        }
    }

    fn set_default_umount_modules(&self, value: bool) -> Result<()> {
        let mut raw = value as u32;
        self.ioctl(SET_DEFAULT_UMOUNT, &mut raw)?
            .map_err(|e| OracleError::Write {
                key: "default_umount_modules".to_string(),
                source: e,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_profile_round_trips() {
        let mut profile = Profile::new_default("com.example.app", 10_123);
        profile.allow_su = true;
        profile.root_use_default = false;
        profile.uid = 2000;
        profile.gid = 2000;
        profile.groups = vec![3003, 9997];
        profile.capabilities = vec![0, 21, 64];
        profile.context = "u:r:su:s0".to_string();
        profile.namespace = Namespace::Individual;

        let back = RawProfile::from_profile(&profile).into_profile();
        assert_eq!(back.name, profile.name);
        assert_eq!(back.uid, 2000);
        assert_eq!(back.groups, vec![3003, 9997]);
        assert_eq!(back.capabilities, vec![0, 21, 64]);
        assert_eq!(back.namespace, Namespace::Individual);
        assert!(!back.root_use_default);
    }

    #[test]
    fn oversized_key_is_truncated_not_overflowed() {
        let long = "a".repeat(KEY_LEN * 2);
        let raw = RawProfile::query(&long, 0);
        assert_eq!(raw.key[KEY_LEN - 1], 0);
        assert_eq!(raw.key[KEY_LEN - 2], b'a');
    }

    #[test]
    fn missing_device_reports_unavailable() {
        let oracle = KernelOracle::at(PathBuf::from("/nonexistent/suhub-device"));
        assert!(matches!(
            oracle.app_profile("com.example.app", 10_001),
            Err(OracleError::Unavailable(_))
        ));
    }
}
