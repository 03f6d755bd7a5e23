//! Virtual filesystem mounting for PID 1
//!
//! Every mount is forced: whatever is mounted at the target is lazily
//! detached first, then a fresh instance goes on top. Mounting the same entry
//! twice is therefore harmless, which matters because the kernel or an earlier
//! init may already have mounted some of these.
//!
//! The auxiliary table is applied after the first reap:
//! - /sys (sysfs, remounted first so the rest land on the fresh instance)
//! - /dev/pts, /dev/shm, /dev/mqueue
//! - securityfs, cgroup2, pstore, bpf, debugfs, tracefs, configfs

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::InitError;

/// Mountpoint of the device tree, the only place device nodes are allowed
const DEVICE_TREE: &str = "/dev";

/// Write to kernel log (/dev/kmsg) - survives better than the console this early
fn kmsg(msg: &str) {
    if let Ok(mut f) = fs::OpenOptions::new().write(true).open("/dev/kmsg") {
        let _ = writeln!(f, "tmpfs_switch_init: {}", msg);
    }
}

/// A virtual filesystem and where it goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountSpec {
    pub target: &'static str,
    pub fstype: &'static str,
}

impl MountSpec {
    pub const fn new(target: &'static str, fstype: &'static str) -> Self {
        Self { target, fstype }
    }

    /// Absolute, not `/` itself, and typed
    pub fn is_valid(&self) -> bool {
        self.target.len() > 1 && self.target.starts_with('/') && !self.fstype.is_empty()
    }

    /// Flags for a fresh mount of this entry
    pub fn flags(&self) -> MsFlags {
        mount_flags(self.target)
    }

    /// Force a fresh mount of this entry.
    pub fn mount(&self) -> Result<(), InitError> {
        if !self.is_valid() {
            return Err(InitError::MountSpec {
                target: self.target.to_string(),
                fstype: self.fstype.to_string(),
            });
        }
        mount_fresh(Path::new(self.target), self.fstype, self.flags())
    }
}

fn under_device_tree(target: &str) -> bool {
    target
        .strip_prefix(DEVICE_TREE)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn mount_flags(target: &str) -> MsFlags {
    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NOATIME;
    if !under_device_tree(target) {
        flags |= MsFlags::MS_NODEV;
    }
    flags
}

/// Device nodes, mounted before anything else
pub const DEVICE_MOUNT: MountSpec = MountSpec::new("/dev", "devtmpfs");

/// Process information, mounted before the first reap
pub const PROC_MOUNT: MountSpec = MountSpec::new("/proc", "proc");

/// Auxiliary filesystems, in mount order
pub const AUXILIARY_MOUNTS: &[MountSpec] = &[
    MountSpec::new("/sys", "sysfs"),
    // no fuse in recovery
    MountSpec::new("/sys/kernel/config", "configfs"),
    MountSpec::new("/sys/kernel/tracing", "tracefs"),
    MountSpec::new("/sys/kernel/debug", "debugfs"),
    // no hugetlbfs in recovery
    MountSpec::new("/sys/fs/bpf", "bpf"),
    MountSpec::new("/sys/fs/pstore", "pstore"),
    MountSpec::new("/sys/fs/cgroup", "cgroup2"),
    MountSpec::new("/sys/kernel/security", "securityfs"),
    MountSpec::new("/dev/mqueue", "mqueue"),
    MountSpec::new("/dev/shm", "tmpfs"),
    MountSpec::new("/dev/pts", "devpts"),
];

/// Lazily detach whatever is at `target`.
///
/// Nothing being mounted there is the common case, so failure is only logged.
pub fn detach(target: &Path) {
    if let Err(e) = umount2(target, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH) {
        log::debug!("Nothing detached from {}: {}", target.display(), e);
    }
}

/// Detach and remount `fstype` at `target`.
///
/// The mount itself is mandatory.
pub fn force_mount(target: &Path, fstype: &str) -> Result<(), InitError> {
    mount_fresh(target, fstype, mount_flags(&target.to_string_lossy()))
}

fn mount_fresh(target: &Path, fstype: &str, flags: MsFlags) -> Result<(), InitError> {
    detach(target);

    let target_str = target.to_string_lossy();
    mount(Some("none"), target, Some(fstype), flags, None::<&str>).map_err(|e| {
        kmsg(&format!("FAILED to mount {} on {}: {}", fstype, target_str, e));
        InitError::Mount {
            target: target_str.to_string(),
            fstype: fstype.to_string(),
            source: e,
        }
    })?;

    log::info!("Mounted {} on {}", fstype, target_str);
    Ok(())
}

/// Mount the auxiliary table.
///
/// /run is dropped first: there are no users and the root is already tmpfs.
pub fn mount_auxiliary_filesystems() -> Result<(), InitError> {
    detach(Path::new("/run"));

    for spec in AUXILIARY_MOUNTS {
        spec.mount()?;
    }

    log::info!("Auxiliary filesystems mounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_entries_are_valid() {
        for spec in AUXILIARY_MOUNTS.iter().chain([&DEVICE_MOUNT, &PROC_MOUNT]) {
            assert!(spec.is_valid(), "{:?}", spec);
        }
    }

    #[test]
    fn test_invalid_specs() {
        assert!(!MountSpec::new("/", "tmpfs").is_valid());
        assert!(!MountSpec::new("sys", "sysfs").is_valid());
        assert!(!MountSpec::new("/sys", "").is_valid());
    }

    #[test]
    fn test_invalid_spec_is_fatal_without_mounting() {
        let err = MountSpec::new("/", "tmpfs").mount().unwrap_err();
        assert!(matches!(err, InitError::MountSpec { .. }));
    }

    #[test]
    fn test_device_tree_allows_device_nodes() {
        for target in ["/dev", "/dev/pts", "/dev/shm", "/dev/mqueue"] {
            let flags = mount_flags(target);
            assert!(!flags.contains(MsFlags::MS_NODEV), "{}", target);
            assert!(flags.contains(MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NOATIME));
        }
    }

    #[test]
    fn test_everything_else_is_nodev() {
        for target in ["/proc", "/sys", "/sys/fs/cgroup", "/devices", "/run"] {
            let flags = mount_flags(target);
            assert!(flags.contains(MsFlags::MS_NODEV), "{}", target);
            assert!(flags.contains(MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NOATIME));
        }
    }

    #[test]
    fn test_table_flags_follow_device_tree() {
        for spec in AUXILIARY_MOUNTS.iter().chain([&DEVICE_MOUNT, &PROC_MOUNT]) {
            let nodev = spec.flags().contains(MsFlags::MS_NODEV);
            assert_eq!(nodev, !spec.target.starts_with("/dev"), "{:?}", spec);
        }
        assert!(!DEVICE_MOUNT.flags().contains(MsFlags::MS_NODEV));
        assert!(PROC_MOUNT.flags().contains(MsFlags::MS_NODEV));
    }

    #[test]
    fn test_sysfs_comes_before_its_children() {
        assert_eq!(AUXILIARY_MOUNTS[0], MountSpec::new("/sys", "sysfs"));
        let sys_children = AUXILIARY_MOUNTS
            .iter()
            .filter(|s| s.target.starts_with("/sys/"))
            .count();
        assert_eq!(sys_children, 7);
        assert_eq!(AUXILIARY_MOUNTS.len(), 11);
    }
}
