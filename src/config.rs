//! Fixed configuration for the recovery init
//!
//! Nothing here is read from disk: the ramdisk layout is built alongside the
//! binary, so paths are compile-time knowledge. The values are still carried
//! around explicitly so tests can point components at temporary trees.

use std::path::PathBuf;
use std::time::Duration;

/// Name the binary answers to when asked to switch roots.
pub const ACTIVATE_NAME: &str = "activate";

/// Highest numbered virtual console the kernel provides (MAX_NR_CONSOLES).
pub const MAX_CONSOLES: u32 = 63;

/// Paths and timings used across the init.
#[derive(Debug, Clone)]
pub struct InitConfig {
    /// Stale switch-root marker removed at boot
    pub activation_marker: PathBuf,
    /// Where the persistent root is expected to be mounted
    pub new_root: PathBuf,
    /// Helper that performs switch-root
    pub switch_root_helper: PathBuf,
    /// Where this binary is installed inside the new root
    pub installed_init: PathBuf,
    /// Minimum link count of a populated root directory
    pub new_root_min_links: u64,
    /// Interactive shell
    pub shell: PathBuf,
    /// Controlling terminal device
    pub controlling_tty: PathBuf,
    /// Virtual consoles are this prefix followed by their number
    pub console_prefix: String,
    /// Number of the primary virtual console
    pub primary_console: u32,
    /// Secondary device that receives stderr
    pub debug_device: PathBuf,
    /// Process information tree
    pub proc_root: PathBuf,
    /// Settle delay and grace period between reap sweeps
    pub settle_delay: Duration,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            activation_marker: PathBuf::from("/activate"),
            new_root: PathBuf::from("/cdrom"),
            switch_root_helper: PathBuf::from("/bin/systemctl"),
            installed_init: PathBuf::from("/sbin/tmpfs_switch_init"),
            new_root_min_links: 5,
            shell: PathBuf::from("/bin/bash"),
            controlling_tty: PathBuf::from("/dev/tty"),
            console_prefix: "/dev/tty".to_string(),
            primary_console: 1,
            debug_device: PathBuf::from("/dev/ttyS0"),
            proc_root: PathBuf::from("/proc"),
            settle_delay: Duration::from_secs(1),
        }
    }
}

impl InitConfig {
    /// Device node of a numbered virtual console
    pub fn console_path(&self, n: u32) -> PathBuf {
        PathBuf::from(format!("{}{}", self.console_prefix, n))
    }

    /// Device node of the primary virtual console
    pub fn primary_console_path(&self) -> PathBuf {
        self.console_path(self.primary_console)
    }

    /// argv[0] for the shell
    pub fn shell_name(&self) -> String {
        self.shell
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sh".to_string())
    }
}

/// Environment handed to every shell the init launches.
///
/// The inherited environment is discarded before any shell starts; this table
/// is the whole environment they see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellEnvironment {
    vars: [(&'static str, &'static str); 7],
}

impl Default for ShellEnvironment {
    fn default() -> Self {
        Self {
            vars: [
                ("HOME", "/root"),
                ("PAGER", "less"),
                ("TERM", "linux"),
                ("SHELL", "/bin/bash"),
                ("USER", "root"),
                // usr is merged and nothing lives in /usr/local here
                ("PATH", "/sbin:/bin"),
                ("PWD", "/"),
            ],
        }
    }
}

impl ShellEnvironment {
    /// Value of a variable in the table
    pub fn get(&self, key: &str) -> Option<&'static str> {
        self.vars.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// The home directory the shell will be told about
    pub fn home(&self) -> &'static str {
        self.get("HOME").unwrap_or("/")
    }

    /// Same table with HOME pointing at `/`, used when the home directory
    /// could not be created.
    pub fn with_root_home(mut self) -> Self {
        for (key, value) in self.vars.iter_mut() {
            if *key == "HOME" {
                *value = "/";
            }
        }
        self
    }

    /// `KEY=value` strings in table order
    pub fn entries(&self) -> impl Iterator<Item = String> + '_ {
        self.vars.iter().map(|(k, v)| format!("{}={}", k, v))
    }
}
