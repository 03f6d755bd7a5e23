//! Switch-root activation
//!
//! Run by hand (through the `activate` link) once the persistent root is
//! mounted at the new-root path. The candidate has to look like a real,
//! separately mounted root before the switch-root helper is started; the
//! helper then re-executes this binary from the new root as PID 1.

use std::convert::Infallible;
use std::fmt;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::config::InitConfig;
use crate::error::InitError;
use crate::exec::{Invocation, ProgramExec};

/// Why the candidate was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    Missing,
    NotDirectory,
    LacksFiles,
    NotMountpoint,
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Refusal::Missing => "New root missing",
            Refusal::NotDirectory => "New root is not a directory",
            Refusal::LacksFiles => "New root lacks files",
            Refusal::NotMountpoint => "New root is not a mountpoint",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    /// Reported to the user; nothing happened
    #[error("{0}")]
    Refused(Refusal),

    #[error(transparent)]
    Fatal(#[from] InitError),
}

impl From<Refusal> for ActivationError {
    fn from(refusal: Refusal) -> Self {
        ActivationError::Refused(refusal)
    }
}

/// A validated switch-root candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationTarget {
    pub path: PathBuf,
    pub dev: u64,
    pub nlink: u64,
}

pub struct ActivationHandshake<'a> {
    config: &'a InitConfig,
    current_root: PathBuf,
}

impl<'a> ActivationHandshake<'a> {
    pub fn new(config: &'a InitConfig) -> Self {
        Self {
            config,
            current_root: PathBuf::from("/"),
        }
    }

    /// Compare against a different directory than `/`
    pub fn with_current_root(mut self, root: &Path) -> Self {
        self.current_root = root.to_path_buf();
        self
    }

    /// Check that the candidate is a populated directory on its own mount.
    pub fn validate(&self) -> Result<ActivationTarget, ActivationError> {
        let root = fs::symlink_metadata(&self.current_root).map_err(InitError::StatRoot)?;

        let path = &self.config.new_root;
        let target = fs::symlink_metadata(path).map_err(|e| {
            log::debug!("Cannot stat {}: {}", path.display(), e);
            Refusal::Missing
        })?;

        if !target.is_dir() {
            return Err(Refusal::NotDirectory.into());
        }
        if target.nlink() < self.config.new_root_min_links {
            return Err(Refusal::LacksFiles.into());
        }
        if target.dev() == root.dev() {
            return Err(Refusal::NotMountpoint.into());
        }

        Ok(ActivationTarget {
            path: path.clone(),
            dev: target.dev(),
            nlink: target.nlink(),
        })
    }

    /// `systemctl switch-root <new root> <installed init>`
    pub fn helper_invocation(&self, target: &ActivationTarget) -> Result<Invocation, InitError> {
        let helper_name = self
            .config
            .switch_root_helper
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let new_root = target.path.to_string_lossy();
        let init = self.config.installed_init.to_string_lossy();
        Invocation::new(
            &self.config.switch_root_helper,
            &[helper_name.as_str(), "switch-root", &*new_root, &*init],
        )
    }

    /// Validate and exec the helper. Only returns on failure.
    pub fn run<E: ProgramExec>(&self, exec: &mut E) -> Result<Infallible, ActivationError> {
        let target = self.validate()?;
        log::info!(
            "Switching root to {} (dev {:#x}, {} links)",
            target.path.display(),
            target.dev,
            target.nlink
        );
        let invocation = self.helper_invocation(&target)?;
        Err(exec.exec(&invocation).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[derive(Default)]
    struct RecordingExec {
        calls: Vec<Invocation>,
    }

    impl ProgramExec for RecordingExec {
        fn exec(&mut self, invocation: &Invocation) -> InitError {
            self.calls.push(invocation.clone());
            InitError::Exec {
                program: invocation.program_name(),
                source: Errno::ENOEXEC,
            }
        }
    }

    fn config_for(new_root: &Path) -> InitConfig {
        InitConfig {
            new_root: new_root.to_path_buf(),
            ..InitConfig::default()
        }
    }

    fn populated(dir: &Path) {
        for sub in ["bin", "etc", "usr"] {
            fs::create_dir(dir.join(sub)).unwrap();
        }
    }

    fn refusal(result: Result<Infallible, ActivationError>) -> Refusal {
        match result {
            Err(ActivationError::Refused(r)) => r,
            Err(other) => panic!("unexpected error {}", other),
            Ok(never) => match never {},
        }
    }

    #[test]
    fn test_missing_new_root() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(&tmp.path().join("cdrom"));
        let mut exec = RecordingExec::default();

        let result = ActivationHandshake::new(&config).run(&mut exec);
        let r = refusal(result);
        assert_eq!(r, Refusal::Missing);
        assert_eq!(r.to_string(), "New root missing");
        assert!(exec.calls.is_empty());
    }

    #[test]
    fn test_new_root_not_a_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("cdrom");
        fs::write(&file, b"").unwrap();
        let config = config_for(&file);
        let mut exec = RecordingExec::default();

        let result = ActivationHandshake::new(&config).run(&mut exec);
        assert_eq!(refusal(result), Refusal::NotDirectory);
        assert!(exec.calls.is_empty());
    }

    #[test]
    fn test_new_root_lacks_files() {
        let tmp = tempfile::tempdir().unwrap();
        let empty = tmp.path().join("cdrom");
        fs::create_dir(&empty).unwrap();
        let config = config_for(&empty);
        let mut exec = RecordingExec::default();

        let result = ActivationHandshake::new(&config)
            .with_current_root(Path::new("/proc"))
            .run(&mut exec);
        assert_eq!(refusal(result), Refusal::LacksFiles);
        assert!(exec.calls.is_empty());
    }

    #[test]
    fn test_new_root_on_same_device() {
        let tmp = tempfile::tempdir().unwrap();
        let candidate = tmp.path().join("cdrom");
        fs::create_dir(&candidate).unwrap();
        populated(&candidate);
        let config = config_for(&candidate);
        let mut exec = RecordingExec::default();

        let result = ActivationHandshake::new(&config)
            .with_current_root(tmp.path())
            .run(&mut exec);
        let r = refusal(result);
        assert_eq!(r, Refusal::NotMountpoint);
        assert!(r.to_string().contains("not a mountpoint"));
        assert!(exec.calls.is_empty());
    }

    #[test]
    fn test_valid_new_root_execs_helper() {
        let tmp = tempfile::tempdir().unwrap();
        let candidate = tmp.path().join("cdrom");
        fs::create_dir(&candidate).unwrap();
        populated(&candidate);
        let config = config_for(&candidate);
        let mut exec = RecordingExec::default();

        // procfs is always a different device than a temporary directory
        let result = ActivationHandshake::new(&config)
            .with_current_root(Path::new("/proc"))
            .run(&mut exec);

        assert!(matches!(
            result,
            Err(ActivationError::Fatal(InitError::Exec { .. }))
        ));
        assert_eq!(exec.calls.len(), 1);
        let call = &exec.calls[0];
        assert_eq!(call.program_name(), "/bin/systemctl");
        assert_eq!(
            call.args(),
            vec![
                "systemctl".to_string(),
                "switch-root".to_string(),
                candidate.to_string_lossy().into_owned(),
                "/sbin/tmpfs_switch_init".to_string(),
            ]
        );
        assert!(call.env.is_none());
    }

    #[test]
    fn test_unstatable_root_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(tmp.path());
        let result = ActivationHandshake::new(&config)
            .with_current_root(&tmp.path().join("gone"))
            .validate();
        assert!(matches!(
            result,
            Err(ActivationError::Fatal(InitError::StatRoot(_)))
        ));
    }
}
