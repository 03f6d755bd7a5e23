//! Boot sequence for PID 1
//!
//! Runs once, in order, with no retries:
//! 1. Drop the stale activation marker, sync, settle
//! 2. Mount /dev, take the console, dump our arguments
//! 3. Fix signal dispositions, mount /proc, kill whatever we inherited
//! 4. Reset the environment, mount the auxiliary filesystems, sync
//! 5. Switch SIGCHLD to plain default, settle, move to the primary console
//! 6. Hand over to the shell supervisor

use nix::errno::Errno;
use nix::unistd::{chdir, sync};
use std::convert::Infallible;
use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use super::console::Console;
use super::mount;
use super::reaper::ProcessReaper;
use super::settle;
use super::shell::ShellSupervisor;
use super::signals::{self, ChildDisposition};
use crate::config::{InitConfig, ShellEnvironment};
use crate::error::InitError;

/// Create the home directory at `home`; fall back to `/` as HOME if that fails.
pub fn ensure_home(env: ShellEnvironment, home: &Path) -> ShellEnvironment {
    match DirBuilder::new().mode(0o700).create(home) {
        Ok(()) => env,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => env,
        Err(e) => {
            println!("mkdir root failed");
            log::warn!("Cannot create {}: {}", home.display(), e);
            env.with_root_home()
        }
    }
}

/// Forget everything inherited from the kernel and start from `/`.
fn reset_process_environment() -> Result<(), InitError> {
    // SAFETY: single threaded; nothing holds pointers into environ
    Errno::result(unsafe { libc::clearenv() }).map_err(InitError::Environment)?;
    chdir("/").map_err(|e| InitError::Chdir {
        path: "/".into(),
        source: e,
    })
}

fn remove_marker(marker: &Path) {
    if let Err(e) = fs::remove_file(marker) {
        log::debug!("No stale marker {}: {}", marker.display(), e);
    }
}

/// Everything PID 1 does, from the first instruction to the final shell
pub struct BootSequencer {
    config: InitConfig,
    args: Vec<String>,
}

impl BootSequencer {
    pub fn new(config: InitConfig, args: Vec<String>) -> Self {
        Self { config, args }
    }

    fn dump_arguments(&self) {
        println!("tmpfs_switch_init with argc {}", self.args.len());
        for arg in &self.args {
            println!("{}", arg);
        }
    }

    /// Boot and run the shells. Only returns on failure.
    pub fn run(self) -> Result<Infallible, InitError> {
        let config = &self.config;
        log::info!("Running as PID 1");

        remove_marker(&config.activation_marker);
        sync();
        let first_settle = settle::settle(config.settle_delay);

        mount::DEVICE_MOUNT.mount()?;
        let mut console = Console::new(config);
        console.activate_early()?;
        self.dump_arguments();
        settle::report(first_settle);

        ChildDisposition::NoStop.install()?;
        signals::harden()?;

        mount::PROC_MOUNT.mount()?;
        ProcessReaper::with_kill(&config.proc_root, config.settle_delay).reap()?;

        let env = ShellEnvironment::default();
        let home = env.home();
        let env = ensure_home(env, Path::new(home));
        reset_process_environment()?;
        mount::mount_auxiliary_filesystems()?;
        sync();

        ChildDisposition::Default.install()?;
        settle::report(settle::settle(config.settle_delay));

        console.release()?;
        console.activate_late()?;

        ShellSupervisor::new(config, env).run(&mut console)
    }
}
