//! Failure channels
//!
//! Every step of the init either succeeds, logs and carries on, or fails in a
//! way nothing above PID 1 could repair. The last kind is [`InitError`]: the
//! binary's single top-level handler reports it and aborts the process.
//! Recoverable failures never leave a component as `Err`; they are logged
//! where they happen.

use std::path::PathBuf;

/// A failure the program cannot continue past.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("invalid mount table entry {target} ({fstype})")]
    MountSpec { target: String, fstype: String },

    #[error("failed to mount {fstype} on {target}: {source}")]
    Mount {
        target: String,
        fstype: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to enumerate {path}: {source}")]
    Enumerate {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to take over standard streams: {0}")]
    StandardStreams(#[source] nix::Error),

    #[error("failed to hang up {path}: {source}")]
    Hangup {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to detach controlling terminal: {0}")]
    Release(#[source] nix::Error),

    #[error("failed to read terminal attributes: {0}")]
    TermiosRead(#[source] nix::Error),

    #[error("failed to write terminal attributes: {0}")]
    TermiosWrite(#[source] nix::Error),

    #[error("failed to deallocate {path}: {source}")]
    Deallocate {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("console cannot {event} while {state:?}")]
    ConsoleState {
        state: crate::pid1::ConsoleSession,
        event: &'static str,
    },

    #[error("failed to set up signal disposition for {signal}: {source}")]
    Signal {
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::Error,
    },

    #[error("failed to disable ctrl-alt-del reboot: {0}")]
    CtrlAltDel(#[source] nix::Error),

    #[error("failed to reset environment: {0}")]
    Environment(#[source] nix::Error),

    #[error("failed to change directory to {path}: {source}")]
    Chdir {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to start a new session: {0}")]
    Setsid(#[source] nix::Error),

    #[error("wait failed: {0}")]
    Wait(#[source] nix::Error),

    #[error("failed to exec {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: nix::Error,
    },

    #[error("argument contains an interior NUL: {0:?}")]
    NulByte(String),

    #[error("failed to stat /: {0}")]
    StatRoot(#[source] std::io::Error),
}

/// The errno behind an I/O error, for reporting alongside syscall failures.
pub(crate) fn errno_of(e: &std::io::Error) -> nix::errno::Errno {
    nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))
}

/// The one place a fatal error ends the process.
///
/// Nothing supervises PID 1, so the best remaining outcome is a loud,
/// immediate stop that the kernel reports.
pub fn abort_on(err: &InitError) -> ! {
    log::error!("fatal: {}", err);
    println!("fatal: {}", err);
    std::process::abort()
}
