//! PID 1 functionality
//!
//! Handles responsibilities specific to running as init (PID 1):
//! - Mounting the virtual filesystems
//! - Killing whatever is left over, twice
//! - Console ownership and terminal state
//! - Supervising the rescue shell

mod boot;
mod console;
mod mount;
mod reaper;
mod settle;
mod shell;
mod signals;

pub use boot::{ensure_home, BootSequencer};
pub use console::{
    flush_input, take_over_standard_streams, Console, ConsoleEvent, ConsoleSession,
    TerminalProfile, CLEAN_CONSOLE,
};
pub use mount::{
    detach, force_mount, mount_auxiliary_filesystems, MountSpec, AUXILIARY_MOUNTS, DEVICE_MOUNT,
    PROC_MOUNT,
};
pub use reaper::{
    classify_cmdline, eligible_pid, parse_pid, Ambiguity, KillSignaller, ProcDir, ProcessReaper,
    ProcessRecord, Signaller, SweepSignal, SweepStats, Verdict,
};
pub use settle::{settle, SleepError};
pub use shell::{await_child, BlockingWait, ShellSupervisor, Waiter};
pub use signals::{harden, ChildDisposition};
