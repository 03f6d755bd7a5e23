//! Deciding what this invocation is for
//!
//! The same binary is the ramdisk's PID 1 and, through a link named
//! `activate`, the manual switch-root trigger. The choice is made once, up
//! front, from the process id and the name we were started under.

use std::ffi::OsString;
use std::path::Path;

use crate::config::ACTIVATE_NAME;

/// Why an invocation was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("Expected process name")]
    NoProcessName,
    #[error("tmpfs_switch_init must be root")]
    NotRoot,
    #[error("Must run as pid 1")]
    NotPid1,
    #[error("Too many arguments")]
    TooManyArguments,
}

impl UsageError {
    pub fn exit_code(self) -> i32 {
        1
    }
}

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Boot the ramdisk; carries argv for the diagnostic dump
    Pid1 { args: Vec<String> },
    /// Validate the new root and switch to it
    Activate,
    /// Print the error and exit
    Usage(UsageError),
}

impl Mode {
    /// Pick the mode for a process with this pid, uid and argv.
    pub fn detect(pid: u32, uid: u32, argv: &[OsString]) -> Mode {
        let Some(arg0) = argv.first() else {
            return Mode::Usage(UsageError::NoProcessName);
        };
        if uid != 0 {
            return Mode::Usage(UsageError::NotRoot);
        }
        if pid == 1 {
            return Mode::Pid1 {
                args: argv
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect(),
            };
        }

        let name = Path::new(arg0).file_name().unwrap_or(arg0.as_os_str());
        if name != ACTIVATE_NAME {
            return Mode::Usage(UsageError::NotPid1);
        }
        if argv.len() != 1 {
            return Mode::Usage(UsageError::TooManyArguments);
        }
        Mode::Activate
    }
}
