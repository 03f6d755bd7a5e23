//! Signal disposition for PID 1
//!
//! PID 1 only receives signals it has explicitly set up, so the defaults that
//! matter are chosen here per boot phase:
//! - SIGCHLD: no stop notifications until the environment is set up, plain
//!   default once the shell supervisor starts collecting children with wait()
//! - SIGHUP: ignored, the console gets hung up on purpose
//! - ctrl-alt-del: delivered as SIGINT instead of rebooting on the spot

use nix::sys::reboot::set_cad_enabled;
use nix::sys::signal::{sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::InitError;

/// How child exits are delivered in the current phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildDisposition {
    /// Default action, but no SIGCHLD for stopped children
    NoStop,
    /// Plain default; exits are collected with wait()
    Default,
}

impl ChildDisposition {
    fn action(self) -> SigAction {
        let flags = match self {
            ChildDisposition::NoStop => SaFlags::SA_NOCLDSTOP,
            ChildDisposition::Default => SaFlags::empty(),
        };
        SigAction::new(SigHandler::SigDfl, flags, SigSet::empty())
    }

    /// Install this disposition for SIGCHLD.
    pub fn install(self) -> Result<(), InitError> {
        // SAFETY: SIG_DFL installs no handler code
        unsafe { sigaction(Signal::SIGCHLD, &self.action()) }
            .map(drop)
            .map_err(|e| InitError::Signal {
                signal: Signal::SIGCHLD,
                source: e,
            })?;
        log::debug!("SIGCHLD disposition: {:?}", self);
        Ok(())
    }
}

/// Keep ctrl-alt-del from rebooting and survive console hangups.
pub fn harden() -> Result<(), InitError> {
    set_cad_enabled(false).map_err(InitError::CtrlAltDel)?;

    // SAFETY: SIG_IGN installs no handler code
    unsafe { signal(Signal::SIGHUP, SigHandler::SigIgn) }.map_err(|e| InitError::Signal {
        signal: Signal::SIGHUP,
        source: e,
    })?;
    Ok(())
}
