//! tmpfs_switch - PID 1 for a tmpfs recovery root
//!
//! A small init that:
//! - Mounts the virtual filesystems a rescue shell needs
//! - Clears out processes left over from the previous root
//! - Puts the console into a known, sane state
//! - Runs a supervised rescue shell, then an unsupervised one
//! - Switches to a persistent root on request (`activate`)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              tmpfs_switch_init                   │
//! ├────────────────────────┬────────────────────────┤
//! │ BootSequencer (pid 1)  │  ActivationHandshake   │
//! ├────────────────────────┴────────────────────────┤
//! │ ShellSupervisor │ Console │ Reaper │ Mounts      │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod activate;
pub mod config;
pub mod error;
pub mod exec;
pub mod mode;
pub mod pid1;

pub use activate::{ActivationError, ActivationHandshake, Refusal};
pub use config::{InitConfig, ShellEnvironment};
pub use error::{abort_on, InitError};
pub use mode::{Mode, UsageError};
