//! tmpfs_switch_init - PID 1 of the recovery ramdisk
//!
//! As PID 1:
//! - Mounts /dev, /proc and the auxiliary filesystems
//! - Kills everything inherited from the previous root
//! - Runs a rescue shell on tty1, then execs a last shell in its place
//!
//! As `activate` (a link to this binary):
//! - Checks that /cdrom holds a separately mounted root
//! - Runs `systemctl switch-root /cdrom /sbin/tmpfs_switch_init`

use nix::unistd::getuid;
use std::process::ExitCode;

use tmpfs_switch::exec::Execve;
use tmpfs_switch::pid1::BootSequencer;
use tmpfs_switch::{abort_on, ActivationError, ActivationHandshake, InitConfig, Mode};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let argv: Vec<_> = std::env::args_os().collect();
    let config = InitConfig::default();

    match Mode::detect(std::process::id(), getuid().as_raw(), &argv) {
        Mode::Pid1 { args } => {
            let Err(e) = BootSequencer::new(config, args).run();
            abort_on(&e)
        }
        Mode::Activate => {
            let Err(e) = ActivationHandshake::new(&config).run(&mut Execve);
            match e {
                ActivationError::Refused(refusal) => {
                    println!("{}", refusal);
                    ExitCode::FAILURE
                }
                ActivationError::Fatal(e) => abort_on(&e),
            }
        }
        Mode::Usage(usage) => {
            println!("{}", usage);
            ExitCode::from(usage.exit_code() as u8)
        }
    }
}
