//! Shell supervision
//!
//! The init runs one supervised shell, waits for exactly that process, tidies
//! up after it and then becomes a shell itself. Orphans reparented to PID 1
//! exit through the same wait() and are simply collected on the way.

use nix::errno::Errno;
use nix::sys::wait::wait;
use nix::unistd::{fork, setsid, ForkResult, Pid};
use std::convert::Infallible;

use super::console::{self, Console};
use super::reaper::ProcessReaper;
use super::settle;
use crate::config::{InitConfig, ShellEnvironment};
use crate::error::{abort_on, InitError};
use crate::exec::{Execve, Invocation, ProgramExec};

/// Source of child exits
pub trait Waiter {
    /// Block until some child exits. `None` when the exit carried no pid.
    fn wait_any(&mut self) -> nix::Result<Option<Pid>>;
}

/// wait(2)
#[derive(Debug, Default)]
pub struct BlockingWait;

impl Waiter for BlockingWait {
    fn wait_any(&mut self) -> nix::Result<Option<Pid>> {
        wait().map(|status| status.pid())
    }
}

/// Wait until `tracked` exits. Returns how many other children were
/// collected meanwhile.
pub fn await_child<W: Waiter>(tracked: Pid, waiter: &mut W) -> Result<usize, InitError> {
    let mut orphans = 0;
    loop {
        match waiter.wait_any() {
            Ok(Some(pid)) if pid == tracked => return Ok(orphans),
            Ok(Some(pid)) if pid.as_raw() > 1 => {
                log::debug!("Collected orphan {}", pid);
                orphans += 1;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(InitError::Wait(e)),
        }
    }
}

/// Runs the interactive shell and the final one
pub struct ShellSupervisor<'a> {
    config: &'a InitConfig,
    env: ShellEnvironment,
}

impl<'a> ShellSupervisor<'a> {
    pub fn new(config: &'a InitConfig, env: ShellEnvironment) -> Self {
        Self { config, env }
    }

    /// The shell, with nothing but the fixed environment
    pub fn invocation(&self) -> Result<Invocation, InitError> {
        let name = self.config.shell_name();
        Invocation::new(&self.config.shell, &[name.as_str()])?.with_environment(&self.env)
    }

    /// Put the primary console on the standard streams and exec the shell.
    /// Only returns on failure.
    fn enter_shell<E: ProgramExec>(&self, exec: &mut E) -> Result<Infallible, InitError> {
        let invocation = self.invocation()?;
        console::acquire_session_console(&self.config.primary_console_path())?;
        Err(exec.exec(&invocation))
    }

    /// Fork the interactive shell as leader of its own session.
    pub fn spawn(&self) -> Result<Pid, InitError> {
        console::flush_input();

        // SAFETY: single threaded; the child only calls setsid, open, dup2 and exec
        match unsafe { fork() }.map_err(InitError::Fork)? {
            ForkResult::Parent { child } => {
                log::info!("Shell started as {}", child);
                Ok(child)
            }
            ForkResult::Child => {
                let result = setsid()
                    .map_err(InitError::Setsid)
                    .and_then(|_| self.enter_shell(&mut Execve));
                match result {
                    Err(e) => abort_on(&e),
                    Ok(never) => match never {},
                }
            }
        }
    }

    /// Run the interactive session, clean up after it and exec the final shell.
    pub fn run(&self, console: &mut Console) -> Result<Infallible, InitError> {
        println!("work shell");
        let shell = self.spawn()?;
        let orphans = await_child(shell, &mut BlockingWait)?;
        log::info!("Shell {} exited ({} orphans collected)", shell, orphans);

        console.activate_late()?;
        println!("work done");
        settle::report(settle::settle(self.config.settle_delay));
        ProcessReaper::with_kill(&self.config.proc_root, self.config.settle_delay).reap()?;
        console.teardown()?;

        println!("exec shell");
        console::flush_input();
        self.enter_shell(&mut Execve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted {
        exits: VecDeque<nix::Result<Option<Pid>>>,
        calls: usize,
    }

    impl Scripted {
        fn new(exits: Vec<nix::Result<Option<Pid>>>) -> Self {
            Self {
                exits: exits.into(),
                calls: 0,
            }
        }
    }

    impl Waiter for Scripted {
        fn wait_any(&mut self) -> nix::Result<Option<Pid>> {
            self.calls += 1;
            self.exits.pop_front().expect("waited past the script")
        }
    }

    fn pid(raw: i32) -> nix::Result<Option<Pid>> {
        Ok(Some(Pid::from_raw(raw)))
    }

    #[test]
    fn test_tracked_child_first() {
        let mut waiter = Scripted::new(vec![pid(42), pid(77)]);
        assert_eq!(await_child(Pid::from_raw(42), &mut waiter).unwrap(), 0);
        assert_eq!(waiter.calls, 1);
    }

    #[test]
    fn test_orphans_before_tracked_child() {
        let mut waiter = Scripted::new(vec![pid(100), pid(101), pid(42), pid(102)]);
        assert_eq!(await_child(Pid::from_raw(42), &mut waiter).unwrap(), 2);
        assert_eq!(waiter.calls, 3);
        assert_eq!(waiter.exits.len(), 1);
    }

    #[test]
    fn test_interruptions_and_impossible_pids_are_skipped() {
        let mut waiter = Scripted::new(vec![
            Err(Errno::EINTR),
            pid(0),
            pid(1),
            Ok(None),
            pid(55),
            Err(Errno::EINTR),
            pid(42),
        ]);
        assert_eq!(await_child(Pid::from_raw(42), &mut waiter).unwrap(), 1);
        assert_eq!(waiter.calls, 7);
    }

    #[test]
    fn test_wait_failure_is_fatal() {
        let mut waiter = Scripted::new(vec![pid(100), Err(Errno::ECHILD)]);
        let err = await_child(Pid::from_raw(42), &mut waiter).unwrap_err();
        assert!(matches!(err, InitError::Wait(Errno::ECHILD)));
    }

    #[test]
    fn test_shell_invocation() {
        let config = InitConfig::default();
        let supervisor = ShellSupervisor::new(&config, ShellEnvironment::default());
        let inv = supervisor.invocation().unwrap();
        assert_eq!(inv.program_name(), "/bin/bash");
        assert_eq!(inv.args(), vec!["bash"]);
        let env: Vec<String> = inv
            .env
            .unwrap()
            .iter()
            .map(|e| e.to_string_lossy().into_owned())
            .collect();
        assert_eq!(env, ShellEnvironment::default().entries().collect::<Vec<_>>());
    }

    #[test]
    fn test_shell_invocation_uses_given_environment() {
        let config = InitConfig::default();
        let env = ShellEnvironment::default().with_root_home();
        let supervisor = ShellSupervisor::new(&config, env);
        let env = supervisor.invocation().unwrap().env.unwrap();
        assert_eq!(env[0].to_str().unwrap(), "HOME=/");
    }
}
