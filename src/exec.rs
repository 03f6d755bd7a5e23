//! Replacing the current process image

use nix::unistd::{execv, execve};
use std::convert::Infallible;
use std::ffi::CString;
use std::path::Path;

use crate::config::ShellEnvironment;
use crate::error::InitError;

/// A program, its argv and (optionally) a replacement environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: CString,
    pub argv: Vec<CString>,
    /// `None` keeps the current environment
    pub env: Option<Vec<CString>>,
}

fn cstring(s: &str) -> Result<CString, InitError> {
    CString::new(s).map_err(|_| InitError::NulByte(s.to_string()))
}

impl Invocation {
    pub fn new(program: &Path, argv: &[&str]) -> Result<Self, InitError> {
        Ok(Self {
            program: cstring(&program.to_string_lossy())?,
            argv: argv.iter().map(|a| cstring(a)).collect::<Result<_, _>>()?,
            env: None,
        })
    }

    /// Replace the environment with exactly `env`
    pub fn with_environment(mut self, env: &ShellEnvironment) -> Result<Self, InitError> {
        self.env = Some(env.entries().map(|e| cstring(&e)).collect::<Result<_, _>>()?);
        Ok(self)
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// argv as plain strings
    pub fn args(&self) -> Vec<String> {
        self.argv
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

/// Something that can replace the current process.
///
/// A successful exec never returns, so the only thing that comes back is the
/// reason it failed.
pub trait ProgramExec {
    fn exec(&mut self, invocation: &Invocation) -> InitError;
}

/// execve(2)
#[derive(Debug, Default)]
pub struct Execve;

impl ProgramExec for Execve {
    fn exec(&mut self, invocation: &Invocation) -> InitError {
        let result: nix::Result<Infallible> = match &invocation.env {
            Some(env) => execve(&invocation.program, &invocation.argv, env),
            None => execv(&invocation.program, &invocation.argv),
        };
        let Err(source) = result;
        InitError::Exec {
            program: invocation.program_name(),
            source,
        }
    }
}
