//! Process reaping sweep for PID 1 ("killall5")
//!
//! Whatever survived from the environment before this init, or whatever the
//! shell left behind, is found by walking /proc and signalled directly.
//! Processes come and go while the walk runs; every "it vanished" case is
//! expected and only logged. Failing to walk /proc at all is fatal.
//!
//! The walk uses fixed buffers: this runs early, single threaded, and should
//! not lean on the allocator.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{lseek, Pid, Whence};
use std::ffi::CStr;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::settle;
use crate::error::{errno_of, InitError};

/// Size of the directory-entry buffer
pub const DIRENT_BUFFER: usize = 16384;

/// Size of the command-line probe
pub const CMDLINE_PROBE: usize = 256;

// struct linux_dirent64 layout: d_ino (8), d_off (8), d_reclen (2), d_type (1), d_name
const DIRENT_RECLEN: usize = 16;
const DIRENT_TYPE: usize = 18;
const DIRENT_NAME: usize = 19;

/// Which sweep is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepSignal {
    /// First sweep, polite
    Term,
    /// Second sweep, after the grace delay
    Kill,
}

impl SweepSignal {
    pub fn signal(self) -> Signal {
        match self {
            SweepSignal::Term => Signal::SIGTERM,
            SweepSignal::Kill => Signal::SIGKILL,
        }
    }

    fn label(self) -> &'static str {
        match self {
            SweepSignal::Term => "remaining",
            SweepSignal::Kill => "stubborn",
        }
    }
}

/// Delivers sweep signals
pub trait Signaller {
    fn deliver(&mut self, pid: Pid, signal: SweepSignal) -> nix::Result<()>;
}

/// Real signal delivery with kill(2)
#[derive(Debug, Default)]
pub struct KillSignaller;

impl Signaller for KillSignaller {
    fn deliver(&mut self, pid: Pid, signal: SweepSignal) -> nix::Result<()> {
        kill(pid, signal.signal())
    }
}

/// Why a command line could not be trusted this sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ambiguity {
    /// Zero bytes
    Missing,
    /// A lone NUL
    Empty,
    /// A lone non-NUL byte
    CorruptEmpty,
    /// Filled the probe without a NUL anywhere
    Oversized,
    /// Short read not ending in NUL
    Corrupt,
    /// read(2) failed
    Unreadable,
}

impl fmt::Display for Ambiguity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Ambiguity::Missing => "missing",
            Ambiguity::Empty => "empty",
            Ambiguity::CorruptEmpty => "corrupt empty",
            Ambiguity::Oversized => "oversized",
            Ambiguity::Corrupt => "corrupt",
            Ambiguity::Unreadable => "unreadable",
        };
        f.write_str(s)
    }
}

/// What a sweep decided about one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Gone before it could be looked at
    Vanished,
    /// No address space; never signalled
    KernelThread,
    /// Left for the next sweep
    Ambiguous(Ambiguity),
    /// Clean read; gets the sweep's signal
    Signal,
}

/// Bounded copy of /proc/<pid>/cmdline
#[derive(Clone, Copy)]
pub struct CmdlineProbe {
    buf: [u8; CMDLINE_PROBE],
    len: usize,
}

impl CmdlineProbe {
    /// Program name: everything before the first NUL
    pub fn name(&self) -> &[u8] {
        let data = &self.buf[..self.len];
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        &data[..end]
    }
}

impl fmt::Debug for CmdlineProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.name()))
    }
}

/// One process as seen by one sweep
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: Pid,
    pub has_address_space: bool,
    pub cmdline: Option<CmdlineProbe>,
    pub verdict: Verdict,
}

impl ProcessRecord {
    fn new(pid: Pid, verdict: Verdict) -> Self {
        Self {
            pid,
            has_address_space: false,
            cmdline: None,
            verdict,
        }
    }
}

/// Counts from one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub candidates: usize,
    pub signalled: usize,
    pub kernel_threads: usize,
    pub ambiguous: usize,
    pub vanished: usize,
}

/// Parse a /proc entry name as a pid. Only plain decimal digits count.
pub fn parse_pid(name: &[u8]) -> Option<i32> {
    if name.is_empty() {
        return None;
    }
    name.iter().try_fold(0i32, |pid, &c| {
        if !c.is_ascii_digit() {
            return None;
        }
        pid.checked_mul(10)?.checked_add(i32::from(c - b'0'))
    })
}

/// Pids a sweep may touch: numeric and above 1
pub fn eligible_pid(name: &[u8]) -> Option<Pid> {
    parse_pid(name).filter(|&pid| pid > 1).map(Pid::from_raw)
}

/// Judge a command-line read of `len` bytes into `probe`.
pub fn classify_cmdline(probe: &[u8], read: Result<usize, Errno>) -> Result<(), Ambiguity> {
    let len = match read {
        Err(_) => return Err(Ambiguity::Unreadable),
        Ok(len) => len.min(probe.len()),
    };
    let data = &probe[..len];
    match len {
        0 => Err(Ambiguity::Missing),
        1 if data[0] == 0 => Err(Ambiguity::Empty),
        1 => Err(Ambiguity::CorruptEmpty),
        _ if len == probe.len() => {
            if data.contains(&0) {
                Ok(())
            } else {
                Err(Ambiguity::Oversized)
            }
        }
        _ if data[len - 1] != 0 => Err(Ambiguity::Corrupt),
        _ => Ok(()),
    }
}

fn open_at(dir: BorrowedFd<'_>, name: &CStr, flags: libc::c_int) -> nix::Result<OwnedFd> {
    // SAFETY: name is NUL terminated and dir outlives the call
    let fd = Errno::result(unsafe { libc::openat(dir.as_raw_fd(), name.as_ptr(), flags) })?;
    // SAFETY: openat just returned this descriptor and nothing else owns it
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn read_into(fd: OwnedFd, buf: &mut [u8]) -> Result<usize, Errno> {
    let mut file = File::from(fd);
    file.read(buf).map_err(|e| errno_of(&e))
}

/// Look at one /proc entry.
pub fn inspect(procfs: BorrowedFd<'_>, name: &CStr, pid: Pid) -> ProcessRecord {
    let proc = match open_at(procfs, name, libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC) {
        Ok(fd) => fd,
        Err(e) => {
            log::debug!("disappeared pid {}: {}", pid, e);
            return ProcessRecord::new(pid, Verdict::Vanished);
        }
    };

    let has_address_space = match open_at(proc.as_fd(), c"maps", libc::O_RDONLY | libc::O_CLOEXEC) {
        Ok(maps) => {
            let mut ignore = [0u8; 1];
            match read_into(maps, &mut ignore) {
                Ok(len) => len > 0,
                Err(e) => {
                    log::debug!("unreadable maps {}: {}", pid, e);
                    false
                }
            }
        }
        Err(e) => {
            log::debug!("disappeared maps {}: {}", pid, e);
            false
        }
    };
    if !has_address_space {
        return ProcessRecord::new(pid, Verdict::KernelThread);
    }

    let cmdline = match open_at(proc.as_fd(), c"cmdline", libc::O_RDONLY | libc::O_CLOEXEC) {
        Ok(fd) => fd,
        Err(e) => {
            log::debug!("disappeared cmdline {}: {}", pid, e);
            return ProcessRecord {
                has_address_space,
                ..ProcessRecord::new(pid, Verdict::Vanished)
            };
        }
    };

    let mut probe = CmdlineProbe {
        buf: [0u8; CMDLINE_PROBE],
        len: 0,
    };
    let read = read_into(cmdline, &mut probe.buf);
    probe.len = read.unwrap_or(0).min(CMDLINE_PROBE);

    let verdict = match classify_cmdline(&probe.buf, read) {
        Ok(()) => Verdict::Signal,
        Err(ambiguity) => Verdict::Ambiguous(ambiguity),
    };

    ProcessRecord {
        pid,
        has_address_space,
        cmdline: Some(probe),
        verdict,
    }
}

/// Open handle on the process directory
pub struct ProcDir {
    fd: OwnedFd,
    path: PathBuf,
}

impl ProcDir {
    pub fn open(path: &Path) -> Result<Self, InitError> {
        let file = File::open(path).map_err(|e| InitError::Open {
            path: path.to_path_buf(),
            source: errno_of(&e),
        })?;
        Ok(Self {
            fd: OwnedFd::from(file),
            path: path.to_path_buf(),
        })
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Start the next enumeration from the first entry again
    pub fn rewind(&self) -> Result<(), InitError> {
        lseek(self.fd.as_raw_fd(), 0, Whence::SeekSet)
            .map(drop)
            .map_err(|e| self.enumerate_error(e))
    }

    fn enumerate_error(&self, source: Errno) -> InitError {
        InitError::Enumerate {
            path: self.path.clone(),
            source,
        }
    }

    /// Call `f` with every directory (or untyped) entry name.
    pub fn for_each_entry(&self, mut f: impl FnMut(&CStr)) -> Result<(), InitError> {
        let mut buf = [0u8; DIRENT_BUFFER];
        loop {
            // SAFETY: buf is writable for its whole length
            let read = unsafe {
                libc::syscall(
                    libc::SYS_getdents64,
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr(),
                    buf.len(),
                )
            };
            let end = Errno::result(read).map_err(|e| self.enumerate_error(e))? as usize;
            if end == 0 {
                return Ok(());
            }

            let mut offset = 0;
            while offset < end {
                if offset + DIRENT_NAME > end {
                    return Err(self.enumerate_error(Errno::EINVAL));
                }
                let reclen_bytes = [buf[offset + DIRENT_RECLEN], buf[offset + DIRENT_RECLEN + 1]];
                let reclen = u16::from_ne_bytes(reclen_bytes) as usize;
                if reclen <= DIRENT_NAME || offset + reclen > end {
                    return Err(self.enumerate_error(Errno::EINVAL));
                }
                let d_type = buf[offset + DIRENT_TYPE];
                let name = CStr::from_bytes_until_nul(&buf[offset + DIRENT_NAME..offset + reclen])
                    .map_err(|_| self.enumerate_error(Errno::EINVAL))?;
                if d_type == libc::DT_DIR || d_type == libc::DT_UNKNOWN {
                    f(name);
                }
                offset += reclen;
            }
        }
    }
}

/// Two-sweep terminator for everything except PID 1 and kernel threads
pub struct ProcessReaper<S: Signaller> {
    proc_root: PathBuf,
    grace: Duration,
    signaller: S,
}

impl ProcessReaper<KillSignaller> {
    pub fn with_kill(proc_root: &Path, grace: Duration) -> Self {
        Self::new(proc_root, grace, KillSignaller)
    }
}

impl<S: Signaller> ProcessReaper<S> {
    pub fn new(proc_root: &Path, grace: Duration, signaller: S) -> Self {
        Self {
            proc_root: proc_root.to_path_buf(),
            grace,
            signaller,
        }
    }

    pub fn signaller(&self) -> &S {
        &self.signaller
    }

    /// TERM sweep, grace delay, KILL sweep.
    pub fn reap(&mut self) -> Result<(), InitError> {
        let dir = ProcDir::open(&self.proc_root)?;

        println!("sigterm");
        let term = self.sweep(&dir, SweepSignal::Term)?;
        log::debug!("TERM sweep: {:?}", term);

        settle::report(settle::settle(self.grace));

        println!("sigkill");
        dir.rewind()?;
        let kill = self.sweep(&dir, SweepSignal::Kill)?;
        log::debug!("KILL sweep: {:?}", kill);

        println!("done killall5");
        Ok(())
    }

    /// One pass over `dir`, signalling every clean read.
    pub fn sweep(&mut self, dir: &ProcDir, signal: SweepSignal) -> Result<SweepStats, InitError> {
        let mut stats = SweepStats::default();
        let signaller = &mut self.signaller;

        dir.for_each_entry(|name| {
            let Some(pid) = eligible_pid(name.to_bytes()) else {
                return;
            };
            stats.candidates += 1;

            let record = inspect(dir.as_fd(), name, pid);
            match record.verdict {
                Verdict::Vanished => stats.vanished += 1,
                Verdict::KernelThread => stats.kernel_threads += 1,
                Verdict::Ambiguous(ambiguity) => {
                    stats.ambiguous += 1;
                    if ambiguity == Ambiguity::Unreadable {
                        log::debug!("unreadable cmdline {}", pid);
                    } else {
                        println!("{} cmdline {}", ambiguity, pid);
                    }
                }
                Verdict::Signal => {
                    let process_name = record
                        .cmdline
                        .as_ref()
                        .map(|c| String::from_utf8_lossy(c.name()).into_owned())
                        .unwrap_or_default();
                    println!("{} {} {}", signal.label(), pid, process_name);
                    match signaller.deliver(pid, signal) {
                        Ok(()) => stats.signalled += 1,
                        Err(Errno::ESRCH) => {
                            log::debug!("{} exited before {:?}", pid, signal.signal())
                        }
                        Err(e) => log::warn!("Failed to signal {}: {}", pid, e),
                    }
                }
            }
        })?;

        Ok(stats)
    }
}
