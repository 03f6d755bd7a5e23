//! Console ownership for PID 1
//!
//! The init owns at most one terminal at a time and always reaches it through
//! the standard streams. Taking a terminal means dup'ing it onto 0/1/2 and
//! closing every other descriptor, so nothing leaks into the shells.
//!
//! After every takeover the terminal is put into a known state. Most of that
//! is cosmetic and unchecked (a console that is not a virtual terminal rejects
//! half of the keyboard ioctls). Only the termios read-modify-write is checked:
//! if it fails, the shell would run on a terminal in an unknown mode.

use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::config::{InitConfig, MAX_CONSOLES};
use crate::error::{errno_of, InitError};

/// Request numbers from asm-generic/ioctls.h, linux/kd.h and linux/vt.h
mod request {
    pub const TIOCNXCL: u32 = 0x540D;
    pub const TIOCLINUX: u32 = 0x541C;
    pub const TIOCNOTTY: u32 = 0x5422;
    pub const TIOCSETD: u32 = 0x5423;
    pub const TIOCCBRK: u32 = 0x5428;
    pub const TIOCVHANGUP: u32 = 0x5437;
    pub const TIOCSLCKTRMIOS: u32 = 0x5457;

    pub const KIOCSOUND: u32 = 0x4B2F;
    pub const KDMKTONE: u32 = 0x4B30;
    pub const KDSETLED: u32 = 0x4B32;
    pub const KDSETMODE: u32 = 0x4B3A;
    pub const KDSKBMODE: u32 = 0x4B45;
    pub const KDSKBLED: u32 = 0x4B65;
    pub const PIO_FONTRESET: u32 = 0x4B6D;

    pub const VT_SETMODE: u32 = 0x5602;
    pub const VT_GETSTATE: u32 = 0x5603;
    pub const VT_ACTIVATE: u32 = 0x5606;
    pub const VT_WAITACTIVE: u32 = 0x5607;
    pub const VT_DISALLOCATE: u32 = 0x5608;
    pub const VT_UNLOCKSWITCH: u32 = 0x560C;
}

/// TIOCLINUX subcodes
mod tioclinux {
    pub const UNBLANKSCREEN: u8 = 4;
    pub const SETVESABLANK: u8 = 10;
    pub const SETKMSGREDIRECT: u8 = 11;
    pub const GETFGCONSOLE: u8 = 16;
}

const N_TTY: libc::c_int = 0;
const KD_TEXT: libc::c_ulong = 0;
const K_UNICODE: libc::c_ulong = 3;
const VT_AUTO: libc::c_char = 0;

const fn ctrl(c: u8) -> libc::cc_t {
    c - b'a' + 1
}

/// struct vt_mode
#[repr(C)]
#[allow(dead_code)]
#[derive(Default)]
struct VtMode {
    mode: libc::c_char,
    waitv: libc::c_char,
    relsig: libc::c_short,
    acqsig: libc::c_short,
    frsig: libc::c_short,
}

/// struct vt_stat
#[repr(C)]
#[allow(dead_code)]
#[derive(Default)]
struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

/// Target state of the console, applied as a whole after every takeover
#[derive(Debug, Clone, Copy)]
pub struct TerminalProfile {
    pub input_flags: libc::tcflag_t,
    pub output_flags: libc::tcflag_t,
    pub control_flags: libc::tcflag_t,
    pub local_flags: libc::tcflag_t,
    /// Bound control characters; everything else is disabled
    pub control_chars: &'static [(usize, libc::cc_t)],
    /// KDSETLED argument (all lights on, then keyboard flags cleared)
    pub leds: libc::c_ulong,
    pub keyboard_mode: libc::c_ulong,
    pub display_mode: libc::c_ulong,
    pub vt_mode: libc::c_char,
}

/// Canonical UTF-8 line editing with job control, like a freshly reset linux console
pub const CLEAN_CONSOLE: TerminalProfile = TerminalProfile {
    // recovery mode: ignore breaks and parity errors
    input_flags: libc::ICRNL | libc::IXON | libc::IXOFF | libc::IUTF8 | libc::IGNBRK | libc::IGNPAR,
    output_flags: libc::OPOST | libc::ONLCR | libc::TAB3,
    // assume a linux console rather than a serial port
    control_flags: libc::B38400 | libc::CS8 | libc::CREAD | libc::CLOCAL,
    local_flags: libc::ISIG
        | libc::ICANON
        | libc::ECHO
        | libc::ECHOE
        | libc::ECHOK
        | libc::ECHOCTL
        | libc::ECHOKE
        | libc::IEXTEN,
    control_chars: &[
        (libc::VDISCARD, ctrl(b'o')),
        (libc::VEOF, ctrl(b'd')),
        (libc::VERASE, 0o177),
        (libc::VINTR, ctrl(b'c')),
        (libc::VKILL, ctrl(b'u')),
        (libc::VLNEXT, ctrl(b'v')),
        (libc::VMIN, 1),
        (libc::VQUIT, 0o34),
        (libc::VREPRINT, ctrl(b'r')),
        (libc::VSTART, ctrl(b'q')),
        (libc::VSTOP, ctrl(b's')),
        (libc::VSUSP, ctrl(b'z')),
        (libc::VWERASE, ctrl(b'w')),
    ],
    leds: !0,
    keyboard_mode: K_UNICODE,
    display_mode: KD_TEXT,
    vt_mode: VT_AUTO,
};

impl TerminalProfile {
    /// Overwrite every mode field of `termios` with this profile.
    pub fn apply(&self, termios: &mut libc::termios) {
        termios.c_iflag = self.input_flags;
        termios.c_oflag = self.output_flags;
        termios.c_cflag = self.control_flags;
        termios.c_lflag = self.local_flags;
        termios.c_line = N_TTY as libc::cc_t;
        termios.c_cc = [0; libc::NCCS];
        for &(index, value) in self.control_chars {
            termios.c_cc[index] = value;
        }
    }

    /// Read the attributes of `tty`, apply this profile and write them back,
    /// discarding pending input.
    pub fn write_to(&self, tty: BorrowedFd<'_>) -> Result<(), InitError> {
        // SAFETY: termios is plain old data; all-zero is a valid value
        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: termios is a valid out-pointer
        Errno::result(unsafe { libc::tcgetattr(tty.as_raw_fd(), &mut termios) })
            .map_err(InitError::TermiosRead)?;
        self.apply(&mut termios);
        // SAFETY: termios was filled by tcgetattr and adjusted in place
        Errno::result(unsafe { libc::tcsetattr(tty.as_raw_fd(), libc::TCSAFLUSH, &termios) })
            .map_err(InitError::TermiosWrite)?;
        Ok(())
    }
}

/// Who holds the console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleSession {
    /// Nothing taken yet
    Unowned,
    /// Holding the terminal the kernel started us on
    EarlyActive,
    /// Holding the primary virtual console
    LateActive,
    /// Controlling terminal given up
    Released,
}

/// Something that moves the console between sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleEvent {
    EarlyActivate,
    LateActivate,
    Release,
    Teardown,
}

impl ConsoleEvent {
    fn name(self) -> &'static str {
        match self {
            ConsoleEvent::EarlyActivate => "activate early",
            ConsoleEvent::LateActivate => "activate late",
            ConsoleEvent::Release => "release",
            ConsoleEvent::Teardown => "tear down",
        }
    }
}

impl ConsoleSession {
    /// State after `event`, or `None` if the event makes no sense now.
    pub fn next(self, event: ConsoleEvent) -> Option<ConsoleSession> {
        use ConsoleEvent as E;
        use ConsoleSession as S;
        match (self, event) {
            (S::Unowned, E::EarlyActivate) => Some(S::EarlyActive),
            (S::Unowned | S::Released | S::LateActive, E::LateActivate) => Some(S::LateActive),
            (S::EarlyActive | S::LateActive, E::Release) => Some(S::Released),
            (S::LateActive, E::Teardown) => Some(S::LateActive),
            _ => None,
        }
    }
}

fn ioctl(fd: RawFd, request: u32, arg: libc::c_ulong) -> nix::Result<libc::c_int> {
    // SAFETY: every request used here takes an integer or a pointer to a
    // live, correctly sized value owned by the caller
    Errno::result(unsafe { libc::ioctl(fd, request as _, arg) })
}

fn ioctl_ptr<T>(fd: RawFd, request: u32, arg: &T) -> nix::Result<libc::c_int> {
    ioctl(fd, request, arg as *const T as libc::c_ulong)
}

/// Unchecked terminal control: log and move on.
fn decorate(what: &str, result: nix::Result<libc::c_int>) {
    if let Err(e) = result {
        log::debug!("{} failed: {}", what, e);
    }
}

fn dup2(from: RawFd, to: RawFd) -> nix::Result<()> {
    // SAFETY: plain descriptor duplication
    Errno::result(unsafe { libc::dup2(from, to) }).map(drop)
}

fn close(fd: RawFd) -> nix::Result<()> {
    // SAFETY: callers own fd
    Errno::result(unsafe { libc::close(fd) }).map(drop)
}

fn close_from(first: RawFd) -> nix::Result<()> {
    // SAFETY: closes descriptors this process owns; nothing refers to them afterwards
    Errno::result(unsafe {
        libc::syscall(libc::SYS_close_range, first as libc::c_uint, libc::c_uint::MAX, 0)
    })
    .map(drop)
}

/// Make `fd` the only descriptor besides stdin, stdout and stderr.
pub fn take_over_standard_streams(fd: OwnedFd) -> Result<(), InitError> {
    let _ = std::io::stdout().flush();
    let fd = fd.into_raw_fd();
    let steps = || -> nix::Result<()> {
        if fd != 3 {
            dup2(fd, 3)?;
        }
        close_from(4)?;
        dup2(3, 0)?;
        dup2(3, 1)?;
        dup2(3, 2)?;
        close(3)
    };
    steps().map_err(InitError::StandardStreams)
}

fn open_terminal(path: &Path, controlling: bool) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    if !controlling {
        options.custom_flags(libc::O_NOCTTY);
    }
    options.open(path)
}

fn open_error(path: &Path, e: &std::io::Error) -> InitError {
    InitError::Open {
        path: path.to_path_buf(),
        source: errno_of(e),
    }
}

/// Open `path` as the controlling terminal of a fresh session and put it on
/// the standard streams. Runs in a child after setsid().
pub fn acquire_session_console(path: &Path) -> Result<(), InitError> {
    let tty = open_terminal(path, true).map_err(|e| open_error(path, &e))?;
    take_over_standard_streams(OwnedFd::from(tty))
}

/// Drop pending keyboard input on the console. Best-effort.
pub fn flush_input() {
    // SAFETY: tcflush on stdin
    let result = Errno::result(unsafe { libc::tcflush(0, libc::TCIFLUSH) });
    decorate("flush input", result);
}

fn clear_screen() {
    let mut out = std::io::stdout();
    let _ = out.write_all(b"\x1b[r\x1b[H\x1b[2J\x1b[3J\x1b[0m\x1bc");
    let _ = out.flush();
}

/// The console and which session currently holds it
pub struct Console {
    state: ConsoleSession,
    config: InitConfig,
    profile: TerminalProfile,
}

impl Console {
    pub fn new(config: &InitConfig) -> Self {
        Self {
            state: ConsoleSession::Unowned,
            config: config.clone(),
            profile: CLEAN_CONSOLE,
        }
    }

    pub fn state(&self) -> ConsoleSession {
        self.state
    }

    fn transition(&self, event: ConsoleEvent) -> Result<ConsoleSession, InitError> {
        self.state.next(event).ok_or(InitError::ConsoleState {
            state: self.state,
            event: event.name(),
        })
    }

    /// Take the terminal we were started on, or the primary console if there
    /// is none.
    pub fn activate_early(&mut self) -> Result<(), InitError> {
        let next = self.transition(ConsoleEvent::EarlyActivate)?;

        let tty = match open_terminal(&self.config.controlling_tty, false) {
            Ok(tty) => tty,
            Err(e) if errno_of(&e) == Errno::ENXIO => {
                let primary = self.config.primary_console_path();
                log::debug!("No controlling terminal, using {}", primary.display());
                return self.activate_late();
            }
            Err(e) => return Err(open_error(&self.config.controlling_tty, &e)),
        };
        take_over_standard_streams(OwnedFd::from(tty))?;
        self.apply_profile()?;

        self.state = next;
        Ok(())
    }

    /// Hang up the primary console, take it fresh and bring it to the front.
    pub fn activate_late(&mut self) -> Result<(), InitError> {
        let next = self.transition(ConsoleEvent::LateActivate)?;
        let path = self.config.primary_console_path();

        let stale = open_terminal(&path, false).map_err(|e| open_error(&path, &e))?;
        ioctl(stale.as_raw_fd(), request::TIOCVHANGUP, 0).map_err(|e| InitError::Hangup {
            path: path.clone(),
            source: e,
        })?;
        drop(stale);

        let tty = open_terminal(&path, false).map_err(|e| open_error(&path, &e))?;
        take_over_standard_streams(OwnedFd::from(tty))?;

        let vt = libc::c_ulong::from(self.config.primary_console);
        decorate("VT_ACTIVATE", ioctl(0, request::VT_ACTIVATE, vt));
        decorate("VT_WAITACTIVE", ioctl(0, request::VT_WAITACTIVE, vt));
        self.apply_profile()?;

        self.state = next;
        Ok(())
    }

    /// Give up the controlling terminal. Having none is fine.
    pub fn release(&mut self) -> Result<(), InitError> {
        let next = self.transition(ConsoleEvent::Release)?;

        match open_terminal(&self.config.controlling_tty, false) {
            Ok(tty) => {
                ioctl(tty.as_raw_fd(), request::TIOCNOTTY, 0).map_err(InitError::Release)?;
            }
            Err(e) if errno_of(&e) == Errno::ENXIO => {
                log::debug!("No controlling terminal to release");
            }
            Err(e) => return Err(InitError::Release(errno_of(&e))),
        }

        log::debug!("Controlling terminal released");
        self.state = next;
        Ok(())
    }

    /// Deallocate every virtual console, highest first.
    pub fn teardown(&mut self) -> Result<(), InitError> {
        let next = self.transition(ConsoleEvent::Teardown)?;

        let mut out = std::io::stdout();
        let _ = out.write_all(b"\x1b[0m");
        let _ = out.flush();

        for n in (1..=MAX_CONSOLES).rev() {
            let path = self.config.console_path(n);
            let vt = match open_terminal(&path, false) {
                Ok(vt) => vt,
                Err(e) => {
                    log::debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            // 0 releases every console nobody holds; only a kernel without
            // virtual terminals rejects it
            ioctl(vt.as_raw_fd(), request::VT_DISALLOCATE, 0)
                .map_err(|e| InitError::Deallocate { path, source: e })?;
        }

        self.state = next;
        Ok(())
    }

    /// Point stderr at the debug device.
    fn redirect_stderr(&self) {
        match open_terminal(&self.config.debug_device, false) {
            Ok(debug) => decorate("stderr redirect", dup2(debug.as_raw_fd(), 2).map(|_| 0)),
            Err(e) => log::debug!("No debug device {}: {}", self.config.debug_device.display(), e),
        }
    }

    /// Bring the terminal on stdin into the clean profile.
    fn apply_profile(&self) -> Result<(), InitError> {
        let profile = &self.profile;
        self.redirect_stderr();

        decorate(
            "unblank",
            ioctl_ptr(0, request::TIOCLINUX, &[tioclinux::UNBLANKSCREEN, 0u8]),
        );
        clear_screen();
        decorate(
            "kmsg redirect",
            ioctl_ptr(0, request::TIOCLINUX, &[tioclinux::SETKMSGREDIRECT, 0u8]),
        );
        decorate("KDSETLED", ioctl(0, request::KDSETLED, profile.leds));
        decorate("KDSKBLED", ioctl(0, request::KDSKBLED, 0));
        decorate("KDSETMODE", ioctl(0, request::KDSETMODE, profile.display_mode));
        decorate("KDMKTONE", ioctl(0, request::KDMKTONE, 0));
        decorate("KIOCSOUND", ioctl(0, request::KIOCSOUND, 0));
        decorate("PIO_FONTRESET", ioctl(0, request::PIO_FONTRESET, 0));
        decorate("KDSKBMODE", ioctl(0, request::KDSKBMODE, profile.keyboard_mode));
        let vt_mode = VtMode {
            mode: profile.vt_mode,
            ..Default::default()
        };
        decorate("VT_SETMODE", ioctl_ptr(0, request::VT_SETMODE, &vt_mode));
        decorate("VT_UNLOCKSWITCH", ioctl(0, request::VT_UNLOCKSWITCH, 0));
        decorate("TIOCNXCL", ioctl(0, request::TIOCNXCL, 0));
        decorate("TIOCSETD", ioctl_ptr(0, request::TIOCSETD, &N_TTY));
        decorate("TIOCCBRK", ioctl(0, request::TIOCCBRK, 0));
        decorate(
            "VESA blank",
            ioctl_ptr(0, request::TIOCLINUX, &[tioclinux::SETVESABLANK, 0u8]),
        );
        // SAFETY: termios is plain old data; all-zero is a valid value
        let unlocked: libc::termios = unsafe { std::mem::zeroed() };
        decorate("TIOCSLCKTRMIOS", ioctl_ptr(0, request::TIOCSLCKTRMIOS, &unlocked));

        profile.write_to(std::io::stdin().as_fd())?;

        clear_screen();
        self.report_active();
        Ok(())
    }

    fn report_active(&self) {
        let foreground =
            ioctl_ptr(0, request::TIOCLINUX, &[tioclinux::GETFGCONSOLE, 0u8]).unwrap_or(-1);
        let mut stat = VtStat::default();
        let stat_ptr = &mut stat as *mut VtStat as libc::c_ulong;
        let active = match ioctl(0, request::VT_GETSTATE, stat_ptr) {
            Ok(_) => i32::from(stat.v_active),
            Err(_) => -2,
        };
        println!("switched to console {} / {}", foreground, active);
    }
}
