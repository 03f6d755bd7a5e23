//! Integration tests for the PID 1 building blocks
//!
//! The reaper tests sweep the real /proc but only ever signal children this
//! test spawned. Mount tests need root and are ignored by default.
//!
//! Run the root-only tests with: sudo cargo test --test pid1_integration -- --ignored

use nix::sys::signal::Signal;
use nix::unistd::{getuid, Pid};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tmpfs_switch::pid1::{force_mount, ProcessReaper, Signaller, SweepSignal};

/// Signals only the processes it was told about, and remembers what it sent
struct OnlyChildren {
    allowed: Vec<i32>,
    delivered: Vec<(i32, SweepSignal)>,
}

impl OnlyChildren {
    fn new(children: &[&Child]) -> Self {
        Self {
            allowed: children.iter().map(|c| c.id() as i32).collect(),
            delivered: Vec::new(),
        }
    }

    fn signals_for(&self, child: &Child) -> Vec<SweepSignal> {
        self.delivered
            .iter()
            .filter(|(pid, _)| *pid == child.id() as i32)
            .map(|(_, s)| *s)
            .collect()
    }
}

impl Signaller for OnlyChildren {
    fn deliver(&mut self, pid: Pid, signal: SweepSignal) -> nix::Result<()> {
        if !self.allowed.contains(&pid.as_raw()) {
            return Ok(());
        }
        self.delivered.push((pid.as_raw(), signal));
        nix::sys::signal::kill(pid, signal.signal())
    }
}

/// Wait until the child has exec'd into `name`
fn wait_for_exec(child: &Child, name: &str) {
    let path = format!("/proc/{}/cmdline", child.id());
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Ok(cmdline) = std::fs::read(&path) {
            if cmdline.starts_with(name.as_bytes()) {
                return;
            }
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("child {} never became {}", child.id(), name);
}

fn spawn(program: &str, args: &[&str]) -> Child {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn test child")
}

#[test]
fn test_reaper_terminates_children() {
    let mut polite = spawn("sleep", &["30"]);
    wait_for_exec(&polite, "sleep");

    let mut reaper = ProcessReaper::new(
        Path::new("/proc"),
        Duration::from_millis(200),
        OnlyChildren::new(&[&polite]),
    );
    reaper.reap().expect("reap failed");

    // Exited after TERM: a zombie has no address space, so no KILL follows
    assert_eq!(reaper.signaller().signals_for(&polite), vec![SweepSignal::Term]);

    let status = polite.wait().unwrap();
    assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
}

#[test]
fn test_reaper_escalates_for_stubborn_children() {
    let mut stubborn = spawn("sh", &["-c", "trap '' TERM; exec sleep 30"]);
    wait_for_exec(&stubborn, "sleep");

    let grace = Duration::from_millis(200);
    let started = Instant::now();
    let mut reaper = ProcessReaper::new(
        Path::new("/proc"),
        grace,
        OnlyChildren::new(&[&stubborn]),
    );
    reaper.reap().expect("reap failed");
    assert!(started.elapsed() >= grace);

    assert_eq!(
        reaper.signaller().signals_for(&stubborn),
        vec![SweepSignal::Term, SweepSignal::Kill]
    );

    let status = stubborn.wait().unwrap();
    assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
}

#[test]
fn test_binary_refuses_plain_invocation() {
    let output = Command::new(env!("CARGO_BIN_EXE_tmpfs_switch_init"))
        .output()
        .expect("failed to run binary");
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(1));
    if getuid().is_root() {
        assert!(stdout.contains("Must run as pid 1"), "stdout: {}", stdout);
    } else {
        assert!(stdout.contains("must be root"), "stdout: {}", stdout);
    }
}

#[test]
fn test_activate_link_without_new_root() {
    if getuid().is_root() && Path::new("/cdrom").exists() {
        eprintln!("/cdrom exists on this host, skipping test");
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let link = tmp.path().join("activate");
    std::os::unix::fs::symlink(env!("CARGO_BIN_EXE_tmpfs_switch_init"), &link).unwrap();

    let output = Command::new(&link).output().expect("failed to run activate");
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(1));
    if getuid().is_root() {
        assert!(stdout.contains("New root missing"), "stdout: {}", stdout);
    } else {
        assert!(stdout.contains("must be root"), "stdout: {}", stdout);
    }
}

#[test]
fn test_activate_link_with_arguments() {
    let tmp = tempfile::tempdir().unwrap();
    let link = tmp.path().join("activate");
    std::os::unix::fs::symlink(env!("CARGO_BIN_EXE_tmpfs_switch_init"), &link).unwrap();

    let output = Command::new(&link)
        .arg("/mnt")
        .output()
        .expect("failed to run activate");
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_eq!(output.status.code(), Some(1));
    if getuid().is_root() {
        assert!(stdout.contains("Too many arguments"), "stdout: {}", stdout);
    }
}

#[test]
#[ignore] // Requires root
fn test_forced_mount_is_repeatable() {
    if !getuid().is_root() {
        eprintln!("Not root, skipping test");
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    force_mount(tmp.path(), "tmpfs").expect("first mount failed");
    force_mount(tmp.path(), "tmpfs").expect("second mount failed");

    // Each forced mount detached the previous one, so one unmount empties it
    nix::mount::umount2(tmp.path(), nix::mount::MntFlags::MNT_DETACH).unwrap();
}
