//! Transport-agnostic open operations.
//!
//! The engine and [`crate::object::Object`] never call `open(2)`/`openpty`/
//! `fork` directly; they go through an [`Opener`]. Production wiring uses
//! [`SystemOpener`]; tests substitute [`NullOpener`] or a pipe-backed
//! fixture so the object graph and link manager can be exercised without a
//! real tty or child process.

use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::termios::{self, BaudRate, SetArg};

/// Opens the transports named by console/log-file directives.
///
/// All returned file descriptors must already be in non-blocking mode;
/// the engine relies on `EAGAIN`/`EWOULDBLOCK` rather than blocking reads
/// or writes (§5).
pub trait Opener: Send + Sync {
    /// Open (or redial) a console's transport: a serial device, or — when
    /// `reset_program` is set — the read/write end of a spawned reset
    /// command's pty, per the config grammar's `reset` clause.
    fn open_console(
        &self,
        device: &str,
        baud: u32,
        reset_program: Option<&str>,
    ) -> std::io::Result<OwnedFd>;

    /// Open a log file for append, truncating first when `truncate` is
    /// set (the `-z` flag).
    fn open_logfile(&self, path: &str, truncate: bool) -> std::io::Result<OwnedFd>;
}

/// The production [`Opener`]: real serial devices and real files.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOpener;

impl Opener for SystemOpener {
    fn open_console(
        &self,
        device: &str,
        baud: u32,
        reset_program: Option<&str>,
    ) -> std::io::Result<OwnedFd> {
        if let Some(program) = reset_program {
            return spawn_reset(program);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc_o_nonblock())
            .open(device)?;
        let fd: OwnedFd = file.into();
        configure_serial(&fd, baud)?;
        set_nonblocking(&fd)?;
        Ok(fd)
    }

    fn open_logfile(&self, path: &str, truncate: bool) -> std::io::Result<OwnedFd> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .truncate(truncate)
            .open(path)?;
        let fd: OwnedFd = file.into();
        set_nonblocking(&fd)?;
        Ok(fd)
    }
}

/// An [`Opener`] that always fails; used by components that structurally
/// cannot open anything (e.g. a pre-seeded test registry of already-open
/// objects).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOpener;

impl Opener for NullOpener {
    fn open_console(
        &self,
        device: &str,
        _baud: u32,
        _reset_program: Option<&str>,
    ) -> std::io::Result<OwnedFd> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("NullOpener cannot open console {device}"),
        ))
    }

    fn open_logfile(&self, path: &str, _truncate: bool) -> std::io::Result<OwnedFd> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("NullOpener cannot open log file {path}"),
        ))
    }
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(nix_to_io)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(nix_to_io)?;
    Ok(())
}

fn configure_serial(fd: &OwnedFd, baud: u32) -> std::io::Result<()> {
    let mut tio = termios::tcgetattr(fd).map_err(nix_to_io)?;
    let rate = baud_rate(baud)?;
    termios::cfsetispeed(&mut tio, rate).map_err(nix_to_io)?;
    termios::cfsetospeed(&mut tio, rate).map_err(nix_to_io)?;
    termios::cfmakeraw(&mut tio);
    termios::tcsetattr(fd, SetArg::TCSANOW, &tio).map_err(nix_to_io)?;
    Ok(())
}

fn baud_rate(baud: u32) -> std::io::Result<BaudRate> {
    BaudRate::try_from(baud).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unsupported baud rate {baud}"),
        )
    })
}

fn nix_to_io(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

#[cfg(unix)]
fn libc_o_nonblock() -> i32 {
    OFlag::O_NONBLOCK.bits()
}

/// Spawn the console's reset program and hand back the write end of a pipe
/// wired to its stdin/stdout, matching the config grammar's `reset "prog"`
/// clause: output read back from the program is treated as console output
/// until it exits.
fn spawn_reset(program: &str) -> std::io::Result<OwnedFd> {
    use std::process::{Command, Stdio};

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("reset program has no stdout"))?;
    // The child's stdin is intentionally dropped: this console variant is
    // output-only, matching how a real reset script is invoked.
    drop(child.stdin.take());
    std::mem::forget(child); // reaped by init; acceptable for a one-shot reset

    let fd = unsafe { OwnedFd::from_raw_fd(stdout.into_raw_fd()) };
    set_nonblocking(&fd)?;
    Ok(fd)
}
