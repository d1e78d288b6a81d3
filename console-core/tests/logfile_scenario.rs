//! End-to-end exercise of spec.md §8 scenario 1: a console declared with a
//! `LOG=` clause gets an automatically-created, automatically-linked
//! `LogFile` object, and bytes written into the console show up on disk
//! after the log's header line.

use std::fs;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use console_core::config::Config;
use console_core::engine::Engine;
use console_core::opener::Opener;
use tempfile::tempdir;

/// Opens the console end as a socketpair (so the test can push simulated
/// device output) and the log file as a real on-disk, non-blocking file —
/// the one piece of this fixture that needs to be real, since the point of
/// this scenario is to observe actual bytes landing on disk.
#[derive(Default)]
struct MixedOpener {
    console_other_end: Mutex<Option<std::os::fd::RawFd>>,
}

impl MixedOpener {
    fn take_console_other_end(&self) -> OwnedFd {
        let raw = self
            .console_other_end
            .lock()
            .unwrap()
            .take()
            .expect("console not opened yet");
        unsafe { OwnedFd::from_raw_fd(raw) }
    }
}

impl Opener for MixedOpener {
    fn open_console(
        &self,
        _device: &str,
        _baud: u32,
        _reset_program: Option<&str>,
    ) -> std::io::Result<OwnedFd> {
        use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
        let (engine_end, test_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        *self.console_other_end.lock().unwrap() = Some(test_end.as_raw_fd());
        std::mem::forget(test_end);
        Ok(engine_end)
    }

    fn open_logfile(&self, path: &str, truncate: bool) -> std::io::Result<OwnedFd> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .truncate(truncate)
            .custom_flags(nix::fcntl::OFlag::O_NONBLOCK.bits())
            .open(path)?;
        Ok(file.into())
    }
}

/// Boxes an `Arc<MixedOpener>` behind the `Opener` trait object the engine
/// wants, while letting the test keep its own handle to pull the
/// socketpair's other end back out.
struct SharedOpener(Arc<MixedOpener>);

impl Opener for SharedOpener {
    fn open_console(
        &self,
        device: &str,
        baud: u32,
        reset_program: Option<&str>,
    ) -> std::io::Result<OwnedFd> {
        self.0.open_console(device, baud, reset_program)
    }

    fn open_logfile(&self, path: &str, truncate: bool) -> std::io::Result<OwnedFd> {
        self.0.open_logfile(path, truncate)
    }
}

fn pump(engine: &mut Engine, times: usize) {
    for _ in 0..times {
        engine.tick().unwrap();
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn console_with_log_clause_writes_header_then_console_bytes_to_disk() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("c1.log");

    let config = Config::parse(&format!(
        r#"
        SERVER PORT=0
        CONSOLE NAME=c1 DEV="test-device" BPS=9600 LOG="{}"
        "#,
        log_path.display()
    ))
    .unwrap();

    let opener = Arc::new(MixedOpener::default());
    // Engine::new opens and links the log file eagerly (a console with a
    // `LOG=` clause is attached to its log at construction time, unlike
    // client attaches, which are lazy), so the other end of the console's
    // socketpair is available immediately after.
    let mut engine = Engine::new(&config, Box::new(SharedOpener(opener.clone())), false).unwrap();

    pump(&mut engine, 2);

    let header = fs::read_to_string(&log_path).unwrap();
    assert!(header.starts_with("* Console [c1] log started on"));
    assert!(header.ends_with("\n\n"));

    let mut console_end: std::net::TcpStream =
        unsafe { std::net::TcpStream::from_raw_fd(opener.take_console_other_end().into_raw_fd()) };
    console_end.write_all(b"hello\n").unwrap();
    pump(&mut engine, 5);

    let contents = fs::read_to_string(&log_path).unwrap();
    assert!(contents.ends_with("hello\n"));
}
