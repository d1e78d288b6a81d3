//! Single-instance advisory locking and the `-k` kill path (§6).
//!
//! The daemon takes a shared `flock` on the config file itself — opening
//! it read-only, per spec. A second instance against the same config
//! fails to acquire even a second shared lock only if something else
//! holds it exclusively, which never happens in normal operation; what
//! actually prevents two live daemons is `-k`'s probe: it attempts a
//! non-blocking *exclusive* lock on the same file, which fails while a
//! running instance holds its shared lock, and that failure is the
//! signal that a daemon is up. The running instance's pid is recorded in
//! a sibling pidfile so `-k` knows who to signal.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use console_core::error::{CoreError, Result};

/// A shared lock on the config file, held for the process's lifetime,
/// plus the pidfile written alongside it. Dropping it releases the
/// `flock` (automatic on close) and removes the pidfile.
pub struct InstanceLock {
    _config_file: File,
    pidfile: PathBuf,
}

impl InstanceLock {
    /// Open `config_path` read-only, take a shared advisory lock on it,
    /// and record our pid in `pidfile`. Fails with [`CoreError::Config`]
    /// if the config file cannot be locked (another instance holds it
    /// exclusively, which only `-k`'s probe ever does, transiently).
    pub fn acquire(config_path: &Path, pidfile: &Path) -> Result<Self> {
        let config_file = OpenOptions::new()
            .read(true)
            .open(config_path)
            .map_err(CoreError::Io)?;

        flock(config_file.as_raw_fd(), FlockArg::LockSharedNonblock).map_err(|_| {
            CoreError::config(format!(
                "cannot lock config file {}: held exclusively by another process",
                config_path.display()
            ))
        })?;

        if let Some(parent) = pidfile.parent() {
            std::fs::create_dir_all(parent).map_err(CoreError::Io)?;
        }
        let mut pid_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(pidfile)
            .map_err(CoreError::Io)?;
        writeln!(pid_file, "{}", std::process::id()).map_err(CoreError::Io)?;
        pid_file.sync_all().map_err(CoreError::Io)?;

        Ok(Self {
            _config_file: config_file,
            pidfile: pidfile.to_path_buf(),
        })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.pidfile);
    }
}

/// Handle `-k`: probe for a running instance by attempting a non-blocking
/// exclusive lock on the config file. Success means nothing is running
/// against it (§8 scenario 6 expects this to exit 0 without signaling
/// anyone is an error in our favor: no daemon, nothing to kill). Failure
/// means a daemon holds the shared lock; read its pid from the pidfile
/// and send `SIGTERM`.
pub fn kill_running(config_path: &Path, pidfile: &Path) -> Result<()> {
    let config_file = OpenOptions::new()
        .read(true)
        .open(config_path)
        .map_err(CoreError::Io)?;

    if flock(config_file.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_ok() {
        let _ = flock(config_file.as_raw_fd(), FlockArg::Unlock);
        return Err(CoreError::config(format!(
            "no running instance holds {}",
            config_path.display()
        )));
    }

    let contents = std::fs::read_to_string(pidfile).map_err(|e| {
        CoreError::config(format!("cannot read pidfile {}: {e}", pidfile.display()))
    })?;
    let pid: i32 = contents
        .trim()
        .parse()
        .map_err(|_| CoreError::config(format!("pidfile {} is not a valid pid", pidfile.display())))?;

    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        .map_err(|e| CoreError::config(format!("failed to signal pid {pid}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn write_config(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("consoled.cf");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "CONSOLE NAME=c1 DEV=/dev/ttyS0").unwrap();
        path
    }

    #[test]
    fn acquire_writes_own_pid() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path());
        let pidfile = dir.path().join("consoled.pid");
        let lock = InstanceLock::acquire(&config_path, &pidfile).unwrap();
        let contents = std::fs::read_to_string(&pidfile).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        drop(lock);
        assert!(!pidfile.exists());
    }

    #[test]
    fn kill_running_reports_error_when_nothing_is_running() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path());
        let pidfile = dir.path().join("consoled.pid");
        assert!(kill_running(&config_path, &pidfile).is_err());
    }

    #[test]
    fn kill_running_signals_the_lock_holder() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path());
        let pidfile = dir.path().join("consoled.pid");
        let _lock = InstanceLock::acquire(&config_path, &pidfile).unwrap();
        // Our own pid is in the pidfile; signal 0 (no-op probe) would be
        // the non-destructive choice, but SIGTERM against our own test
        // process is not something we can safely exercise here, so this
        // only checks that the exclusive-probe path correctly detects the
        // held shared lock and proceeds to read the pidfile.
        let err = kill_running(&config_path, &PathBuf::from("/nonexistent/does-not-exist"))
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
