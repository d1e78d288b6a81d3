//! Typed endpoint (C2): the single entity type with a tagged variant for
//! per-kind auxiliary state.
//!
//! Objects never hold pointers to each other. `writer`/`readers` are
//! [`ObjectId`] handles resolved through the [`crate::registry::Registry`],
//! the arena that owns every `Object` — this is what makes link symmetry
//! (invariant 1) mechanically checkable instead of relying on aliased
//! pointers, per the design notes.

use std::fmt;
use std::os::fd::OwnedFd;
#[cfg(test)]
use std::os::fd::FromRawFd;
use std::time::SystemTime;

use smallvec::SmallVec;

use crate::error::{CoreError, Result};
use crate::opener::Opener;
use crate::ring::RingBuffer;

/// Most consoles have a handful of readers (a couple of spies plus the
/// writer and its log file); inline storage avoids a heap allocation for
/// the common case.
type Readers = SmallVec<[ObjectId; 4]>;

/// Stable handle for an object, assigned by the registry on insertion.
/// Plays the role the pack's `PeerKey = u64` plays for peer maps: a
/// compact, copyable identity that doesn't alias.
pub type ObjectId = u64;

/// The three endpoint kinds named in the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Console,
    LogFile,
    ClientSocket,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Console => "console",
            Self::LogFile => "logfile",
            Self::ClientSocket => "client",
        })
    }
}

/// Variant-specific state, per §3.
#[derive(Debug)]
pub enum Variant {
    Console {
        device: String,
        baud: u32,
        reset_program: Option<String>,
    },
    LogFile,
    ClientSocket {
        got_iac: bool,
        time_last_read: SystemTime,
    },
}

/// A typed endpoint: Console, LogFile, or ClientSocket.
pub struct Object {
    id: ObjectId,
    name: String,
    kind: ObjectKind,
    fd: Option<OwnedFd>,
    buf: RingBuffer,
    writer: Option<ObjectId>,
    readers: Readers,
    variant: Variant,
}

impl Object {
    /// Construct an inactive `Console`. Call [`Object::open`] to attach its
    /// transport.
    #[must_use]
    pub fn new_console(
        id: ObjectId,
        name: impl Into<String>,
        device: impl Into<String>,
        baud: u32,
        reset_program: Option<String>,
    ) -> Self {
        let name = name.into();
        Self {
            id,
            buf: RingBuffer::with_default_capacity(name.clone()),
            name,
            kind: ObjectKind::Console,
            fd: None,
            writer: None,
            readers: Readers::new(),
            variant: Variant::Console {
                device: device.into(),
                baud,
                reset_program,
            },
        }
    }

    /// Construct an inactive `LogFile`. Its writer, once set, must be a
    /// `Console` (invariant 3); the link manager enforces this.
    #[must_use]
    pub fn new_logfile(id: ObjectId, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            buf: RingBuffer::with_default_capacity(name.clone()),
            name,
            kind: ObjectKind::LogFile,
            fd: None,
            writer: None,
            readers: Readers::new(),
            variant: Variant::LogFile,
        }
    }

    /// Construct an active `ClientSocket` from an already-accepted
    /// connection. Fails with [`CoreError::Clock`] if the wall clock is
    /// unreadable.
    pub fn new_client(id: ObjectId, user: &str, host: &str, fd: OwnedFd) -> Result<Self> {
        let time_last_read = SystemTime::now();
        // SystemTime::now() only panics on platforms without a clock; the
        // fallible form exists so callers can surface Clock rather than
        // unwind.
        time_last_read
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(|e| CoreError::Clock(e.to_string()))?;

        let name = format!("{user}@{host}");
        Ok(Self {
            id,
            buf: RingBuffer::with_default_capacity(name.clone()),
            name,
            kind: ObjectKind::ClientSocket,
            fd: Some(fd),
            writer: None,
            readers: Readers::new(),
            variant: Variant::ClientSocket {
                got_iac: false,
                time_last_read,
            },
        })
    }

    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[must_use]
    pub fn variant(&self) -> &Variant {
        &self.variant
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    #[must_use]
    pub fn fd(&self) -> Option<&OwnedFd> {
        self.fd.as_ref()
    }

    #[must_use]
    pub fn buf(&self) -> &RingBuffer {
        &self.buf
    }

    #[must_use]
    pub fn writer(&self) -> Option<ObjectId> {
        self.writer
    }

    #[must_use]
    pub fn readers(&self) -> &[ObjectId] {
        &self.readers
    }

    /// Once set, the ring admits no further bytes until the object is
    /// reopened in a new epoch (invariant 7). The ring is the sole source
    /// of truth for this flag; the object does not duplicate it.
    #[must_use]
    pub fn got_eof(&self) -> bool {
        self.buf.got_eof()
    }

    /// Admit bytes to the ring. Precondition: `!got_eof()`.
    pub fn write_in(&self, src: &[u8]) -> Result<usize> {
        self.buf.push(src)
    }

    /// Idempotent open: already-open returns success. Dispatches on
    /// variant as described in §4.2. `writer_name` is required to format a
    /// `LogFile`'s header line and is ignored otherwise. `truncate`
    /// implements the `-z` flag for log files.
    pub fn open(
        &mut self,
        opener: &dyn Opener,
        writer_name: Option<&str>,
        truncate: bool,
    ) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        match &self.variant {
            Variant::Console { device, baud, reset_program } => {
                let fd = opener
                    .open_console(device, *baud, reset_program.as_deref())
                    .map_err(|e| CoreError::open_failed(&self.name, e))?;
                self.fd = Some(fd);
            }
            Variant::LogFile => {
                let writer_name =
                    writer_name.expect("LogFile open requires its console's name");
                let fd = opener
                    .open_logfile(&self.name, truncate)
                    .map_err(|e| CoreError::open_failed(&self.name, e))?;
                self.fd = Some(fd);
                self.buf.clear_eof();
                let header = format_log_header(writer_name);
                // Queued into our own ring; the engine's next drain writes
                // it to the freshly opened fd, same as any other output.
                self.buf.push(header.as_bytes())?;
            }
            Variant::ClientSocket { .. } => {
                // Born open; nothing to do.
            }
        }
        Ok(())
    }

    /// Close the underlying fd (idempotent) and clear EOF so the object
    /// can be cleanly reopened in a later epoch. Does not touch the
    /// graph; callers go through [`crate::link`].
    pub fn close_fd(&mut self) {
        self.fd = None;
        self.buf.clear_eof();
    }

    pub(crate) fn set_writer(&mut self, writer: Option<ObjectId>) {
        self.writer = writer;
    }

    pub(crate) fn readers_mut(&mut self) -> &mut Readers {
        &mut self.readers
    }

    /// Record that a client read bytes just now, for idle-timeout policy.
    pub fn touch_last_read(&mut self) {
        if let Variant::ClientSocket { time_last_read, .. } = &mut self.variant {
            *time_last_read = SystemTime::now();
        }
    }

    #[must_use]
    pub fn time_last_read(&self) -> Option<SystemTime> {
        match &self.variant {
            Variant::ClientSocket { time_last_read, .. } => Some(*time_last_read),
            _ => None,
        }
    }

    pub(crate) fn got_iac_mut(&mut self) -> Option<&mut bool> {
        match &mut self.variant {
            Variant::ClientSocket { got_iac, .. } => Some(got_iac),
            _ => None,
        }
    }

    /// Test-only escape hatch: mark this object open with an arbitrary fd,
    /// bypassing [`Object::open`] and its [`crate::opener::Opener`]. Used
    /// by fixtures that need an already-open `Console` without a real
    /// serial device.
    #[cfg(test)]
    pub(crate) fn attach_fd_for_test(&mut self, fd: OwnedFd) {
        self.fd = Some(fd);
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("open", &self.is_open())
            .field("writer", &self.writer)
            .field("readers", &self.readers)
            .finish()
    }
}

/// Lexicographic name order, used for stable listing (§4.2's `compare`).
#[must_use]
pub fn compare(a: &Object, b: &Object) -> std::cmp::Ordering {
    a.name.cmp(&b.name)
}

fn format_log_header(console_name: &str) -> String {
    let now = chrono::Local::now();
    format!(
        "* Console [{console_name}] log started on {}.\n\n",
        now.format("%a %b %e %H:%M:%S %Y")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_order_is_lexicographic() {
        let a = Object::new_console(1, "alpha", "/dev/null", 9600, None);
        let b = Object::new_console(2, "beta", "/dev/null", 9600, None);
        assert_eq!(compare(&a, &b), std::cmp::Ordering::Less);
        assert_eq!(compare(&b, &a), std::cmp::Ordering::Greater);
    }

    #[test]
    fn log_header_contains_console_name() {
        let header = format_log_header("c1");
        assert!(header.starts_with("* Console [c1] log started on"));
        assert!(header.ends_with("\n\n"));
    }

    #[test]
    fn new_client_name_is_user_at_host() {
        // SAFETY: stdin is always a valid fd for this process; we never
        // read/write through it, only exercise the constructor.
        let fd = unsafe { OwnedFd::from_raw_fd(0) };
        let obj = Object::new_client(1, "alice", "host1", fd).unwrap();
        assert_eq!(obj.name(), "alice@host1");
        assert!(obj.is_open());
        std::mem::forget(obj); // avoid closing fd 0 in the test process
    }
}
