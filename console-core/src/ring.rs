//! Bounded ring buffer (C1).
//!
//! A fixed-capacity byte ring with producer-overwrites-consumer semantics.
//! `push` never blocks: if the ring cannot hold the full payload, the
//! oldest un-consumed bytes are evicted and an `overwrote N bytes` event is
//! logged. `drain_once` performs exactly one write syscall per call, via a
//! caller-supplied closure, so wrapped data is written on a later tick.
//!
//! One [`parking_lot::Mutex`] per ring guards `in`/`out`/`got_eof`
//! together; it is never held across more than one syscall.

use std::io;

use parking_lot::Mutex;

use crate::error::{CoreError, Result};

/// Default ring capacity (`CAP` in the spec), chosen to hold a few terminal
/// screenfuls of scrollback without per-console configuration.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Outcome of one [`RingBuffer::drain_once`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The ring was empty; nothing to write.
    Empty,
    /// `n` bytes were written to the sink.
    Wrote(usize),
    /// The sink is not ready (`EAGAIN`/`EWOULDBLOCK`); state is unchanged.
    WouldBlock,
    /// The sink's peer is gone (`EPIPE`); `got_eof` is now set and the ring
    /// is empty.
    Eof,
}

struct Ring {
    storage: Box<[u8]>,
    /// Index of the next byte to write.
    r#in: usize,
    /// Index of the next byte to read.
    out: usize,
    got_eof: bool,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring capacity must reserve one empty slot");
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            r#in: 0,
            out: 0,
            got_eof: false,
        }
    }

    #[inline]
    fn cap(&self) -> usize {
        self.storage.len()
    }

    /// Usable capacity: `CAP - 1`, the empty/full ambiguity is resolved by
    /// reserving one slot.
    #[inline]
    fn usable(&self) -> usize {
        self.cap() - 1
    }

    #[inline]
    fn len(&self) -> usize {
        if self.r#in >= self.out {
            self.r#in - self.out
        } else {
            self.cap() - self.out + self.r#in
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.r#in == self.out
    }

    /// Length of the contiguous prefix available for a single `drain`
    /// syscall: from `out` up to either `in` (if not wrapped) or the end of
    /// the storage slice (if wrapped, the remainder is picked up next
    /// tick).
    fn contiguous_len(&self) -> usize {
        if self.r#in >= self.out {
            self.r#in - self.out
        } else {
            self.cap() - self.out
        }
    }

    fn contiguous_slice(&self) -> &[u8] {
        let len = self.contiguous_len();
        &self.storage[self.out..self.out + len]
    }

    fn push(&mut self, src: &[u8], name: &str) -> Result<usize> {
        if self.got_eof {
            return Err(CoreError::Closed(name.to_string()));
        }
        let requested = src.len();
        if requested == 0 {
            return Ok(0);
        }

        let usable = self.usable();
        // If the payload alone is larger than the whole ring, only its
        // trailing `usable` bytes can ever be resident; the rest never
        // touches storage.
        let (src, truncated) = if requested > usable {
            (&src[requested - usable..], requested - usable)
        } else {
            (src, 0)
        };

        let free = usable - self.len();
        let overflow = src.len().saturating_sub(free);
        if overflow > 0 {
            self.out = (self.out + overflow) % self.cap();
        }

        let cap = self.cap();
        let first = (cap - self.r#in).min(src.len());
        self.storage[self.r#in..self.r#in + first].copy_from_slice(&src[..first]);
        if first < src.len() {
            let rest = src.len() - first;
            self.storage[..rest].copy_from_slice(&src[first..]);
        }
        self.r#in = (self.r#in + src.len()) % cap;

        let total_overwritten = overflow + truncated;
        if total_overwritten > 0 {
            tracing::debug!(
                object = name,
                bytes = total_overwritten,
                "overwrote {} bytes from {}",
                total_overwritten,
                name
            );
        }

        Ok(requested)
    }

    fn drain_once(
        &mut self,
        mut write: impl FnMut(&[u8]) -> io::Result<usize>,
    ) -> Result<DrainOutcome> {
        if self.is_empty() {
            return Ok(DrainOutcome::Empty);
        }
        loop {
            let prefix = self.contiguous_slice();
            match write(prefix) {
                Ok(n) => {
                    self.out = (self.out + n) % self.cap();
                    return Ok(DrainOutcome::Wrote(n));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(DrainOutcome::WouldBlock)
                }
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    self.got_eof = true;
                    self.r#in = 0;
                    self.out = 0;
                    return Ok(DrainOutcome::Eof);
                }
                Err(e) => return Err(CoreError::Io(e)),
            }
        }
    }
}

/// A fixed-capacity byte ring shared between the engine thread (which reads
/// and drains) and, in principle, worker threads performing blocking opens
/// (which only ever push a synthetic header line). See the crate's
/// concurrency notes for why the mutex is the sole cross-thread surface.
pub struct RingBuffer {
    name: Box<str>,
    inner: Mutex<Ring>,
}

impl RingBuffer {
    #[must_use]
    pub fn new(name: impl Into<Box<str>>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Ring::new(capacity)),
        }
    }

    #[must_use]
    pub fn with_default_capacity(name: impl Into<Box<str>>) -> Self {
        Self::new(name, DEFAULT_CAPACITY)
    }

    /// Admit up to `src.len()` bytes. Never blocks; overwrites the oldest
    /// bytes if the ring cannot hold the full payload. Always returns
    /// `src.len()` (the producer's bytes are always "accepted", even if
    /// some are immediately overwritten), unless the ring has already seen
    /// EOF, in which case it returns [`CoreError::Closed`].
    pub fn push(&self, src: &[u8]) -> Result<usize> {
        self.inner.lock().push(src, &self.name)
    }

    /// Write the contiguous prefix to a sink via one call to `write`. See
    /// [`DrainOutcome`] for the possible results.
    pub fn drain_once(&self, write: impl FnMut(&[u8]) -> io::Result<usize>) -> Result<DrainOutcome> {
        self.inner.lock().drain_once(write)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    #[must_use]
    pub fn got_eof(&self) -> bool {
        self.inner.lock().got_eof
    }

    /// Mark the ring as having seen EOF: no further pushes will succeed.
    pub fn set_eof(&self) {
        self.inner.lock().got_eof = true;
    }

    /// Clear EOF, e.g. after a fully-closed object is reopened in a new
    /// epoch.
    pub fn clear_eof(&self) {
        self.inner.lock().got_eof = false;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
