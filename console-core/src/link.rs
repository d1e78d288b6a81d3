//! Link manager (C4): attach, detach, and cascading close over the object
//! graph, including the "steal" protocol described in §4.4.
//!
//! Every edge in the graph is a `writer -> reader` pair: `writer`'s output
//! flows into `reader`'s ring. Two independent edges connect a console to
//! one of its clients: the console's own output fans out to the client
//! (`client.writer = console`, the client is one of `console.readers`),
//! and, for at most one client at a time, that client's keystrokes flow
//! back into the console (`console.writer = client`, the console is one
//! of `client.readers`). [`link_edge`]/[`unlink_edge`] keep both sides of
//! whichever edge they touch in sync, which is what makes invariant 1
//! (`a ∈ b.readers ⇔ a.writer = b`) hold for either direction.

use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::object::{ObjectId, ObjectKind};
use crate::opener::Opener;
use crate::registry::Registry;

/// What happened as a side effect of [`attach`]. `Stole` tells the caller
/// that the named client was just displaced and must be closed (the
/// engine, not the link manager, owns fd/token teardown, so it performs
/// the actual [`close`] call).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Attached as a read-only spy; no writer change.
    Spied,
    /// Attached as the sole writer; no previous writer existed.
    Claimed,
    /// Attached as the writer, displacing the named client, which must
    /// now be closed by the caller.
    Stole(ObjectId),
}

/// Create the edge `writer -> reader`: `reader.writer = writer` and
/// `reader` is added to `writer.readers`, maintaining invariant 1.
/// No-op if the edge already exists.
fn link_edge(registry: &mut Registry, writer: ObjectId, reader: ObjectId) {
    let already = registry
        .get(writer)
        .map(|w| w.readers().contains(&reader))
        .unwrap_or(false);
    if !already {
        if let Some(w) = registry.get_mut(writer) {
            w.readers_mut().push(reader);
        }
    }
    if let Some(r) = registry.get_mut(reader) {
        r.set_writer(Some(writer));
    }
}

/// Remove the edge `writer -> reader`, if present. Safe to call on ids
/// that no longer exist (e.g. mid-cascade).
fn unlink_edge(registry: &mut Registry, writer: ObjectId, reader: ObjectId) {
    if let Some(w) = registry.get_mut(writer) {
        w.readers_mut().retain(|&r| r != reader);
    }
    if let Some(r) = registry.get_mut(reader) {
        if r.writer() == Some(writer) {
            r.set_writer(None);
        }
    }
}

/// Attach `reader` (always a `ClientSocket`) to `console`. Opens the
/// console's transport first if it is not already open. The console's
/// output always starts fanning out to `reader` immediately (every
/// attached client watches, regardless of write access). When
/// `want_write` is set and the console already has a different writer,
/// that writer is demoted: a notice is queued on its ring and the caller
/// must invoke [`close`] on it (see [`AttachOutcome::Stole`]).
pub fn attach(
    registry: &mut Registry,
    opener: &dyn Opener,
    console: ObjectId,
    reader: ObjectId,
    want_write: bool,
    truncate: bool,
) -> Result<AttachOutcome> {
    {
        let console_obj = registry
            .get_mut(console)
            .ok_or_else(|| CoreError::config("attach target no longer exists"))?;
        if console_obj.kind() != ObjectKind::Console {
            return Err(CoreError::config("attach target is not a console"));
        }
        console_obj.open(opener, None, false)?;
    }

    // If either endpoint is inactive, open it (§4.4). A `ClientSocket`
    // reader is always already open; a `LogFile` reader opens here on
    // first attach, writing its header with the console's name.
    let console_name = registry.get(console).map(|c| c.name().to_string());
    if let Some(reader_obj) = registry.get_mut(reader) {
        reader_obj.open(opener, console_name.as_deref(), truncate)?;
    }

    // Edge: console's output fans out to `reader` (spy, logfile, or the
    // client about to claim write access -- everyone attached sees it).
    link_edge(registry, console, reader);

    if !want_write {
        debug!(reader, console, "attached read-only");
        return Ok(AttachOutcome::Spied);
    }

    let current_writer = registry.get(console).and_then(|c| c.writer());
    let outcome = match current_writer {
        None => AttachOutcome::Claimed,
        Some(same) if same == reader => AttachOutcome::Claimed,
        Some(previous) => {
            steal_notice(registry, previous, reader, console)?;
            info!(reader, console, previous, "stole write access");
            AttachOutcome::Stole(previous)
        }
    };

    // Edge: `reader`'s keystrokes flow into `console` (the single
    // explicit-writer edge, invariant 4). Replacing a previous writer
    // clears only this edge; the previous writer keeps its own spy edge
    // (console -> previous) until the caller closes it.
    if let Some(previous) = current_writer {
        if previous != reader {
            unlink_edge(registry, previous, console);
        }
    }
    link_edge(registry, reader, console);

    if matches!(outcome, AttachOutcome::Claimed) {
        debug!(reader, console, "claimed write access");
    }
    Ok(outcome)
}

/// Queue a steal notice on the displaced writer's own ring, per §4.4:
/// `"\nConsole '<dst.name>' stolen by <<src.name>> at <timestamp>.\n"`.
fn steal_notice(
    registry: &mut Registry,
    displaced: ObjectId,
    stealer: ObjectId,
    console: ObjectId,
) -> Result<()> {
    let console_name = registry
        .get(console)
        .map(|c| c.name().to_string())
        .unwrap_or_default();
    let stealer_name = registry
        .get(stealer)
        .map(|c| c.name().to_string())
        .unwrap_or_default();
    if let Some(obj) = registry.get(displaced) {
        let now = chrono::Local::now();
        let notice = format!(
            "\nConsole '{console_name}' stolen by <{stealer_name}> at {}.\n",
            now.format("%a %b %e %H:%M:%S %Y")
        );
        obj.write_in(notice.as_bytes())?;
    }
    Ok(())
}

/// Detach `reader` from `console`: removes both the output fan-out edge
/// and, if `reader` held write access, the input edge. A displaced spy
/// is not auto-promoted; the console is simply left writerless until the
/// next explicit `attach` with `want_write`.
pub fn detach(registry: &mut Registry, console: ObjectId, reader: ObjectId) -> Result<()> {
    unlink_edge(registry, console, reader);
    unlink_edge(registry, reader, console);
    debug!(reader, console, "detached");
    Ok(())
}

fn is_orphaned(registry: &Registry, id: ObjectId) -> bool {
    registry
        .get(id)
        .map(|o| o.writer().is_none() && o.readers().is_empty())
        .unwrap_or(false)
}

/// Close an object: drain-then-close per §4.4.
///
/// 1. If the object has a writer, detach from it; if the writer is now
///    orphaned (no writer, no readers), recursively close it.
/// 2. Detach every reader; any reader left orphaned is recursively
///    closed.
/// 3. If the object's own ring still holds bytes, mark it EOF and leave
///    the fd alone -- [`finish_close`] completes the job once the I/O
///    engine drains the ring dry.
/// 4. Otherwise, close the fd. `ClientSocket` objects are removed from
///    the registry outright; `Console` and `LogFile` objects persist,
///    inactive, until reopened or the daemon shuts down.
///
/// Idempotent: closing an id that no longer exists is a no-op.
pub fn close(registry: &mut Registry, id: ObjectId) -> Result<()> {
    if registry.get(id).is_none() {
        return Ok(());
    }
    if let Some(writer_id) = registry.get(id).and_then(|o| o.writer()) {
        unlink_edge(registry, writer_id, id);
        if is_orphaned(registry, writer_id) {
            close(registry, writer_id)?;
        }
    }
    finish_close_readers(registry, id)?;
    finish_close(registry, id)
}

fn finish_close_readers(registry: &mut Registry, id: ObjectId) -> Result<()> {
    let readers = registry.get(id).map(|o| o.readers().to_vec()).unwrap_or_default();
    for reader_id in readers {
        unlink_edge(registry, id, reader_id);
        if is_orphaned(registry, reader_id) {
            close(registry, reader_id)?;
        }
    }
    Ok(())
}

/// The drain-then-close tail: steps 3/4 above. Exposed so the I/O engine
/// can re-invoke it once a deferred (EOF-marked, non-empty-ring) object
/// finishes draining.
pub fn finish_close(registry: &mut Registry, id: ObjectId) -> Result<()> {
    let Some(object) = registry.get(id) else {
        return Ok(());
    };
    if !object.buf().is_empty() {
        object.buf().set_eof();
        return Ok(());
    }
    let kind = object.kind();
    let name = object.name().to_string();
    if let Some(object) = registry.get_mut(id) {
        object.close_fd();
    }
    info!(object = %name, %kind, "closed");
    if kind == ObjectKind::ClientSocket {
        registry.remove(id);
    }
    Ok(())
}
