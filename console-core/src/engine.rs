//! Readiness-driven I/O engine (C5).
//!
//! One [`mio::Poll`] instance multiplexes every console device, log file,
//! and client socket. Each tick: drain the signal self-pipe, accept new
//! clients, then for every other readable token pull bytes into the
//! appropriate ring(s), and for every writable token drain one pending
//! write. Nothing here ever calls a blocking read or write; everything
//! goes through `EAGAIN`/`EWOULDBLOCK` and comes back around on the next
//! tick, per §5's readiness contract.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::{SIGHUP, SIGTERM};
use signal_hook_mio::v0_8::Signals;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control::{ControlCommand, Parser as ControlParser};
use crate::error::{CoreError, Result};
use crate::link;
use crate::object::{Object, ObjectId, ObjectKind};
use crate::opener::Opener;
use crate::reconnect::ReconnectState;
use crate::registry::Registry;

const LISTENER_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);
const FIRST_DYNAMIC_TOKEN: usize = 2;

/// How long a `poll` call waits with no readiness events before returning
/// anyway, so the idle-timeout sweep and the EOF/close bookkeeping run
/// even on a quiet server.
const IDLE_TICK: Duration = Duration::from_secs(5);

/// What the engine did on one call to [`Engine::tick`]; mainly useful to
/// tests and to the daemon's top-level loop for logging/exit decisions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub accepted: usize,
    pub closed: usize,
    pub shutdown_requested: bool,
}

pub struct Engine {
    poll: Poll,
    events: Events,
    registry: Registry,
    opener: Box<dyn Opener>,
    listener: mio::net::TcpListener,
    signals: Signals,
    fd_tokens: HashMap<Token, ObjectId>,
    id_tokens: HashMap<ObjectId, Token>,
    next_token: usize,
    /// Which console a client is currently viewing (writer or spy),
    /// independent of write permission; `ControlCommand::AttachTo` and
    /// detach/steal bookkeeping keep this in sync with the graph.
    client_console: HashMap<ObjectId, ObjectId>,
    parsers: HashMap<ObjectId, ControlParser>,
    truncate_logs: bool,
    idle_timeout: Option<Duration>,
    /// Per-console reopen backoff: a console whose transport just failed
    /// to open is not retried on every single client attach attempt (a
    /// serial adapter that was just unplugged won't reappear in a tight
    /// loop). Reset on a successful open.
    reconnect: HashMap<ObjectId, ReconnectState>,
    retry_after: HashMap<ObjectId, Instant>,
}

impl Engine {
    /// Build the engine from a parsed config: bind the client listener,
    /// register signal handling, and pre-register (but do not open) every
    /// configured console and its log file. Consoles open lazily on
    /// first attach (§4.2); this keeps a server with 200 consoles from
    /// holding 200 serial fds open before anyone is watching any of them.
    pub fn new(config: &Config, opener: Box<dyn Opener>, truncate_logs: bool) -> Result<Self> {
        let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port)
            .parse()
            .map_err(|e| CoreError::config(format!("invalid server port: {e}")))?;
        let mut listener = mio::net::TcpListener::bind(addr)?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mut signals = Signals::new([SIGTERM, SIGHUP])?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;

        let mut engine = Self {
            poll,
            events: Events::with_capacity(256),
            registry: Registry::new(),
            opener,
            listener,
            signals,
            fd_tokens: HashMap::new(),
            id_tokens: HashMap::new(),
            next_token: FIRST_DYNAMIC_TOKEN,
            client_console: HashMap::new(),
            parsers: HashMap::new(),
            truncate_logs,
            idle_timeout: None,
            reconnect: HashMap::new(),
            retry_after: HashMap::new(),
        };

        for spec in &config.consoles {
            let console_id = engine.registry.reserve_id();
            engine.registry.insert(Object::new_console(
                console_id,
                spec.name.clone(),
                spec.device.clone(),
                spec.baud,
                spec.reset.clone(),
            ))?;
            if let Some(log_path) = &spec.log {
                let log_id = engine.registry.reserve_id();
                engine
                    .registry
                    .insert(Object::new_logfile(log_id, log_path.clone()))?;
                link::attach(
                    &mut engine.registry,
                    &*engine.opener,
                    console_id,
                    log_id,
                    false,
                    truncate_logs,
                )?;
                engine
                    .registry
                    .get_mut(log_id)
                    .expect("just inserted")
                    .set_writer(Some(console_id));

                // `attach` above just opened both ends eagerly (a console
                // declared with `LOG=` is active from startup, unlike a
                // bare console, which stays inactive until a client
                // attaches). Neither fd is registered with `mio::Poll` yet
                // by virtue of being open, so do that now, or the console
                // is never read and the log file is never drained. The
                // console's own ring is empty at this point (nothing
                // queued to send back to the device yet), so it only
                // needs `READABLE`; `WRITABLE` is armed dynamically the
                // first time something is pushed into its ring. The log
                // file's ring already holds the header line `attach` just
                // wrote, so it registers `WRITABLE` right away.
                engine.register_object(console_id, Interest::READABLE)?;
                engine.register_object(log_id, Interest::WRITABLE)?;
            }
        }

        Ok(engine)
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The address the client listener actually bound to; mainly useful
    /// for tests that bind to port 0 and need to connect back.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    fn allocate_token(&mut self, id: ObjectId) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.fd_tokens.insert(token, id);
        self.id_tokens.insert(id, token);
        token
    }

    fn register_object(&mut self, id: ObjectId, interest: Interest) -> Result<()> {
        let raw = self
            .registry
            .get(id)
            .and_then(Object::fd)
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| CoreError::config("cannot register an unopened object"))?;
        let token = self.allocate_token(id);
        self.poll
            .registry()
            .register(&mut SourceFd(&raw), token, interest)?;
        Ok(())
    }

    fn deregister_object(&mut self, id: ObjectId, raw: RawFd) {
        if let Some(token) = self.id_tokens.remove(&id) {
            self.fd_tokens.remove(&token);
        }
        let _ = self.poll.registry().deregister(&mut SourceFd(&raw));
    }

    /// The interest an object always wants, independent of whatever is
    /// currently queued in its ring. A log file wants nothing on its own
    /// (it never gets read from); a console or client socket always wants
    /// `READABLE`.
    fn base_interest(kind: ObjectKind) -> Option<Interest> {
        match kind {
            ObjectKind::LogFile => None,
            ObjectKind::Console | ObjectKind::ClientSocket => Some(Interest::READABLE),
        }
    }

    /// Arm `WRITABLE` for an object whose ring just went from empty to
    /// non-empty. `mio::Poll` is edge-triggered: the one-time `WRITABLE`
    /// edge delivered at registration is consumed against whatever the fd's
    /// state happened to be at the time, typically an empty ring, and is
    /// never reported again just because a ring filled up later. Every
    /// site that pushes bytes into an object's ring calls this afterward
    /// so the next `tick` actually drains it.
    fn rearm_writable(&mut self, id: ObjectId) {
        let Some(object) = self.registry.get(id) else { return };
        let kind = object.kind();
        let Some(raw) = object.fd().map(AsRawFd::as_raw_fd) else { return };
        let interest = Self::base_interest(kind).map_or(Interest::WRITABLE, |base| base.add(Interest::WRITABLE));
        if let Some(&token) = self.id_tokens.get(&id) {
            if self.poll.registry().reregister(&mut SourceFd(&raw), token, interest).is_ok() {
                return;
            }
        }
        // Not registered at all yet (a log file whose ring had drained
        // to nothing and been fully deregistered) -- register fresh.
        let _ = self.register_object(id, interest);
    }

    /// Drop `WRITABLE` interest once a drain leaves an object's ring dry,
    /// so a quiet client doesn't keep generating ignored writable edges.
    /// For a log file (no base interest of its own) this deregisters the
    /// fd entirely until `rearm_writable` brings it back.
    fn disarm_writable(&mut self, id: ObjectId) {
        let Some(object) = self.registry.get(id) else { return };
        let kind = object.kind();
        let Some(raw) = object.fd().map(AsRawFd::as_raw_fd) else { return };
        match Self::base_interest(kind) {
            Some(base) => {
                if let Some(&token) = self.id_tokens.get(&id) {
                    let _ = self.poll.registry().reregister(&mut SourceFd(&raw), token, base);
                }
            }
            None => self.deregister_object(id, raw),
        }
    }

    /// Attach a client to a console, opening the console's transport (and
    /// registering it for readiness) on first use. Mirrors the `&!name`
    /// control command and the initial connect-time attach.
    ///
    /// If the console's most recent open attempt failed, new attaches are
    /// refused until the backoff interval in `self.reconnect` elapses,
    /// rather than re-spawning a broken reset program or re-dialing a
    /// disconnected serial adapter on every single client connection.
    pub fn attach_client(&mut self, client: ObjectId, console_name: &str, want_write: bool) -> Result<()> {
        let console_id = self
            .registry
            .find(ObjectKind::Console, console_name)
            .ok_or_else(|| CoreError::config(format!("no such console '{console_name}'")))?;

        let was_open = self.registry.get(console_id).map(Object::is_open).unwrap_or(false);
        if !was_open {
            if let Some(retry_at) = self.retry_after.get(&console_id) {
                if Instant::now() < *retry_at {
                    return Err(CoreError::open_failed(
                        console_name,
                        "backing off after a recent failed open attempt",
                    ));
                }
            }
        }

        let outcome = match link::attach(
            &mut self.registry,
            &*self.opener,
            console_id,
            client,
            want_write,
            self.truncate_logs,
        ) {
            Ok(outcome) => {
                self.reconnect.entry(console_id).or_default().reset();
                self.retry_after.remove(&console_id);
                outcome
            }
            Err(e @ CoreError::OpenFailed { .. }) => {
                let delay = self.reconnect.entry(console_id).or_default().next_delay();
                self.retry_after.insert(console_id, Instant::now() + delay);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if !was_open {
            self.register_object(console_id, Interest::READABLE)?;
        }
        self.client_console.insert(client, console_id);
        if let link::AttachOutcome::Stole(previous) = outcome {
            // `link::attach` already queued the steal notice on the
            // displaced writer's own ring (it has no access to this
            // engine's `Poll`), so rearm `WRITABLE` before closing it or
            // the drain-then-close tail (§4.4) never gets a writable edge
            // to flush that notice on.
            self.rearm_writable(previous);
            self.close_object(previous);
        }
        Ok(())
    }

    fn detach_client(&mut self, client: ObjectId) -> Result<()> {
        if let Some(console_id) = self.client_console.remove(&client) {
            link::detach(&mut self.registry, console_id, client)?;
        }
        Ok(())
    }

    /// Run one readiness wait plus its reaction. The daemon's main loop
    /// calls this in a `while !shutdown` loop; splitting it out like this
    /// keeps the event loop itself unit-testable without a real socket.
    pub fn tick(&mut self) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        self.poll.poll(&mut self.events, Some(IDLE_TICK))?;

        let readiness: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        for (token, readable, writable) in readiness {
            match token {
                LISTENER_TOKEN => summary.accepted += self.accept_all()?,
                SIGNAL_TOKEN => {
                    if self.drain_signals() {
                        summary.shutdown_requested = true;
                    }
                }
                _ => {
                    let Some(&id) = self.fd_tokens.get(&token) else {
                        continue;
                    };
                    if readable {
                        if self.handle_readable(id)? {
                            summary.closed += 1;
                            continue;
                        }
                    }
                    if writable && self.handle_writable(id)? {
                        summary.closed += 1;
                    }
                }
            }
        }

        self.sweep_idle_clients();
        Ok(summary)
    }

    fn accept_all(&mut self) -> Result<usize> {
        let mut accepted = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let raw = stream.into_raw_fd();
                    // SAFETY: `into_raw_fd` hands us sole ownership; no
                    // other handle to this fd exists.
                    let fd = unsafe { std::os::fd::OwnedFd::from_raw_fd(raw) };
                    let id = self.registry.reserve_id();
                    // `ip:port` rather than just `ip`: the kernel guarantees
                    // no two simultaneously-open connections share a source
                    // (ip, port) pair, so two terminals on the same host
                    // never collide on the registry's name index the way a
                    // bare IP would.
                    let host = format!("{}:{}", addr.ip(), addr.port());
                    let object = Object::new_client(id, "anonymous", &host, fd)?;
                    let name = object.name().to_string();
                    match self.registry.insert(object) {
                        Ok(_) => {
                            self.parsers.insert(id, ControlParser::new());
                            self.register_object(id, Interest::READABLE)?;
                            info!(client = %name, "accepted connection");
                            accepted += 1;
                        }
                        Err(CoreError::Duplicate(_)) => {
                            // A repeat (name, kind) pair; drop this one
                            // connection rather than taking the whole
                            // daemon down. The object (and its owned fd)
                            // is dropped right here, which closes the
                            // socket.
                            warn!(client = %name, "duplicate client identity, dropping connection");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CoreError::Io(e)),
            }
        }
        Ok(accepted)
    }

    /// Returns `true` once all pending signals have been drained and one
    /// of them was a shutdown request (`SIGTERM`). `SIGHUP` triggers a
    /// config reload hook the caller is expected to run between ticks;
    /// the engine itself holds no opinion about reload mechanics.
    fn drain_signals(&mut self) -> bool {
        let mut shutdown = false;
        for signal in self.signals.pending() {
            match signal {
                SIGTERM => shutdown = true,
                SIGHUP => info!("SIGHUP received, reload requested"),
                other => debug!(signal = other, "ignoring unhandled signal"),
            }
        }
        shutdown
    }

    /// Returns `true` if the object was closed as a result (EOF or fatal
    /// error), in which case the caller must not touch its token again.
    fn handle_readable(&mut self, id: ObjectId) -> Result<bool> {
        let Some(object) = self.registry.get(id) else {
            return Ok(true);
        };
        let kind = object.kind();
        let Some(raw) = object.fd().map(AsRawFd::as_raw_fd) else {
            return Ok(false);
        };

        let mut buf = [0u8; 4096];
        loop {
            match nix::unistd::read(raw, &mut buf) {
                Ok(0) => return Ok(self.close_object(id)),
                Ok(n) => self.route_input(id, kind, &buf[..n])?,
                Err(nix::errno::Errno::EAGAIN) => return Ok(false),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    let err = CoreError::Io(std::io::Error::from_raw_os_error(e as i32));
                    if err.is_fatal() {
                        warn!(object = id, error = %err, "fatal read error, closing object");
                    } else {
                        debug!(object = id, error = %err, "read error, closing object");
                    }
                    return Ok(self.close_object(id));
                }
            }
        }
    }

    fn route_input(&mut self, id: ObjectId, kind: ObjectKind, data: &[u8]) -> Result<()> {
        match kind {
            ObjectKind::Console => {
                let readers = self.registry.get(id).map(|o| o.readers().to_vec()).unwrap_or_default();
                for reader in readers {
                    let wrote = match self.registry.get(reader) {
                        Some(reader_obj) => {
                            reader_obj.write_in(data)?;
                            true
                        }
                        None => false,
                    };
                    if wrote {
                        self.rearm_writable(reader);
                    }
                }
            }
            ObjectKind::ClientSocket => self.route_client_input(id, data)?,
            ObjectKind::LogFile => {
                // Log files are write-only from the engine's perspective.
            }
        }
        Ok(())
    }

    fn route_client_input(&mut self, client: ObjectId, data: &[u8]) -> Result<()> {
        let parser = self.parsers.entry(client).or_default();
        let (passthrough, commands) = parser.feed_chunk(data);

        if !passthrough.is_empty() {
            if let Some(&console_id) = self.client_console.get(&client) {
                let is_writer = self
                    .registry
                    .get(console_id)
                    .map(|c| c.writer() == Some(client))
                    .unwrap_or(false);
                if is_writer {
                    let wrote = match self.registry.get(console_id) {
                        Some(console) => {
                            console.write_in(&passthrough)?;
                            true
                        }
                        None => false,
                    };
                    if wrote {
                        self.rearm_writable(console_id);
                    }
                }
            }
        }

        for command in commands {
            match command {
                ControlCommand::Detach => self.detach_client(client)?,
                ControlCommand::AttachTo(name) => {
                    if let Err(e) = self.attach_client(client, &name, true) {
                        let wrote = match self.registry.get(client) {
                            Some(obj) => {
                                let msg = format!("\r\n*** {e} ***\r\n");
                                obj.write_in(msg.as_bytes())?;
                                true
                            }
                            None => false,
                        };
                        if wrote {
                            self.rearm_writable(client);
                        }
                    }
                }
            }
        }
        if let Some(obj) = self.registry.get_mut(client) {
            obj.touch_last_read();
        }
        Ok(())
    }

    /// Returns `true` if the object was fully closed (peer gone or fatal
    /// error) this call; `false` if it is still open, including the
    /// "drain-then-close" deferred state where `got_eof` is set but bytes
    /// remain to flush (§4.4 step 3) -- the caller keeps polling it.
    fn handle_writable(&mut self, id: ObjectId) -> Result<bool> {
        let Some(object) = self.registry.get(id) else {
            return Ok(true);
        };
        let Some(raw) = object.fd().map(AsRawFd::as_raw_fd) else {
            return Ok(false);
        };
        let ring = object.buf();

        let mut eof = false;
        let mut drained_dry = false;
        loop {
            let outcome = ring.drain_once(|chunk| {
                nix::unistd::write(raw, chunk).map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            })?;
            match outcome {
                crate::ring::DrainOutcome::Empty => {
                    eof = ring.got_eof();
                    drained_dry = !eof;
                    break;
                }
                crate::ring::DrainOutcome::Wrote(_) => continue,
                crate::ring::DrainOutcome::WouldBlock => break,
                crate::ring::DrainOutcome::Eof => {
                    eof = true;
                    break;
                }
            }
        }
        // `ring`/`object` borrow `self.registry`; that borrow ends here,
        // above the `&mut self` calls below.
        if eof {
            return Ok(self.close_object(id));
        }
        if drained_dry {
            // Nothing left to write; drop `WRITABLE` until `rearm_writable`
            // brings it back on the next push, per mio's edge-triggered
            // readiness (see `rearm_writable`).
            self.disarm_writable(id);
        }
        Ok(false)
    }

    /// Run [`link::close`] and, once it has actually cleared the fd (the
    /// ring may still hold bytes, in which case `link::close` only marks
    /// `got_eof` and leaves the fd registered so draining continues),
    /// tear down this engine's own bookkeeping. Returns `true` once the
    /// object is fully torn down (fd closed, and for a `ClientSocket`,
    /// removed from the registry); `false` if the close is still
    /// deferred and the caller should keep polling this id.
    fn close_object(&mut self, id: ObjectId) -> bool {
        let raw = self.registry.get(id).and_then(Object::fd).map(AsRawFd::as_raw_fd);
        self.parsers.remove(&id);
        let _ = self.detach_client(id);
        if let Err(e) = link::close(&mut self.registry, id) {
            warn!(object = id, error = %e, "error during close");
        }
        let drained = match self.registry.get(id) {
            Some(object) => !object.is_open(),
            None => true,
        };
        if drained {
            if let Some(raw) = raw {
                self.deregister_object(id, raw);
            }
        }
        drained
    }

    fn sweep_idle_clients(&mut self) {
        let Some(timeout) = self.idle_timeout else { return };
        let expired: Vec<ObjectId> = self
            .registry
            .iter()
            .filter(|(_, o)| o.kind() == ObjectKind::ClientSocket)
            .filter_map(|(&id, o)| {
                let last = o.time_last_read()?;
                let elapsed = last.elapsed().unwrap_or_default();
                (elapsed >= timeout).then_some(id)
            })
            .collect();
        for id in expired {
            info!(client = id, "idle timeout, disconnecting");
            self.close_object(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opener::NullOpener;

    #[test]
    fn new_engine_binds_and_preregisters_consoles() {
        let config = Config::parse(
            r#"
            SERVER PORT=0
            CONSOLE NAME=c1 DEV="/dev/null" BPS=9600
            "#,
        )
        .unwrap();
        let engine = Engine::new(&config, Box::new(NullOpener), false).unwrap();
        assert_eq!(engine.registry().len(), 1);
    }
}
