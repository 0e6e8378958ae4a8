// Session table and the cooperative loop that owns it.
//
// `SessionManager` holds every session this process has: listening endpoints,
// sockets accepted on them, and outbound connections. All session state lives
// on one thread, the one that calls `exec()`. Socket work happens on helper
// threads (the shared accept thread and reader threads from `listener.rs`,
// plus one short-lived thread per outbound connect), and those threads only
// ever *submit* a `Command` over an unbounded `mpsc` channel. `exec()` waits
// up to its budget for the first command (`recv_timeout`), then drops a
// `PassEnd` marker at the back of the channel and drains up to it
// (`try_recv`). Commands submitted during the pass, including by the pass's
// own actions, land behind the marker and wait for the next `exec()`.
//
// Lifecycle hooks (`on_session_create`, `on_session_parse`,
// `on_session_delete`) run on the loop thread with `&mut SessionManager`, so
// a hook can send, close, connect or inspect sessions directly. A hook list
// is taken out of the manager while it runs and restored afterwards; hooks
// registered from inside a hook are appended and fire from the next event.
// A panicking hook is logged and the remaining hooks still run.
//
// Closing is lazy: `close_session` only shuts the socket down (or stops the
// accept thread). The reader's fault, or the accept thread's exit, comes back
// through the channel and is the single point where a session is deleted, so
// the delete hook fires exactly once. The session is still in the table, in
// state `Closing`, while delete hooks run.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use switchboard_protocol::{SessionDescriptor, SessionType};
use tracing::{Span, debug, error, info, info_span, warn};

use crate::error::NetError;
use crate::listener::{AcceptHandler, Acceptor, SEND_TIMEOUT, spawn_reader};
use crate::router::panic_message;

/// Upper bound on an outbound connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opaque, monotonically increasing session handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Outbound connect still in flight.
    Connecting,
    Open,
    /// Shut down or faulted; deletion is pending or in progress.
    Closing,
    Closed,
}

/// One logical connection (or listening endpoint).
pub struct Session {
    id: SessionId,
    kind: SessionType,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    conntime: DateTime<Utc>,
    state: SessionState,
    rfifo: Vec<u8>,
    stream: Option<TcpStream>,
    /// Bytes sent while `Connecting`, flushed once the connect succeeds.
    pending_out: Vec<u8>,
    acceptor: Option<Acceptor>,
}

impl Session {
    fn new(
        id: SessionId,
        kind: SessionType,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        state: SessionState,
    ) -> Self {
        Self {
            id,
            kind,
            local,
            remote,
            conntime: Utc::now(),
            state,
            rfifo: Vec::new(),
            stream: None,
            pending_out: Vec::new(),
            acceptor: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> SessionType {
        self.kind
    }

    /// Local endpoint; `None` until an outbound connect completes.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Remote endpoint; `None` for listen sessions.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn conntime(&self) -> DateTime<Utc> {
        self.conntime
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bytes received and not yet consumed.
    pub fn rfifo(&self) -> &[u8] {
        &self.rfifo
    }

    /// Drop the first `n` buffered bytes (clamped to what is buffered).
    pub fn rfifo_skip(&mut self, n: usize) {
        let n = n.min(self.rfifo.len());
        self.rfifo.drain(..n);
    }

    /// Take the whole buffered span, leaving the buffer empty.
    pub fn rfifo_take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.rfifo)
    }

    /// Wire description of this session for the session-admin services.
    pub fn descriptor(&self) -> SessionDescriptor {
        let local = self
            .local
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        let conntime = match self.kind {
            SessionType::Listen => None,
            SessionType::Accept | SessionType::Connect => Some(self.conntime),
        };
        SessionDescriptor::new(self.kind, local, self.remote, conntime)
    }

    fn write(&mut self, bytes: &[u8]) {
        let Some(stream) = &self.stream else {
            return;
        };
        let mut writer: &TcpStream = stream;
        if let Err(e) = writer.write_all(bytes) {
            warn!(session = %self.id, error = %e, "write failed, closing session");
            let _ = stream.shutdown(Shutdown::Both);
            self.state = SessionState::Closing;
        }
    }

    fn shutdown(&mut self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(mut acceptor) = self.acceptor.take() {
            acceptor.stop();
        }
    }

    #[cfg(test)]
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.rfifo.extend_from_slice(bytes);
    }
}

/// Work submitted to the loop thread.
enum Command {
    Accepted {
        listen: SessionId,
        stream: TcpStream,
        remote: SocketAddr,
    },
    ListenStopped {
        listen: SessionId,
    },
    Connected {
        session: SessionId,
        result: io::Result<TcpStream>,
    },
    Data {
        session: SessionId,
        bytes: Vec<u8>,
    },
    Fault {
        session: SessionId,
        error: io::Error,
    },
    Invoke(Box<dyn FnOnce(&mut SessionManager) + Send>),
    /// Boundary of the current `exec()` pass.
    PassEnd,
}

/// Cloneable handle for running closures on a manager's loop thread.
#[derive(Clone)]
pub struct Invoker {
    tx: Sender<Command>,
}

impl Invoker {
    /// Queue `action` for the next `exec()`. Returns `false` if the manager
    /// has been dropped.
    pub fn begin_invoke(&self, action: impl FnOnce(&mut SessionManager) + Send + 'static) -> bool {
        self.tx.send(Command::Invoke(Box::new(action))).is_ok()
    }
}

/// Lifecycle hook; runs on the loop thread.
pub type SessionHook = Box<dyn FnMut(&mut SessionManager, SessionId) + Send>;

#[derive(Clone, Copy)]
enum Hook {
    Create,
    Parse,
    Delete,
}

#[derive(Default)]
struct Hooks {
    create: Vec<SessionHook>,
    parse: Vec<SessionHook>,
    delete: Vec<SessionHook>,
}

impl Hooks {
    fn list(&mut self, hook: Hook) -> &mut Vec<SessionHook> {
        match hook {
            Hook::Create => &mut self.create,
            Hook::Parse => &mut self.parse,
            Hook::Delete => &mut self.delete,
        }
    }
}

/// Owns all sessions and the command channel feeding them.
pub struct SessionManager {
    span: Span,
    sessions: BTreeMap<SessionId, Session>,
    next_id: u64,
    tx: Sender<Command>,
    rx: Receiver<Command>,
    hooks: Hooks,
}

impl SessionManager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            span: info_span!("sessions"),
            sessions: BTreeMap::new(),
            next_id: 0,
            tx,
            rx,
            hooks: Hooks::default(),
        }
    }

    /// Use `span` as the logging context for the manager and its threads.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn on_session_create(
        &mut self,
        hook: impl FnMut(&mut SessionManager, SessionId) + Send + 'static,
    ) {
        self.hooks.create.push(Box::new(hook));
    }

    /// Fires after new bytes have been appended to a session's buffer.
    pub fn on_session_parse(
        &mut self,
        hook: impl FnMut(&mut SessionManager, SessionId) + Send + 'static,
    ) {
        self.hooks.parse.push(Box::new(hook));
    }

    pub fn on_session_delete(
        &mut self,
        hook: impl FnMut(&mut SessionManager, SessionId) + Send + 'static,
    ) {
        self.hooks.delete.push(Box::new(hook));
    }

    pub fn invoker(&self) -> Invoker {
        Invoker {
            tx: self.tx.clone(),
        }
    }

    /// Queue `action` to run on the loop thread during a later `exec()`.
    pub fn begin_invoke(&self, action: impl FnOnce(&mut SessionManager) + Send + 'static) {
        let _ = self.tx.send(Command::Invoke(Box::new(action)));
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// All sessions, in creation order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn allocate_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    /// Listen on `endpoint`. Each accepted socket becomes an `accept` session.
    pub fn listen(&mut self, endpoint: SocketAddr) -> Result<SessionId, NetError> {
        let id = self.allocate_id();
        let handler = SessionAcceptor {
            listen: id,
            tx: self.tx.clone(),
        };
        let acceptor = Acceptor::start(endpoint, self.span.clone(), handler)?;
        let local = acceptor.local_addr();

        let mut session = Session::new(
            id,
            SessionType::Listen,
            Some(local),
            None,
            SessionState::Open,
        );
        session.acceptor = Some(acceptor);
        self.sessions.insert(id, session);
        self.span
            .in_scope(|| info!(session = %id, %local, "listen session created"));
        self.emit(Hook::Create, id);
        Ok(id)
    }

    /// Start an outbound connection. The session is returned in state
    /// `Connecting`; it becomes `Open` or is deleted during a later `exec()`.
    pub fn connect(&mut self, endpoint: SocketAddr) -> SessionId {
        let id = self.allocate_id();
        self.sessions.insert(
            id,
            Session::new(
                id,
                SessionType::Connect,
                None,
                Some(endpoint),
                SessionState::Connecting,
            ),
        );

        let tx = self.tx.clone();
        let span = self.span.clone();
        let spawned = thread::Builder::new()
            .name(format!("connect-{endpoint}"))
            .spawn(move || {
                let _entered = span.enter();
                let result = TcpStream::connect_timeout(&endpoint, CONNECT_TIMEOUT);
                let _ = tx.send(Command::Connected {
                    session: id,
                    result,
                });
            });
        if let Err(e) = spawned {
            let _ = self.tx.send(Command::Connected {
                session: id,
                result: Err(e),
            });
        }

        self.span
            .in_scope(|| info!(session = %id, remote = %endpoint, "connecting"));
        self.emit(Hook::Create, id);
        id
    }

    /// Write `bytes` on a session. Bytes sent while connecting are held until
    /// the connect completes; sends to unknown, closing or listen sessions
    /// are ignored.
    pub fn send_session(&mut self, id: SessionId, bytes: &[u8]) {
        let _entered = self.span.enter();
        let Some(session) = self.sessions.get_mut(&id) else {
            debug!(session = %id, "send to unknown session ignored");
            return;
        };
        match (session.state, session.kind) {
            (SessionState::Connecting, _) => session.pending_out.extend_from_slice(bytes),
            (SessionState::Open, SessionType::Accept | SessionType::Connect) => {
                session.write(bytes);
            }
            (state, kind) => {
                debug!(session = %id, ?state, %kind, "send ignored");
            }
        }
    }

    /// Shut a session down. Deletion is reported later, once.
    pub fn close_session(&mut self, id: SessionId) {
        let _entered = self.span.enter();
        if let Some(session) = self.sessions.get_mut(&id) {
            debug!(session = %id, "closing session");
            session.state = SessionState::Closing;
            session.shutdown();
        }
    }

    /// Run one pass of the loop: wait up to `budget` for work, then handle
    /// everything queued at that moment. Work submitted while the pass runs
    /// is left for the next call. Returns the number of commands handled.
    pub fn exec(&mut self, budget: Duration) -> usize {
        let first = loop {
            match self.rx.recv_timeout(budget) {
                // Marker from an `exec()` nested inside an action; not work.
                Ok(Command::PassEnd) => continue,
                Ok(command) => break command,
                Err(_) => return 0,
            }
        };
        // `self` holds a sender, so the channel cannot be disconnected.
        let _ = self.tx.send(Command::PassEnd);
        self.handle(first);
        let mut handled = 1;
        while let Ok(command) = self.rx.try_recv() {
            if matches!(command, Command::PassEnd) {
                break;
            }
            self.handle(command);
            handled += 1;
        }
        handled
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Accepted {
                listen,
                stream,
                remote,
            } => self.on_accepted(listen, stream, remote),
            Command::ListenStopped { listen } => {
                self.delete_session(listen, &"listener stopped");
            }
            Command::Connected { session, result } => self.on_connected(session, result),
            Command::Data { session, bytes } => {
                if let Some(s) = self.sessions.get_mut(&session) {
                    s.rfifo.extend_from_slice(&bytes);
                    self.emit(Hook::Parse, session);
                }
            }
            Command::Fault { session, error } => self.delete_session(session, &error),
            Command::Invoke(action) => action(self),
            Command::PassEnd => {}
        }
    }

    fn on_accepted(&mut self, listen: SessionId, stream: TcpStream, remote: SocketAddr) {
        let id = self.allocate_id();
        let mut session = Session::new(
            id,
            SessionType::Accept,
            stream.local_addr().ok(),
            Some(remote),
            SessionState::Open,
        );
        if let Err(e) = self.arm(id, &stream) {
            self.span
                .in_scope(|| warn!(%remote, error = %e, "dropping accepted socket"));
            return;
        }
        session.stream = Some(stream);
        self.sessions.insert(id, session);
        self.span
            .in_scope(|| info!(session = %id, %listen, %remote, "session accepted"));
        self.emit(Hook::Create, id);
    }

    fn on_connected(&mut self, id: SessionId, result: io::Result<TcpStream>) {
        let Some(connecting) = self
            .sessions
            .get(&id)
            .map(|session| session.state == SessionState::Connecting)
        else {
            return;
        };
        let stream = match result {
            Ok(stream) if connecting => stream,
            Ok(_) => {
                self.delete_session(id, &"closed while connecting");
                return;
            }
            Err(e) => {
                self.delete_session(id, &e);
                return;
            }
        };
        if let Err(e) = self.arm(id, &stream) {
            self.delete_session(id, &e);
            return;
        }

        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.local = stream.local_addr().ok();
        session.stream = Some(stream);
        session.state = SessionState::Open;
        let pending = std::mem::take(&mut session.pending_out);
        if !pending.is_empty() {
            session.write(&pending);
        }
        self.span.in_scope(|| info!(session = %id, "session connected"));
    }

    /// Set the write timeout and start the reader thread for a session.
    fn arm(&self, id: SessionId, stream: &TcpStream) -> io::Result<()> {
        stream.set_write_timeout(Some(SEND_TIMEOUT))?;
        let reader = stream.try_clone()?;
        let data_tx = self.tx.clone();
        let fault_tx = self.tx.clone();
        spawn_reader(
            reader,
            self.span.clone(),
            move |chunk| {
                let _ = data_tx.send(Command::Data {
                    session: id,
                    bytes: chunk.to_vec(),
                });
            },
            move |error| {
                let _ = fault_tx.send(Command::Fault { session: id, error });
            },
        )?;
        Ok(())
    }

    /// The single point where a session leaves the table.
    fn delete_session(&mut self, id: SessionId, reason: &dyn fmt::Display) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.state = SessionState::Closing;
        self.span
            .in_scope(|| info!(session = %id, reason = %reason, "session deleted"));
        self.emit(Hook::Delete, id);
        if let Some(mut session) = self.sessions.remove(&id) {
            session.shutdown();
            session.state = SessionState::Closed;
        }
    }

    fn emit(&mut self, hook: Hook, id: SessionId) {
        let mut running = std::mem::take(self.hooks.list(hook));
        for callback in &mut running {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(self, id)));
            if let Err(payload) = outcome {
                self.span.in_scope(|| {
                    error!(session = %id, panic = panic_message(&*payload), "session hook panicked");
                });
            }
        }
        let added = std::mem::take(self.hooks.list(hook));
        running.extend(added);
        *self.hooks.list(hook) = running;
    }

    #[cfg(test)]
    pub(crate) fn insert_detached(
        &mut self,
        kind: SessionType,
        remote: Option<SocketAddr>,
    ) -> SessionId {
        let id = self.allocate_id();
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, 2000));
        self.sessions.insert(
            id,
            Session::new(id, kind, Some(local), remote, SessionState::Open),
        );
        id
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for session in self.sessions.values_mut() {
            session.shutdown();
        }
    }
}

/// Forwards accepted sockets of one listen session to the loop.
struct SessionAcceptor {
    listen: SessionId,
    tx: Sender<Command>,
}

impl AcceptHandler for SessionAcceptor {
    fn accepted(&mut self, stream: TcpStream, remote: SocketAddr) {
        let _ = self.tx.send(Command::Accepted {
            listen: self.listen,
            stream,
            remote,
        });
    }

    fn stopped(&mut self, _local: SocketAddr) {
        let _ = self.tx.send(Command::ListenStopped {
            listen: self.listen,
        });
    }
}
