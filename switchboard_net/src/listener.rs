// TCP listener with a per-client reader thread and an event fan-out.
//
// Architecture: one accept thread plus one reader thread per client, the same
// thread-per-reader shape the session manager uses. The two building blocks
// are crate-visible so `session.rs` shares them:
//
// - `Acceptor`: binds (refusing endpoints this process already listens on),
//   runs a blocking `accept()` loop on a dedicated thread, and hands every
//   accepted socket to an `AcceptHandler`. `stop()` raises a cancellation flag,
//   releases the listening socket so the blocked `accept()` returns, and joins
//   the thread.
// - `spawn_reader`: a thread that reads into a fixed 8 KB buffer, reports each
//   chunk, and re-arms immediately. EOF and read errors both end in a single
//   `on_fault` call, so a connection has exactly one teardown path.
//
// `ConnectionListener` keeps every live client in one table behind a single
// mutex. The table is only ever shrunk by the reader's fault path; the close
// operations merely shut the socket down and let that path do the removal and
// raise `ClientDisconn`. Writes happen under the table lock with a socket
// write timeout, and events are raised after the lock is released.

use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{Span, debug, info, info_span, warn};

use crate::error::NetError;
use crate::events::{ListenerEvent, Subscribers};

/// Size of the fixed per-connection receive buffer.
pub const RECV_BUFFER_SIZE: usize = 8192;

/// Upper bound on a single blocking socket write.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoints this process currently listens on.
static ACTIVE_LISTENERS: Mutex<BTreeSet<SocketAddr>> = Mutex::new(BTreeSet::new());

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its endpoint from `ACTIVE_LISTENERS` when dropped.
struct Registration(SocketAddr);

impl Drop for Registration {
    fn drop(&mut self) {
        lock(&ACTIVE_LISTENERS).remove(&self.0);
    }
}

/// Callbacks from an accept thread.
pub(crate) trait AcceptHandler: Send + 'static {
    fn started(&mut self, _local: SocketAddr) {}
    fn accepted(&mut self, stream: TcpStream, remote: SocketAddr);
    fn stopped(&mut self, local: SocketAddr);
}

/// A bound listening socket and the thread accepting on it.
pub(crate) struct Acceptor {
    local: SocketAddr,
    cancel: Arc<AtomicBool>,
    /// Second handle on the listening socket, used to unblock `accept()`.
    listener: Option<TcpListener>,
    thread: Option<JoinHandle<()>>,
}

impl Acceptor {
    /// Bind `endpoint` and start accepting on a new thread.
    pub(crate) fn start(
        endpoint: SocketAddr,
        span: Span,
        mut handler: impl AcceptHandler,
    ) -> Result<Self, NetError> {
        let (listener, registration) = {
            let mut active = lock(&ACTIVE_LISTENERS);
            if endpoint.port() != 0 && active.contains(&endpoint) {
                return Err(NetError::AlreadyBound(endpoint));
            }
            let listener = TcpListener::bind(endpoint).map_err(|e| {
                if e.kind() == io::ErrorKind::AddrInUse {
                    NetError::AlreadyBound(endpoint)
                } else {
                    NetError::Io(e)
                }
            })?;
            let local = listener.local_addr()?;
            active.insert(local);
            (listener, Registration(local))
        };
        let local = registration.0;
        let unblock_handle = listener.try_clone()?;
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();

        let thread = thread::Builder::new()
            .name(format!("accept-{local}"))
            .spawn(move || {
                let _entered = span.enter();
                handler.started(local);
                accept_loop(&listener, &cancel_flag, &mut handler);
                drop(listener);
                drop(registration);
                info!(%local, "listener stopped");
                handler.stopped(local);
            })?;

        Ok(Self {
            local,
            cancel,
            listener: Some(unblock_handle),
            thread: Some(thread),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub(crate) fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Cancel the accept loop, release the socket, and wait for the thread.
    /// Safe to call repeatedly, and from the accept thread itself (in which
    /// case the join is skipped).
    pub(crate) fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(listener) = self.listener.take() {
            unblock_accept(&listener, self.local);
        }
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: &TcpListener, cancel: &AtomicBool, handler: &mut impl AcceptHandler) {
    loop {
        match listener.accept() {
            Ok((stream, remote)) => {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                handler.accepted(stream, remote);
            }
            Err(e) if cancel.load(Ordering::SeqCst) => {
                debug!(error = %e, "accept released by stop");
                break;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Make a blocked `accept()` on `listener` return. Shutting the socket down
/// wakes it on Linux; the loopback connect covers platforms where it does not.
fn unblock_accept(listener: &TcpListener, local: SocketAddr) {
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        // SAFETY: the descriptor is owned by `listener`, which outlives the call.
        unsafe {
            libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
    #[cfg(not(unix))]
    let _ = listener;

    let mut wake = local;
    if wake.ip().is_unspecified() {
        wake.set_ip(match local {
            SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
            SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
        });
    }
    let _ = TcpStream::connect_timeout(&wake, Duration::from_millis(200));
}

/// Spawn a reader thread for `stream`. `on_read` gets every received chunk;
/// `on_fault` runs once when the connection ends, with the read error or a
/// synthesized `UnexpectedEof` for an orderly peer shutdown.
pub(crate) fn spawn_reader<R, F>(
    mut stream: TcpStream,
    span: Span,
    mut on_read: R,
    on_fault: F,
) -> io::Result<JoinHandle<()>>
where
    R: FnMut(&[u8]) + Send + 'static,
    F: FnOnce(io::Error) + Send + 'static,
{
    let name = match stream.peer_addr() {
        Ok(peer) => format!("read-{peer}"),
        Err(_) => "read".into(),
    };
    thread::Builder::new().name(name).spawn(move || {
        let _entered = span.enter();
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let error = loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    break io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer shut down the connection",
                    );
                }
                Ok(n) => on_read(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break e,
            }
        };
        on_fault(error);
    })
}

/// One accepted client as tracked by the listener.
struct ClientEntry {
    id: u64,
    local: SocketAddr,
    remote: SocketAddr,
    /// Write/close handle; the reader thread owns its own clone.
    stream: TcpStream,
}

type ClientTable = Arc<Mutex<Vec<ClientEntry>>>;

/// Accepts inbound TCP clients and reports their lifecycle and traffic as
/// `ListenerEvent`s.
pub struct ConnectionListener {
    span: Span,
    events: Arc<Subscribers<ListenerEvent>>,
    clients: ClientTable,
    acceptor: Option<Acceptor>,
}

impl ConnectionListener {
    pub fn new() -> Self {
        Self {
            span: info_span!("listener"),
            events: Arc::new(Subscribers::new()),
            clients: Arc::new(Mutex::new(Vec::new())),
            acceptor: None,
        }
    }

    /// Use `span` as the logging context for this listener and its threads.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Register an event callback. See `events.rs` for ordering and threading.
    pub fn subscribe(&self, callback: impl Fn(&ListenerEvent) + Send + Sync + 'static) {
        self.events.subscribe(callback);
    }

    /// Bind `endpoint` and start accepting. Returns the bound address, which
    /// differs from `endpoint` when port 0 was requested.
    pub fn start(&mut self, endpoint: SocketAddr) -> Result<SocketAddr, NetError> {
        if let Some(acceptor) = &self.acceptor {
            if acceptor.is_running() {
                return Err(NetError::ListenerActive(acceptor.local_addr()));
            }
        }
        self.acceptor = None;

        let handler = ClientAcceptor {
            span: self.span.clone(),
            events: self.events.clone(),
            clients: self.clients.clone(),
            next_id: 0,
        };
        let acceptor = Acceptor::start(endpoint, self.span.clone(), handler)?;
        let local = acceptor.local_addr();
        self.span.in_scope(|| info!(%local, "listener started"));
        self.acceptor = Some(acceptor);
        Ok(local)
    }

    /// Stop accepting. Already-connected clients stay connected.
    pub fn stop(&mut self) {
        if let Some(mut acceptor) = self.acceptor.take() {
            acceptor.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.acceptor.as_ref().is_some_and(Acceptor::is_running)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.as_ref().map(Acceptor::local_addr)
    }

    /// Write `data` to every connected client. Returns the number of clients
    /// the write succeeded for.
    pub fn send_all(&self, data: &[u8]) -> usize {
        self.send_where(data, |_| true)
    }

    /// Write `data` to the client connected from `remote`.
    pub fn send_to(&self, remote: SocketAddr, data: &[u8]) -> usize {
        self.send_where(data, |client| client.remote == remote)
    }

    fn send_where(&self, data: &[u8], mut wanted: impl FnMut(&ClientEntry) -> bool) -> usize {
        let _entered = self.span.enter();
        let mut delivered = Vec::new();
        {
            let table = lock(&self.clients);
            for client in table.iter().filter(|client| wanted(*client)) {
                match (&client.stream).write_all(data) {
                    Ok(()) => delivered.push((client.local, client.remote)),
                    Err(e) => {
                        warn!(remote = %client.remote, error = %e, "send failed, closing client");
                        let _ = client.stream.shutdown(Shutdown::Both);
                    }
                }
            }
        }
        for &(local, remote) in &delivered {
            self.events.emit(&ListenerEvent::ClientSendMsg {
                local,
                remote,
                data: data.to_vec(),
            });
        }
        delivered.len()
    }

    /// Shut down every client socket. Table removal and `ClientDisconn`
    /// follow from each reader thread.
    pub fn close_all(&self) {
        for client in lock(&self.clients).iter() {
            let _ = client.stream.shutdown(Shutdown::Both);
        }
    }

    /// Shut down the client connected from `remote`, if any.
    pub fn close_client(&self, remote: SocketAddr) {
        let table = lock(&self.clients);
        if let Some(client) = table.iter().find(|client| client.remote == remote) {
            let _ = client.stream.shutdown(Shutdown::Both);
        }
    }

    pub fn contains_client(&self, remote: SocketAddr) -> bool {
        lock(&self.clients)
            .iter()
            .any(|client| client.remote == remote)
    }

    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }
}

impl Default for ConnectionListener {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionListener {
    fn drop(&mut self) {
        self.stop();
        self.close_all();
    }
}

/// The listener's side of the accept thread.
struct ClientAcceptor {
    span: Span,
    events: Arc<Subscribers<ListenerEvent>>,
    clients: ClientTable,
    next_id: u64,
}

impl AcceptHandler for ClientAcceptor {
    fn started(&mut self, local: SocketAddr) {
        self.events.emit(&ListenerEvent::ListenerStarted { local });
    }

    fn accepted(&mut self, stream: TcpStream, remote: SocketAddr) {
        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(e) => {
                warn!(%remote, error = %e, "dropping accepted socket without local address");
                return;
            }
        };
        let _ = stream.set_write_timeout(Some(SEND_TIMEOUT));
        let table_handle = match stream.try_clone() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%remote, error = %e, "dropping accepted socket that cannot be cloned");
                return;
            }
        };

        self.next_id += 1;
        let id = self.next_id;
        lock(&self.clients).push(ClientEntry {
            id,
            local,
            remote,
            stream: table_handle,
        });
        info!(%remote, "client connected");
        self.events.emit(&ListenerEvent::ClientConnect { local, remote });

        let read_events = self.events.clone();
        let on_read = move |chunk: &[u8]| {
            read_events.emit(&ListenerEvent::ClientReadMsg {
                local,
                remote,
                data: chunk.to_vec(),
            });
        };
        let fault_events = self.events.clone();
        let fault_clients = self.clients.clone();
        let on_fault = move |error: io::Error| {
            drop_client(&fault_clients, &fault_events, id, local, remote, &error);
        };

        if let Err(e) = spawn_reader(stream, self.span.clone(), on_read, on_fault) {
            drop_client(&self.clients, &self.events, id, local, remote, &e);
        }
    }

    fn stopped(&mut self, local: SocketAddr) {
        self.events.emit(&ListenerEvent::ListenerStopped { local });
    }
}

/// The single place a client leaves the table.
fn drop_client(
    clients: &ClientTable,
    events: &Subscribers<ListenerEvent>,
    id: u64,
    local: SocketAddr,
    remote: SocketAddr,
    error: &io::Error,
) {
    let removed = {
        let mut table = lock(clients);
        table
            .iter()
            .position(|client| client.id == id)
            .map(|index| table.remove(index))
    };
    if let Some(client) = removed {
        let _ = client.stream.shutdown(Shutdown::Both);
    }
    info!(%remote, error = %error, "client disconnected");
    events.emit(&ListenerEvent::ClientDisconn { local, remote });
}
