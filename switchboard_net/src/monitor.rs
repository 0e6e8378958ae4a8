// Session monitor: the consuming end of the session-admin services.
//
// A `Monitor` opens one outbound session to a center and keeps a
// `SessionView` (the center's listen endpoints and accepted clients) in sync:
// `login()` sends `service.sesslogin` followed by `service.sessdetail`, the
// detail response replaces the view, and `notice.sesscreate` /
// `notice.sessdelete` add or remove single rows afterwards.
//
// Unlike the center, the monitor routes through the queue: the parse hook
// only drains requests into the router's `RequestQueue`, and `exec_once`
// runs `SessionManager::exec` followed by `ServiceRouter::exec`, with the
// view as the router context. The view sits behind a mutex so other threads
// can read snapshots while the loop runs on its own thread (`spawn`).

use std::net::{IpAddr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use switchboard_protocol::{
    Ack, DetailRequest, DetailResponse, LoginRequest, SESSCREATE, SESSDELETE, SESSDETAIL,
    SESSLOGIN, SessionDescriptor, SessionNotice, SessionType,
};
use tracing::{debug, error, info, info_span, warn};

use crate::dispatcher::FramingDispatcher;
use crate::error::NetError;
use crate::listener::lock;
use crate::router::{ServiceRouter, panic_message};
use crate::session::{Invoker, SessionId, SessionManager, SessionState};

/// Configuration for connecting a monitor to a center.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub server: SocketAddr,
    /// Upper bound on one `SessionManager::exec` pass.
    pub poll_timeout: Duration,
    /// Ask the center for create/delete notices at login.
    pub admin: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], 2000)),
            poll_timeout: Duration::from_secs(1),
            admin: true,
        }
    }
}

/// A listening endpoint on the center.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerUnit {
    pub ip: IpAddr,
    pub port: u16,
}

/// A client accepted by the center.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientUnit {
    pub remote: SocketAddr,
    pub connect_time: Option<DateTime<Utc>>,
}

enum Row {
    Server(ServerUnit),
    Client(ClientUnit),
}

/// The center's session table as last reported.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionView {
    pub servers: Vec<ServerUnit>,
    pub clients: Vec<ClientUnit>,
}

impl SessionView {
    /// Replace both tables from a detail response. A response with a
    /// non-zero `errcode` leaves the view untouched. Returns whether the view
    /// was replaced.
    pub fn apply_detail(&mut self, detail: &DetailResponse) -> bool {
        if !detail.is_ok() {
            info!(
                errcode = detail.errcode,
                errmsg = detail.errmsg.as_deref().unwrap_or_default(),
                "session detail refused"
            );
            return false;
        }
        let mut servers = Vec::new();
        let mut clients = Vec::new();
        for descriptor in &detail.data {
            match row(descriptor) {
                Some(Row::Server(server)) => servers.push(server),
                Some(Row::Client(client)) => clients.push(client),
                None => {}
            }
        }
        self.servers = servers;
        self.clients = clients;
        true
    }

    /// Add the row for a newly created session. Returns whether a row was added.
    pub fn apply_create(&mut self, descriptor: &SessionDescriptor) -> bool {
        match row(descriptor) {
            Some(Row::Server(server)) => self.servers.push(server),
            Some(Row::Client(client)) => self.clients.push(client),
            None => return false,
        }
        true
    }

    /// Remove the first row matching a deleted session. Returns whether a row
    /// was removed.
    pub fn apply_delete(&mut self, descriptor: &SessionDescriptor) -> bool {
        match row(descriptor) {
            Some(Row::Server(server)) => remove_first(&mut self.servers, |s| *s == server),
            Some(Row::Client(client)) => {
                remove_first(&mut self.clients, |c| c.remote == client.remote)
            }
            None => false,
        }
    }
}

fn remove_first<T>(rows: &mut Vec<T>, matches: impl Fn(&T) -> bool) -> bool {
    match rows.iter().position(matches) {
        Some(index) => {
            rows.remove(index);
            true
        }
        None => false,
    }
}

/// The view row a descriptor maps to, if any. Malformed endpoints are logged
/// and skipped; `connect` sessions have no row.
fn row(descriptor: &SessionDescriptor) -> Option<Row> {
    match descriptor.kind {
        SessionType::Listen => match descriptor.local_addr() {
            Some(local) => Some(Row::Server(ServerUnit {
                ip: local.ip(),
                port: local.port(),
            })),
            None => {
                warn!(localip = %descriptor.localip, "skipping listen row with malformed endpoint");
                None
            }
        },
        SessionType::Accept => match descriptor.remote_addr() {
            Some(remote) => Some(Row::Client(ClientUnit {
                remote,
                connect_time: descriptor.conntime,
            })),
            None => {
                warn!(remoteip = ?descriptor.remoteip, "skipping client row with malformed endpoint");
                None
            }
        },
        SessionType::Connect => {
            debug!(localip = %descriptor.localip, "ignoring connect session row");
            None
        }
    }
}

/// Connection to a center plus the view it maintains.
pub struct Monitor {
    config: MonitorConfig,
    manager: SessionManager,
    router: ServiceRouter<SessionView>,
    dispatcher: Arc<FramingDispatcher>,
    view: Arc<Mutex<SessionView>>,
    server: SessionId,
}

impl Monitor {
    /// Start connecting to `config.server` and register the view services.
    /// The connect completes during a later `exec_once`.
    pub fn connect(config: MonitorConfig) -> Result<Self, NetError> {
        let mut manager = SessionManager::new().with_span(info_span!("monitor"));
        let dispatcher = Arc::new(FramingDispatcher::new().with_span(manager.span().clone()));
        let mut router: ServiceRouter<SessionView> =
            ServiceRouter::new().with_span(manager.span().clone());

        router.register(SESSLOGIN, |_view, request, _response| {
            let ack: Ack = request.json()?;
            if ack.errcode == 0 {
                info!("logged in to center");
            } else {
                warn!(errcode = ack.errcode, errmsg = ack.errmsg.as_deref().unwrap_or_default(), "login refused");
            }
            Ok(())
        })?;
        router.register(SESSDETAIL, |view, request, _response| {
            let detail: DetailResponse = request.json()?;
            view.apply_detail(&detail);
            Ok(())
        })?;
        router.register(SESSCREATE, |view, request, _response| {
            let notice: SessionNotice = request.json()?;
            view.apply_create(&notice.data);
            Ok(())
        })?;
        router.register(SESSDELETE, |view, request, _response| {
            let notice: SessionNotice = request.json()?;
            view.apply_delete(&notice.data);
            Ok(())
        })?;

        let queue = router.queue();
        let parse_dispatcher = dispatcher.clone();
        manager.on_session_parse(move |manager, id| {
            queue.extend(parse_dispatcher.drain(manager, id));
        });

        let server = manager.connect(config.server);
        let endpoint = config.server;
        manager.on_session_delete(move |_manager, id| {
            if id == server {
                warn!(server = %endpoint, "connection to center lost");
            }
        });

        Ok(Self {
            config,
            manager,
            router,
            dispatcher,
            view: Arc::new(Mutex::new(SessionView::default())),
            server,
        })
    }

    /// Queue the login handshake and a detail request on the loop thread.
    pub fn login(&self) {
        queue_login(
            &self.manager.invoker(),
            &self.dispatcher,
            self.server,
            self.config.admin,
        );
    }

    /// One loop pass: socket work, then routing of everything received.
    pub fn exec_once(&mut self) -> usize {
        let handled = self.manager.exec(self.config.poll_timeout);
        let replies = {
            let mut view = lock(&self.view);
            self.router.exec(&mut *view)
        };
        for reply in replies {
            self.dispatcher
                .reply(&mut self.manager, reply.session, &reply.response);
        }
        handled
    }

    /// Snapshot of the current view.
    pub fn view(&self) -> SessionView {
        lock(&self.view).clone()
    }

    pub fn shared_view(&self) -> Arc<Mutex<SessionView>> {
        self.view.clone()
    }

    pub fn invoker(&self) -> Invoker {
        self.manager.invoker()
    }

    /// State of the session to the center; `None` once it has been deleted.
    pub fn server_state(&self) -> Option<SessionState> {
        self.manager.session(self.server).map(|session| session.state())
    }

    /// Run the loop on a background thread.
    pub fn spawn(self) -> Result<MonitorHandle, NetError> {
        let keep_running = Arc::new(AtomicBool::new(true));
        let keep_running_loop = keep_running.clone();
        let view = self.view.clone();
        let invoker = self.manager.invoker();
        let dispatcher = self.dispatcher.clone();
        let server = self.server;
        let admin = self.config.admin;
        let thread = thread::Builder::new()
            .name("monitor".into())
            .spawn(move || self.run(&keep_running_loop))?;
        Ok(MonitorHandle {
            keep_running,
            thread: Some(thread),
            view,
            invoker,
            dispatcher,
            server,
            admin,
        })
    }

    fn run(mut self, keep_running: &AtomicBool) {
        let span = self.manager.span().clone();
        let _entered = span.enter();
        info!(server = %self.config.server, "monitor running");
        while keep_running.load(Ordering::SeqCst) {
            let pass = panic::catch_unwind(AssertUnwindSafe(|| self.exec_once()));
            if let Err(payload) = pass {
                error!(panic = panic_message(&*payload), "monitor loop pass panicked");
            }
        }
        info!("monitor stopping");
    }
}

fn queue_login(
    invoker: &Invoker,
    dispatcher: &Arc<FramingDispatcher>,
    server: SessionId,
    admin: bool,
) {
    let login_dispatcher = dispatcher.clone();
    invoker.begin_invoke(move |manager| {
        if let Err(e) = login_dispatcher.send_json(manager, server, &LoginRequest::new(admin)) {
            warn!(error = %e, "failed to encode login request");
        }
    });
    let detail_dispatcher = dispatcher.clone();
    invoker.begin_invoke(move |manager| {
        if let Err(e) = detail_dispatcher.send_json(manager, server, &DetailRequest::default()) {
            warn!(error = %e, "failed to encode detail request");
        }
    });
}

/// Handle to a monitor running on its own thread.
pub struct MonitorHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    view: Arc<Mutex<SessionView>>,
    invoker: Invoker,
    dispatcher: Arc<FramingDispatcher>,
    server: SessionId,
    admin: bool,
}

impl MonitorHandle {
    pub fn login(&self) {
        queue_login(&self.invoker, &self.dispatcher, self.server, self.admin);
    }

    pub fn view(&self) -> SessionView {
        lock(&self.view).clone()
    }

    pub fn shared_view(&self) -> Arc<Mutex<SessionView>> {
        self.view.clone()
    }

    pub fn invoker(&self) -> Invoker {
        self.invoker.clone()
    }

    /// Signal the loop to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::Instant;

    use switchboard_protocol::{read_message, write_message};

    use super::*;

    fn listen_row(addr: &str) -> SessionDescriptor {
        SessionDescriptor::new(SessionType::Listen, addr.parse().unwrap(), None, None)
    }

    fn client_row(local: &str, remote: &str) -> SessionDescriptor {
        SessionDescriptor::new(
            SessionType::Accept,
            local.parse().unwrap(),
            Some(remote.parse().unwrap()),
            Some(Utc::now()),
        )
    }

    fn populated() -> SessionView {
        let mut view = SessionView::default();
        assert!(view.apply_detail(&DetailResponse::ok(vec![
            listen_row("127.0.0.1:2000"),
            client_row("127.0.0.1:2000", "10.0.0.5:51000"),
            client_row("127.0.0.1:2000", "10.0.0.6:51001"),
        ])));
        view
    }

    #[test]
    fn detail_replaces_both_tables() {
        let mut view = populated();
        assert_eq!(
            view.servers,
            vec![ServerUnit {
                ip: "127.0.0.1".parse().unwrap(),
                port: 2000
            }]
        );
        assert_eq!(view.clients.len(), 2);

        assert!(view.apply_detail(&DetailResponse::ok(vec![listen_row("0.0.0.0:3000")])));
        assert_eq!(view.servers.len(), 1);
        assert_eq!(view.servers[0].port, 3000);
        assert!(view.clients.is_empty());
    }

    #[test]
    fn refused_detail_makes_no_mutation() {
        let mut view = populated();
        let before = view.clone();
        assert!(!view.apply_detail(&DetailResponse::error(3, "not allowed")));
        assert_eq!(view, before);

        let mut refused = DetailResponse::ok(vec![listen_row("127.0.0.1:9")]);
        refused.errcode = 1;
        assert!(!view.apply_detail(&refused));
        assert_eq!(view, before);
    }

    #[test]
    fn notices_add_and_remove_single_rows() {
        let mut view = populated();
        let extra = client_row("127.0.0.1:2000", "10.0.0.7:51002");
        assert!(view.apply_create(&extra));
        assert_eq!(view.clients.len(), 3);

        assert!(view.apply_delete(&client_row("127.0.0.1:2000", "10.0.0.5:51000")));
        assert_eq!(view.clients.len(), 2);
        assert!(
            !view
                .clients
                .iter()
                .any(|c| c.remote == "10.0.0.5:51000".parse().unwrap())
        );

        assert!(view.apply_delete(&listen_row("127.0.0.1:2000")));
        assert!(view.servers.is_empty());
        assert!(!view.apply_delete(&listen_row("127.0.0.1:2000")));
    }

    #[test]
    fn malformed_and_connect_rows_are_skipped() {
        let mut view = SessionView::default();
        let mut bad_listen = listen_row("127.0.0.1:2000");
        bad_listen.localip = "not-an-endpoint".into();
        let mut bad_client = client_row("127.0.0.1:2000", "10.0.0.5:1");
        bad_client.remoteip = Some("10.0.0.5".into());
        let connect = SessionDescriptor::new(
            SessionType::Connect,
            "127.0.0.1:40000".parse().unwrap(),
            Some("127.0.0.1:2000".parse().unwrap()),
            Some(Utc::now()),
        );

        assert!(view.apply_detail(&DetailResponse::ok(vec![
            bad_listen.clone(),
            bad_client.clone(),
            connect.clone(),
            listen_row("127.0.0.1:2001"),
        ])));
        assert_eq!(view.servers.len(), 1);
        assert!(view.clients.is_empty());
        assert!(!view.apply_create(&bad_client));
        assert!(!view.apply_create(&connect));
    }

    #[test]
    fn login_sends_handshake_then_detail_and_applies_reply() {
        let center = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = MonitorConfig {
            server: center.local_addr().unwrap(),
            poll_timeout: Duration::from_millis(10),
            admin: true,
        };
        let mut monitor = Monitor::connect(config).unwrap();
        monitor.login();
        let (mut peer, _) = center.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.server_state() != Some(SessionState::Open) {
            assert!(Instant::now() < deadline);
            monitor.exec_once();
        }

        let login: LoginRequest = serde_json::from_slice(&read_message(&mut peer).unwrap()).unwrap();
        assert_eq!(login, LoginRequest::new(true));
        let detail: DetailRequest =
            serde_json::from_slice(&read_message(&mut peer).unwrap()).unwrap();
        assert_eq!(detail, DetailRequest::default());

        let reply = DetailResponse::ok(vec![listen_row("127.0.0.1:2000")]);
        write_message(&mut peer, &serde_json::to_vec(&reply).unwrap()).unwrap();
        while monitor.view().servers.is_empty() {
            assert!(Instant::now() < deadline);
            monitor.exec_once();
        }
        assert_eq!(monitor.view().servers[0].port, 2000);
    }
}
