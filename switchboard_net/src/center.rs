// Session center: the serving end of the session-admin services.
//
// `start_center` binds a listen session and runs a `SessionManager` loop on a
// background thread with a config struct and a stoppable handle.
// Everything happens on that one thread: requests are routed immediately from
// the parse hook (`FramingDispatcher::on_parse_ready`) with the manager as the
// router context, so handlers can read the live session table directly.
//
// Services:
// - `service.sessdetail` answers with a descriptor for every live session.
// - `service.sesslogin` records the session's admin flag and acknowledges.
//
// Sessions that logged in with `admin: true` receive `notice.sesscreate` and
// `notice.sessdelete` for every other session that comes and goes.
//
// Shutdown: `CenterHandle::stop` clears `keep_running`; the loop notices
// within one poll timeout, then dropping the manager closes every socket.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use switchboard_protocol::{
    Ack, DetailResponse, LoginRequest, SESSDETAIL, SESSLOGIN, SessionDescriptor, SessionNotice,
};
use tracing::{error, info, info_span, warn};

use crate::dispatcher::FramingDispatcher;
use crate::error::NetError;
use crate::listener::lock;
use crate::router::{ServiceRouter, panic_message};
use crate::session::{Session, SessionId, SessionManager};

/// Configuration for starting a session center.
#[derive(Clone, Debug)]
pub struct CenterConfig {
    pub listen: SocketAddr,
    /// Upper bound on one `SessionManager::exec` pass.
    pub poll_timeout: Duration,
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 2000)),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// Handle returned by `start_center` to control the running center.
pub struct CenterHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CenterHandle {
    /// Signal the center to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }
}

/// Start a center on a background thread. Returns a handle for stopping it
/// and the bound address (useful when port 0 is used to let the OS pick a
/// free port).
pub fn start_center(config: CenterConfig) -> Result<(CenterHandle, SocketAddr), NetError> {
    let mut manager = SessionManager::new().with_span(info_span!("center"));
    install(&mut manager)?;
    let listen = manager.listen(config.listen)?;
    let addr = manager
        .session(listen)
        .and_then(Session::local_addr)
        .unwrap_or(config.listen);

    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_loop = keep_running.clone();
    let thread = thread::Builder::new()
        .name("center".into())
        .spawn(move || run_center(manager, config.poll_timeout, &keep_running_loop))?;

    Ok((
        CenterHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

type Admins = Arc<Mutex<BTreeSet<SessionId>>>;

/// Register the session-admin services and notice hooks on `manager`.
pub fn install(manager: &mut SessionManager) -> Result<(), NetError> {
    let admins: Admins = Arc::new(Mutex::new(BTreeSet::new()));
    let dispatcher = Arc::new(FramingDispatcher::new().with_span(manager.span().clone()));
    let mut router: ServiceRouter<SessionManager> =
        ServiceRouter::new().with_span(manager.span().clone());

    router.register(SESSDETAIL, |manager, _request, response| {
        let data: Vec<SessionDescriptor> = manager.sessions().map(Session::descriptor).collect();
        response.set_json(&DetailResponse::ok(data))?;
        Ok(())
    })?;

    let login_admins = admins.clone();
    router.register(SESSLOGIN, move |_manager, request, response| {
        let login: LoginRequest = request.json()?;
        {
            let mut admins = lock(&login_admins);
            if login.admin {
                admins.insert(request.session());
            } else {
                admins.remove(&request.session());
            }
        }
        info!(session = %request.session(), admin = login.admin, "session logged in");
        response.set_json(&Ack::ok(SESSLOGIN))?;
        Ok(())
    })?;

    let parse_dispatcher = dispatcher.clone();
    manager.on_session_parse(move |manager, id| {
        parse_dispatcher.on_parse_ready(manager, id, &mut router);
    });

    let create_admins = admins.clone();
    let create_dispatcher = dispatcher.clone();
    manager.on_session_create(move |manager, id| {
        notify_admins(manager, &create_dispatcher, &create_admins, id, SessionNotice::created);
    });

    manager.on_session_delete(move |manager, id| {
        notify_admins(manager, &dispatcher, &admins, id, SessionNotice::deleted);
        lock(&admins).remove(&id);
    });
    Ok(())
}

/// Push a notice about `subject` to every admin session except itself.
fn notify_admins(
    manager: &mut SessionManager,
    dispatcher: &FramingDispatcher,
    admins: &Admins,
    subject: SessionId,
    notice: fn(SessionDescriptor) -> SessionNotice,
) {
    let targets: Vec<SessionId> = lock(admins)
        .iter()
        .copied()
        .filter(|admin| *admin != subject)
        .collect();
    if targets.is_empty() {
        return;
    }
    let Some(descriptor) = manager.session(subject).map(Session::descriptor) else {
        return;
    };
    let payload = match serde_json::to_vec(&notice(descriptor)) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(session = %subject, error = %e, "failed to encode session notice");
            return;
        }
    };
    for target in targets {
        dispatcher.send(manager, target, &payload);
    }
}

/// Center loop. Runs until `keep_running` is set to false.
fn run_center(mut manager: SessionManager, poll_timeout: Duration, keep_running: &AtomicBool) {
    let span = manager.span().clone();
    let _entered = span.enter();
    info!("center running");
    while keep_running.load(Ordering::SeqCst) {
        let pass = panic::catch_unwind(AssertUnwindSafe(|| manager.exec(poll_timeout)));
        if let Err(payload) = pass {
            error!(panic = panic_message(&*payload), "center loop pass panicked");
        }
    }
    info!(sessions = manager.len(), "center stopping");
}
