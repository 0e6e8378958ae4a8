// switchboard_net: TCP session engine with session-admin services.
//
// The engine accepts and opens TCP connections, cuts each byte stream into
// messages with a pluggable `FramePolicy` (from `switchboard_protocol`), and
// routes every message by its identifier to a named handler whose response
// goes back on the originating connection.
//
// Module overview:
// - `listener.rs`:   `ConnectionListener` (accept thread, a reader thread
//                    per client, one locked client table, broadcast/targeted
//                    send) plus the accept/read machinery `session.rs` reuses.
// - `events.rs`:     `ListenerEvent` and the ordered `Subscribers` list.
// - `session.rs`:    `Session` and `SessionManager`, the single-threaded
//                    loop that owns all sessions. Helper threads submit
//                    commands over an `mpsc` channel; `exec()` drains it.
// - `dispatcher.rs`: `FramingDispatcher`, `Request`, `Response`. Buffer in,
//                    requests out, replies framed on the way back.
// - `router.rs`:     `ServiceRouter` and `RequestQueue`: identifier ->
//                    handler, with per-request error and panic isolation.
// - `center.rs`:     The serving side: `service.sessdetail`,
//                    `service.sesslogin`, create/delete notices to admins.
// - `monitor.rs`:    The consuming side: a `SessionView` kept in sync with a
//                    center.
// - `error.rs`:      `NetError`.
//
// The `switchboard` binary (`main.rs`) runs either side from the command
// line. Both can also be embedded through `start_center` / `Monitor`.

pub mod center;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod listener;
pub mod monitor;
pub mod router;
pub mod session;

pub use center::{CenterConfig, CenterHandle, start_center};
pub use dispatcher::{FramingDispatcher, Request, RequestKind, Response};
pub use error::{HandlerError, NetError};
pub use events::{ListenerEvent, Subscribers};
pub use listener::ConnectionListener;
pub use monitor::{ClientUnit, Monitor, MonitorConfig, MonitorHandle, ServerUnit, SessionView};
pub use router::{Reply, RequestQueue, ServiceRouter};
pub use session::{Invoker, Session, SessionId, SessionManager, SessionState};
