// Frame extraction: session receive buffer -> `Request`s.
//
// `FramingDispatcher` runs on the loop thread whenever bytes are appended to
// a session. It asks its `FramePolicy` about the buffered span and acts on the
// answer:
//
// - garbled header        -> discard the whole buffered span and hand back an
//                            `Unknown` request over those bytes
// - header fine, partial  -> leave the buffer alone and wait for more bytes
// - complete frame        -> parse, skip exactly `consumed` bytes, hand back a
//                            `Recognized` request
//
// and repeats while complete frames remain, so several frames that arrive in
// one read are all delivered, in order. A policy claiming to have consumed
// zero bytes, or more than is buffered, is treated like a garbled header.
//
// Two ways to route what comes out:
// - immediate: `on_parse_ready` hands each request to a `ServiceRouter` whose
//   context is the `SessionManager` and writes the reply straight back;
// - queued: `drain` returns the requests for a `RequestQueue`, and whoever
//   runs `ServiceRouter::exec` writes the replies with `reply`.

use std::net::SocketAddr;

use serde::Serialize;
use serde::de::DeserializeOwned;
use switchboard_protocol::{FramePolicy, LengthPrefixed, ParsedFrame};
use tracing::{Span, info_span, trace, warn};

use crate::router::ServiceRouter;
use crate::session::{Session, SessionId, SessionManager};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// A complete frame as understood by the policy.
    Recognized,
    /// Bytes discarded after a garbled header.
    Unknown,
}

/// One message taken off a session's receive buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    session: SessionId,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    kind: RequestKind,
    consumed: usize,
    payload: Vec<u8>,
    identifier: Option<String>,
}

impl Request {
    pub fn recognized(
        session: SessionId,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        frame: ParsedFrame,
    ) -> Self {
        Self {
            session,
            local,
            remote,
            kind: RequestKind::Recognized,
            consumed: frame.consumed,
            payload: frame.payload,
            identifier: frame.identifier,
        }
    }

    pub fn unknown(
        session: SessionId,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        discarded: Vec<u8>,
    ) -> Self {
        Self {
            session,
            local,
            remote,
            kind: RequestKind::Unknown,
            consumed: discarded.len(),
            payload: discarded,
            identifier: None,
        }
    }

    /// Session the request arrived on. It may no longer exist.
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Bytes removed from the session buffer for this request.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// Handler output. No data, or empty data, means nothing is sent back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    data: Option<Vec<u8>>,
}

impl Response {
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = Some(data);
    }

    /// Serialize `value` as the reply payload.
    pub fn set_json<T: Serialize>(&mut self, value: &T) -> serde_json::Result<()> {
        self.data = Some(serde_json::to_vec(value)?);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data = None;
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn is_reply(&self) -> bool {
        self.data.as_ref().is_some_and(|data| !data.is_empty())
    }
}

/// Splits session buffers into requests using a `FramePolicy`.
pub struct FramingDispatcher<P: FramePolicy = LengthPrefixed> {
    span: Span,
    policy: P,
}

impl FramingDispatcher<LengthPrefixed> {
    pub fn new() -> Self {
        Self::with_policy(LengthPrefixed::new())
    }
}

impl Default for FramingDispatcher<LengthPrefixed> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: FramePolicy> FramingDispatcher<P> {
    pub fn with_policy(policy: P) -> Self {
        Self {
            span: info_span!("dispatcher"),
            policy,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Take the next request off `session`'s buffer, or `None` if the buffer
    /// is empty or holds only part of a frame.
    pub fn next_request(&self, session: &mut Session) -> Option<Request> {
        let _entered = self.span.enter();
        let buf = session.rfifo();
        if buf.is_empty() {
            return None;
        }
        if !self.policy.check_type(buf) {
            warn!(session = %session.id(), bytes = buf.len(), "garbled frame header, discarding buffer");
            return Some(Self::discard(session));
        }
        if !self.policy.check_length(buf) {
            trace!(session = %session.id(), bytes = buf.len(), "partial frame buffered");
            return None;
        }
        let frame = self.policy.parse(buf);
        if frame.consumed == 0 || frame.consumed > buf.len() {
            warn!(
                session = %session.id(),
                consumed = frame.consumed,
                bytes = buf.len(),
                "frame policy reported an impossible length, discarding buffer"
            );
            return Some(Self::discard(session));
        }
        session.rfifo_skip(frame.consumed);
        Some(Request::recognized(
            session.id(),
            session.local_addr(),
            session.remote_addr(),
            frame,
        ))
    }

    fn discard(session: &mut Session) -> Request {
        let discarded = session.rfifo_take();
        Request::unknown(
            session.id(),
            session.local_addr(),
            session.remote_addr(),
            discarded,
        )
    }

    /// Every request currently extractable from session `id`.
    pub fn drain(&self, manager: &mut SessionManager, id: SessionId) -> Vec<Request> {
        let mut requests = Vec::new();
        if let Some(session) = manager.session_mut(id) {
            while let Some(request) = self.next_request(session) {
                requests.push(request);
            }
        }
        requests
    }

    /// Extract, route and answer every complete frame buffered on `id`.
    pub fn on_parse_ready(
        &self,
        manager: &mut SessionManager,
        id: SessionId,
        router: &mut ServiceRouter<SessionManager>,
    ) {
        while let Some(request) = manager
            .session_mut(id)
            .and_then(|session| self.next_request(session))
        {
            let response = router.handle(manager, &request);
            self.reply(manager, request.session(), &response);
        }
    }

    /// Frame and send `response` on `session`, if it carries data. A session
    /// that no longer exists makes this a no-op.
    pub fn reply(&self, manager: &mut SessionManager, session: SessionId, response: &Response) {
        if let Some(data) = response.data().filter(|data| !data.is_empty()) {
            self.send(manager, session, data);
        }
    }

    /// Frame `payload` with the policy and send it on `session`.
    pub fn send(&self, manager: &mut SessionManager, session: SessionId, payload: &[u8]) {
        manager.send_session(session, &self.policy.encode(payload));
    }

    /// Serialize `value` as JSON and send it on `session`.
    pub fn send_json<T: Serialize>(
        &self,
        manager: &mut SessionManager,
        session: SessionId,
        value: &T,
    ) -> serde_json::Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.send(manager, session, &payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use switchboard_protocol::SessionType;

    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        LengthPrefixed::new().encode(payload)
    }

    fn detached(mgr: &mut SessionManager) -> SessionId {
        mgr.insert_detached(SessionType::Accept, Some("127.0.0.1:40000".parse().unwrap()))
    }

    fn feed(mgr: &mut SessionManager, id: SessionId, bytes: &[u8]) {
        mgr.session_mut(id).unwrap().feed(bytes);
    }

    #[test]
    fn hello_one_byte_at_a_time() {
        let dispatcher = FramingDispatcher::new();
        let mut mgr = SessionManager::new();
        let id = detached(&mut mgr);

        let wire = frame(b"HELLO");
        let (last, head) = wire.split_last().unwrap();
        for byte in head {
            feed(&mut mgr, id, std::slice::from_ref(byte));
            assert!(dispatcher.drain(&mut mgr, id).is_empty());
        }
        assert_eq!(mgr.session(id).unwrap().rfifo(), head);

        feed(&mut mgr, id, std::slice::from_ref(last));
        let requests = dispatcher.drain(&mut mgr, id);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].payload(), b"HELLO");
        assert_eq!(requests[0].kind(), RequestKind::Recognized);
        assert_eq!(requests[0].consumed(), 9);
        assert_eq!(requests[0].identifier(), None);
        assert!(mgr.session(id).unwrap().rfifo().is_empty());
    }

    #[test]
    fn chunk_boundaries_do_not_change_requests() {
        let dispatcher = FramingDispatcher::new();
        let mut wire = Vec::new();
        wire.extend(frame(br#"{"id":"service.a"}"#));
        wire.extend(frame(b"x"));
        wire.extend(frame(br#"{"id":"service.b","n":1}"#));

        let whole = {
            let mut mgr = SessionManager::new();
            let id = detached(&mut mgr);
            feed(&mut mgr, id, &wire);
            dispatcher.drain(&mut mgr, id)
        };
        assert_eq!(whole.len(), 3);
        assert_eq!(whole[0].identifier(), Some("service.a"));
        assert_eq!(whole[2].identifier(), Some("service.b"));

        for chunk_len in [1, 2, 3, 5, 7, 11, 13] {
            let mut mgr = SessionManager::new();
            let id = detached(&mut mgr);
            let mut split = Vec::new();
            for chunk in wire.chunks(chunk_len) {
                feed(&mut mgr, id, chunk);
                split.extend(dispatcher.drain(&mut mgr, id));
            }
            assert_eq!(split, whole, "chunk length {chunk_len}");
        }
    }

    #[test]
    fn consumed_matches_frame_and_leftover_is_kept() {
        let dispatcher = FramingDispatcher::new();
        let mut mgr = SessionManager::new();
        let id = detached(&mut mgr);

        let first = frame(b"abc");
        let second = frame(b"defgh");
        let mut wire = first.clone();
        wire.extend_from_slice(&second[..6]);
        feed(&mut mgr, id, &wire);

        let session = mgr.session_mut(id).unwrap();
        let request = dispatcher.next_request(session).unwrap();
        assert_eq!(request.consumed(), first.len());
        assert_eq!(session.rfifo(), &second[..6]);
        assert!(dispatcher.next_request(session).is_none());
        assert_eq!(session.rfifo(), &second[..6]);

        session.feed(&second[6..]);
        let request = dispatcher.next_request(session).unwrap();
        assert_eq!(request.payload(), b"defgh");
        assert!(session.rfifo().is_empty());
    }

    #[test]
    fn garbled_header_discards_whole_span() {
        let dispatcher = FramingDispatcher::with_policy(LengthPrefixed::with_max_len(64));
        let mut mgr = SessionManager::new();
        let id = detached(&mut mgr);

        let mut wire = vec![0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3];
        wire.extend(frame(b"after"));
        feed(&mut mgr, id, &wire);

        let requests = dispatcher.drain(&mut mgr, id);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind(), RequestKind::Unknown);
        assert_eq!(requests[0].payload(), wire.as_slice());
        assert_eq!(requests[0].consumed(), wire.len());
        assert_eq!(requests[0].identifier(), None);
        assert!(mgr.session(id).unwrap().rfifo().is_empty());
    }

    /// Claims every frame is complete but consumes nothing.
    struct Stuck;

    impl FramePolicy for Stuck {
        fn check_type(&self, _buf: &[u8]) -> bool {
            true
        }
        fn check_length(&self, _buf: &[u8]) -> bool {
            true
        }
        fn parse(&self, _buf: &[u8]) -> ParsedFrame {
            ParsedFrame {
                consumed: 0,
                payload: Vec::new(),
                identifier: None,
            }
        }
        fn encode(&self, payload: &[u8]) -> Vec<u8> {
            payload.to_vec()
        }
    }

    #[test]
    fn zero_consumed_is_treated_as_garbled() {
        let dispatcher = FramingDispatcher::with_policy(Stuck);
        let mut mgr = SessionManager::new();
        let id = detached(&mut mgr);
        feed(&mut mgr, id, b"anything");

        let requests = dispatcher.drain(&mut mgr, id);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind(), RequestKind::Unknown);
        assert!(mgr.session(id).unwrap().rfifo().is_empty());
    }

    #[test]
    fn response_reply_semantics() {
        let mut response = Response::default();
        assert!(!response.is_reply());
        response.set_data(Vec::new());
        assert!(!response.is_reply());
        response.set_json(&serde_json::json!({"id": "x"})).unwrap();
        assert!(response.is_reply());
        response.clear();
        assert_eq!(response.data(), None);
    }

    #[test]
    fn reply_to_a_vanished_session_is_a_no_op() {
        let dispatcher = FramingDispatcher::new();
        let mut mgr = SessionManager::new();
        let live = detached(&mut mgr);
        let gone = SessionId(live.0 + 100);

        let handled = Arc::new(Mutex::new(Vec::new()));
        let seen = handled.clone();
        let mut router: ServiceRouter<SessionManager> = ServiceRouter::new();
        router
            .register("service.echo", move |mgr, request, response| {
                seen.lock()
                    .unwrap()
                    .push((request.session(), mgr.session(request.session()).is_some()));
                response.set_data(request.payload().to_vec());
                Ok(())
            })
            .unwrap();

        let payload = br#"{"id":"service.echo"}"#;
        let wire = frame(payload);
        router.enqueue(Request::recognized(
            gone,
            None,
            None,
            LengthPrefixed::new().parse(&wire),
        ));
        let replies = router.exec(&mut mgr);

        assert_eq!(*handled.lock().unwrap(), vec![(gone, false)]);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].session, gone);
        assert_eq!(replies[0].response.data(), Some(&payload[..]));

        dispatcher.reply(&mut mgr, replies[0].session, &replies[0].response);
        dispatcher.send(&mut mgr, gone, b"more");
        assert_eq!(mgr.len(), 1);
        assert!(mgr.session(gone).is_none());
        assert!(mgr.session(live).unwrap().rfifo().is_empty());
    }

    #[test]
    fn parse_ready_routes_and_replies_on_the_session() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let mut mgr = SessionManager::new();
        let id = mgr.connect(addr);
        let (mut peer, _) = server.accept().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while mgr.session(id).unwrap().state() != crate::session::SessionState::Open {
            assert!(Instant::now() < deadline);
            mgr.exec(Duration::from_millis(10));
        }

        let dispatcher = FramingDispatcher::new();
        let mut router: ServiceRouter<SessionManager> = ServiceRouter::new();
        router
            .register("service.echo", |_mgr, request, response| {
                response.set_data(request.payload().to_vec());
                Ok(())
            })
            .unwrap();

        let wire = frame(br#"{"id":"service.echo"}"#);
        feed(&mut mgr, id, &wire);
        feed(&mut mgr, id, &frame(br#"{"id":"nobody.home"}"#));
        dispatcher.on_parse_ready(&mut mgr, id, &mut router);
        assert!(mgr.session(id).unwrap().rfifo().is_empty());

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut echoed = vec![0u8; wire.len()];
        peer.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, wire);

        peer.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut extra = [0u8; 1];
        assert!(peer.read(&mut extra).is_err());
    }
}
