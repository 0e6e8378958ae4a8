// Named-service routing.
//
// `ServiceRouter<C>` maps an identifier (the `id` of a JSON payload) to a
// handler. Handlers get a mutable context `C`, the request, and a response
// slot they may leave empty for fire-and-forget notices. The context is
// whatever state the handlers work on: the center routes with the
// `SessionManager` itself, the monitor with its `SessionView`.
//
// Requests reach handlers two ways. `handle` routes one request right away
// (the dispatcher's immediate path). `enqueue` / `RequestQueue` append to a
// FIFO that `exec` drains; the queue handle is cloneable so session hooks can
// feed it, and `exec` only takes what was queued when it started.
//
// A handler that returns an error or panics only loses its own response; the
// failure is logged and routing continues with the next request. There is no
// per-handler timeout, so a handler that blocks stalls the drain.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::{Span, debug, info_span, warn};

use crate::dispatcher::{Request, Response};
use crate::error::{HandlerError, NetError};
use crate::listener::lock;
use crate::session::SessionId;

type Handler<C> = Box<dyn FnMut(&mut C, &Request, &mut Response) -> Result<(), HandlerError> + Send>;

/// Shared FIFO of requests awaiting `ServiceRouter::exec`.
#[derive(Clone, Default)]
pub struct RequestQueue(Arc<Mutex<VecDeque<Request>>>);

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: Request) {
        lock(&self.0).push_back(request);
    }

    pub fn extend(&self, requests: impl IntoIterator<Item = Request>) {
        lock(&self.0).extend(requests);
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_all(&self) -> VecDeque<Request> {
        std::mem::take(&mut *lock(&self.0))
    }
}

/// A non-empty response and the session it is addressed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub session: SessionId,
    pub response: Response,
}

pub struct ServiceRouter<C> {
    span: Span,
    services: HashMap<String, Handler<C>>,
    queue: RequestQueue,
}

impl<C> ServiceRouter<C> {
    pub fn new() -> Self {
        Self {
            span: info_span!("router"),
            services: HashMap::new(),
            queue: RequestQueue::new(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Bind `handler` to `identifier`. Each identifier can be bound once.
    pub fn register(
        &mut self,
        identifier: impl Into<String>,
        handler: impl FnMut(&mut C, &Request, &mut Response) -> Result<(), HandlerError>
        + Send
        + 'static,
    ) -> Result<(), NetError> {
        let identifier = identifier.into();
        if self.services.contains_key(&identifier) {
            return Err(NetError::DuplicateService(identifier));
        }
        self.services.insert(identifier, Box::new(handler));
        Ok(())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.services.contains_key(identifier)
    }

    /// Handle for feeding this router's queue from elsewhere.
    pub fn queue(&self) -> RequestQueue {
        self.queue.clone()
    }

    pub fn enqueue(&self, request: Request) {
        self.queue.push(request);
    }

    /// Route one request and return the handler's response. Unrouted or
    /// failed requests yield an empty response.
    pub fn handle(&mut self, ctx: &mut C, request: &Request) -> Response {
        let _entered = self.span.enter();
        let mut response = Response::default();
        let Some(identifier) = request.identifier() else {
            debug!(session = %request.session(), kind = ?request.kind(), bytes = request.payload().len(), "request without identifier dropped");
            return response;
        };
        let Some(handler) = self.services.get_mut(identifier) else {
            warn!(session = %request.session(), identifier, "no service registered, request dropped");
            return response;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, request, &mut response)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session = %request.session(), identifier, error = %e, "service failed");
                response.clear();
            }
            Err(payload) => {
                warn!(session = %request.session(), identifier, panic = panic_message(&*payload), "service panicked");
                response.clear();
            }
        }
        response
    }

    /// Route everything queued as of this call, in order. Returns the
    /// responses that need to be sent.
    pub fn exec(&mut self, ctx: &mut C) -> Vec<Reply> {
        let pending = self.queue.take_all();
        let mut replies = Vec::new();
        for request in pending {
            let response = self.handle(ctx, &request);
            if response.is_reply() {
                replies.push(Reply {
                    session: request.session(),
                    response,
                });
            }
        }
        replies
    }
}

impl<C> Default for ServiceRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
