// Listener events and the ordered subscriber list that fans them out.
//
// `Subscribers` is a plain ordered list of callbacks. `emit` snapshots the
// list before calling out, so a callback may subscribe further callbacks (or
// call back into the listener) without deadlocking; new subscribers see the
// next event, not the current one. Callbacks run on whichever thread raised
// the event: the accept thread, a client reader thread, or the caller of
// `send_all` / `send_to`.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// Lifecycle and data events raised by `ConnectionListener`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerEvent {
    ListenerStarted {
        local: SocketAddr,
    },
    ListenerStopped {
        local: SocketAddr,
    },
    ClientConnect {
        local: SocketAddr,
        remote: SocketAddr,
    },
    ClientDisconn {
        local: SocketAddr,
        remote: SocketAddr,
    },
    /// Bytes received from a client since the previous read completion.
    ClientReadMsg {
        local: SocketAddr,
        remote: SocketAddr,
        data: Vec<u8>,
    },
    /// Bytes written to one client by `send_all` or `send_to`.
    ClientSendMsg {
        local: SocketAddr,
        remote: SocketAddr,
        data: Vec<u8>,
    },
}

impl ListenerEvent {
    /// Remote endpoint for client events, `None` for listener events.
    pub fn remote(&self) -> Option<SocketAddr> {
        match self {
            Self::ListenerStarted { .. } | Self::ListenerStopped { .. } => None,
            Self::ClientConnect { remote, .. }
            | Self::ClientDisconn { remote, .. }
            | Self::ClientReadMsg { remote, .. }
            | Self::ClientSendMsg { remote, .. } => Some(*remote),
        }
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered list of event callbacks, shared with the threads that raise events.
pub struct Subscribers<E> {
    callbacks: RwLock<Vec<Callback<E>>>,
}

impl<E> Subscribers<E> {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Append a callback. Callbacks are invoked in registration order.
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) {
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        callbacks.push(Arc::new(callback));
    }

    /// Deliver `event` to every callback registered so far.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}
