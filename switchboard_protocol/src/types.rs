// Core shared types for the session-admin protocol.
//
// `SessionType` tags a session descriptor with how the session came to exist
// on the serving side. It is serialized in lowercase (`"listen"`, `"accept"`,
// `"connect"`) under the descriptor's `type` field (see `message.rs`). The
// engine crate (`switchboard_net::session`) reuses it as the session kind.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a session was created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// A listening socket owned by the session manager.
    Listen,
    /// An inbound connection accepted from a listen session.
    Accept,
    /// An outbound connection requested explicitly.
    Connect,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listen => f.write_str("listen"),
            Self::Accept => f.write_str("accept"),
            Self::Connect => f.write_str("connect"),
        }
    }
}
