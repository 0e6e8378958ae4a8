// Session-admin messages exchanged between a center and its monitors.
//
// Every payload is a UTF-8 JSON object carrying its service identifier in an
// `id` string field. Four identifiers make up the vocabulary:
// - `service.sesslogin`: monitor → center handshake with an admin flag.
//   Admin sessions receive create/delete notices.
// - `service.sessdetail`: request/response. The response carries `errcode`
//   (0 = success) and on success a `data` array of session descriptors.
// - `notice.sesscreate`: center → admin, fire-and-forget, one descriptor.
// - `notice.sessdelete`: center → admin, fire-and-forget, one descriptor.
//
// Endpoints travel as `"ip:port"` strings rather than typed addresses so that a
// consumer can skip one malformed row without rejecting the whole message.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::types::SessionType;

/// Handshake request identifier.
pub const SESSLOGIN: &str = "service.sesslogin";
/// Session snapshot request identifier.
pub const SESSDETAIL: &str = "service.sessdetail";
/// Session-created notice identifier.
pub const SESSCREATE: &str = "notice.sesscreate";
/// Session-deleted notice identifier.
pub const SESSDELETE: &str = "notice.sessdelete";

/// Error code carried by successful responses.
pub const ERRCODE_OK: i32 = 0;

/// Extract the `id` field of a JSON payload, if the payload is a JSON object
/// carrying one.
pub fn message_id(payload: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Envelope {
        id: String,
    }
    serde_json::from_slice::<Envelope>(payload)
        .ok()
        .map(|envelope| envelope.id)
}

/// One row of the session table as seen over the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    pub kind: SessionType,
    pub localip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remoteip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conntime: Option<DateTime<Utc>>,
}

impl SessionDescriptor {
    pub fn new(
        kind: SessionType,
        local: SocketAddr,
        remote: Option<SocketAddr>,
        conntime: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            kind,
            localip: local.to_string(),
            remoteip: remote.map(|addr| addr.to_string()),
            conntime,
        }
    }

    /// Parsed `localip`, or `None` if it is not a valid `ip:port`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.localip.parse().ok()
    }

    /// Parsed `remoteip`, or `None` if absent or not a valid `ip:port`.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remoteip.as_deref().and_then(|ip| ip.parse().ok())
    }
}

/// Bare request carrying only its identifier (`service.sessdetail`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetailRequest {
    pub id: String,
}

impl Default for DetailRequest {
    fn default() -> Self {
        Self {
            id: SESSDETAIL.into(),
        }
    }
}

/// Handshake request (`service.sesslogin`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub id: String,
    /// Accepts both a JSON boolean and the strings `"true"` / `"false"`,
    /// which older monitors send.
    #[serde(default, deserialize_with = "lenient_flag")]
    pub admin: bool,
}

impl LoginRequest {
    pub fn new(admin: bool) -> Self {
        Self {
            id: SESSLOGIN.into(),
            admin,
        }
    }
}

/// Generic acknowledgement: identifier plus error code.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub id: String,
    pub errcode: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
}

impl Ack {
    pub fn ok(id: &str) -> Self {
        Self {
            id: id.into(),
            errcode: ERRCODE_OK,
            errmsg: None,
        }
    }

    pub fn error(id: &str, errcode: i32, errmsg: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            errcode,
            errmsg: Some(errmsg.into()),
        }
    }
}

/// Response to `service.sessdetail`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetailResponse {
    pub id: String,
    pub errcode: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
    #[serde(default)]
    pub data: Vec<SessionDescriptor>,
}

impl DetailResponse {
    pub fn ok(data: Vec<SessionDescriptor>) -> Self {
        Self {
            id: SESSDETAIL.into(),
            errcode: ERRCODE_OK,
            errmsg: None,
            data,
        }
    }

    pub fn error(errcode: i32, errmsg: impl Into<String>) -> Self {
        Self {
            id: SESSDETAIL.into(),
            errcode,
            errmsg: Some(errmsg.into()),
            data: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errcode == ERRCODE_OK
    }
}

/// `notice.sesscreate` / `notice.sessdelete` body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionNotice {
    pub id: String,
    pub data: SessionDescriptor,
}

impl SessionNotice {
    pub fn created(data: SessionDescriptor) -> Self {
        Self {
            id: SESSCREATE.into(),
            data,
        }
    }

    pub fn deleted(data: SessionDescriptor) -> Self {
        Self {
            id: SESSDELETE.into(),
            data,
        }
    }
}

fn lenient_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }
    match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => Ok(value),
        Flag::Text(text) => Ok(text.eq_ignore_ascii_case("true")),
    }
}
