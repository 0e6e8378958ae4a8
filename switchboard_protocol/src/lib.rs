// switchboard_protocol: wire contract shared by switchboard peers.
//
// This crate defines how a TCP byte stream is cut into messages and what the
// session-admin messages look like. It is shared by the serving side (the
// session center) and consumers (the session monitor, plain test peers) in
// `switchboard_net`, and has no dependency on any socket or threading code.
//
// Module overview:
// - `types.rs`:    `SessionType` (listen, accept or connect).
// - `message.rs`:  Service identifiers (`service.sessdetail`, ...), session
//                  descriptors, request/response/notice bodies, and
//                  `message_id` for pulling the `id` out of a JSON payload.
// - `framing.rs`:  The `FramePolicy` contract (classify, length-check, parse,
//                  encode), the default `LengthPrefixed` policy, and blocking
//                  `read_message` / `write_message` helpers for the same format.
//
// Design decisions:
// - **Framing is pluggable.** The engine only ever talks to `FramePolicy`; the
//   4-byte length prefix is a default, not a requirement.
// - **JSON payloads keyed by `id`.** Routing needs nothing but the identifier,
//   so everything else in a payload stays opaque to the engine.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{
    FramePolicy, HEADER_LEN, LengthPrefixed, MAX_MESSAGE_SIZE, ParsedFrame, read_message,
    write_message,
};
pub use message::{
    Ack, DetailRequest, DetailResponse, ERRCODE_OK, LoginRequest, SESSCREATE, SESSDELETE,
    SESSDETAIL, SESSLOGIN, SessionDescriptor, SessionNotice, message_id,
};
pub use types::SessionType;
