// Test-only peer for end-to-end tests against a session center.
//
// `TestPeer` is a plain blocking TCP socket speaking the protocol crate's
// length-prefixed framing. It deliberately shares no code with the engine's
// session or dispatcher layers, so tests exercise the center exactly as an
// external client would. The only test-specific code here is the blocking
// receive helpers with timeouts, plus `wait_for` for polling shared state
// such as a running monitor's view.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use switchboard_protocol::{
    Ack, DetailRequest, DetailResponse, LoginRequest, SESSDETAIL, SESSLOGIN, read_message,
    write_message,
};

/// Default timeout for blocking receives and polling.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between polling attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll `done` until it holds or `WAIT_TIMEOUT` passes. Returns the final
/// result.
pub fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(POLL_INTERVAL);
    }
    done()
}

/// A raw framed client.
pub struct TestPeer {
    stream: TcpStream,
}

impl TestPeer {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("TestPeer::connect failed");
        stream
            .set_read_timeout(Some(WAIT_TIMEOUT))
            .expect("set_read_timeout failed");
        Self { stream }
    }

    /// The peer's own endpoint, i.e. the `remoteip` the center reports for it.
    pub fn local_addr(&self) -> SocketAddr {
        self.stream.local_addr().expect("local_addr failed")
    }

    /// Serialize `msg` as JSON and send it as one frame.
    pub fn send<T: Serialize>(&mut self, msg: &T) {
        let json = serde_json::to_vec(msg).expect("serialize failed");
        write_message(&mut self.stream, &json).expect("send failed");
    }

    /// Write raw bytes, bypassing framing.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("raw send failed");
    }

    /// Receive the next frame as JSON, panicking after `WAIT_TIMEOUT`.
    pub fn recv_json(&mut self) -> Value {
        let bytes = read_message(&mut self.stream).expect("recv failed");
        serde_json::from_slice(&bytes).expect("reply is not JSON")
    }

    /// Receive the next frame if one arrives within `timeout`.
    pub fn try_recv_json(&mut self, timeout: Duration) -> Option<Value> {
        self.stream
            .set_read_timeout(Some(timeout))
            .expect("set_read_timeout failed");
        let result = read_message(&mut self.stream);
        self.stream
            .set_read_timeout(Some(WAIT_TIMEOUT))
            .expect("set_read_timeout failed");
        match result {
            Ok(bytes) => Some(serde_json::from_slice(&bytes).expect("reply is not JSON")),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                None
            }
            Err(e) => panic!("recv failed: {e}"),
        }
    }

    /// Receive frames until one carries identifier `id`, skipping the rest
    /// (typically notices), and deserialize it.
    pub fn recv_id<T: DeserializeOwned>(&mut self, id: &str) -> T {
        loop {
            let msg = self.recv_json();
            if msg["id"] == id {
                return serde_json::from_value(msg).expect("unexpected reply shape");
            }
        }
    }

    /// Log in and return the acknowledgement.
    pub fn login(&mut self, admin: bool) -> Ack {
        self.send(&LoginRequest::new(admin));
        self.recv_id(SESSLOGIN)
    }

    /// Request the center's session table.
    pub fn detail(&mut self) -> DetailResponse {
        self.send(&DetailRequest::default());
        self.recv_id(SESSDETAIL)
    }

    /// Whether the center has closed this connection.
    pub fn is_closed(&mut self) -> bool {
        matches!(
            read_message(&mut self.stream),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof
        )
    }
}
