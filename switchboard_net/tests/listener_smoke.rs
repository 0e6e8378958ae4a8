// End-to-end test of `ConnectionListener` driven purely by its events.
//
// The listener's callbacks only forward events into an `mpsc` channel; the
// test thread drains that channel, cuts each client's bytes into frames with
// the protocol crate's `LengthPrefixed` policy, and echoes frames back to the
// client they came from. Clients are plain TCP sockets using the blocking
// `read_message` / `write_message` helpers.

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use switchboard_net::{ConnectionListener, ListenerEvent};
use switchboard_protocol::{FramePolicy, LengthPrefixed, read_message, write_message};

const WAIT: Duration = Duration::from_secs(5);

/// Per-client receive buffers plus the frames cut from them so far.
#[derive(Default)]
struct EchoState {
    buffers: HashMap<SocketAddr, Vec<u8>>,
    disconnects: HashMap<SocketAddr, usize>,
    echoed: usize,
    stopped: bool,
}

impl EchoState {
    /// Apply one event; returns the complete frames it finished.
    fn apply(&mut self, event: ListenerEvent) -> Vec<(SocketAddr, Vec<u8>)> {
        let policy = LengthPrefixed::new();
        match event {
            ListenerEvent::ClientReadMsg { remote, data, .. } => {
                let buf = self.buffers.entry(remote).or_default();
                buf.extend_from_slice(&data);
                let mut frames = Vec::new();
                while policy.check_type(buf) && policy.check_length(buf) {
                    let frame = policy.parse(buf);
                    buf.drain(..frame.consumed);
                    frames.push((remote, frame.payload));
                }
                self.echoed += frames.len();
                frames
            }
            ListenerEvent::ClientDisconn { remote, .. } => {
                *self.disconnects.entry(remote).or_default() += 1;
                Vec::new()
            }
            ListenerEvent::ListenerStopped { .. } => {
                self.stopped = true;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

/// Drain events, echoing completed frames, until `done` holds.
fn pump(
    listener: &ConnectionListener,
    events: &Receiver<ListenerEvent>,
    state: &mut EchoState,
    mut done: impl FnMut(&EchoState) -> bool,
) {
    let deadline = Instant::now() + WAIT;
    while !done(state) {
        assert!(Instant::now() < deadline, "timed out waiting for listener");
        if let Ok(event) = events.recv_timeout(Duration::from_millis(20)) {
            for (remote, payload) in state.apply(event) {
                let frame = LengthPrefixed::new().encode(&payload);
                assert_eq!(listener.send_to(remote, &frame), 1);
            }
        }
    }
}

fn client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

#[test]
fn framed_echo_over_listener_events() {
    let mut listener = ConnectionListener::new();
    let (tx, events) = mpsc::channel();
    let tx = Mutex::new(tx);
    listener.subscribe(move |event| {
        let _ = tx.lock().unwrap().send(event.clone());
    });
    let addr = listener.start("127.0.0.1:0".parse().unwrap()).unwrap();
    let mut state = EchoState::default();

    let mut a = client(addr);
    let mut b = client(addr);
    let remote_a = a.local_addr().unwrap();
    let remote_b = b.local_addr().unwrap();
    pump(&listener, &events, &mut state, |_| {
        listener.contains_client(remote_a) && listener.contains_client(remote_b)
    });

    // Client A trickles its frame in one byte at a time; B sends two frames
    // in a single write.
    let frame_a = LengthPrefixed::new().encode(br#"{"id":"service.echo","from":"a"}"#);
    for byte in &frame_a {
        a.write_all(std::slice::from_ref(byte)).unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    let mut burst = LengthPrefixed::new().encode(b"b-one");
    burst.extend(LengthPrefixed::new().encode(b"b-two"));
    b.write_all(&burst).unwrap();

    let read_a = thread::spawn(move || {
        let echoed = read_message(&mut a).unwrap();
        (a, echoed)
    });
    let read_b = thread::spawn(move || {
        let first = read_message(&mut b).unwrap();
        let second = read_message(&mut b).unwrap();
        (b, first, second)
    });
    pump(&listener, &events, &mut state, |_| {
        read_a.is_finished() && read_b.is_finished()
    });
    let (mut a, echoed_a) = read_a.join().unwrap();
    let (mut b, first_b, second_b) = read_b.join().unwrap();
    assert_eq!(echoed_a, br#"{"id":"service.echo","from":"a"}"#);
    assert_eq!(first_b, b"b-one");
    assert_eq!(second_b, b"b-two");

    // Broadcast reaches both clients.
    let notice = LengthPrefixed::new().encode(b"everyone");
    assert_eq!(listener.send_all(&notice), 2);
    assert_eq!(read_message(&mut a).unwrap(), b"everyone");
    assert_eq!(read_message(&mut b).unwrap(), b"everyone");

    // Closing A twice still disconnects it exactly once and leaves B alone.
    listener.close_client(remote_a);
    listener.close_client(remote_a);
    pump(&listener, &events, &mut state, |s| {
        s.disconnects.get(&remote_a) == Some(&1)
    });
    assert!(!listener.contains_client(remote_a));
    assert!(listener.contains_client(remote_b));
    assert!(read_message(&mut a).is_err());

    // Stopping the listener keeps B connected; dropping it closes B.
    listener.stop();
    pump(&listener, &events, &mut state, |s| s.stopped);
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
    let echoed = state.echoed;
    write_message(&mut b, b"still-here").unwrap();
    pump(&listener, &events, &mut state, |s| s.echoed == echoed + 1);
    assert_eq!(read_message(&mut b).unwrap(), b"still-here");

    drop(listener);
    assert!(read_message(&mut b).is_err());
    assert_eq!(state.disconnects.get(&remote_a), Some(&1));
}
