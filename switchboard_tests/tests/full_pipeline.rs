// End-to-end tests: a real session center, raw framed peers, and a monitor.
//
// Every test starts its own center on an OS-assigned port and talks to it
// over real localhost TCP. Peers are `TestPeer`s (plain sockets + framing);
// the monitor is the library's `Monitor` running on its own thread.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use switchboard_net::{CenterConfig, CenterHandle, Monitor, MonitorConfig, start_center};
use switchboard_protocol::{
    Ack, DetailResponse, FramePolicy, LengthPrefixed, SESSCREATE, SESSDELETE, SESSDETAIL,
    SESSLOGIN, SessionNotice, SessionType,
};
use switchboard_tests::{TestPeer, wait_for};

/// How long to listen for traffic that must not arrive.
const QUIET: Duration = Duration::from_millis(300);

fn center() -> (CenterHandle, SocketAddr) {
    start_center(CenterConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        poll_timeout: Duration::from_millis(20),
    })
    .unwrap()
}

fn accepted_remotes(detail: &DetailResponse) -> Vec<SocketAddr> {
    detail
        .data
        .iter()
        .filter(|d| d.kind == SessionType::Accept)
        .filter_map(|d| d.remote_addr())
        .collect()
}

#[test]
fn detail_tracks_live_sessions() {
    let (handle, addr) = center();
    let mut asker = TestPeer::connect(addr);
    let others: Vec<TestPeer> = (0..2).map(|_| TestPeer::connect(addr)).collect();
    let expected: Vec<SocketAddr> = others.iter().map(TestPeer::local_addr).collect();

    assert!(wait_for(|| {
        let detail = asker.detail();
        assert!(detail.is_ok());
        accepted_remotes(&detail).len() == 3
    }));
    let detail = asker.detail();
    let listen: Vec<_> = detail
        .data
        .iter()
        .filter(|d| d.kind == SessionType::Listen)
        .collect();
    assert_eq!(listen.len(), 1);
    assert_eq!(listen[0].local_addr(), Some(addr));
    let remotes = accepted_remotes(&detail);
    assert!(remotes.contains(&asker.local_addr()));
    for remote in &expected {
        assert!(remotes.contains(remote));
    }

    drop(others);
    assert!(wait_for(|| accepted_remotes(&asker.detail()).len() == 1));

    handle.stop();
}

#[test]
fn admin_gets_notices_for_other_sessions_only() {
    let (handle, addr) = center();
    let mut admin = TestPeer::connect(addr);
    assert_eq!(admin.login(true), Ack::ok(SESSLOGIN));
    let mut bystander = TestPeer::connect(addr);
    assert_eq!(bystander.login(false).errcode, 0);
    // The bystander's own create notice arrived before it logged in.
    let created: SessionNotice = admin.recv_id(SESSCREATE);
    assert_eq!(created.data.remote_addr(), Some(bystander.local_addr()));

    let visitor = TestPeer::connect(addr);
    let visitor_addr = visitor.local_addr();
    let created: SessionNotice = admin.recv_id(SESSCREATE);
    assert_eq!(created.data.kind, SessionType::Accept);
    assert_eq!(created.data.remote_addr(), Some(visitor_addr));
    assert!(created.data.conntime.is_some());

    drop(visitor);
    let deleted: SessionNotice = admin.recv_id(SESSDELETE);
    assert_eq!(deleted.data.remote_addr(), Some(visitor_addr));

    assert_eq!(bystander.try_recv_json(QUIET), None);
    assert_eq!(admin.try_recv_json(QUIET), None);

    handle.stop();
}

#[test]
fn request_split_into_single_bytes_is_answered_once() {
    let (handle, addr) = center();
    let mut peer = TestPeer::connect(addr);

    let frame = LengthPrefixed::new().encode(format!(r#"{{"id":"{SESSDETAIL}"}}"#).as_bytes());
    for byte in &frame {
        peer.send_raw(std::slice::from_ref(byte));
        thread::sleep(Duration::from_millis(2));
    }
    let reply: DetailResponse = peer.recv_id(SESSDETAIL);
    assert!(reply.is_ok());
    assert_eq!(peer.try_recv_json(QUIET), None);

    handle.stop();
}

#[test]
fn garbage_and_unknown_services_do_not_break_the_session() {
    let (handle, addr) = center();
    let mut peer = TestPeer::connect(addr);

    peer.send(&serde_json::json!({"id": "service.nope"}));
    peer.send_raw(&[0xFF, 0xFF, 0xFF, 0xFF, b'j', b'u', b'n', b'k']);
    assert_eq!(peer.try_recv_json(QUIET), None);

    let reply = peer.detail();
    assert!(reply.is_ok());
    assert_eq!(accepted_remotes(&reply), vec![peer.local_addr()]);

    peer.send(&serde_json::json!({"id": SESSLOGIN, "admin": 42}));
    assert_eq!(peer.try_recv_json(QUIET), None);
    assert!(peer.detail().is_ok());

    handle.stop();
}

#[test]
fn stopping_the_center_closes_peers() {
    let (handle, addr) = center();
    let mut peer = TestPeer::connect(addr);
    assert!(peer.detail().is_ok());
    handle.stop();
    assert!(peer.is_closed());
}

#[test]
fn monitor_view_follows_the_center() {
    let (center_handle, addr) = center();
    let monitor = Monitor::connect(MonitorConfig {
        server: addr,
        poll_timeout: Duration::from_millis(20),
        admin: true,
    })
    .unwrap();
    monitor.login();
    let monitor = monitor.spawn().unwrap();

    // The snapshot holds the listen endpoint and the monitor's own session.
    assert!(wait_for(|| {
        let view = monitor.view();
        view.servers.len() == 1 && view.clients.len() == 1
    }));
    let view = monitor.view();
    assert_eq!(view.servers[0].ip, addr.ip());
    assert_eq!(view.servers[0].port, addr.port());

    let peer = TestPeer::connect(addr);
    let peer_addr = peer.local_addr();
    assert!(wait_for(|| {
        monitor
            .view()
            .clients
            .iter()
            .any(|c| c.remote == peer_addr && c.connect_time.is_some())
    }));

    drop(peer);
    assert!(wait_for(|| monitor.view().clients.len() == 1));
    assert!(monitor.view().clients.iter().all(|c| c.remote != peer_addr));

    monitor.stop();
    center_handle.stop();
}

#[test]
fn monitor_without_admin_keeps_its_snapshot() {
    let (center_handle, addr) = center();
    let monitor = Monitor::connect(MonitorConfig {
        server: addr,
        poll_timeout: Duration::from_millis(20),
        admin: false,
    })
    .unwrap();
    monitor.login();
    let monitor = monitor.spawn().unwrap();
    assert!(wait_for(|| monitor.view().clients.len() == 1));

    let _peer = TestPeer::connect(addr);
    thread::sleep(QUIET);
    assert_eq!(monitor.view().clients.len(), 1);

    // A fresh detail request picks the new client up.
    monitor.login();
    assert!(wait_for(|| monitor.view().clients.len() == 2));

    monitor.stop();
    center_handle.stop();
}
