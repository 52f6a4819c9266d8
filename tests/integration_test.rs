//! Integration tests for sessions
//!
//! Real sessions over loopback TCP, discovering each other through a shared
//! in-process directory.

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use peershare::{LocalDirectory, PeerInfo, Session, SessionConfig, SessionEvent};

const SERVICE: &str = "_test1._tcp";

/// Generous upper bound for anything that should happen "soon"
const WAIT: Duration = Duration::from_secs(10);

/// Test participant that records every notification it sees
struct Participant {
    session: Session,
    events: Receiver<SessionEvent>,
    peers: Vec<PeerInfo>,
    joined: Vec<String>,
    messages: Vec<(String, Vec<u8>)>,
    errors: usize,
    ever_connected: bool,
}

impl Participant {
    fn new(directory: &LocalDirectory, id: &str, name: &str) -> Self {
        Self::with(directory, id, name, SERVICE, "1234")
    }

    fn with(directory: &LocalDirectory, id: &str, name: &str, service: &str, secret: &str) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let config = SessionConfig::new(PeerInfo::with_id(id, [("name", name)]), service, secret, "IDENTITY")
            .with_bind_addr("127.0.0.1:0".parse().unwrap())
            .with_heartbeat_interval(Duration::from_millis(200))
            .with_connection_timeout(Duration::from_secs(1))
            .with_max_message_size(64 * 1024);

        let (tx, events) = mpsc::channel::<SessionEvent>();
        let mut session = Session::new(config, Arc::new(directory.clone()), tx);
        session.start_sharing().unwrap();

        Participant {
            session,
            events,
            peers: Vec::new(),
            joined: Vec::new(),
            messages: Vec::new(),
            errors: 0,
            ever_connected: false,
        }
    }

    /// Drain pending notifications into the recorded state
    fn poll(&mut self) {
        for event in self.events.try_iter() {
            match event {
                SessionEvent::PeersChanged(peers) => {
                    self.ever_connected |= !peers.is_empty();
                    self.peers = peers;
                }
                SessionEvent::PeerJoined(info) => self.joined.push(info.peer_id().to_string()),
                SessionEvent::Message { from, data } => {
                    self.messages.push((from.peer_id().to_string(), data))
                }
                SessionEvent::Error(_) => self.errors += 1,
            }
        }
    }

    fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.iter().map(|p| p.peer_id().to_string()).collect();
        ids.sort();
        ids
    }
}

/// Retry `check` until it holds or `timeout` passes
fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    check()
}

fn connect_pair(directory: &LocalDirectory) -> (Participant, Participant) {
    let mut a = Participant::new(directory, "A", "Tim");
    let mut b = Participant::new(directory, "B", "Eddy");

    assert!(eventually(WAIT, || {
        a.poll();
        b.poll();
        a.peer_ids() == ["B"] && b.peer_ids() == ["A"]
    }));
    (a, b)
}

#[test]
fn test_two_peers_connect_and_exchange_identity() {
    let directory = LocalDirectory::new();
    let (a, b) = connect_pair(&directory);

    assert_eq!(a.peers[0].attribute("name"), Some("Eddy"));
    assert_eq!(b.peers[0].attribute("name"), Some("Tim"));
    assert!(a.joined.contains(&"B".to_string()));
    assert!(b.joined.contains(&"A".to_string()));
    assert_eq!(a.errors, 0);
    assert_eq!(b.errors, 0);
}

#[test]
fn test_send_to_one_and_to_all() {
    let directory = LocalDirectory::new();
    let (mut a, mut b) = connect_pair(&directory);

    b.session.send("A", b"hello A".to_vec());
    a.session.send_to_all(b"hello everyone".to_vec());
    a.session.send("nobody", b"lost".to_vec());

    assert!(eventually(WAIT, || {
        a.poll();
        b.poll();
        !a.messages.is_empty() && !b.messages.is_empty()
    }));

    assert_eq!(a.messages, vec![("B".to_string(), b"hello A".to_vec())]);
    assert_eq!(b.messages, vec![("A".to_string(), b"hello everyone".to_vec())]);
}

#[test]
fn test_messages_arrive_in_order() {
    let directory = LocalDirectory::new();
    let (mut a, mut b) = connect_pair(&directory);

    for i in 0..50u32 {
        a.session.send("B", i.to_be_bytes().to_vec());
    }

    assert!(eventually(WAIT, || {
        b.poll();
        b.messages.len() == 50
    }));
    let received: Vec<u32> = b
        .messages
        .iter()
        .map(|(_, data)| u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
        .collect();
    assert_eq!(received, (0..50).collect::<Vec<u32>>());
}

#[test]
fn test_three_peers_form_full_mesh() {
    let directory = LocalDirectory::new();
    let mut a = Participant::new(&directory, "A", "Tim");
    let mut b = Participant::new(&directory, "B", "Eddy");
    let mut c = Participant::new(&directory, "C", "Craig");

    assert!(eventually(WAIT, || {
        a.poll();
        b.poll();
        c.poll();
        a.peer_ids() == ["B", "C"] && b.peer_ids() == ["A", "C"] && c.peer_ids() == ["A", "B"]
    }));

    // One connection per pair: each side accepted or initiated, never both
    let initiated: u64 = [&a, &b, &c]
        .iter()
        .map(|p| {
            p.session
                .metrics()
                .connections_initiated_total
                .load(std::sync::atomic::Ordering::Relaxed)
        })
        .sum();
    assert_eq!(initiated, 3);
}

#[test]
fn test_stop_and_restart_reconnects() {
    let directory = LocalDirectory::new();
    let (mut a, mut b) = connect_pair(&directory);

    b.session.stop_sharing();
    b.poll();
    assert!(b.peers.is_empty());

    assert!(eventually(WAIT, || {
        a.poll();
        a.peers.is_empty()
    }));

    b.session.start_sharing().unwrap();
    assert!(eventually(WAIT, || {
        a.poll();
        b.poll();
        a.peer_ids() == ["B"] && b.peer_ids() == ["A"]
    }));
}

#[test]
fn test_different_services_never_connect() {
    let directory = LocalDirectory::new();
    let mut a = Participant::with(&directory, "A", "Tim", "_test1._tcp", "1234");
    let mut b = Participant::with(&directory, "B", "Eddy", "_test2._tcp", "1234");

    thread::sleep(Duration::from_secs(1));
    a.poll();
    b.poll();

    assert!(!a.ever_connected);
    assert!(!b.ever_connected);
    assert_eq!(directory.advertised("_test1._tcp"), vec!["A".to_string()]);
}

#[test]
fn test_mismatched_secret_reports_error_and_never_connects() {
    let directory = LocalDirectory::new();
    let mut a = Participant::with(&directory, "A", "Tim", SERVICE, "1234");
    let mut b = Participant::with(&directory, "B", "Eddy", SERVICE, "wrong");

    assert!(eventually(WAIT, || {
        a.poll();
        b.poll();
        a.errors > 0 && b.errors > 0
    }));

    // Further rediscovery cycles keep failing the same way
    thread::sleep(Duration::from_millis(500));
    a.poll();
    b.poll();
    assert!(!a.ever_connected);
    assert!(!b.ever_connected);
    assert!(a.messages.is_empty());
}

#[test]
fn test_oversized_message_dropped_connection_kept() {
    let directory = LocalDirectory::new();
    let (mut a, mut b) = connect_pair(&directory);

    a.session.send("B", vec![0u8; 64 * 1024 + 1]);
    a.session.send("B", b"small".to_vec());

    assert!(eventually(WAIT, || {
        b.poll();
        !b.messages.is_empty()
    }));
    assert_eq!(b.messages, vec![("A".to_string(), b"small".to_vec())]);

    a.poll();
    assert_eq!(a.peer_ids(), ["B"]);
}

#[test]
fn test_heartbeats_keep_idle_connection_alive() {
    let directory = LocalDirectory::new();
    let (mut a, mut b) = connect_pair(&directory);

    // Several dead-peer timeouts worth of idle time
    thread::sleep(Duration::from_millis(2500));
    a.poll();
    b.poll();

    assert_eq!(a.peer_ids(), ["B"]);
    assert_eq!(b.peer_ids(), ["A"]);
    let pruned = a
        .session
        .metrics()
        .connections_pruned_total
        .load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(pruned, 0);
}
