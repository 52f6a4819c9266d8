//! Peershare chat
//!
//! Terminal chat over a LAN session:
//! - Advertises and browses via mDNS under `--service`
//! - Connects to every peer that knows the same `--secret`/`--identity`
//! - Sends each stdin line to all peers (`/to <peer id> <text>` for one)

use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use peershare::{MdnsDirectory, PeerInfo, Session, SessionConfig, SessionEvent};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_SERVICE: &str = "_peershare._tcp";

const DEFAULT_IDENTITY: &str = "peershare";

/// How often the main loop checks for shutdown
const TICK: Duration = Duration::from_millis(100);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // --service <type>    Service type to advertise and browse
    // --secret <secret>   Pre-shared secret (required)
    // --identity <label>  PSK identity label
    // --name <name>       Display name shown to peers
    // --bind <addr:port>  Listener address
    let args: Vec<String> = std::env::args().collect();

    let service = parse_arg(&args, "--service").unwrap_or_else(|| DEFAULT_SERVICE.to_string());
    let secret = parse_arg(&args, "--secret").ok_or("Missing --secret <secret>")?;
    let identity = parse_arg(&args, "--identity").unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
    let name = parse_arg(&args, "--name").unwrap_or_else(default_name);
    let bind: SocketAddr = parse_arg(&args, "--bind")
        .unwrap_or_else(|| peershare::config::DEFAULT_BIND_ADDR.to_string())
        .parse()
        .map_err(|_| "Invalid bind address")?;

    let info = PeerInfo::new([("name", name.as_str())]);

    log::info!("Peershare starting...");
    log::info!("  Peer:     {} ({})", info.peer_id(), name);
    log::info!("  Service:  {}", service);
    log::info!("  Identity: {}", identity);
    log::info!("  Bind:     {}", bind);

    let config = SessionConfig::new(info, service, secret, identity).with_bind_addr(bind);

    let directory = Arc::new(MdnsDirectory::new()?);
    let (tx, events) = mpsc::channel::<SessionEvent>();
    let mut session = Session::new(config, directory.clone(), tx);
    session.start_sharing()?;

    // Graceful shutdown on SIGINT/SIGTERM
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    let lines = spawn_stdin_reader();
    let mut peers: Vec<PeerInfo> = Vec::new();

    while !term.load(Ordering::Relaxed) {
        match events.recv_timeout(TICK) {
            Ok(event) => print_event(event, &mut peers),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        loop {
            match lines.try_recv() {
                Ok(line) => {
                    if !handle_line(&session, &peers, line.trim()) {
                        term.store(true, Ordering::Relaxed);
                        break;
                    }
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    // stdin closed; keep running until signalled
                    break;
                }
            }
        }
    }

    log::info!("Shutting down...");
    session.stop_sharing();
    directory.shutdown();
    Ok(())
}

/// Parse a command line argument value
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "peershare".to_string())
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("stdin: {}", e);
                    return;
                }
            }
        }
    });
    rx
}

/// Returns false when the user asked to quit
fn handle_line(session: &Session, peers: &[PeerInfo], line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit", _) => return false,
        ("/peers", _) => {
            if peers.is_empty() {
                println!("(no peers)");
            }
            for peer in peers {
                println!("{}  {}", peer.peer_id(), display_name(peer));
            }
        }
        ("/metrics", _) => print!("{}", session.metrics().render()),
        ("/to", rest) => match rest.split_once(' ') {
            Some((to, text)) => session.send(to, text.as_bytes().to_vec()),
            None => println!("usage: /to <peer id> <text>"),
        },
        _ => session.send_to_all(line.as_bytes().to_vec()),
    }
    true
}

fn print_event(event: SessionEvent, peers: &mut Vec<PeerInfo>) {
    match event {
        SessionEvent::PeersChanged(list) => {
            println!("* {} peer(s) connected", list.len());
            *peers = list;
        }
        SessionEvent::PeerJoined(peer) => {
            println!("* {} joined", display_name(&peer));
        }
        SessionEvent::Message { from, data } => {
            println!("<{}> {}", display_name(&from), String::from_utf8_lossy(&data));
        }
        SessionEvent::Error(e) => {
            log::warn!("{}", e);
        }
    }
}

fn display_name(peer: &PeerInfo) -> &str {
    peer.attribute("name").unwrap_or_else(|| peer.peer_id())
}
