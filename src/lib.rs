//! Peershare: serverless LAN sessions between peers that share a secret
//!
//! Each participant advertises itself under a service name, discovers the
//! others, and keeps one PSK-authenticated, encrypted TCP connection to each.
//! Over that connection peers exchange identities, heartbeats and opaque
//! application messages.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Session (public handle, EventSink)       │
//! ├──────────────────────────────────────────┤
//! │ Coordinator (mio loop, control cycle)    │
//! ├───────────────┬──────────────┬───────────┤
//! │ Discovery     │ Listener     │ Peer      │
//! │ (Directory)   │              │ Connection│
//! ├───────────────┴──────────────┼───────────┤
//! │                              │ Framing   │
//! │ mDNS / in-process directory  ├───────────┤
//! │                              │ Secure    │
//! └──────────────────────────────┴───────────┘
//! ```

pub mod clock;
pub mod config;
pub mod connection;
mod coordinator;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod listener;
pub mod metrics;
pub mod peer;
pub mod secure;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SessionConfig;
pub use connection::{ConnectionState, Endpoint};
pub use discovery::{Directory, LocalDirectory, MdnsDirectory, ServiceEndpoint};
pub use error::SessionError;
pub use framing::{Frame, FrameDecoder, MessageKind};
pub use metrics::Metrics;
pub use peer::PeerInfo;
pub use session::{EventSink, Session, SessionEvent};
