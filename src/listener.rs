//! Peer listener: accepts inbound streams and advertises the local peer

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};

use crate::discovery::{Advertisement, Directory};
use crate::error::SessionError;

pub struct Listener {
    token: Token,
    bind_addr: SocketAddr,
    socket: Option<TcpListener>,
    local_addr: SocketAddr,
    directory: Arc<dyn Directory>,
    service_type: String,
    /// Advertised instance name (the local peer id)
    name: String,
    advertisement: Option<Advertisement>,
}

impl Listener {
    /// Bind and register; advertising is a separate step
    pub fn bind(
        registry: &Registry,
        token: Token,
        bind_addr: SocketAddr,
        directory: Arc<dyn Directory>,
        service_type: &str,
        name: &str,
    ) -> Result<Self, SessionError> {
        let (socket, local_addr) = open(registry, token, bind_addr).map_err(SessionError::Bind)?;
        log::info!("Listening on {}", local_addr);

        Ok(Listener {
            token,
            bind_addr,
            socket: Some(socket),
            local_addr,
            directory,
            service_type: service_type.to_string(),
            name: name.to_string(),
            advertisement: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// False after `close` or a failed `restart`
    pub fn is_listening(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_advertised(&self) -> bool {
        self.advertisement.is_some()
    }

    /// Advertise if not already; a failure is logged and retried later
    pub fn ensure_advertised(&mut self) -> bool {
        if self.advertisement.is_some() {
            return true;
        }
        if self.socket.is_none() {
            return false;
        }

        match self
            .directory
            .advertise(&self.service_type, &self.name, self.local_addr)
        {
            Ok(advertisement) => {
                log::info!(
                    "Advertising {} under {} at {}",
                    self.name,
                    self.service_type,
                    self.local_addr
                );
                self.advertisement = Some(advertisement);
                true
            }
            Err(e) => {
                log::warn!("Advertising {} failed: {} (will retry)", self.service_type, e);
                false
            }
        }
    }

    /// Drain every pending inbound stream
    ///
    /// An error other than `WouldBlock` means the listening socket is broken
    /// and must be restarted.
    pub fn accept(&mut self) -> io::Result<Vec<(TcpStream, SocketAddr)>> {
        let socket = match self.socket.as_ref() {
            Some(socket) => socket,
            None => return Ok(Vec::new()),
        };

        let mut accepted = Vec::new();
        loop {
            match socket.accept() {
                Ok((stream, addr)) => {
                    log::debug!("Accepted inbound stream from {}", addr);
                    accepted.push((stream, addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(accepted),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_transient(&e) => {
                    log::debug!("Transient accept error: {}", e);
                    continue;
                }
                Err(e) => {
                    if accepted.is_empty() {
                        return Err(e);
                    }
                    log::warn!("Accept failed after {} streams: {}", accepted.len(), e);
                    return Ok(accepted);
                }
            }
        }
    }

    /// Rebind the socket and re-advertise
    pub fn restart(&mut self, registry: &Registry) -> Result<(), SessionError> {
        self.close(registry);

        let (socket, local_addr) =
            open(registry, self.token, self.bind_addr).map_err(SessionError::Bind)?;
        log::info!("Listener restarted on {}", local_addr);
        self.socket = Some(socket);
        self.local_addr = local_addr;
        self.ensure_advertised();
        Ok(())
    }

    /// Withdraw the advertisement and stop accepting
    pub fn close(&mut self, registry: &Registry) {
        self.advertisement = None;
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = registry.deregister(&mut socket) {
                log::debug!("Deregister listener failed: {}", e);
            }
        }
    }
}

fn open(
    registry: &Registry,
    token: Token,
    bind_addr: SocketAddr,
) -> io::Result<(TcpListener, SocketAddr)> {
    let mut socket = TcpListener::bind(bind_addr)?;
    let local_addr = socket.local_addr()?;
    registry.register(&mut socket, token, Interest::READABLE)?;
    Ok((socket, local_addr))
}

/// Per-connection accept failures that leave the listener usable
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}
