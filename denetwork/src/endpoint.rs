//! Non-blocking UDP transport: the `Endpoint`/`Listener` pair that moves
//! raw datagrams in and out of the process.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};

use crate::address::Address;
use crate::error::{ErrorUtils, NetworkResult};
use crate::message::Message;

const SOCKET_TOKEN: Token = Token(0);

/// Receives datagrams an `Endpoint` pulls off the wire. Implemented by
/// whatever owns the endpoint (a `Connection` or a `Server`).
pub trait Listener {
    fn received_datagram(&mut self, from: Address, data: &[u8]);
}

/// A transport that can send and receive UDP datagrams without blocking.
/// Implementations are not required to be backed by a real socket; tests
/// may substitute an in-memory pair.
pub trait Endpoint {
    /// Binds the endpoint to `address` (`0.0.0.0`/`::` for "any"). Fails if
    /// already open.
    fn open(&mut self, address: Address) -> NetworkResult<()>;

    /// Closes the endpoint if open. Idempotent.
    fn close(&mut self);

    /// Sends `message`'s contents to `address`. A partial UDP write is
    /// treated as fatal since a datagram is sent whole or not at all.
    fn send_datagram(&mut self, address: Address, message: &Message) -> NetworkResult<()>;

    /// One non-blocking sweep: delivers every datagram currently queued on
    /// the socket to `listener`, then returns. Never blocks regardless of
    /// `timeout`; `timeout` only bounds how long the underlying poll waits
    /// for the socket to become readable.
    fn poll(&mut self, listener: &mut dyn Listener, timeout: Option<Duration>) -> io::Result<()>;

    /// The address this endpoint is bound to, once open.
    fn local_address(&self) -> Option<Address>;
}

/// `Endpoint` backed by `mio::net::UdpSocket`.
pub struct UdpEndpoint {
    socket: Option<UdpSocket>,
    poll: Poll,
    events: Events,
    local_address: Option<Address>,
    recv_buf: [u8; 65536],
}

impl UdpEndpoint {
    pub fn new() -> io::Result<UdpEndpoint> {
        Ok(UdpEndpoint {
            socket: None,
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            local_address: None,
            recv_buf: [0u8; 65536],
        })
    }
}

impl Endpoint for UdpEndpoint {
    fn open(&mut self, address: Address) -> NetworkResult<()> {
        if self.socket.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "endpoint already open").into());
        }

        let socket_addr = address.to_socket();
        let mut socket = UdpSocket::bind(socket_addr)?;
        self.poll
            .registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        self.local_address = Some(Address::from_socket(socket.local_addr()?));
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = self.poll.registry().deregister(&mut socket);
        }
        self.local_address = None;
    }

    fn send_datagram(&mut self, address: Address, message: &Message) -> NetworkResult<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint not open"))?;

        let data = message.as_slice();
        let sent = socket.send_to(data, address.to_socket())?;
        if sent != data.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "partial datagram write").into());
        }
        Ok(())
    }

    fn poll(&mut self, listener: &mut dyn Listener, timeout: Option<Duration>) -> io::Result<()> {
        let socket = match &self.socket {
            Some(socket) => socket,
            None => return Ok(()),
        };

        self.poll.poll(&mut self.events, timeout)?;

        if !self.events.iter().any(|e| e.token() == SOCKET_TOKEN && e.is_readable()) {
            return Ok(());
        }

        loop {
            match socket.recv_from(&mut self.recv_buf) {
                Ok((len, from)) => {
                    let address = Address::from_socket(from);
                    listener.received_datagram(address, &self.recv_buf[..len]);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    fn local_address(&self) -> Option<Address> {
        self.local_address
    }
}

/// Resolves a hostname or address literal plus port into a concrete
/// `Address`, preferring IPv4 results when both families are available.
pub fn resolve_address(host: &str, port: u16) -> NetworkResult<Address> {
    use std::net::ToSocketAddrs;

    let mut candidates = (host, port).to_socket_addrs()?;
    let first_v4 = candidates.find(|a| a.is_ipv4());
    match first_v4 {
        Some(addr) => Ok(Address::from_socket(addr)),
        None => {
            let mut candidates = (host, port).to_socket_addrs()?;
            candidates
                .next()
                .map(Address::from_socket)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address found").into())
        }
    }
}

/// The address this host would present to the outside world. Interface
/// enumeration is platform-specific plumbing this crate doesn't carry;
/// callers that need it should resolve it themselves and pass the result
/// in, e.g. as a `ServerConfig::bind_address` override.
pub fn find_public_address() -> NetworkResult<Address> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "find_public_address: not implemented on this platform").into())
}

/// All local addresses bound to network interfaces on this host. See
/// `find_public_address`.
pub fn find_all_addresses() -> NetworkResult<Vec<Address>> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "find_all_addresses: not implemented on this platform").into())
}

#[allow(dead_code)]
fn is_loopback(addr: &Address) -> bool {
    match addr.to_socket().ip() {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}
