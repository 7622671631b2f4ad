//! Listens on a single UDP socket and demultiplexes datagrams across the
//! connections of every peer that has talked to it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use slog::Logger;

use crate::address::Address;
use crate::codec::Reader;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionState, EndpointHandle};
use crate::endpoint::{Endpoint, Listener, UdpEndpoint};
use crate::error::{ErrorUtils, NetworkResult};
use crate::logging;
use crate::proto::Command;

/// Application hook fired when a new inbound connection is accepted. The
/// app typically calls `conn.set_handler(...)` here to attach its
/// per-connection capability object before any further datagram arrives.
pub trait ServerHandler {
    fn client_connected(&mut self, _conn: &mut Connection) {}
}

/// Accepts inbound connections on a single socket, routing each
/// subsequent datagram to the `Connection` that owns its source address.
pub struct Server {
    log: Logger,
    endpoint: Rc<RefCell<UdpEndpoint>>,
    config: ServerConfig,
    connections: HashMap<Address, Connection>,
    last_update: Option<Instant>,
    handler: Option<Rc<RefCell<dyn ServerHandler>>>,
}

impl Server {
    pub fn new(parent_log: Option<&Logger>) -> std::io::Result<Server> {
        let log = logging::child(parent_log, slog::o!("component" => "server"));
        Ok(Server {
            log,
            endpoint: Rc::new(RefCell::new(UdpEndpoint::new()?)),
            config: ServerConfig::default(),
            connections: HashMap::new(),
            last_update: None,
            handler: None,
        })
    }

    /// Plugs in the capability object notified whenever a new connection
    /// is accepted. Replaces any previously set handler.
    pub fn set_handler(&mut self, handler: Rc<RefCell<dyn ServerHandler>>) {
        self.handler = Some(handler);
    }

    /// Binds the listening socket per `config`.
    pub fn listen_on(&mut self, config: ServerConfig) -> NetworkResult<()> {
        let address = crate::address::parse_address(&config.bind_address)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad bind address"))?;
        self.endpoint.borrow_mut().open(address)?;
        slog::info!(self.log, "listening"; "address" => %address);
        self.config = config;
        Ok(())
    }

    #[inline]
    pub fn local_address(&self) -> Option<Address> {
        self.endpoint.borrow().local_address()
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, remote: Address) -> Option<&Connection> {
        self.connections.get(&remote)
    }

    pub fn connection_mut(&mut self, remote: Address) -> Option<&mut Connection> {
        self.connections.get_mut(&remote)
    }

    pub fn connections(&self) -> impl Iterator<Item = (&Address, &Connection)> {
        self.connections.iter()
    }

    /// One non-blocking sweep: reads every queued datagram, routes it to
    /// an existing connection or spins up a new one for a
    /// `CONNECTION_REQUEST`, then advances every connection's timers.
    pub fn poll(&mut self, timeout: Option<Duration>) -> NetworkResult<()> {
        let mut inbox: Vec<(Address, Vec<u8>)> = Vec::new();
        {
            struct Collector<'a>(&'a mut Vec<(Address, Vec<u8>)>);
            impl<'a> Listener for Collector<'a> {
                fn received_datagram(&mut self, from: Address, data: &[u8]) {
                    self.0.push((from, data.to_vec()));
                }
            }
            let mut collector = Collector(&mut inbox);
            self.endpoint.borrow_mut().poll(&mut collector, timeout)?;
        }

        for (from, data) in inbox {
            self.route_datagram(from, &data);
        }

        let now = Instant::now();
        let elapsed = self
            .last_update
            .map(|prev| now.duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);
        self.last_update = Some(now);

        let mut dead = Vec::new();
        for (addr, conn) in self.connections.iter_mut() {
            let result = conn.update(elapsed);
            // A peer-initiated `CONNECTION_CLOSE` disconnects the
            // connection from inside `process_datagram`, not `update`, so
            // `update` returning `Ok` doesn't mean the connection is still
            // live; check its state directly too.
            if result.is_err() || conn.connection_state() == ConnectionState::Disconnected {
                dead.push(*addr);
            }
        }
        for addr in dead {
            self.connections.remove(&addr);
            slog::debug!(self.log, "connection removed"; "remote" => %addr);
        }

        Ok(())
    }

    fn route_datagram(&mut self, from: Address, data: &[u8]) {
        if let Some(conn) = self.connections.get_mut(&from) {
            let _ = conn.process_datagram(from, data);
            return;
        }

        let mut reader = Reader::new(data);
        let command_byte = match reader.read_byte() {
            Ok(b) => b,
            Err(_) => return,
        };

        if Command::from_byte(command_byte) != Some(Command::ConnectionRequest) {
            slog::debug!(self.log, "datagram from unknown peer ignored"; "remote" => %from);
            return;
        }

        if let Some(max) = self.config.max_connections {
            if self.connections.len() >= max {
                slog::debug!(self.log, "rejecting connection, server full"; "remote" => %from);
                return;
            }
        }

        let peer_protocol = reader.read_ushort().unwrap_or(0);

        let mut conn = Connection::new(
            EndpointHandle::Shared(Rc::clone(&self.endpoint)),
            self.config.connection.clone(),
            Some(&self.log),
        );

        match conn.accept_from(from, peer_protocol) {
            Ok(()) => {
                slog::info!(self.log, "connection accepted"; "remote" => %from);
                if let Some(handler) = &self.handler {
                    handler.borrow_mut().client_connected(&mut conn);
                }
                self.connections.insert(from, conn);
            }
            Err(err) => {
                if err.has_failed() {
                    slog::debug!(self.log, "connection rejected"; "remote" => %from, "error" => %err);
                }
            }
        }
    }

    /// Closes the listening socket and drops every connection.
    pub fn dispose(&mut self) {
        for (_, mut conn) in self.connections.drain() {
            conn.disconnect(true);
        }
        self.endpoint.borrow_mut().close();
    }
}
