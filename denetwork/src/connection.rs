//! The connection state machine: handshake, reliable delivery, and
//! state-link routing for a single peer.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use slog::Logger;

use crate::address::Address;
use crate::codec::{Reader, Writer};
use crate::config::ConnectionConfig;
use crate::endpoint::{Endpoint, Listener, UdpEndpoint};
use crate::error::{ErrorUtils, FailureReason, NetworkError, NetworkResult};
use crate::logging;
use crate::message::Message;
use crate::proto::{Command, ConnectionAckResult, LinkDownReason, ValueType, DENETWORK_PROTOCOL};
use crate::state::State;
use crate::state_link::{LinkDirection, LinkId, StateLink};
use crate::value::Value;

/// Largest payload a single datagram is allowed to carry before a
/// reliable message must be split into `ReliableMessageLong` fragments.
const MAX_DATAGRAM_PAYLOAD: usize = 1200;

/// Application hooks for connection-level events. Every method defaults
/// to a no-op so a handler only needs to override what it cares about.
/// Held as a capability object rather than through a class hierarchy: a
/// `Connection` calls out to whatever is plugged into `set_handler`.
pub trait ConnectionHandler {
    /// Fired once, on the side that called `connect_to`, when the peer
    /// accepts the handshake.
    fn connection_established(&mut self) {}

    /// Fired once when a connection attempt or an established connection
    /// fails, before `connection_closed`.
    fn connection_failed(&mut self, _reason: FailureReason) {}

    /// Fired once when the connection is torn down, whichever side or
    /// reason initiated it.
    fn connection_closed(&mut self) {}

    /// Fired for every application message delivered, reliable or not.
    fn message_received(&mut self, _data: &[u8]) {}

    /// Fired after a `LINK_UPDATE` value has been applied to a mirrored
    /// state.
    fn remote_value_changed(&mut self, _link_id: LinkId, _index: usize) {}

    /// Called when a peer publishes a state via `LINK_STATE`. Returning a
    /// `State` whose schema matches the wire schema accepts the link;
    /// returning `None` rejects it.
    fn create_state(&mut self, _identify: &[u8], _read_only: bool) -> Option<State> {
        None
    }
}

/// `Connection::poll` drives its endpoint directly when it owns one
/// (client side), or is driven by a `Server` that demultiplexes a shared
/// socket across many connections (server side). Either way the
/// connection never owns two sockets.
pub enum EndpointHandle {
    Owned(UdpEndpoint),
    Shared(Rc<RefCell<UdpEndpoint>>),
}

impl EndpointHandle {
    fn send_datagram(&mut self, address: Address, message: &Message) -> NetworkResult<()> {
        match self {
            EndpointHandle::Owned(endpoint) => endpoint.send_datagram(address, message),
            EndpointHandle::Shared(endpoint) => endpoint.borrow_mut().send_datagram(address, message),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Which queue a reliably-sent frame belongs to. `RELIABLE_LINK_STATE`
/// shares the same sequence space, send queue and ack mechanism as a
/// plain reliable message; only `Message` payloads are ever split into
/// `RELIABLE_MESSAGE_LONG` fragments, since the wire format has no
/// fragmented `LINK_STATE` variant.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ReliablePayloadKind {
    Message,
    LinkState,
}

struct PendingReliable {
    sequence: u16,
    data: Vec<u8>,
    kind: ReliablePayloadKind,
    elapsed_since_send: f64,
    total_elapsed: f64,
}

/// In-progress reassembly of a fragmented `RELIABLE_MESSAGE_LONG`,
/// indexed by part number rather than arrival order so reordered
/// fragments can't corrupt the reassembled payload.
struct FragmentAssembly {
    sequence: u16,
    part_count: usize,
    parts: Vec<Option<Vec<u8>>>,
}

/// A single reliable/unreliable connection to a remote peer.
pub struct Connection {
    log: Logger,
    config: ConnectionConfig,
    endpoint: EndpointHandle,
    handler: Option<Rc<RefCell<dyn ConnectionHandler>>>,

    local_address: Option<Address>,
    remote_address: Option<Address>,
    state: ConnectionState,

    protocol: u16,

    elapsed_connect_resend: f64,
    elapsed_connect_timeout: f64,
    elapsed_since_receive: f64,

    reliable_number_send: u16,
    reliable_number_recv: u16,
    reliable_send_queue: VecDeque<PendingReliable>,
    reliable_recv_pending: Vec<(u16, Vec<u8>, ReliablePayloadKind)>,
    reliable_fragments: Vec<FragmentAssembly>,

    states: Vec<State>,
    links: Vec<StateLink>,
    next_link_id: LinkId,

    inbound_messages: Vec<Vec<u8>>,
}

impl Connection {
    pub fn new(endpoint: EndpointHandle, config: ConnectionConfig, parent_log: Option<&Logger>) -> Connection {
        let log = logging::child(parent_log, slog::o!("component" => "connection"));
        Connection {
            log,
            config,
            endpoint,
            handler: None,
            local_address: None,
            remote_address: None,
            state: ConnectionState::Disconnected,
            protocol: DENETWORK_PROTOCOL,
            elapsed_connect_resend: 0.0,
            elapsed_connect_timeout: 0.0,
            elapsed_since_receive: 0.0,
            reliable_number_send: 0,
            reliable_number_recv: 0,
            reliable_send_queue: VecDeque::new(),
            reliable_recv_pending: Vec::new(),
            reliable_fragments: Vec::new(),
            states: Vec::new(),
            links: Vec::new(),
            next_link_id: 0,
            inbound_messages: Vec::new(),
        }
    }

    /// Plugs in the capability object that receives this connection's
    /// lifecycle and state-sync callbacks. Replaces any previously set
    /// handler.
    pub fn set_handler(&mut self, handler: Rc<RefCell<dyn ConnectionHandler>>) {
        self.handler = Some(handler);
    }

    #[inline]
    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    #[inline]
    pub fn remote_address(&self) -> Option<Address> {
        self.remote_address
    }

    /// Client-side handshake entry point: opens a local endpoint if
    /// needed and sends the first `CONNECTION_REQUEST`.
    pub fn connect_to(&mut self, remote: Address) -> NetworkResult<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(NetworkError::Fatal(FailureReason::Generic));
        }

        if let EndpointHandle::Owned(endpoint) = &mut self.endpoint {
            if endpoint.local_address().is_none() {
                let bind_addr = match remote {
                    Address::V4 { .. } => Address::ipv4_any(),
                    Address::V6 { .. } => Address::ipv6_any(),
                };
                endpoint.open(bind_addr)?;
            }
            self.local_address = endpoint.local_address();
        }

        self.remote_address = Some(remote);
        self.state = ConnectionState::Connecting;
        self.elapsed_connect_resend = self.config.connect_resend_interval();
        self.elapsed_connect_timeout = 0.0;
        slog::debug!(self.log, "connecting"; "remote" => %remote);
        Ok(())
    }

    /// Server-side acceptance: a `CONNECTION_REQUEST` already arrived and
    /// this connection is being created to answer it.
    pub fn accept_from(&mut self, remote: Address, peer_protocol: u16) -> NetworkResult<()> {
        self.remote_address = Some(remote);
        self.elapsed_since_receive = 0.0;

        let mut msg = Message::new();
        {
            let mut w = msg.writer();
            let mut cursor = w.cursor();
            cursor.write_byte(Command::ConnectionAck.into());
            if peer_protocol == self.protocol {
                cursor.write_byte(ConnectionAckResult::Accept as u8);
                cursor.write_ushort(self.protocol);
                self.state = ConnectionState::Connected;
            } else {
                cursor.write_byte(ConnectionAckResult::RejectNoCommonProtocol as u8);
                cursor.write_ushort(self.protocol);
                self.state = ConnectionState::Disconnected;
            }
        }
        self.endpoint.send_datagram(remote, &msg)?;

        if self.state != ConnectionState::Connected {
            return Err(NetworkError::Fatal(FailureReason::NoCommonProtocol));
        }
        slog::debug!(self.log, "accepted inbound connection"; "remote" => %remote);
        Ok(())
    }

    /// Tears the connection down. Idempotent, like `dispose`: called both
    /// when the application asks to disconnect and when a timeout or a
    /// peer-initiated close drives the same cleanup.
    pub fn disconnect(&mut self, notify: bool) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        if notify {
            if let Some(remote) = self.remote_address {
                let mut msg = Message::new();
                {
                    let mut w = msg.writer();
                    w.cursor().write_byte(Command::ConnectionClose.into());
                }
                let _ = self.endpoint.send_datagram(remote, &msg);
            }
        }

        for link in &mut self.links {
            link.tear_down();
        }
        self.reliable_send_queue.clear();
        self.reliable_recv_pending.clear();
        self.reliable_fragments.clear();
        self.state = ConnectionState::Disconnected;
        slog::debug!(self.log, "disconnected");
        if let Some(handler) = &self.handler {
            handler.borrow_mut().connection_closed();
        }
    }

    /// Sends an unreliable application message.
    pub fn send_message(&mut self, data: &[u8]) -> NetworkResult<()> {
        let remote = self.remote_address.ok_or(NetworkError::Fatal(FailureReason::Generic))?;
        let mut msg = Message::new();
        {
            let mut w = msg.writer();
            let mut cursor = w.cursor();
            cursor.write_byte(Command::Message.into());
            cursor.write_ushort(data.len() as u16);
            cursor.write_bytes(data);
        }
        self.endpoint.send_datagram(remote, &msg)
    }

    /// Queues a reliable application message. Delivery is retried every
    /// `reliable_resend_interval` until acknowledged, up to
    /// `reliable_timeout`, at which point the connection is torn down.
    pub fn send_reliable(&mut self, data: &[u8]) -> NetworkResult<()> {
        let sequence = self.reliable_number_send;
        self.reliable_number_send = self.reliable_number_send.wrapping_add(1);

        self.reliable_send_queue.push_back(PendingReliable {
            sequence,
            data: data.to_vec(),
            kind: ReliablePayloadKind::Message,
            elapsed_since_send: self.config.reliable_resend_interval(),
            total_elapsed: 0.0,
        });

        self.flush_reliable_queue()
    }

    /// Sends a raw command byte followed by `data` verbatim, with no
    /// length prefix. Only fits fixed-width bodies (`LINK_UP`, `LINK_DOWN`);
    /// `MESSAGE`-shaped payloads need their own length-prefixed framing.
    fn send_with_command(&mut self, command: Command, data: &[u8]) -> NetworkResult<()> {
        let remote = self.remote_address.ok_or(NetworkError::Fatal(FailureReason::Generic))?;
        let mut msg = Message::new();
        {
            let mut w = msg.writer();
            let mut cursor = w.cursor();
            cursor.write_byte(command.into());
            cursor.write_bytes(data);
        }
        self.endpoint.send_datagram(remote, &msg)
    }

    fn send_reliable_frame(&mut self, sequence: u16, data: &[u8], kind: ReliablePayloadKind) -> NetworkResult<()> {
        let remote = self.remote_address.ok_or(NetworkError::Fatal(FailureReason::Generic))?;

        match kind {
            ReliablePayloadKind::LinkState => {
                if data.len() > MAX_DATAGRAM_PAYLOAD {
                    return Err(NetworkError::Fatal(FailureReason::InvalidMessage));
                }
                let mut msg = Message::new();
                {
                    let mut w = msg.writer();
                    let mut cursor = w.cursor();
                    cursor.write_byte(Command::ReliableLinkState.into());
                    cursor.write_ushort(sequence);
                    cursor.write_bytes(data);
                }
                self.endpoint.send_datagram(remote, &msg)
            }
            ReliablePayloadKind::Message => {
                if data.len() <= MAX_DATAGRAM_PAYLOAD {
                    let mut msg = Message::new();
                    {
                        let mut w = msg.writer();
                        let mut cursor = w.cursor();
                        cursor.write_byte(Command::ReliableMessage.into());
                        cursor.write_ushort(sequence);
                        cursor.write_ushort(data.len() as u16);
                        cursor.write_bytes(data);
                    }
                    return self.endpoint.send_datagram(remote, &msg);
                }

                let part_count = (data.len() + MAX_DATAGRAM_PAYLOAD - 1) / MAX_DATAGRAM_PAYLOAD;
                for (part_index, chunk) in data.chunks(MAX_DATAGRAM_PAYLOAD).enumerate() {
                    let mut msg = Message::new();
                    {
                        let mut w = msg.writer();
                        let mut cursor = w.cursor();
                        cursor.write_byte(Command::ReliableMessageLong.into());
                        cursor.write_ushort(sequence);
                        cursor.write_ushort(part_index as u16);
                        cursor.write_ushort(part_count as u16);
                        cursor.write_ushort(chunk.len() as u16);
                        cursor.write_bytes(chunk);
                    }
                    self.endpoint.send_datagram(remote, &msg)?;
                }
                Ok(())
            }
        }
    }

    fn flush_reliable_queue(&mut self) -> NetworkResult<()> {
        let window = self.config.reliable_window_size() as usize;
        let in_flight: Vec<(u16, Vec<u8>, ReliablePayloadKind)> = self
            .reliable_send_queue
            .iter()
            .take(window)
            .map(|p| (p.sequence, p.data.clone(), p.kind))
            .collect();

        for (sequence, data, kind) in in_flight {
            self.send_reliable_frame(sequence, &data, kind)?;
        }
        Ok(())
    }

    /// Drains messages received since the last call.
    pub fn take_received_messages(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.inbound_messages)
    }

    /// Publishes a new state to the peer over `LINK_STATE`: a local,
    /// writable state is created from `values`, frozen against further
    /// schema changes, and announced reliably. The peer answers with
    /// `LINK_UP` (accepted) or `LINK_DOWN` (rejected or schema mismatch).
    /// `identify` is opaque to this crate; the peer's `create_state` hook
    /// decides what it means.
    pub fn publish_state(&mut self, identify: &[u8], read_only: bool, values: Vec<Value>) -> NetworkResult<LinkId> {
        if identify.len() > u16::MAX as usize {
            return Err(NetworkError::Fatal(FailureReason::InvalidMessage));
        }

        let mut state = State::new(false);
        for value in values {
            state.add_value(value).expect("freshly created state is never linked");
        }
        let schema = state.schema();
        state.mark_linked();

        let state_id = self.states.len();
        self.states.push(state);

        let link_id = self.next_link_id;
        self.next_link_id = self.next_link_id.wrapping_add(1);

        let mut link = StateLink::new(link_id, state_id, LinkDirection::Outgoing);
        link.listen()?;
        for index in 0..schema.len() {
            link.mark_dirty(index);
        }
        self.links.push(link);

        let mut body = Vec::new();
        {
            let mut w = Writer::new(&mut body);
            w.write_ushort(link_id);
            w.write_byte(read_only as u8);
            w.write_ushort(schema.len() as u16);
            for (index, value_type) in schema.iter().enumerate() {
                w.write_byte((*value_type).into());
                self.states[state_id]
                    .value(index)
                    .expect("index within freshly built schema")
                    .write(&mut w)?;
            }
            w.write_ushort(identify.len() as u16);
            w.write_bytes(identify);
        }

        let sequence = self.reliable_number_send;
        self.reliable_number_send = self.reliable_number_send.wrapping_add(1);
        self.reliable_send_queue.push_back(PendingReliable {
            sequence,
            data: body,
            kind: ReliablePayloadKind::LinkState,
            elapsed_since_send: self.config.reliable_resend_interval(),
            total_elapsed: 0.0,
        });

        self.flush_reliable_queue()?;
        Ok(link_id)
    }

    fn link_index(&self, link_id: LinkId) -> Option<usize> {
        self.links.iter().position(|l| l.link_id() == link_id)
    }

    /// The state behind `link_id`, if the link exists. On an `Outgoing`
    /// link this is the writable local state the application mutates; on
    /// an `Incoming` link it's the read-only mirror `LINK_UPDATE` writes
    /// into.
    pub fn state(&self, link_id: LinkId) -> Option<&State> {
        let idx = self.link_index(link_id)?;
        let state_id = self.links[idx].state_id();
        self.states.get(state_id)
    }

    /// Mutable access to the state behind `link_id`, for an application
    /// to change values on an `Outgoing` link between `update()` calls.
    /// The next `update()` detects and pushes any changes via `LINK_UPDATE`.
    pub fn state_mut(&mut self, link_id: LinkId) -> Option<&mut State> {
        let idx = self.link_index(link_id)?;
        let state_id = self.links[idx].state_id();
        self.states.get_mut(state_id)
    }

    /// Advances timers by `elapsed` seconds: connect retries/timeout,
    /// reliable resend/timeout, and pushing any dirty outgoing state
    /// link values.
    pub fn update(&mut self, elapsed: f64) -> NetworkResult<()> {
        match self.state {
            ConnectionState::Connecting => self.update_connecting(elapsed)?,
            ConnectionState::Connected => self.update_connected(elapsed)?,
            ConnectionState::Disconnected => {}
        }
        Ok(())
    }

    fn update_connecting(&mut self, elapsed: f64) -> NetworkResult<()> {
        self.elapsed_connect_timeout += elapsed;
        if self.elapsed_connect_timeout >= self.config.connect_timeout() {
            self.state = ConnectionState::Disconnected;
            if let Some(handler) = &self.handler {
                handler.borrow_mut().connection_failed(FailureReason::Timeout);
                handler.borrow_mut().connection_closed();
            }
            return Err(NetworkError::Fatal(FailureReason::Timeout));
        }

        self.elapsed_connect_resend += elapsed;
        if self.elapsed_connect_resend >= self.config.connect_resend_interval() {
            self.elapsed_connect_resend = 0.0;
            if let Some(remote) = self.remote_address {
                let mut msg = Message::new();
                {
                    let mut w = msg.writer();
                    let mut cursor = w.cursor();
                    cursor.write_byte(Command::ConnectionRequest.into());
                    cursor.write_ushort(self.protocol);
                }
                self.endpoint.send_datagram(remote, &msg)?;
            }
        }
        Ok(())
    }

    fn update_connected(&mut self, elapsed: f64) -> NetworkResult<()> {
        let timeout = self.config.reliable_timeout();
        let resend = self.config.reliable_resend_interval();
        let mut timed_out = false;

        self.elapsed_since_receive += elapsed;
        if self.elapsed_since_receive >= timeout {
            timed_out = true;
        }

        for pending in self.reliable_send_queue.iter_mut() {
            pending.total_elapsed += elapsed;
            pending.elapsed_since_send += elapsed;
            if pending.total_elapsed >= timeout {
                timed_out = true;
            }
        }

        if timed_out {
            if let Some(handler) = &self.handler {
                handler.borrow_mut().connection_failed(FailureReason::Timeout);
            }
            self.disconnect(true);
            return Err(NetworkError::Fatal(FailureReason::Timeout));
        }

        let window = self.config.reliable_window_size() as usize;
        let due: Vec<(u16, Vec<u8>, ReliablePayloadKind)> = self
            .reliable_send_queue
            .iter_mut()
            .take(window)
            .filter(|p| p.elapsed_since_send >= resend)
            .map(|p| {
                p.elapsed_since_send = 0.0;
                (p.sequence, p.data.clone(), p.kind)
            })
            .collect();

        for (sequence, data, kind) in due {
            self.send_reliable_frame(sequence, &data, kind)?;
        }

        for link_idx in 0..self.links.len() {
            if self.links[link_idx].direction() != LinkDirection::Outgoing || !self.links[link_idx].is_up() {
                continue;
            }
            let state_id = self.links[link_idx].state_id();
            let dirty = self.states[state_id].sync(false);
            for index in dirty {
                self.links[link_idx].mark_dirty(index);
            }
            if self.links[link_idx].has_pending_updates() {
                self.send_link_update(link_idx)?;
            }
        }
        Ok(())
    }

    fn send_link_update(&mut self, link_idx: usize) -> NetworkResult<()> {
        let remote = self.remote_address.ok_or(NetworkError::Fatal(FailureReason::Generic))?;
        let link_id = self.links[link_idx].link_id();
        let state_id = self.links[link_idx].state_id();
        let indices = self.links[link_idx].drain_dirty();

        let mut msg = Message::new();
        {
            let mut w = msg.writer();
            let mut cursor = w.cursor();
            cursor.write_byte(Command::LinkUpdate.into());
            cursor.write_ushort(link_id);
            cursor.write_ushort(indices.len() as u16);
            for index in indices {
                cursor.write_ushort(index as u16);
                if let Some(value) = self.states[state_id].value(index) {
                    value.write(&mut cursor)?;
                }
            }
        }
        self.endpoint.send_datagram(remote, &msg)
    }

    fn send_link_up(&mut self, link_id: LinkId) -> NetworkResult<()> {
        let mut buf = Vec::new();
        Writer::new(&mut buf).write_ushort(link_id);
        self.send_with_command(Command::LinkUp, &buf)
    }

    fn send_link_down(&mut self, link_id: LinkId, reason: LinkDownReason) -> NetworkResult<()> {
        let mut buf = Vec::new();
        {
            let mut w = Writer::new(&mut buf);
            w.write_ushort(link_id);
            w.write_byte(reason as u8);
        }
        self.send_with_command(Command::LinkDown, &buf)
    }

    fn ack_reliable(&mut self, sequence: u16) {
        self.reliable_send_queue.retain(|p| p.sequence != sequence);
    }

    fn dispatch(&mut self, from: Address, command: Command, reader: &mut Reader<'_>) -> NetworkResult<()> {
        match command {
            Command::ConnectionAck => {
                let result = reader.read_byte()?;
                let chosen_protocol = reader.read_ushort()?;
                match ConnectionAckResult::from_byte(result) {
                    Some(ConnectionAckResult::Accept) => {
                        self.state = ConnectionState::Connected;
                        self.remote_address = Some(from);
                        self.protocol = chosen_protocol;
                        slog::debug!(self.log, "connection established"; "remote" => %from);
                        if let Some(handler) = &self.handler {
                            handler.borrow_mut().connection_established();
                        }
                    }
                    Some(ConnectionAckResult::RejectNoCommonProtocol) => {
                        self.state = ConnectionState::Disconnected;
                        if let Some(handler) = &self.handler {
                            handler.borrow_mut().connection_failed(FailureReason::NoCommonProtocol);
                            handler.borrow_mut().connection_closed();
                        }
                        return Err(NetworkError::Fatal(FailureReason::NoCommonProtocol));
                    }
                    _ => {
                        self.state = ConnectionState::Disconnected;
                        if let Some(handler) = &self.handler {
                            handler.borrow_mut().connection_failed(FailureReason::Rejected);
                            handler.borrow_mut().connection_closed();
                        }
                        return Err(NetworkError::Fatal(FailureReason::Rejected));
                    }
                }
                Ok(())
            }
            Command::ConnectionClose => {
                self.disconnect(false);
                Ok(())
            }
            Command::Message => {
                let length = reader.read_ushort()? as usize;
                let data = reader.read_bytes(length)?.to_vec();
                if let Some(handler) = &self.handler {
                    handler.borrow_mut().message_received(&data);
                }
                self.inbound_messages.push(data);
                Ok(())
            }
            Command::ReliableMessage => {
                let sequence = reader.read_ushort()?;
                let length = reader.read_ushort()? as usize;
                let data = reader.read_bytes(length)?.to_vec();
                self.receive_reliable(sequence, data, ReliablePayloadKind::Message)
            }
            Command::ReliableMessageLong => {
                let sequence = reader.read_ushort()?;
                let part_index = reader.read_ushort()? as usize;
                let part_count = reader.read_ushort()? as usize;
                let length = reader.read_ushort()? as usize;
                let chunk = reader.read_bytes(length)?.to_vec();
                self.receive_reliable_fragment(sequence, part_index, part_count, chunk)
            }
            Command::ReliableAck => {
                let sequence = reader.read_ushort()?;
                let _result = reader.read_byte()?;
                self.ack_reliable(sequence);
                Ok(())
            }
            Command::ReliableLinkState => {
                let sequence = reader.read_ushort()?;
                let body = reader.read_bytes(reader.remaining())?.to_vec();
                self.receive_reliable(sequence, body, ReliablePayloadKind::LinkState)
            }
            Command::LinkUp => {
                let link_id = reader.read_ushort()?;
                if let Some(idx) = self.link_index(link_id) {
                    self.links[idx].bring_up()?;
                    let state_id = self.links[idx].state_id();
                    for index in 0..self.states[state_id].len() {
                        self.links[idx].mark_dirty(index);
                    }
                }
                Ok(())
            }
            Command::LinkDown => {
                let link_id = reader.read_ushort()?;
                let _reason = LinkDownReason::from_byte(reader.read_byte()?);
                if let Some(idx) = self.link_index(link_id) {
                    self.links[idx].tear_down();
                }
                Ok(())
            }
            Command::LinkUpdate => {
                let link_id = reader.read_ushort()?;
                let count = reader.read_ushort()? as usize;
                let idx = match self.link_index(link_id) {
                    Some(idx) => idx,
                    None => {
                        slog::debug!(self.log, "link update for unknown link"; "link_id" => link_id);
                        return self.send_link_down(link_id, LinkDownReason::UnknownLink);
                    }
                };
                let state_id = self.links[idx].state_id();
                for _ in 0..count {
                    let value_index = reader.read_ushort()? as usize;
                    self.states[state_id].apply_update(value_index, reader)?;
                    if let Some(handler) = &self.handler {
                        handler.borrow_mut().remote_value_changed(link_id, value_index);
                    }
                }
                Ok(())
            }
            Command::ConnectionRequest => Ok(()),
        }
    }

    /// Decodes a `LINK_STATE` body (everything after the reliable
    /// sequence number), asks the handler whether to accept it, and
    /// answers with `LINK_UP` or `LINK_DOWN`.
    fn handle_link_state(&mut self, body: Vec<u8>) -> NetworkResult<()> {
        let mut reader = Reader::new(&body);
        let link_id = reader.read_ushort()?;
        let read_only = reader.read_byte()? != 0;
        let schema_len = reader.read_ushort()? as usize;

        let mut values = Vec::with_capacity(schema_len);
        for _ in 0..schema_len {
            let type_byte = reader.read_byte()?;
            let value_type = ValueType::from_byte(type_byte).ok_or(NetworkError::Fatal(FailureReason::InvalidMessage))?;
            let mut value = Value::from_type(value_type);
            value.read(&mut reader)?;
            values.push(value);
        }

        let identify_len = reader.read_ushort()? as usize;
        let identify = reader.read_bytes(identify_len)?.to_vec();
        let schema: Vec<ValueType> = values.iter().map(|v| v.value_type()).collect();

        let proposed_state = match &self.handler {
            Some(handler) => handler.borrow_mut().create_state(&identify, read_only),
            None => None,
        };

        let proposed_state = match proposed_state {
            Some(state) => state,
            None => return self.send_link_down(link_id, LinkDownReason::Rejected),
        };

        if proposed_state.schema() != schema {
            return self.send_link_down(link_id, LinkDownReason::MismatchedSchema);
        }

        let mut mirrored = State::new(read_only);
        for value in values {
            mirrored.add_value(value).expect("freshly created state is never linked");
        }
        mirrored.mark_linked();

        let state_id = self.states.len();
        self.states.push(mirrored);

        let mut link = StateLink::new(link_id, state_id, LinkDirection::Incoming);
        link.listen()?;
        link.bring_up()?;
        self.links.push(link);

        self.send_link_up(link_id)
    }

    fn receive_reliable(&mut self, sequence: u16, data: Vec<u8>, kind: ReliablePayloadKind) -> NetworkResult<()> {
        if sequence == self.reliable_number_recv {
            self.reliable_number_recv = self.reliable_number_recv.wrapping_add(1);
            self.deliver_reliable_payload(kind, data)?;
            self.drain_pending_reliable()?;
        } else if sequence_in_window(self.reliable_number_recv, sequence) {
            if !self.reliable_recv_pending.iter().any(|(s, _, _)| *s == sequence) {
                self.reliable_recv_pending.push((sequence, data, kind));
            }
        }
        self.send_reliable_ack(sequence)
    }

    fn deliver_reliable_payload(&mut self, kind: ReliablePayloadKind, data: Vec<u8>) -> NetworkResult<()> {
        match kind {
            ReliablePayloadKind::Message => {
                if let Some(handler) = &self.handler {
                    handler.borrow_mut().message_received(&data);
                }
                self.inbound_messages.push(data);
                Ok(())
            }
            ReliablePayloadKind::LinkState => self.handle_link_state(data),
        }
    }

    fn receive_reliable_fragment(
        &mut self,
        sequence: u16,
        part_index: usize,
        part_count: usize,
        chunk: Vec<u8>,
    ) -> NetworkResult<()> {
        if part_count == 0 || part_index >= part_count {
            return Err(NetworkError::Fatal(FailureReason::InvalidMessage));
        }

        let idx = match self.reliable_fragments.iter().position(|f| f.sequence == sequence) {
            Some(idx) => idx,
            None => {
                self.reliable_fragments.push(FragmentAssembly {
                    sequence,
                    part_count,
                    parts: vec![None; part_count],
                });
                self.reliable_fragments.len() - 1
            }
        };

        if self.reliable_fragments[idx].part_count != part_count {
            return Err(NetworkError::Fatal(FailureReason::InvalidMessage));
        }
        self.reliable_fragments[idx].parts[part_index] = Some(chunk);

        if self.reliable_fragments[idx].parts.iter().all(|p| p.is_some()) {
            let assembly = self.reliable_fragments.remove(idx);
            let data: Vec<u8> = assembly.parts.into_iter().flatten().flatten().collect();
            return self.receive_reliable(sequence, data, ReliablePayloadKind::Message);
        }
        Ok(())
    }

    fn drain_pending_reliable(&mut self) -> NetworkResult<()> {
        loop {
            let next = self.reliable_number_recv;
            if let Some(pos) = self.reliable_recv_pending.iter().position(|(s, _, _)| *s == next) {
                let (_, data, kind) = self.reliable_recv_pending.remove(pos);
                self.reliable_number_recv = self.reliable_number_recv.wrapping_add(1);
                self.deliver_reliable_payload(kind, data)?;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn send_reliable_ack(&mut self, sequence: u16) -> NetworkResult<()> {
        let remote = self.remote_address.ok_or(NetworkError::Fatal(FailureReason::Generic))?;
        let mut msg = Message::new();
        {
            let mut w = msg.writer();
            let mut cursor = w.cursor();
            cursor.write_byte(Command::ReliableAck.into());
            cursor.write_ushort(sequence);
            cursor.write_byte(0);
        }
        self.endpoint.send_datagram(remote, &msg)
    }

    /// Processes one datagram addressed to this connection.
    pub fn process_datagram(&mut self, from: Address, data: &[u8]) -> NetworkResult<()> {
        self.elapsed_since_receive = 0.0;

        let mut reader = Reader::new(data);
        let command_byte = reader.read_byte()?;
        let command = Command::from_byte(command_byte).ok_or(NetworkError::Fatal(FailureReason::InvalidMessage))?;

        let result = self.dispatch(from, command, &mut reader);
        if let Err(err) = &result {
            if result.has_failed() {
                slog::debug!(self.log, "connection dispatch failed"; "error" => %err);
            }
        }
        result
    }

    /// Drives the owned endpoint, if any, for one non-blocking sweep.
    /// Server-hosted connections are polled by the server instead.
    pub fn poll_owned(&mut self) -> NetworkResult<()> {
        if let EndpointHandle::Owned(_) = &self.endpoint {
            let mut inbox: Vec<(Address, Vec<u8>)> = Vec::new();
            {
                struct Collector<'a>(&'a mut Vec<(Address, Vec<u8>)>);
                impl<'a> Listener for Collector<'a> {
                    fn received_datagram(&mut self, from: Address, data: &[u8]) {
                        self.0.push((from, data.to_vec()));
                    }
                }
                let mut collector = Collector(&mut inbox);
                if let EndpointHandle::Owned(endpoint) = &mut self.endpoint {
                    endpoint.poll(&mut collector, Some(std::time::Duration::from_millis(0)))?;
                }
            }
            for (from, data) in inbox {
                let _ = self.process_datagram(from, &data);
            }
        }
        Ok(())
    }
}

/// True if `candidate` falls within the receive window starting at
/// `base`, using wraparound comparison (`candidate` is "ahead of or at"
/// base but not more than halfway around the 16-bit space).
fn sequence_in_window(base: u16, candidate: u16) -> bool {
    let diff = candidate.wrapping_sub(base);
    diff != 0 && diff < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::IntFormat;
    use rand::seq::SliceRandom;
    use rand::thread_rng;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn test_connection() -> Connection {
        let endpoint = UdpEndpoint::new().unwrap();
        Connection::new(EndpointHandle::Owned(endpoint), ConnectionConfig::default(), None)
    }

    #[derive(Default)]
    struct RecordingHandler {
        established: u32,
        failed: Vec<FailureReason>,
        closed: u32,
        messages: Vec<Vec<u8>>,
        value_changes: Vec<(LinkId, usize)>,
    }

    impl ConnectionHandler for RecordingHandler {
        fn connection_established(&mut self) {
            self.established += 1;
        }
        fn connection_failed(&mut self, reason: FailureReason) {
            self.failed.push(reason);
        }
        fn connection_closed(&mut self) {
            self.closed += 1;
        }
        fn message_received(&mut self, data: &[u8]) {
            self.messages.push(data.to_vec());
        }
        fn remote_value_changed(&mut self, link_id: LinkId, index: usize) {
            self.value_changes.push((link_id, index));
        }
        fn create_state(&mut self, _identify: &[u8], read_only: bool) -> Option<State> {
            let mut state = State::new(read_only);
            state.add_value(Value::int(IntFormat::Sint32, 0)).unwrap();
            Some(state)
        }
    }

    #[test]
    fn connect_to_moves_to_connecting() {
        let mut conn = test_connection();
        conn.connect_to(Address::ipv4_loopback(3413)).unwrap();
        assert_eq!(conn.connection_state(), ConnectionState::Connecting);
    }

    #[test]
    fn connect_to_twice_fails() {
        let mut conn = test_connection();
        conn.connect_to(Address::ipv4_loopback(3413)).unwrap();
        assert!(conn.connect_to(Address::ipv4_loopback(3413)).is_err());
    }

    #[test]
    fn connect_timeout_fires_and_disconnects() {
        let mut conn = test_connection();
        let handler = StdRc::new(StdRefCell::new(RecordingHandler::default()));
        conn.set_handler(handler.clone());
        conn.connect_to(Address::ipv4_loopback(3413)).unwrap();
        let result = conn.update(10.0);
        assert!(result.is_err());
        assert_eq!(conn.connection_state(), ConnectionState::Disconnected);
        assert_eq!(handler.borrow().failed, vec![FailureReason::Timeout]);
        assert_eq!(handler.borrow().closed, 1);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut conn = test_connection();
        conn.disconnect(true);
        conn.disconnect(true);
        assert_eq!(conn.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn disconnect_fires_connection_closed_once() {
        let mut conn = test_connection();
        let handler = StdRc::new(StdRefCell::new(RecordingHandler::default()));
        conn.set_handler(handler.clone());
        conn.remote_address = Some(Address::ipv4_loopback(3413));
        conn.state = ConnectionState::Connected;
        conn.disconnect(false);
        conn.disconnect(false);
        assert_eq!(handler.borrow().closed, 1);
    }

    #[test]
    fn idle_connection_times_out_with_no_pending_reliable_traffic() {
        let mut conn = test_connection();
        let handler = StdRc::new(StdRefCell::new(RecordingHandler::default()));
        conn.set_handler(handler.clone());
        conn.remote_address = Some(Address::ipv4_loopback(3413));
        conn.state = ConnectionState::Connected;

        // No reliable sends in flight at all: the keepalive alone must
        // still notice the peer has gone quiet.
        assert!(conn.reliable_send_queue.is_empty());
        let result = conn.update(conn.config.reliable_timeout() + 0.1);
        assert!(result.is_err());
        assert_eq!(conn.connection_state(), ConnectionState::Disconnected);
        assert_eq!(handler.borrow().failed, vec![FailureReason::Timeout]);
        assert_eq!(handler.borrow().closed, 1);
    }

    #[test]
    fn receiving_a_datagram_resets_the_keepalive_clock() {
        let mut conn = test_connection();
        conn.remote_address = Some(Address::ipv4_loopback(3413));
        conn.state = ConnectionState::Connected;

        let half = conn.config.reliable_timeout() / 2.0;
        conn.update(half).unwrap();
        let keepalive_ping: [u8; 3] = [Command::Message.into(), 0, 0];
        conn.process_datagram(Address::ipv4_loopback(3413), &keepalive_ping).unwrap();
        // Elapsed-since-receive was reset by the datagram above, so another
        // half-timeout still leaves the connection alive.
        assert!(conn.update(half).is_ok());
        assert_eq!(conn.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn sequence_window_accepts_forward_range_only() {
        assert!(sequence_in_window(10, 11));
        assert!(sequence_in_window(10, 10u16.wrapping_add(100)));
        assert!(!sequence_in_window(10, 10));
        assert!(!sequence_in_window(10, 10u16.wrapping_sub(1)));
    }

    #[test]
    fn reliable_ack_removes_message_from_send_queue() {
        let mut conn = test_connection();
        conn.remote_address = Some(Address::ipv4_loopback(3413));
        conn.state = ConnectionState::Connected;
        conn.reliable_send_queue.push_back(PendingReliable {
            sequence: 0,
            data: vec![1, 2, 3],
            kind: ReliablePayloadKind::Message,
            elapsed_since_send: 0.0,
            total_elapsed: 0.0,
        });
        conn.ack_reliable(0);
        assert!(conn.reliable_send_queue.is_empty());
    }

    #[test]
    fn receive_reliable_in_order_delivers_immediately() {
        let mut conn = test_connection();
        conn.remote_address = Some(Address::ipv4_loopback(3413));
        conn.receive_reliable(0, vec![9, 9], ReliablePayloadKind::Message).unwrap();
        let received = conn.take_received_messages();
        assert_eq!(received, vec![vec![9, 9]]);
    }

    #[test]
    fn receive_reliable_out_of_order_buffers_then_drains() {
        let mut conn = test_connection();
        conn.remote_address = Some(Address::ipv4_loopback(3413));
        conn.receive_reliable(1, vec![2], ReliablePayloadKind::Message).unwrap();
        assert!(conn.take_received_messages().is_empty());
        conn.receive_reliable(0, vec![1], ReliablePayloadKind::Message).unwrap();
        assert_eq!(conn.take_received_messages(), vec![vec![1], vec![2]]);
    }

    #[test]
    fn message_received_callback_fires_for_unreliable_and_reliable() {
        let mut conn = test_connection();
        let handler = StdRc::new(StdRefCell::new(RecordingHandler::default()));
        conn.set_handler(handler.clone());
        conn.remote_address = Some(Address::ipv4_loopback(3413));
        conn.receive_reliable(0, vec![1, 2, 3], ReliablePayloadKind::Message).unwrap();
        assert_eq!(handler.borrow().messages, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn fragment_reassembly_is_index_driven_not_arrival_order() {
        let mut conn = test_connection();
        conn.remote_address = Some(Address::ipv4_loopback(3413));

        let parts: Vec<Vec<u8>> = vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]];
        let mut order: Vec<usize> = (0..parts.len()).collect();
        order.shuffle(&mut thread_rng());

        for &part_index in &order {
            conn.receive_reliable_fragment(0, part_index, parts.len(), parts[part_index].clone())
                .unwrap();
        }

        let received = conn.take_received_messages();
        assert_eq!(received, vec![vec![1, 2, 3, 4, 5, 6, 7, 8, 9]]);
    }

    #[test]
    fn fragment_with_mismatched_part_count_is_invalid_message() {
        let mut conn = test_connection();
        conn.remote_address = Some(Address::ipv4_loopback(3413));
        conn.receive_reliable_fragment(0, 0, 2, vec![1]).unwrap();
        assert!(conn.receive_reliable_fragment(0, 1, 3, vec![2]).is_err());
    }

    #[test]
    fn link_update_for_unknown_link_is_non_fatal() {
        let mut conn = test_connection();
        conn.remote_address = Some(Address::ipv4_loopback(3413));
        conn.state = ConnectionState::Connected;

        let mut body = Vec::new();
        {
            let mut w = Writer::new(&mut body);
            w.write_ushort(42);
            w.write_ushort(0);
        }
        let mut reader = Reader::new(&body);
        let result = conn.dispatch(Address::ipv4_loopback(3413), Command::LinkUpdate, &mut reader);
        assert!(result.is_ok());
    }

    #[test]
    fn link_state_handshake_accepts_matching_schema_and_brings_link_up() {
        let mut publisher = test_connection();
        publisher.remote_address = Some(Address::ipv4_loopback(3413));
        publisher.state = ConnectionState::Connected;

        let link_id = publisher
            .publish_state(b"counter", true, vec![Value::int(IntFormat::Sint32, 30)])
            .unwrap();

        let queued = &publisher.reliable_send_queue[0];
        assert_eq!(queued.kind, ReliablePayloadKind::LinkState);
        let wire_body = queued.data.clone();

        let mut receiver = test_connection();
        receiver.remote_address = Some(Address::ipv4_loopback(3414));
        receiver.state = ConnectionState::Connected;
        let handler = StdRc::new(StdRefCell::new(RecordingHandler::default()));
        receiver.set_handler(handler.clone());

        receiver.handle_link_state(wire_body).unwrap();

        assert_eq!(receiver.links.len(), 1);
        assert_eq!(receiver.links[0].link_id(), link_id);
        assert!(receiver.links[0].is_up());
    }

    #[test]
    fn link_state_handshake_rejects_when_handler_declines() {
        struct RejectingHandler;
        impl ConnectionHandler for RejectingHandler {
            fn create_state(&mut self, _identify: &[u8], _read_only: bool) -> Option<State> {
                None
            }
        }

        let mut publisher = test_connection();
        publisher.remote_address = Some(Address::ipv4_loopback(3413));
        publisher.state = ConnectionState::Connected;
        publisher
            .publish_state(b"counter", true, vec![Value::int(IntFormat::Sint32, 30)])
            .unwrap();
        let wire_body = publisher.reliable_send_queue[0].data.clone();

        let mut receiver = test_connection();
        receiver.remote_address = Some(Address::ipv4_loopback(3414));
        receiver.state = ConnectionState::Connected;
        receiver.set_handler(StdRc::new(StdRefCell::new(RejectingHandler)));

        receiver.handle_link_state(wire_body).unwrap();
        assert!(receiver.links.is_empty());
    }
}
