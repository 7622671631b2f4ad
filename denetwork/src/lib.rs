//! Reliable, state-synchronising application protocol over UDP.
//!
//! A [`Connection`](connection::Connection) exchanges unreliable and
//! reliable messages with a single peer and hosts zero or more
//! [`StateLink`](state_link::StateLink)s, each mirroring an ordered
//! [`State`](state::State) of [`Value`](value::Value)s to the other
//! side. A [`Server`](server::Server) accepts many such connections on
//! one socket.

pub mod address;
pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod message;
pub mod proto;
pub mod server;
pub mod state;
pub mod state_link;
pub mod value;

pub use address::Address;
pub use config::{ConnectionConfig, ServerConfig};
pub use connection::{Connection, ConnectionHandler, ConnectionState, EndpointHandle};
pub use error::{ErrorUtils, FailureReason, NetworkError, NetworkResult};
pub use message::Message;
pub use server::{Server, ServerHandler};
pub use state::State;
pub use state_link::{LinkDirection, LinkId, LinkStatus, StateLink};
pub use value::{FloatFormat, IntFormat, Value};
