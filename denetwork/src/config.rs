//! TOML-backed configuration for connections and the server's listening
//! socket, loaded with `serdeconv` the way the rest of this family of
//! projects loads its game configuration.

use serde_derive::{Deserialize, Serialize};
use serdeconv::Error as ConvError;
use std::path::Path;

/// Floor every configurable duration is clamped to. A resend interval or
/// timeout of zero would spin the connection's sync loop.
const MIN_DURATION_SECS: f64 = 0.01;

#[inline]
fn clamp_duration(secs: f64) -> f64 {
    if secs < MIN_DURATION_SECS {
        MIN_DURATION_SECS
    } else {
        secs
    }
}

/// Timing knobs for a single connection's handshake and reliable channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    connect_resend_interval: f64,
    connect_timeout: f64,
    reliable_resend_interval: f64,
    reliable_timeout: f64,
    reliable_window_size: u16,
}

impl ConnectionConfig {
    #[inline]
    pub fn connect_resend_interval(&self) -> f64 {
        self.connect_resend_interval
    }

    #[inline]
    pub fn set_connect_resend_interval(&mut self, secs: f64) {
        self.connect_resend_interval = clamp_duration(secs);
    }

    #[inline]
    pub fn connect_timeout(&self) -> f64 {
        self.connect_timeout
    }

    #[inline]
    pub fn set_connect_timeout(&mut self, secs: f64) {
        self.connect_timeout = clamp_duration(secs);
    }

    #[inline]
    pub fn reliable_resend_interval(&self) -> f64 {
        self.reliable_resend_interval
    }

    #[inline]
    pub fn set_reliable_resend_interval(&mut self, secs: f64) {
        self.reliable_resend_interval = clamp_duration(secs);
    }

    #[inline]
    pub fn reliable_timeout(&self) -> f64 {
        self.reliable_timeout
    }

    #[inline]
    pub fn set_reliable_timeout(&mut self, secs: f64) {
        self.reliable_timeout = clamp_duration(secs);
    }

    #[inline]
    pub fn reliable_window_size(&self) -> u16 {
        self.reliable_window_size
    }

    #[inline]
    pub fn set_reliable_window_size(&mut self, size: u16) {
        self.reliable_window_size = size.max(1);
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<ConnectionConfig, ConvError> {
        serdeconv::from_toml_file(path)
    }

    pub fn from_toml_str(text: &str) -> Result<ConnectionConfig, ConvError> {
        serdeconv::from_toml_str(text)
    }
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            connect_resend_interval: 1.0,
            connect_timeout: 5.0,
            reliable_resend_interval: 0.5,
            reliable_timeout: 3.0,
            reliable_window_size: 10,
        }
    }
}

/// Configuration for a listening `Server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ServerConfig, ConvError> {
        serdeconv::from_toml_file(path)
    }

    pub fn from_toml_str(text: &str) -> Result<ServerConfig, ConvError> {
        serdeconv::from_toml_str(text)
    }
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            bind_address: "0.0.0.0:3413".to_string(),
            max_connections: None,
            connection: ConnectionConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.connect_resend_interval(), 1.0);
        assert_eq!(cfg.connect_timeout(), 5.0);
        assert_eq!(cfg.reliable_resend_interval(), 0.5);
        assert_eq!(cfg.reliable_timeout(), 3.0);
        assert_eq!(cfg.reliable_window_size(), 10);
    }

    #[test]
    fn durations_are_floored_not_allowed_to_zero() {
        let mut cfg = ConnectionConfig::default();
        cfg.set_connect_timeout(0.0);
        assert_eq!(cfg.connect_timeout(), MIN_DURATION_SECS);
        cfg.set_reliable_resend_interval(-5.0);
        assert_eq!(cfg.reliable_resend_interval(), MIN_DURATION_SECS);
    }

    #[test]
    fn window_size_cannot_be_zero() {
        let mut cfg = ConnectionConfig::default();
        cfg.set_reliable_window_size(0);
        assert_eq!(cfg.reliable_window_size(), 1);
    }

    #[test]
    fn server_config_parses_from_toml() {
        let text = r#"
            bind_address = "127.0.0.1:4000"
            max_connections = 64
        "#;
        let cfg = ServerConfig::from_toml_str(text).unwrap();
        assert_eq!(cfg.bind_address, "127.0.0.1:4000");
        assert_eq!(cfg.max_connections, Some(64));
        assert_eq!(cfg.connection.reliable_window_size(), 10);
    }

    #[test]
    fn server_config_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_address, "0.0.0.0:3413");
        assert!(cfg.max_connections.is_none());
    }
}
