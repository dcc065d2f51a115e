use std::{net::SocketAddr, time::Duration};

use crate::crypto::DEFAULT_KEY_BITS;

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Maximum number of concurrently connected sessions.
    pub capacity: usize,
    /// RSA modulus size for each session's key pair.
    pub key_bits: usize,
    /// Closes sessions that stay silent this long. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            capacity: DEFAULT_CAPACITY,
            key_bits: DEFAULT_KEY_BITS,
            idle_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub server: String,
    /// Sent as the first line when set, instead of typing it at the prompt.
    pub name: Option<String>,
    pub key_bits: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("localhost:{DEFAULT_PORT}"),
            name: None,
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}
