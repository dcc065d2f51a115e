//! Multi-user line-based chat server with an optional encrypted channel.
//!
//! Every connection gets its own task. Users pick a name, chat in clear text,
//! and may type `/secure` to switch their connection to an encrypted channel:
//! the two ends swap RSA public keys, the server sends an AES session key
//! wrapped with the client's key, and the client proves it can read it by
//! signing the key's digest.
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`config`] holds the settings both modes run with.
//! - [`crypto`] is the [`crypto::CryptoProvider`] capability and its RSA/AES
//!   implementation.
//! - [`protocol`] decodes wire lines into [`protocol::Line`] and frames them.
//! - [`handshake`] is the key exchange state for the server and client ends.
//! - [`pool`] is the bounded registry of sessions and its broadcast.
//! - [`session`] runs one connection's read loop.
//! - [`server`] accepts connections and enforces pool capacity.
//! - [`client`] is the terminal client.

pub mod cli;
pub mod client;
pub mod config;
pub mod crypto;
pub mod handshake;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;
