use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    config::{ClientConfig, ServerConfig},
    crypto::DEFAULT_KEY_BITS,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server.
    Server(ServerArgs),
    /// Connect to a server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8888")]
    pub listen: SocketAddr,

    /// Maximum number of connected users.
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..=1024))]
    pub capacity: u32,

    /// RSA modulus size for per-session key pairs.
    #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
    pub key_bits: usize,

    /// Disconnect users that send nothing for this many seconds.
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = "localhost:8888")]
    pub server: String,

    /// Display name, sent automatically after connecting.
    #[arg(long)]
    pub name: Option<String>,

    /// RSA modulus size for the client key pair.
    #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
    pub key_bits: usize,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            listen: args.listen,
            capacity: args.capacity as usize,
            key_bits: args.key_bits,
            idle_timeout: args.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl From<ClientArgs> for ClientConfig {
    fn from(args: ClientArgs) -> Self {
        Self {
            server: args.server,
            name: args.name,
            key_bits: args.key_bits,
        }
    }
}
