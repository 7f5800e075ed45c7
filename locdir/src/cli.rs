//! Command-line interface for the server and client binaries.

use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::node::Role;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one node of the directory pair.
    Server(ServerArgs),
    /// Connect to a running pair and issue commands interactively.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Which half of the pair this node serves.
    #[arg(long, value_enum)]
    pub role: Role,

    /// Well-known peer port shared by both nodes of the pair.
    #[arg(long, default_value_t = 40000)]
    pub peer_port: u16,

    /// Client-facing listen address. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:50000")]
    pub listen: SocketAddr,

    /// Maximum simultaneously connected clients.
    #[arg(long, default_value_t = 10)]
    pub max_clients: usize,

    /// Maximum registered identities.
    #[arg(long, default_value_t = 30)]
    pub max_users: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the user-service node.
    #[arg(long, default_value = "127.0.0.1:50000")]
    pub user_server: SocketAddr,

    /// Address of the location-service node.
    #[arg(long, default_value = "127.0.0.1:60000")]
    pub location_server: SocketAddr,

    /// Location code this client reports from.
    #[arg(long, value_parser = clap::value_parser!(i32).range(1..=10))]
    pub location: i32,
}
