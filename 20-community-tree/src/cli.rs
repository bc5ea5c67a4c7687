use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a node for every community listed in a roster file.
    Serve(ServeArgs),
    /// Check that a node answers PING for a community.
    Ping(PingArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// JSON roster describing the communities, their members and our own key.
    #[arg(long)]
    pub roster: PathBuf,

    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:1664")]
    pub listen: SocketAddr,

    /// Look for a parent in every community right after starting.
    #[arg(long)]
    pub join: bool,

    /// Seconds to wait for a TCP connection to a peer.
    #[arg(long, default_value_t = 2)]
    pub connect_timeout: u64,

    /// Seconds to wait for one send or receive.
    #[arg(long, default_value_t = 5)]
    pub io_timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct PingArgs {
    /// Node to probe.
    #[arg(long)]
    pub target: SocketAddr,

    /// Community the probe is scoped to.
    #[arg(long)]
    pub community: String,
}
