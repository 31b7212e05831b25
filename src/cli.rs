use anstyle::AnsiColor;
use clap::builder::styling::Styles;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::server::ServerConfig;
use crate::transfer::TransferConfig;
use crate::{DEF_PORT, DEF_TIMEOUT_MS, MAX_ATTEMPTS};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default())
    .usage(AnsiColor::Green.on_default())
    .literal(AnsiColor::Cyan.on_default())
    .placeholder(AnsiColor::Red.on_default());

#[derive(Parser, Debug)]
#[command(name = "tftp")]
#[command(about = "A simple TFTP client/server", long_about = None)]
#[command(styles = STYLES)]
pub struct Cli {
    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve files from a directory
    Server(ServerArgs),
    /// Download a file from the server
    Get(TransferArgs),
    /// Upload a file to the server
    Put(TransferArgs),
    /// Ask for the operation and filename on stdin
    Client(PeerArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Listen ip
    #[arg(short, long, default_value = "0.0.0.0")]
    pub ip: IpAddr,

    /// Listen Port
    #[arg(short, long, default_value_t = DEF_PORT)]
    pub port: u16,

    /// Work directory
    #[arg(short, long, default_value = ".")]
    pub directory: PathBuf,

    /// Timeout (ms)
    #[arg(short, long, default_value_t = DEF_TIMEOUT_MS)]
    pub timeout: u64,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            addr: SocketAddr::new(self.ip, self.port),
            root: self.directory.clone(),
            timeout: Duration::from_millis(self.timeout),
        }
    }
}

#[derive(Args, Debug)]
pub struct PeerArgs {
    /// Server host
    #[arg(short, long, default_value = "localhost")]
    pub server: String,

    /// Server port
    #[arg(short, long, default_value_t = DEF_PORT)]
    pub port: u16,

    /// Timeout (ms)
    #[arg(short, long, default_value_t = DEF_TIMEOUT_MS)]
    pub timeout: u64,

    /// Max attempts per block
    #[arg(short, long, default_value_t = MAX_ATTEMPTS)]
    pub retry: u8,
}

impl PeerArgs {
    pub fn config(&self) -> TransferConfig {
        TransferConfig {
            timeout: Duration::from_millis(self.timeout),
            max_attempts: self.retry,
        }
    }
}

#[derive(Args, Debug)]
pub struct TransferArgs {
    /// File name, used both locally and on the server
    pub filename: String,

    #[command(flatten)]
    pub peer: PeerArgs,
}
