// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! libshardpool implements the shardpool distributed key-value
//! store: the cluster RPC fabric (`rpc`), the storage engine
//! (`storage`) and the daemon that wires one to the other
//! (`daemon`). The `run` entry point drives the whole thing from
//! parsed command line arguments.

use std::{
    env, fs, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs as _},
    path::PathBuf,
    sync::Mutex,
};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod backup;
pub mod config;
pub mod consts;
pub mod daemon;
mod del;
mod get;
pub mod protocol;
pub mod rpc;
mod set;
pub mod storage;

/// The command line arguments that shardpool expects.
/// These can be directly parsed with clap or manually
/// constructed in order to present some other user
/// interface.
///
/// NOTE: You must check `version()` and handle it yourself
/// if it is set. Clap won't do a good job with its
/// automatic version support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

In most modes logs are discarded by default, but if shardpool is
running in daemon mode, the logs will go to stderr by default."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(
        short,
        long,
        action,
        long_help = "The address to use

For the daemon this is the address to listen on; for the client
commands it is the daemon to dial. Defaults to the listen address
from the config file."
    )]
    pub addr: Option<String>,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that shardpool supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Starts running a storage node daemon")]
    Daemon,

    #[clap(about = "Fetch the value stored under a key")]
    Get {
        #[clap(help = "The key to look up")]
        key: String,
    },

    #[clap(about = "Store a value under a key")]
    Set {
        #[clap(help = "The key to store under")]
        key: String,
        #[clap(help = "The value to store")]
        value: String,
    },

    #[clap(about = "Delete the value stored under a key")]
    Del {
        #[clap(help = "The key to delete")]
        key: String,
    },

    #[clap(about = "Ask the daemon to snapshot its database

The snapshot is written next to the live database file with the
given suffix appended to its name.")]
    Backup {
        #[clap(help = "The suffix for the snapshot file name")]
        suffix: String,
    },
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run the shardpool tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if let Commands::Daemon = args.command {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let config = config::read_config(&args.config_file)?;

    let runtime_dir = match env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) => PathBuf::from(runtime_dir),
        Err(_) => {
            PathBuf::from(env::var("HOME").context("no XDG_RUNTIME_DIR or HOME")?)
                .join(".shardpool")
        }
    }
    .join("shardpool");

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Daemon => daemon::run(config, args.addr, runtime_dir),
        Commands::Get { key } => {
            dial_addr(&args.addr, &config).and_then(|addr| get::run(addr, key))
        }
        Commands::Set { key, value } => {
            dial_addr(&args.addr, &config).and_then(|addr| set::run(addr, key, value))
        }
        Commands::Del { key } => {
            dial_addr(&args.addr, &config).and_then(|addr| del::run(addr, key))
        }
        Commands::Backup { suffix } => {
            dial_addr(&args.addr, &config).and_then(|addr| backup::run(addr, suffix))
        }
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}

/// Figure out where the daemon lives from the client's point of
/// view. A daemon listening on the unspecified address is dialed via
/// loopback.
fn dial_addr(addr: &Option<String>, config: &config::Config) -> anyhow::Result<SocketAddr> {
    let addr = addr
        .clone()
        .or_else(|| config.listen.clone())
        .unwrap_or_else(|| String::from(consts::DEFAULT_LISTEN));
    let mut sock = addr
        .to_socket_addrs()
        .with_context(|| format!("resolving '{addr}'"))?
        .next()
        .ok_or_else(|| anyhow!("'{addr}' resolves to nothing"))?;
    if sock.ip().is_unspecified() {
        match sock.ip() {
            IpAddr::V4(_) => sock.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            IpAddr::V6(_) => sock.set_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        }
    }
    Ok(sock)
}
