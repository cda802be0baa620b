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

use std::{
    fs,
    net::{SocketAddr, TcpListener, ToSocketAddrs as _},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use shardpool_protocol::{Addr, Role};
use tracing::{info, instrument};

use crate::{config, consts, rpc::Cluster, storage::Storage};

pub mod server;
mod signals;

#[instrument(skip_all)]
pub fn run(
    config: config::Config,
    addr_override: Option<String>,
    runtime_dir: PathBuf,
) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    let listen = addr_override
        .or_else(|| config.listen.clone())
        .unwrap_or_else(|| String::from(consts::DEFAULT_LISTEN));
    let listen_addr = resolve(&listen).context("resolving listen address")?;
    let advertise_addr = match &config.advertise {
        Some(advertise) => resolve(advertise).context("resolving advertise address")?,
        None => listen_addr,
    };

    let role = match config.role.as_deref() {
        None | Some("server") => Role::SERVER,
        Some("manager") => Role::MANAGER,
        Some("gateway") => Role::GATEWAY,
        Some(other) => bail!("unknown role '{}'", other),
    };

    let db_path = match &config.db_path {
        Some(p) => PathBuf::from(p),
        None => runtime_dir.join("db"),
    };
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("creating db dir")?;
    }

    let storage = Arc::new(
        Storage::open(
            &db_path,
            Duration::from_secs(
                config.garbage_min_time_secs.unwrap_or(consts::DEFAULT_GARBAGE_MIN_TIME_SECS),
            ),
            Duration::from_secs(
                config.garbage_max_time_secs.unwrap_or(consts::DEFAULT_GARBAGE_MAX_TIME_SECS),
            ),
            config.garbage_mem_limit.unwrap_or(consts::DEFAULT_GARBAGE_MEM_LIMIT),
        )
        .context("opening storage")?,
    );

    let server = Arc::new(server::Server::new(Arc::clone(&storage), db_path));
    let cluster = Cluster::new(
        role,
        Addr::new(advertise_addr),
        Duration::from_millis(
            config.connect_timeout_msec.unwrap_or(consts::DEFAULT_CONNECT_TIMEOUT_MSEC),
        ),
        config.connect_retry_limit.unwrap_or(consts::DEFAULT_CONNECT_RETRY_LIMIT),
        server,
    );

    let listener = TcpListener::bind(listen_addr)
        .with_context(|| format!("binding to {listen_addr}"))?;
    info!("listening on {} as {}", listen_addr, role);

    signals::Handler::new(Arc::clone(&storage)).spawn()?;

    for peer in config.peers.clone().unwrap_or_default() {
        let sock = resolve(&peer).with_context(|| format!("resolving peer '{peer}'"))?;
        info!("dialing peer {}", sock);
        cluster.connect_node(Addr::new(sock));
    }

    cluster.serve(listener)
}

fn resolve(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("resolving '{addr}'"))?
        .next()
        .ok_or_else(|| anyhow!("'{addr}' resolves to nothing"))
}
