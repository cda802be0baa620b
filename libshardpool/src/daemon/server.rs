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

//! The node logic behind the RPC fabric: method handlers over the
//! storage engine.
//!
//! External clients get the user facing operations (get, set, del,
//! backup); peer storage nodes get the replication operations, which
//! carry fully formed raw records and apply with last-writer-wins
//! ordering. Both faces run on the connection reader threads, which
//! is fine because every handler bottoms out in a synchronous, fast
//! storage call.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher as _},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{anyhow, Context};
use shardpool_protocol::{
    method, Addr, BackupReply, BackupRequest, DelReply, DelRequest, GetReply, GetRequest,
    ReplicateDelRequest, ReplicateReply, ReplicateSetRequest, Role, SetReply, SetRequest,
};
use tracing::{info, instrument, warn};

use crate::{
    protocol,
    rpc::{Dispatch, Responder, Session},
    storage::{self, ClockSource, ClockTime, Storage},
};

/// The 64 bit partition hash that prefixes every raw key. Cheap
/// hash-partitioning checks read this prefix without parsing the
/// user key behind it.
pub fn hash64(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

pub struct Server {
    storage: Arc<Storage>,
    clock: ClockSource,
    db_path: PathBuf,
}

impl Server {
    pub fn new(storage: Arc<Storage>, db_path: PathBuf) -> Server {
        Server { storage, clock: ClockSource::new(), db_path }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn handle_subsys(&self, method_id: u16, params: &[u8]) -> anyhow::Result<Vec<u8>> {
        match method_id {
            method::PING => protocol::encode_params(&"pong"),
            method::GET => {
                let req: GetRequest = protocol::decode_params(params)?;
                self.do_get(&req.key)
            }
            method::SET => {
                let req: SetRequest = protocol::decode_params(params)?;
                self.do_set(&req.key, &req.value)
            }
            method::DEL => {
                let req: DelRequest = protocol::decode_params(params)?;
                self.do_del(&req.key)
            }
            method::BACKUP => {
                let req: BackupRequest = protocol::decode_params(params)?;
                self.do_backup(&req.suffix)
            }
            other => Err(anyhow!("unknown method {:#x}", other)),
        }
    }

    fn handle_cluster(&self, method_id: u16, params: &[u8]) -> anyhow::Result<Vec<u8>> {
        match method_id {
            method::PING => protocol::encode_params(&"pong"),
            method::REPLICATE_SET => {
                let req: ReplicateSetRequest = protocol::decode_params(params)?;
                self.do_replicate_set(&req.raw_key, &req.raw_value)
            }
            method::REPLICATE_DEL => {
                let req: ReplicateDelRequest = protocol::decode_params(params)?;
                self.do_replicate_del(&req.raw_key, ClockTime(req.clocktime))
            }
            method::BACKUP => {
                let req: BackupRequest = protocol::decode_params(params)?;
                self.do_backup(&req.suffix)
            }
            other => Err(anyhow!("unknown method {:#x}", other)),
        }
    }

    fn do_get(&self, key: &[u8]) -> anyhow::Result<Vec<u8>> {
        let raw_key = storage::build_raw_key(hash64(key), key);
        let reply = match self.storage.get(&raw_key)? {
            Some(raw) => GetReply {
                clocktime: Storage::clocktime_of(&raw).get(),
                value: Some(raw[storage::VALUE_META_SIZE..].to_vec()),
            },
            None => GetReply { value: None, clocktime: 0 },
        };
        protocol::encode_params(&reply)
    }

    fn do_set(&self, key: &[u8], value: &[u8]) -> anyhow::Result<Vec<u8>> {
        let raw_key = storage::build_raw_key(hash64(key), key);
        let clocktime = self.clock.tick();
        let raw_value = storage::build_raw_value(clocktime, 0, value);
        self.storage.set(&raw_key, &raw_value)?;
        protocol::encode_params(&SetReply { clocktime: clocktime.get() })
    }

    fn do_del(&self, key: &[u8]) -> anyhow::Result<Vec<u8>> {
        let raw_key = storage::build_raw_key(hash64(key), key);
        // presence check and removal are two lock acquisitions; a
        // racing writer in between just makes `removed` report the
        // staler truth, which is fine for an advisory flag
        let existed = self.storage.get(&raw_key)?.is_some();
        let applied = self.storage.remove(&raw_key, self.clock.tick())?;
        protocol::encode_params(&DelReply { removed: existed && applied })
    }

    #[instrument(skip_all, fields(suffix = suffix))]
    fn do_backup(&self, suffix: &str) -> anyhow::Result<Vec<u8>> {
        if suffix.is_empty() || suffix.contains(['/', '\\']) {
            return Err(anyhow!("bad backup suffix '{}'", suffix));
        }
        let mut dst = self.db_path.clone().into_os_string();
        dst.push(format!(".{suffix}"));
        let dst = PathBuf::from(dst);

        info!("create backup: {}", dst.display());
        self.storage.backup(&dst).context("copying database")?;
        protocol::encode_params(&BackupReply { path: dst.display().to_string() })
    }

    fn do_replicate_set(&self, raw_key: &[u8], raw_value: &[u8]) -> anyhow::Result<Vec<u8>> {
        if raw_key.len() < storage::KEY_HASH_SIZE {
            return Err(anyhow!("raw key too short ({} bytes)", raw_key.len()));
        }
        if raw_value.len() < storage::VALUE_META_SIZE {
            return Err(anyhow!("raw value too short ({} bytes)", raw_value.len()));
        }
        self.clock.observe(Storage::clocktime_of(raw_value));
        let applied = self.storage.update(raw_key, raw_value)?;
        protocol::encode_params(&ReplicateReply { applied })
    }

    fn do_replicate_del(&self, raw_key: &[u8], clocktime: ClockTime) -> anyhow::Result<Vec<u8>> {
        if raw_key.len() < storage::KEY_HASH_SIZE {
            return Err(anyhow!("raw key too short ({} bytes)", raw_key.len()));
        }
        self.clock.observe(clocktime);
        let applied = self.storage.remove(raw_key, clocktime)?;
        protocol::encode_params(&ReplicateReply { applied })
    }
}

impl Dispatch for Server {
    fn subsystem_dispatch(
        &self,
        _from: &Arc<Session>,
        response: Responder,
        method_id: u16,
        params: &[u8],
    ) {
        respond(response, self.handle_subsys(method_id, params));
    }

    fn cluster_dispatch(
        &self,
        _from: &Arc<Session>,
        response: Responder,
        method_id: u16,
        params: &[u8],
    ) {
        respond(response, self.handle_cluster(method_id, params));
    }

    fn new_node(&self, addr: Addr, role: Role, _session: &Arc<Session>) {
        info!("new node {} ({})", addr, role);
    }

    fn lost_node(&self, addr: Addr, role: Role) {
        info!("lost node {} ({})", addr, role);
    }
}

fn respond(response: Responder, res: anyhow::Result<Vec<u8>>) {
    match res {
        Ok(raw) => {
            if let Err(err) = response.result(&raw) {
                warn!("writing reply: {:?}", err);
            }
        }
        Err(err) => {
            warn!("request failed: {:#}", err);
            // 0xa0 is an empty string, the fallback if even the error
            // message refuses to encode
            let raw = protocol::encode_params(&format!("{err:#}"))
                .unwrap_or_else(|_| vec![0xa0]);
            if let Err(err) = response.error(&raw) {
                warn!("writing error reply: {:?}", err);
            }
        }
    }
}
