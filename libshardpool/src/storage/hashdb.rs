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

//! The built-in storage backend: an ordered in-memory map image
//! persisted as a single snapshot file.
//!
//! The on-disk format is one MessagePack value, a list of (key,
//! value) byte string pairs. Snapshots are written to a scratch file
//! and renamed into place, so a crash mid write never clobbers the
//! previous image. `backup` is the same snapshot writer pointed at a
//! different path, which is what makes hot backup cheap: serialize
//! whatever is in memory right now.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use serde_bytes::ByteBuf;
use tracing::{debug, warn};

use super::backend::{Backend, IterStep};

pub struct HashDb {
    path: PathBuf,
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Set when a sync or backup fails, cleared on the next success.
    /// Mutex because `backup` runs through a shared reference.
    last_error: Mutex<Option<String>>,
}

impl HashDb {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<HashDb> {
        let path = path.as_ref().to_path_buf();
        let map = if path.exists() {
            let bytes = fs::read(&path)
                .with_context(|| format!("reading db file {}", path.display()))?;
            let records: Vec<(ByteBuf, ByteBuf)> = rmp_serde::from_slice(&bytes)
                .with_context(|| format!("decoding db file {}", path.display()))?;
            records.into_iter().map(|(k, v)| (k.into_vec(), v.into_vec())).collect()
        } else {
            debug!("no db file at {}, starting empty", path.display());
            BTreeMap::new()
        };

        Ok(HashDb { path, map, last_error: Mutex::new(None) })
    }

    fn write_snapshot(&self, dst: &Path) -> anyhow::Result<()> {
        let records: Vec<(&serde_bytes::Bytes, &serde_bytes::Bytes)> = self
            .map
            .iter()
            .map(|(k, v)| (serde_bytes::Bytes::new(k), serde_bytes::Bytes::new(v)))
            .collect();
        let bytes = rmp_serde::to_vec(&records).context("encoding db snapshot")?;

        let mut scratch = dst.as_os_str().to_os_string();
        scratch.push(".tmp");
        let scratch = PathBuf::from(scratch);

        fs::write(&scratch, &bytes)
            .with_context(|| format!("writing db snapshot {}", scratch.display()))?;
        fs::rename(&scratch, dst)
            .with_context(|| format!("installing db snapshot {}", dst.display()))?;
        Ok(())
    }

    fn note(&self, res: anyhow::Result<()>) -> anyhow::Result<()> {
        let mut last_error = self.last_error.lock().unwrap();
        match &res {
            Ok(()) => *last_error = None,
            Err(e) => *last_error = Some(format!("{e:#}")),
        }
        res
    }
}

impl Backend for HashDb {
    fn name(&self) -> &'static str {
        "hashdb"
    }

    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], val: &[u8]) -> anyhow::Result<()> {
        self.map.insert(key.to_vec(), val.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.map.remove(key))
    }

    fn rnum(&self) -> u64 {
        self.map.len() as u64
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        let res = self.write_snapshot(&self.path);
        self.note(res)
    }

    fn backup(&self, dst: &Path) -> anyhow::Result<()> {
        let res = self.write_snapshot(dst);
        self.note(res)
    }

    fn iterate(
        &mut self,
        f: &mut dyn FnMut(&[u8], &[u8]) -> anyhow::Result<IterStep>,
    ) -> anyhow::Result<()> {
        let mut dead = vec![];
        for (key, val) in self.map.iter() {
            if f(key, val)? == IterStep::Remove {
                dead.push(key.clone());
            }
        }
        for key in dead {
            self.map.remove(&key);
        }
        Ok(())
    }

    fn error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }
}

impl Drop for HashDb {
    fn drop(&mut self) {
        if let Err(e) = self.write_snapshot(&self.path) {
            warn!("failed to sync db on close: {:?}", e);
        }
    }
}
