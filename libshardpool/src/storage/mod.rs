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

//! The storage engine: a byte addressed key-value store with a
//! logical clock embedded in every record.
//!
//! Records are raw byte strings with a fixed big endian framing:
//!
//! ```text
//! key:   [ hash:u64 ][ user key bytes ... ]
//! value: [ clocktime:u64 ][ meta:u64 ][ user value bytes ... ]
//! tomb:  [ clocktime:u64 ]
//! ```
//!
//! A value shorter than 16 bytes is a tombstone; its only field is
//! the clock at which the key was deleted. The clock stamp is what
//! makes `update` a last-writer-wins primitive: a write only lands if
//! it is strictly newer than whatever is already there, live or dead.

use std::{
    path::Path,
    sync::{Mutex, RwLock},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

mod backend;
mod buffer_queue;
mod hashdb;

pub use backend::{Backend, IterStep};
pub use buffer_queue::BufferQueue;
pub use hashdb::HashDb;

pub const KEY_HASH_SIZE: usize = 8;
pub const VALUE_CLOCKTIME_SIZE: usize = 8;
pub const VALUE_META_SIZE: usize = VALUE_CLOCKTIME_SIZE + 8;

/// A 64 bit logical timestamp. Total order per node, partial order
/// across the cluster; compared as an unsigned integer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime(pub u64);

impl ClockTime {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// The per-node clock that stamps writes: wall seconds in the high
/// half, a logical counter in the low half. Observing a peer's stamp
/// folds it in lamport style so a node that falls behind on wall time
/// still moves forward past everything it has seen.
pub struct ClockSource(std::sync::atomic::AtomicU64);

impl ClockSource {
    pub fn new() -> Self {
        ClockSource(std::sync::atomic::AtomicU64::new(Self::wall()))
    }

    fn wall() -> u64 {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        secs << 32
    }

    pub fn tick(&self) -> ClockTime {
        use std::sync::atomic::Ordering;
        self.0.fetch_max(Self::wall(), Ordering::AcqRel);
        ClockTime(self.0.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn observe(&self, t: ClockTime) {
        self.0.fetch_max(t.0, std::sync::atomic::Ordering::AcqRel);
    }
}

impl Default for ClockSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Assemble a raw key from a partition hash and the user's key bytes.
pub fn build_raw_key(hash: u64, user_key: &[u8]) -> Vec<u8> {
    let mut raw = vec![0; KEY_HASH_SIZE + user_key.len()];
    Storage::hash_to(hash, &mut raw);
    raw[KEY_HASH_SIZE..].copy_from_slice(user_key);
    raw
}

/// Assemble a live raw value from its clock stamp, meta word and the
/// user's value bytes.
pub fn build_raw_value(clocktime: ClockTime, meta: u64, user_value: &[u8]) -> Vec<u8> {
    let mut raw = vec![0; VALUE_META_SIZE + user_value.len()];
    Storage::clocktime_to(clocktime, &mut raw);
    Storage::meta_to(meta, &mut raw);
    raw[VALUE_META_SIZE..].copy_from_slice(user_value);
    raw
}

/// What `for_each` shows the callback for one record.
pub struct Entry<'a> {
    pub key: &'a [u8],
    pub val: &'a [u8],
}

impl Entry<'_> {
    pub fn is_tombstone(&self) -> bool {
        self.val.len() < VALUE_META_SIZE
    }

    pub fn clocktime(&self) -> ClockTime {
        Storage::clocktime_of(self.val)
    }
}

/// The callback's verdict on the record it was shown.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Visit {
    Keep,
    /// Drop the record from the store outright (no tombstone).
    Delete,
}

pub struct Storage {
    db: RwLock<Box<dyn Backend>>,
    // strictly ordered after the db lock; never take the db lock
    // while holding this one
    garbage: Mutex<BufferQueue>,
    garbage_min_time: Duration,
    garbage_max_time: Duration,
    garbage_mem_limit: usize,
}

impl Storage {
    /// Open the engine over the built-in file backend.
    pub fn open<P: AsRef<Path>>(
        path: P,
        garbage_min_time: Duration,
        garbage_max_time: Duration,
        garbage_mem_limit: usize,
    ) -> anyhow::Result<Storage> {
        let db = HashDb::open(path)?;
        Ok(Self::with_backend(Box::new(db), garbage_min_time, garbage_max_time, garbage_mem_limit))
    }

    /// Wrap an arbitrary backend. The engine serializes access, so
    /// the backend does not need to be internally thread safe.
    pub fn with_backend(
        backend: Box<dyn Backend>,
        garbage_min_time: Duration,
        garbage_max_time: Duration,
        garbage_mem_limit: usize,
    ) -> Storage {
        Storage {
            db: RwLock::new(backend),
            garbage: Mutex::new(BufferQueue::new()),
            garbage_min_time,
            garbage_max_time,
            garbage_mem_limit,
        }
    }

    // record accessors; offsets per the layout at the top of the file

    pub fn hash_of(raw_key: &[u8]) -> u64 {
        BigEndian::read_u64(&raw_key[..KEY_HASH_SIZE])
    }

    pub fn hash_to(hash: u64, raw_key: &mut [u8]) {
        BigEndian::write_u64(&mut raw_key[..KEY_HASH_SIZE], hash);
    }

    pub fn clocktime_of(raw_val: &[u8]) -> ClockTime {
        ClockTime(BigEndian::read_u64(&raw_val[..VALUE_CLOCKTIME_SIZE]))
    }

    pub fn clocktime_to(clocktime: ClockTime, raw_val: &mut [u8]) {
        BigEndian::write_u64(&mut raw_val[..VALUE_CLOCKTIME_SIZE], clocktime.0);
    }

    pub fn meta_of(raw_val: &[u8]) -> u64 {
        BigEndian::read_u64(&raw_val[VALUE_CLOCKTIME_SIZE..VALUE_META_SIZE])
    }

    pub fn meta_to(meta: u64, raw_val: &mut [u8]) {
        BigEndian::write_u64(&mut raw_val[VALUE_CLOCKTIME_SIZE..VALUE_META_SIZE], meta);
    }

    /// Fetch a record. Tombstones read as absent.
    pub fn get(&self, raw_key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let db = self.db.read().unwrap();
        Ok(db.get(raw_key)?.filter(|v| v.len() >= VALUE_META_SIZE))
    }

    /// Unconditional overwrite. The caller is responsible for having
    /// placed the clock stamp in the value's first 8 bytes.
    pub fn set(&self, raw_key: &[u8], raw_val: &[u8]) -> anyhow::Result<()> {
        let mut db = self.db.write().unwrap();
        db.set(raw_key, raw_val)
    }

    /// Conditional put: lands only if strictly newer than the current
    /// record (live or tombstone), or if the key is absent. This is
    /// the last-writer-wins primitive replication leans on.
    pub fn update(&self, raw_key: &[u8], raw_val: &[u8]) -> anyhow::Result<bool> {
        let mut db = self.db.write().unwrap();
        if let Some(cur) = db.get(raw_key)? {
            if cur.len() >= VALUE_CLOCKTIME_SIZE
                && Self::clocktime_of(&cur) >= Self::clocktime_of(raw_val)
            {
                return Ok(false);
            }
        }
        db.set(raw_key, raw_val)?;
        Ok(true)
    }

    /// Replace the record with a tombstone, under the same clock
    /// ordering as `update`. The dead value bytes are parked in the
    /// garbage queue rather than freed, so readers mid flight get a
    /// grace window.
    pub fn remove(&self, raw_key: &[u8], update_clocktime: ClockTime) -> anyhow::Result<bool> {
        let cur = {
            let mut db = self.db.write().unwrap();
            let cur = db.get(raw_key)?;
            if let Some(cur) = &cur {
                if cur.len() >= VALUE_CLOCKTIME_SIZE
                    && Self::clocktime_of(cur) >= update_clocktime
                {
                    return Ok(false);
                }
            }
            let mut tomb = vec![0; VALUE_CLOCKTIME_SIZE];
            Self::clocktime_to(update_clocktime, &mut tomb);
            db.set(raw_key, &tomb)?;
            cur
        };

        if let Some(cur) = cur {
            if cur.len() >= VALUE_META_SIZE {
                let now = Instant::now();
                let mut bytes = raw_key.to_vec();
                bytes.extend_from_slice(&cur);
                let mut garbage = self.garbage.lock().unwrap();
                garbage.push(bytes, now);
                let released = garbage.shrink(
                    self.garbage_min_time,
                    self.garbage_max_time,
                    self.garbage_mem_limit,
                    now,
                );
                if released > 0 {
                    debug!("released {} bytes of deleted records", released);
                }
            }
        }
        Ok(true)
    }

    /// Approximate record count (tombstones included).
    pub fn rnum(&self) -> u64 {
        self.db.read().unwrap().rnum()
    }

    /// Hot copy the store to `dst` while holding the write lock. The
    /// source stays open; `dst` reopens to the same logical contents
    /// the store had at the moment of the call.
    pub fn backup<P: AsRef<Path>>(&self, dst: P) -> anyhow::Result<()> {
        let db = self.db.write().unwrap();
        db.backup(dst.as_ref())
    }

    /// Flush the backing file.
    pub fn sync(&self) -> anyhow::Result<()> {
        self.db.write().unwrap().sync()
    }

    /// The last backend error, empty if the backend is healthy.
    pub fn error(&self) -> String {
        self.db.read().unwrap().error().unwrap_or_default()
    }

    /// Visit every record whose clock stamp is at or below `horizon`.
    /// The callback may delete the record it is shown; deletion is
    /// immediate and unconditional (this is how garbage collection
    /// reaps expired tombstones).
    pub fn for_each<F>(&self, horizon: ClockTime, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(Entry<'_>) -> anyhow::Result<Visit>,
    {
        let mut db = self.db.write().unwrap();
        db.iterate(&mut |key, val| {
            if val.len() >= VALUE_CLOCKTIME_SIZE && Self::clocktime_of(val) > horizon {
                return Ok(IterStep::Keep);
            }
            match f(Entry { key, val })? {
                Visit::Keep => Ok(IterStep::Keep),
                Visit::Delete => Ok(IterStep::Remove),
            }
        })
    }

    /// Run the garbage release policy against the current clock.
    /// Returns how many bytes were freed.
    pub fn release_garbage(&self) -> usize {
        let mut garbage = self.garbage.lock().unwrap();
        garbage.shrink(
            self.garbage_min_time,
            self.garbage_max_time,
            self.garbage_mem_limit,
            Instant::now(),
        )
    }

    pub fn garbage_bytes(&self) -> usize {
        self.garbage.lock().unwrap().total_bytes()
    }

    pub fn garbage_len(&self) -> usize {
        self.garbage.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    fn mem_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(
            dir.path().join("db"),
            Duration::from_secs(0),
            Duration::from_secs(3600),
            usize::MAX,
        )
        .expect("open storage");
        (dir, storage)
    }

    fn key(k: &[u8]) -> Vec<u8> {
        build_raw_key(0x1234_5678_9abc_def0, k)
    }

    fn val(ct: u64, data: &[u8]) -> Vec<u8> {
        build_raw_value(ClockTime(ct), 0, data)
    }

    #[test]
    #[timeout(30000)]
    fn accessors_round_trip() {
        let raw_key = build_raw_key(0xdead_beef_cafe_f00d, b"user-key");
        assert_eq!(Storage::hash_of(&raw_key), 0xdead_beef_cafe_f00d);
        assert_eq!(&raw_key[KEY_HASH_SIZE..], b"user-key");

        let raw_val = build_raw_value(ClockTime(42), 7, b"payload");
        assert_eq!(Storage::clocktime_of(&raw_val), ClockTime(42));
        assert_eq!(Storage::meta_of(&raw_val), 7);
        assert_eq!(&raw_val[VALUE_META_SIZE..], b"payload");

        let mut patched = raw_val.clone();
        Storage::clocktime_to(ClockTime(100), &mut patched);
        Storage::meta_to(9, &mut patched);
        assert_eq!(Storage::clocktime_of(&patched), ClockTime(100));
        assert_eq!(Storage::meta_of(&patched), 9);
    }

    #[test]
    #[timeout(30000)]
    fn get_hides_tombstones() -> anyhow::Result<()> {
        let (_dir, storage) = mem_storage();
        let k = key(b"k");

        assert_eq!(storage.get(&k)?, None);
        storage.set(&k, &val(100, b"a"))?;
        assert_eq!(storage.get(&k)?, Some(val(100, b"a")));

        assert!(storage.remove(&k, ClockTime(200))?);
        assert_eq!(storage.get(&k)?, None);
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn last_writer_wins_ordering() -> anyhow::Result<()> {
        let (_dir, storage) = mem_storage();
        let k = key(b"k");
        storage.set(&k, &val(100, b"a"))?;

        // too old, store unchanged
        assert!(!storage.update(&k, &val(50, b"b"))?);
        assert_eq!(storage.get(&k)?, Some(val(100, b"a")));

        // equal is not newer
        assert!(!storage.update(&k, &val(100, b"b"))?);

        // strictly newer lands
        assert!(storage.update(&k, &val(150, b"c"))?);
        assert_eq!(storage.get(&k)?, Some(val(150, b"c")));

        // removal follows the same ordering
        assert!(!storage.remove(&k, ClockTime(140))?);
        assert_eq!(storage.get(&k)?, Some(val(150, b"c")));
        assert!(storage.remove(&k, ClockTime(200))?);
        assert_eq!(storage.get(&k)?, None);

        // a write older than the tombstone stays dead
        assert!(!storage.update(&k, &val(180, b"d"))?);
        assert_eq!(storage.get(&k)?, None);

        // a write newer than the tombstone resurrects the key
        assert!(storage.update(&k, &val(250, b"e"))?);
        assert_eq!(storage.get(&k)?, Some(val(250, b"e")));
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn update_on_absent_key_succeeds() -> anyhow::Result<()> {
        let (_dir, storage) = mem_storage();
        let k = key(b"fresh");
        assert!(storage.update(&k, &val(1, b"x"))?);
        assert_eq!(storage.get(&k)?, Some(val(1, b"x")));
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn removal_queues_dead_bytes() -> anyhow::Result<()> {
        let (_dir, storage) = mem_storage();
        let k = key(b"k");
        storage.set(&k, &val(1, b"some value bytes"))?;

        assert_eq!(storage.garbage_len(), 0);
        assert!(storage.remove(&k, ClockTime(2))?);
        assert_eq!(storage.garbage_len(), 1);
        // key + value bytes both ride in the queue
        assert_eq!(
            storage.garbage_bytes(),
            k.len() + VALUE_META_SIZE + b"some value bytes".len()
        );

        // removing an already dead key queues nothing new
        assert!(storage.remove(&k, ClockTime(3))?);
        assert_eq!(storage.garbage_len(), 1);
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn for_each_respects_horizon_and_deletes() -> anyhow::Result<()> {
        let (_dir, storage) = mem_storage();
        storage.set(&key(b"old"), &val(10, b"old"))?;
        storage.set(&key(b"new"), &val(100, b"new"))?;
        assert!(storage.remove(&key(b"dead"), ClockTime(20))?);

        let mut seen = vec![];
        storage.for_each(ClockTime(50), |entry| {
            seen.push((entry.key.to_vec(), entry.is_tombstone()));
            Ok(if entry.is_tombstone() { Visit::Delete } else { Visit::Keep })
        })?;

        // the record stamped past the horizon is never shown
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().any(|(k, tomb)| k == &key(b"old") && !tomb));
        assert!(seen.iter().any(|(k, tomb)| k == &key(b"dead") && *tomb));

        // the reaped tombstone is gone for good
        assert_eq!(storage.rnum(), 2);
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn backup_is_point_in_time() -> anyhow::Result<()> {
        let (dir, storage) = mem_storage();
        for i in 0..100u32 {
            let k = key(format!("key-{i}").as_bytes());
            storage.set(&k, &val(i as u64 + 1, format!("val-{i}").as_bytes()))?;
        }

        let snap_path = dir.path().join("snap");
        storage.backup(&snap_path)?;

        // keep mutating the source after the snapshot
        for i in 0..50u32 {
            let k = key(format!("key-{i}").as_bytes());
            storage.set(&k, &val(1000 + i as u64, b"mutated"))?;
        }

        let snapshot = Storage::open(
            &snap_path,
            Duration::from_secs(0),
            Duration::from_secs(3600),
            usize::MAX,
        )?;
        assert_eq!(snapshot.rnum(), 100);
        for i in 0..100u32 {
            let k = key(format!("key-{i}").as_bytes());
            let got = snapshot.get(&k)?.expect("snapshot record present");
            assert_eq!(Storage::clocktime_of(&got), ClockTime(i as u64 + 1));
            assert_eq!(&got[VALUE_META_SIZE..], format!("val-{i}").as_bytes());
        }
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn clock_source_is_monotonic() {
        let clock = ClockSource::new();
        let mut last = ClockTime(0);
        for _ in 0..1000 {
            let t = clock.tick();
            assert!(t > last);
            last = t;
        }

        // observing a stamp from the future pushes the clock past it
        let future = ClockTime(last.0 + 1_000_000);
        clock.observe(future);
        assert!(clock.tick() > future);
    }
}
