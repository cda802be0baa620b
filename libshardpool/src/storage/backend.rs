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

use std::path::Path;

/// What to do with the record a backend iteration just visited.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IterStep {
    Keep,
    Remove,
}

/// The seam between the storage engine and whatever actually holds
/// the bytes.
///
/// Backends store opaque key/value byte strings and know nothing
/// about clock stamps, tombstones or the record layout; all of that
/// is engine policy layered on top. Backends need not be internally
/// thread safe: the engine serializes access through its own
/// reader-writer lock.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    fn set(&mut self, key: &[u8], val: &[u8]) -> anyhow::Result<()>;

    /// Remove a record outright, returning the value it held.
    fn delete(&mut self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    /// Approximate record count, tombstones included.
    fn rnum(&self) -> u64;

    /// Flush state to the backing file.
    fn sync(&mut self) -> anyhow::Result<()>;

    /// Write a consistent copy of the current contents to `dst`.
    /// The engine holds its write lock across this call, so the copy
    /// is a clean point-in-time snapshot.
    fn backup(&self, dst: &Path) -> anyhow::Result<()>;

    /// Visit every record. The callback decides per record whether it
    /// stays or goes; removal takes effect before `iterate` returns.
    fn iterate(
        &mut self,
        f: &mut dyn FnMut(&[u8], &[u8]) -> anyhow::Result<IterStep>,
    ) -> anyhow::Result<()>;

    /// The last backend error, for operational surfacing only.
    fn error(&self) -> Option<String>;
}
