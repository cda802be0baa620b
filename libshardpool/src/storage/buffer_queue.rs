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

//! The deferred-release queue for deleted record bytes.
//!
//! Removing a record replaces it with a tombstone, but the dead
//! bytes are parked here rather than freed outright so that readers
//! still working through them get a grace window. Entries age out of
//! the queue oldest first under two triggers: total buffered bytes
//! over the memory limit, or plain old age. Nothing is ever released
//! before the minimum age, no matter the memory pressure.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

struct Entry {
    bytes: Vec<u8>,
    at: Instant,
}

#[derive(Default)]
pub struct BufferQueue {
    entries: VecDeque<Entry>,
    total: usize,
}

impl BufferQueue {
    pub fn new() -> Self {
        BufferQueue { entries: VecDeque::new(), total: 0 }
    }

    pub fn push(&mut self, bytes: Vec<u8>, at: Instant) {
        self.total += bytes.len();
        self.entries.push_back(Entry { bytes, at });
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release entries from the front per the age/memory policy.
    /// Returns how many bytes were freed.
    pub fn shrink(
        &mut self,
        min_age: Duration,
        max_age: Duration,
        mem_limit: usize,
        now: Instant,
    ) -> usize {
        let mut released = 0;
        while let Some(front) = self.entries.front() {
            let age = now.saturating_duration_since(front.at);
            let over_limit = self.total > mem_limit;
            if age >= max_age || (over_limit && age >= min_age) {
                let entry = self.entries.pop_front().expect("front exists");
                self.total -= entry.bytes.len();
                released += entry.bytes.len();
            } else {
                break;
            }
        }
        released
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MIN: Duration = Duration::from_secs(5);
    const MAX: Duration = Duration::from_secs(30);
    const LIMIT: usize = 1024 * 1024;

    #[test]
    fn nothing_released_before_min_age() {
        let base = Instant::now();
        let mut q = BufferQueue::new();
        // 2x the memory limit, but everything is brand new
        q.push(vec![0; LIMIT], base);
        q.push(vec![0; LIMIT], base);

        let released = q.shrink(MIN, MAX, LIMIT, base + Duration::from_secs(4));
        assert_eq!(released, 0);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn memory_pressure_releases_after_min_age() {
        let base = Instant::now();
        let mut q = BufferQueue::new();
        q.push(vec![0; LIMIT], base);
        q.push(vec![0; LIMIT], base);

        // past the floor, still over the limit: release until we are
        // back under it
        let released = q.shrink(MIN, MAX, LIMIT, base + Duration::from_secs(6));
        assert_eq!(released, LIMIT);
        assert_eq!(q.len(), 1);
        assert_eq!(q.total_bytes(), LIMIT);
    }

    #[test]
    fn old_entries_age_out_without_pressure() {
        let base = Instant::now();
        let mut q = BufferQueue::new();
        q.push(vec![0; 16], base);
        q.push(vec![0; 16], base + Duration::from_secs(20));

        let released = q.shrink(MIN, MAX, LIMIT, base + Duration::from_secs(31));
        assert_eq!(released, 16);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn release_is_oldest_first() {
        let base = Instant::now();
        let mut q = BufferQueue::new();
        q.push(vec![0; 600 * 1024], base);
        q.push(vec![0; 600 * 1024], base + Duration::from_secs(1));

        // only the front entry is past the floor; the queue is over
        // the limit but the younger entry must survive
        let released = q.shrink(MIN, MAX, LIMIT, base + Duration::from_secs(5));
        assert_eq!(released, 600 * 1024);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn under_limit_and_young_is_untouched() {
        let base = Instant::now();
        let mut q = BufferQueue::new();
        q.push(vec![0; 128], base);

        assert_eq!(q.shrink(MIN, MAX, LIMIT, base + Duration::from_secs(10)), 0);
        assert_eq!(q.len(), 1);
        assert_eq!(q.total_bytes(), 128);
    }
}
