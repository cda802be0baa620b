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

use std::time;

pub const BUF_SIZE: usize = 1024 * 16;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:9900";

pub const DEFAULT_CONNECT_TIMEOUT_MSEC: u64 = 1000;
pub const DEFAULT_CONNECT_RETRY_LIMIT: u32 = 8;

// A deleted record's bytes stay resident at least this long so that
// in flight readers never observe them vanish mid use.
pub const DEFAULT_GARBAGE_MIN_TIME_SECS: u64 = 60;
pub const DEFAULT_GARBAGE_MAX_TIME_SECS: u64 = 3600;
pub const DEFAULT_GARBAGE_MEM_LIMIT: usize = 2 * 1024 * 1024;

// How often the cluster scans its session table for peers that never
// completed an identity handshake.
pub const SWEEP_INTERVAL: time::Duration = time::Duration::from_millis(500);
