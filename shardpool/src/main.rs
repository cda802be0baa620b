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

/// Shardpool is a distributed key-value store. Storage nodes talk to
/// one another over a symmetric RPC fabric and reconcile concurrent
/// writes with per-record logical clocks.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = libshardpool::Args::parse();

    if args.version() {
        println!("shardpool {}", VERSION);
        return Ok(());
    }

    libshardpool::run(args)
}
