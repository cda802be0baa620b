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

use std::net::SocketAddr;

use anyhow::Context;
use shardpool_protocol::{method, SetReply, SetRequest};

use crate::protocol;

pub fn run(addr: SocketAddr, key: String, value: String) -> anyhow::Result<()> {
    let mut client = protocol::Client::new(addr)?;

    let reply: SetReply = client
        .call(
            method::SET,
            &SetRequest { key: key.into_bytes(), value: value.into_bytes() },
        )
        .context("storing key")?;

    println!("stored at clocktime {}", reply.clocktime);
    Ok(())
}
