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

use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Ok(home) = env::var("HOME") {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("shardpool");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The address the daemon listens on, for both cluster peers and
    /// external clients. They share one port; peers are told apart by
    /// their first message.
    pub listen: Option<String>,

    /// The address this node advertises to its peers in the identity
    /// handshake. Defaults to the listen address, which is only
    /// correct when the listen address is dialable from other
    /// machines (i.e. not 0.0.0.0).
    pub advertise: Option<String>,

    /// The role this node plays in the cluster: "server", "manager"
    /// or "gateway". Defaults to "server".
    pub role: Option<String>,

    /// Peer nodes to dial at startup.
    pub peers: Option<Vec<String>>,

    /// Where the database file lives. Defaults to db under the
    /// runtime dir.
    pub db_path: Option<String>,

    /// How long a single connect attempt to a peer may take before it
    /// is abandoned and counted against the retry budget.
    pub connect_timeout_msec: Option<u64>,

    /// How many reconnect attempts to make before declaring a peer
    /// lost.
    pub connect_retry_limit: Option<u32>,

    /// A deleted record's bytes are never released before this many
    /// seconds have passed since the deletion.
    pub garbage_min_time_secs: Option<u64>,

    /// A deleted record's bytes are always released once this many
    /// seconds have passed.
    pub garbage_max_time_secs: Option<u64>,

    /// Once the deleted-record buffer exceeds this many bytes, old
    /// entries past the minimum age are released eagerly.
    pub garbage_mem_limit: Option<usize>,
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            listen = "0.0.0.0:9900"
            advertise = "10.0.0.1:9900"
            "#,
            r#"
            role = "manager"
            peers = ["10.0.0.2:9900", "10.0.0.3:9900"]
            "#,
            r#"
            db_path = "/var/lib/shardpool/db"
            connect_timeout_msec = 500
            connect_retry_limit = 3
            "#,
            r#"
            garbage_min_time_secs = 5
            garbage_max_time_secs = 30
            garbage_mem_limit = 1048576
            "#,
            "",
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn parse_defaults() -> anyhow::Result<()> {
        let config: Config = toml::from_str("")?;
        assert!(config.listen.is_none());
        assert!(config.peers.is_none());
        assert!(config.connect_retry_limit.is_none());
        Ok(())
    }
}
