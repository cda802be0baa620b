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
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use anyhow::anyhow;
use byteorder::{BigEndian, ByteOrder};
use serde_derive::{Deserialize, Serialize};

pub mod frame;

pub use frame::{Frame, FrameReader};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The function a node performs within the cluster.
///
/// Roles ride in every init message so that a freshly accepted peer
/// can be classified before any RPC fires. External clients never
/// send an init message at all, so they never get a role.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Role(pub u8);

impl Role {
    pub const MANAGER: Role = Role(0);
    pub const SERVER: Role = Role(1);
    pub const GATEWAY: Role = Role(2);
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Role::MANAGER => write!(f, "manager"),
            Role::SERVER => write!(f, "server"),
            Role::GATEWAY => write!(f, "gateway"),
            Role(other) => write!(f, "role({other})"),
        }
    }
}

/// A cluster endpoint address.
///
/// On the wire an address is a packed blob: the raw ip bytes followed
/// by a big endian port, 6 bytes total for v4 and 18 for v6. The two
/// forms are told apart purely by length.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Addr(SocketAddr);

impl Addr {
    pub fn new(sock: SocketAddr) -> Self {
        Addr(sock)
    }

    pub fn sock(&self) -> SocketAddr {
        self.0
    }

    /// Whether this address has a resolvable outbound form. Addresses
    /// learned from an accepted socket before the peer has identified
    /// itself (unspecified ip, zero port) cannot be dialed back.
    pub fn connectable(&self) -> bool {
        !self.0.ip().is_unspecified() && self.0.port() != 0
    }

    pub fn pack(&self) -> Vec<u8> {
        match self.0.ip() {
            IpAddr::V4(ip) => {
                let mut buf = vec![0; 6];
                buf[..4].copy_from_slice(&ip.octets());
                BigEndian::write_u16(&mut buf[4..], self.0.port());
                buf
            }
            IpAddr::V6(ip) => {
                let mut buf = vec![0; 18];
                buf[..16].copy_from_slice(&ip.octets());
                BigEndian::write_u16(&mut buf[16..], self.0.port());
                buf
            }
        }
    }

    pub fn unpack(buf: &[u8]) -> anyhow::Result<Self> {
        match buf.len() {
            6 => {
                let mut octets = [0; 4];
                octets.copy_from_slice(&buf[..4]);
                let port = BigEndian::read_u16(&buf[4..]);
                Ok(Addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)))
            }
            18 => {
                let mut octets = [0; 16];
                octets.copy_from_slice(&buf[..16]);
                let port = BigEndian::read_u16(&buf[16..]);
                Ok(Addr(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
            }
            n => Err(anyhow!("bad packed address length {}", n)),
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Method ids for the RPCs a storage node serves.
///
/// External (subsystem) clients use the low range, node to node
/// replication uses the 0x20 range. `BACKUP` is accepted on both
/// faces: operators trigger it through a client, managers trigger
/// it over the cluster fabric.
pub mod method {
    pub const GET: u16 = 0x01;
    pub const SET: u16 = 0x02;
    pub const DEL: u16 = 0x03;
    pub const BACKUP: u16 = 0x04;
    pub const PING: u16 = 0x10;
    pub const REPLICATE_SET: u16 = 0x20;
    pub const REPLICATE_DEL: u16 = 0x21;
}

/// Fetch the value stored under a user key.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct GetRequest {
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct GetReply {
    /// The stored bytes, absent if the key is unknown or deleted.
    #[serde(with = "serde_bytes_opt")]
    pub value: Option<Vec<u8>>,
    /// The logical timestamp the value was written at.
    pub clocktime: u64,
}

/// Store a value under a user key. The receiving node stamps the
/// write with its own clock.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct SetRequest {
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct SetReply {
    pub clocktime: u64,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct DelRequest {
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct DelReply {
    pub removed: bool,
}

/// Ask a node to snapshot its database next to the live file.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct BackupRequest {
    pub suffix: String,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct BackupReply {
    pub path: String,
}

/// Push a fully formed record (hash prefixed key, clock stamped
/// value) to a replica. The replica applies it with last writer wins
/// ordering and reports whether the write took effect.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ReplicateSetRequest {
    #[serde(with = "serde_bytes")]
    pub raw_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub raw_value: Vec<u8>,
}

/// Push a deletion to a replica as a tombstone write.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ReplicateDelRequest {
    #[serde(with = "serde_bytes")]
    pub raw_key: Vec<u8>,
    pub clocktime: u64,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ReplicateReply {
    pub applied: bool,
}

/// serde_bytes does not handle Option<Vec<u8>> directly, so we route
/// through a tiny adapter module.
mod serde_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(v: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match v {
            Some(bytes) => ser.serialize_some(serde_bytes::Bytes::new(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v: Option<serde_bytes::ByteBuf> = Option::deserialize(de)?;
        Ok(v.map(|b| b.into_vec()))
    }
}
