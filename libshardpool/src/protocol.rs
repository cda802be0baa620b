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

//! Typed payload helpers and the external client.
//!
//! Request params and response results ride the wire as opaque
//! MessagePack values inside the frame envelope. The helpers here are
//! the one place that opacity is crossed: handlers and clients use
//! them to move between typed payload structs and raw bytes.

use std::{
    io::{Read as _, Write as _},
    net::{SocketAddr, TcpStream},
    time,
};

use anyhow::{anyhow, Context};
use serde::{de::DeserializeOwned, Serialize};
use shardpool_protocol::{frame, Frame, FrameReader};
use tracing::debug;

use super::consts;

// How long a client will sit on a dead daemon before giving up on a
// reply.
const REPLY_TIMEOUT: time::Duration = time::Duration::from_secs(30);

/// Encode a payload struct as one raw MessagePack value. Structs
/// serialize positionally (as arrays), which is the wire contract for
/// request params.
pub fn encode_params<T>(d: &T) -> anyhow::Result<Vec<u8>>
where
    T: Serialize,
{
    rmp_serde::to_vec(d).context("encoding payload")
}

/// Decode one raw MessagePack value into a payload struct.
pub fn decode_params<T>(raw: &[u8]) -> anyhow::Result<T>
where
    T: DeserializeOwned,
{
    rmp_serde::from_slice(raw).context("decoding payload")
}

/// Render an opaque error payload for human eyes. Our daemon sends
/// strings, but any peer bytes must display somehow.
pub fn describe_error(raw: &[u8]) -> String {
    decode_params::<String>(raw).unwrap_or_else(|_| format!("{} raw error bytes", raw.len()))
}

/// A blocking client for the external (subsystem) face of a node.
///
/// It never sends an init message, which is exactly what marks it as
/// an external client rather than a cluster peer on the shared port.
pub struct Client {
    stream: TcpStream,
    frames: FrameReader,
    next_msgid: u32,
}

impl Client {
    pub fn new(addr: SocketAddr) -> anyhow::Result<Client> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("connecting to daemon at {addr}"))?;
        let _ = stream.set_nodelay(true);
        stream
            .set_read_timeout(Some(REPLY_TIMEOUT))
            .context("setting read timeout on daemon stream")?;
        Ok(Client { stream, frames: FrameReader::new(), next_msgid: 0 })
    }

    /// Issue one request and block for its reply.
    pub fn call<Req, Reply>(&mut self, method: u16, req: &Req) -> anyhow::Result<Reply>
    where
        Req: Serialize,
        Reply: DeserializeOwned,
    {
        let msgid = self.next_msgid;
        self.next_msgid = self.next_msgid.wrapping_add(1);

        let params = encode_params(req)?;
        let buf = frame::encode_request(msgid, method, &params)?;
        self.stream.write_all(&buf).context("writing request")?;

        let mut read_buf = vec![0u8; consts::BUF_SIZE];
        loop {
            while let Some(frame) = self.frames.next()? {
                match frame {
                    Frame::Response { msgid: got, error, result } if got == msgid => {
                        if let Some(raw) = error {
                            return Err(anyhow!("daemon error: {}", describe_error(&raw)));
                        }
                        let raw = result.ok_or(anyhow!("response carried no result"))?;
                        return decode_params(&raw);
                    }
                    other => {
                        debug!("ignoring unexpected frame: {:?}", other);
                    }
                }
            }

            let nread = self.stream.read(&mut read_buf).context("reading reply")?;
            if nread == 0 {
                return Err(anyhow!("daemon closed the connection"));
            }
            self.frames.extend(&read_buf[..nread]);
        }
    }
}
