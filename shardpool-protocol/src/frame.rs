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

//! The frame codec for the node to node wire protocol.
//!
//! Frames are MessagePack arrays laid back to back on the byte
//! stream with no outer length prefix; MessagePack is self
//! delimiting so the decoder can always tell where one frame ends
//! and the next begins. Three shapes exist:
//!
//! ```text
//! init:     [0, role:uint, addr:bin]
//! request:  [1, msgid:uint, method:uint, params:any]
//! response: [2, msgid:uint, error:any|nil, result:any|nil]
//! ```
//!
//! `params`, `error` and `result` are opaque at this layer. They are
//! captured as raw MessagePack subtrees and handed to higher layers
//! undecoded, which is what lets one transport carry every RPC the
//! daemon speaks without this crate knowing the payload types.

use std::io::{self, Cursor, Read};

use anyhow::anyhow;
use byteorder::{BigEndian, ReadBytesExt as _};
use rmp::Marker;

use super::{Addr, Role};

const KIND_INIT: u64 = 0;
const KIND_REQUEST: u64 = 1;
const KIND_RESPONSE: u64 = 2;

const NIL_MARKER: u8 = 0xc0;

// Deeper nesting than this in an opaque payload is assumed to be an
// attack or corruption rather than a real value.
const MAX_SKIP_DEPTH: usize = 64;

/// A single decoded frame.
#[derive(Debug, PartialEq)]
pub enum Frame {
    /// The identity handshake a cluster node sends as its very first
    /// message on a fresh connection.
    Init { role: Role, addr: Addr },
    /// One half of an RPC. `params` holds one raw MessagePack value.
    Request { msgid: u32, method: u16, params: Vec<u8> },
    /// The other half. Exactly one of `error` / `result` is present.
    Response { msgid: u32, error: Option<Vec<u8>>, result: Option<Vec<u8>> },
}

pub fn encode_init(role: Role, addr: &Addr) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(32);
    wr(rmp::encode::write_array_len(&mut buf, 3))?;
    wr(rmp::encode::write_uint(&mut buf, KIND_INIT))?;
    wr(rmp::encode::write_uint(&mut buf, role.0 as u64))?;
    wr(rmp::encode::write_bin(&mut buf, &addr.pack()))?;
    Ok(buf)
}

/// `params` must be exactly one pre-encoded MessagePack value.
pub fn encode_request(msgid: u32, method: u16, params: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16 + params.len());
    wr(rmp::encode::write_array_len(&mut buf, 4))?;
    wr(rmp::encode::write_uint(&mut buf, KIND_REQUEST))?;
    wr(rmp::encode::write_uint(&mut buf, msgid as u64))?;
    wr(rmp::encode::write_uint(&mut buf, method as u64))?;
    buf.extend_from_slice(params);
    Ok(buf)
}

/// Exactly one of `error` / `result` must be provided, each a single
/// pre-encoded MessagePack value.
pub fn encode_response(
    msgid: u32,
    error: Option<&[u8]>,
    result: Option<&[u8]>,
) -> anyhow::Result<Vec<u8>> {
    if error.is_some() == result.is_some() {
        return Err(anyhow!("a response carries exactly one of error and result"));
    }
    let payload_len = error.map(<[u8]>::len).unwrap_or(1) + result.map(<[u8]>::len).unwrap_or(1);
    let mut buf = Vec::with_capacity(8 + payload_len);
    wr(rmp::encode::write_array_len(&mut buf, 4))?;
    wr(rmp::encode::write_uint(&mut buf, KIND_RESPONSE))?;
    wr(rmp::encode::write_uint(&mut buf, msgid as u64))?;
    match error {
        Some(raw) => buf.extend_from_slice(raw),
        None => buf.push(NIL_MARKER),
    }
    match result {
        Some(raw) => buf.extend_from_slice(raw),
        None => buf.push(NIL_MARKER),
    }
    Ok(buf)
}

fn wr<T, E: std::fmt::Display>(res: Result<T, E>) -> anyhow::Result<T> {
    res.map_err(|e| anyhow!("encoding frame: {}", e))
}

/// Streaming frame decoder.
///
/// Feed it raw bytes as they come off the socket and pull complete
/// frames out with `next`. A partial frame at the tail of the buffer
/// stays buffered until more bytes arrive.
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
    start: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        FrameReader { buf: Vec::with_capacity(4096), start: 0 }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete frame, or None if the buffered bytes
    /// end mid frame. A malformed frame is a protocol violation and
    /// poisons the whole stream, so it surfaces as an error.
    pub fn next(&mut self) -> anyhow::Result<Option<Frame>> {
        match parse_frame(&self.buf[self.start..])? {
            Some((frame, used)) => {
                self.start += used;
                if self.start == self.buf.len() {
                    self.buf.clear();
                    self.start = 0;
                } else if self.start > 4096 {
                    self.buf.drain(..self.start);
                    self.start = 0;
                }
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

/// Try to parse one frame off the front of `data`. Returns the frame
/// and the number of bytes it consumed, or None if `data` ends before
/// the frame does.
fn parse_frame(data: &[u8]) -> anyhow::Result<Option<(Frame, usize)>> {
    let mut cur = Cursor::new(data);
    match parse_inner(&mut cur) {
        Ok(frame) => Ok(Some((frame, cur.position() as usize))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(anyhow!("malformed frame: {}", e)),
    }
}

fn parse_inner(cur: &mut Cursor<&[u8]>) -> io::Result<Frame> {
    let len = read_array_len(cur)?;
    let kind = read_uint(cur)?;
    match kind {
        KIND_INIT => {
            if len != 3 {
                return Err(bad(format!("init frame with {len} fields")));
            }
            let role = read_uint(cur)?;
            if role > u8::MAX as u64 {
                return Err(bad(format!("role {role} out of range")));
            }
            let packed = read_bin(cur)?;
            let addr =
                Addr::unpack(&packed).map_err(|e| bad(format!("init address: {e}")))?;
            Ok(Frame::Init { role: Role(role as u8), addr })
        }
        KIND_REQUEST => {
            if len != 4 {
                return Err(bad(format!("request frame with {len} fields")));
            }
            let msgid = read_uint_max(cur, u32::MAX as u64)? as u32;
            let method = read_uint_max(cur, u16::MAX as u64)? as u16;
            let params = read_raw(cur)?;
            Ok(Frame::Request { msgid, method, params })
        }
        KIND_RESPONSE => {
            if len != 4 {
                return Err(bad(format!("response frame with {len} fields")));
            }
            let msgid = read_uint_max(cur, u32::MAX as u64)? as u32;
            let error = read_raw_opt(cur)?;
            let result = read_raw_opt(cur)?;
            if error.is_some() == result.is_some() {
                return Err(bad("response must carry exactly one of error and result".into()));
            }
            Ok(Frame::Response { msgid, error, result })
        }
        other => Err(bad(format!("unknown frame kind {other}"))),
    }
}

fn bad(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn read_array_len(cur: &mut Cursor<&[u8]>) -> io::Result<u64> {
    match Marker::from_u8(cur.read_u8()?) {
        Marker::FixArray(n) => Ok(n as u64),
        Marker::Array16 => Ok(cur.read_u16::<BigEndian>()? as u64),
        Marker::Array32 => Ok(cur.read_u32::<BigEndian>()? as u64),
        m => Err(bad(format!("expected array, got marker {m:?}"))),
    }
}

fn read_uint(cur: &mut Cursor<&[u8]>) -> io::Result<u64> {
    match Marker::from_u8(cur.read_u8()?) {
        Marker::FixPos(v) => Ok(v as u64),
        Marker::U8 => Ok(cur.read_u8()? as u64),
        Marker::U16 => Ok(cur.read_u16::<BigEndian>()? as u64),
        Marker::U32 => Ok(cur.read_u32::<BigEndian>()? as u64),
        Marker::U64 => cur.read_u64::<BigEndian>(),
        m => Err(bad(format!("expected uint, got marker {m:?}"))),
    }
}

fn read_uint_max(cur: &mut Cursor<&[u8]>, max: u64) -> io::Result<u64> {
    let v = read_uint(cur)?;
    if v > max {
        return Err(bad(format!("integer {v} exceeds field maximum {max}")));
    }
    Ok(v)
}

fn read_bin(cur: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let len = match Marker::from_u8(cur.read_u8()?) {
        Marker::Bin8 => cur.read_u8()? as usize,
        Marker::Bin16 => cur.read_u16::<BigEndian>()? as usize,
        Marker::Bin32 => cur.read_u32::<BigEndian>()? as usize,
        m => return Err(bad(format!("expected bin, got marker {m:?}"))),
    };
    let mut buf = vec![0; len];
    cur.read_exact(&mut buf)?;
    Ok(buf)
}

/// Capture one raw MessagePack value without decoding it.
fn read_raw(cur: &mut Cursor<&[u8]>) -> io::Result<Vec<u8>> {
    let start = cur.position() as usize;
    skip_value(cur, 0)?;
    let end = cur.position() as usize;
    Ok(cur.get_ref()[start..end].to_vec())
}

/// Like `read_raw` but maps a nil value to None.
fn read_raw_opt(cur: &mut Cursor<&[u8]>) -> io::Result<Option<Vec<u8>>> {
    let pos = cur.position() as usize;
    let data = *cur.get_ref();
    if pos >= data.len() {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    if data[pos] == NIL_MARKER {
        cur.set_position(pos as u64 + 1);
        return Ok(None);
    }
    read_raw(cur).map(Some)
}

fn skip(cur: &mut Cursor<&[u8]>, n: u64) -> io::Result<()> {
    let pos = cur.position();
    let total = cur.get_ref().len() as u64;
    if pos.saturating_add(n) > total {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    cur.set_position(pos + n);
    Ok(())
}

/// Walk past one value of any type. Used to find the extent of the
/// opaque payload fields.
fn skip_value(cur: &mut Cursor<&[u8]>, depth: usize) -> io::Result<()> {
    if depth > MAX_SKIP_DEPTH {
        return Err(bad("payload nesting too deep".into()));
    }
    match Marker::from_u8(cur.read_u8()?) {
        Marker::Null
        | Marker::True
        | Marker::False
        | Marker::FixPos(_)
        | Marker::FixNeg(_) => Ok(()),
        Marker::U8 | Marker::I8 => skip(cur, 1),
        Marker::U16 | Marker::I16 => skip(cur, 2),
        Marker::U32 | Marker::I32 | Marker::F32 => skip(cur, 4),
        Marker::U64 | Marker::I64 | Marker::F64 => skip(cur, 8),
        Marker::FixStr(n) => skip(cur, n as u64),
        Marker::Str8 => {
            let n = cur.read_u8()? as u64;
            skip(cur, n)
        }
        Marker::Str16 => {
            let n = cur.read_u16::<BigEndian>()? as u64;
            skip(cur, n)
        }
        Marker::Str32 => {
            let n = cur.read_u32::<BigEndian>()? as u64;
            skip(cur, n)
        }
        Marker::Bin8 => {
            let n = cur.read_u8()? as u64;
            skip(cur, n)
        }
        Marker::Bin16 => {
            let n = cur.read_u16::<BigEndian>()? as u64;
            skip(cur, n)
        }
        Marker::Bin32 => {
            let n = cur.read_u32::<BigEndian>()? as u64;
            skip(cur, n)
        }
        Marker::FixArray(n) => skip_values(cur, n as u64, depth),
        Marker::Array16 => {
            let n = cur.read_u16::<BigEndian>()? as u64;
            skip_values(cur, n, depth)
        }
        Marker::Array32 => {
            let n = cur.read_u32::<BigEndian>()? as u64;
            skip_values(cur, n, depth)
        }
        Marker::FixMap(n) => skip_values(cur, n as u64 * 2, depth),
        Marker::Map16 => {
            let n = cur.read_u16::<BigEndian>()? as u64;
            skip_values(cur, n * 2, depth)
        }
        Marker::Map32 => {
            let n = cur.read_u32::<BigEndian>()? as u64;
            skip_values(cur, n * 2, depth)
        }
        Marker::FixExt1 => skip(cur, 2),
        Marker::FixExt2 => skip(cur, 3),
        Marker::FixExt4 => skip(cur, 5),
        Marker::FixExt8 => skip(cur, 9),
        Marker::FixExt16 => skip(cur, 17),
        Marker::Ext8 => {
            let n = cur.read_u8()? as u64;
            skip(cur, n + 1)
        }
        Marker::Ext16 => {
            let n = cur.read_u16::<BigEndian>()? as u64;
            skip(cur, n + 1)
        }
        Marker::Ext32 => {
            let n = cur.read_u32::<BigEndian>()? as u64;
            skip(cur, n + 1)
        }
        Marker::Reserved => Err(bad("reserved marker in payload".into())),
    }
}

fn skip_values(cur: &mut Cursor<&[u8]>, n: u64, depth: usize) -> io::Result<()> {
    for _ in 0..n {
        skip_value(cur, depth + 1)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn str_value(s: &str) -> Vec<u8> {
        let mut buf = vec![];
        rmp::encode::write_str(&mut buf, s).expect("write to vec");
        buf
    }

    fn array_of_strs(items: &[&str]) -> Vec<u8> {
        let mut buf = vec![];
        rmp::encode::write_array_len(&mut buf, items.len() as u32).expect("write to vec");
        for s in items {
            rmp::encode::write_str(&mut buf, s).expect("write to vec");
        }
        buf
    }

    #[test]
    fn init_round_trip() {
        let addr = Addr::new("10.0.0.1:1111".parse().unwrap());
        let buf = encode_init(Role::SERVER, &addr).expect("encode");

        let mut rd = FrameReader::new();
        rd.extend(&buf);
        let frame = rd.next().expect("parse").expect("complete frame");
        assert_eq!(frame, Frame::Init { role: Role::SERVER, addr });
        assert!(rd.next().expect("parse").is_none());
    }

    #[test]
    fn request_round_trip() {
        let params = array_of_strs(&["ping"]);
        let buf = encode_request(7, 0x10, &params).expect("encode");

        let mut rd = FrameReader::new();
        rd.extend(&buf);
        match rd.next().expect("parse").expect("complete frame") {
            Frame::Request { msgid, method, params: got } => {
                assert_eq!(msgid, 7);
                assert_eq!(method, 0x10);
                assert_eq!(got, params);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn response_round_trip() {
        let result = str_value("pong");
        let buf = encode_response(7, None, Some(&result[..])).expect("encode");

        let mut rd = FrameReader::new();
        rd.extend(&buf);
        match rd.next().expect("parse").expect("complete frame") {
            Frame::Response { msgid, error, result: got } => {
                assert_eq!(msgid, 7);
                assert_eq!(error, None);
                assert_eq!(got, Some(result));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn response_error_half() {
        let err = str_value("no such method");
        let buf = encode_response(9, Some(&err[..]), None).expect("encode");

        let mut rd = FrameReader::new();
        rd.extend(&buf);
        match rd.next().expect("parse").expect("complete frame") {
            Frame::Response { error, result, .. } => {
                assert_eq!(error, Some(err));
                assert_eq!(result, None);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn response_requires_exactly_one_side() {
        assert!(encode_response(1, None, None).is_err());
        let v = str_value("x");
        assert!(encode_response(1, Some(&v[..]), Some(&v[..])).is_err());
    }

    #[test]
    fn byte_at_a_time() {
        let addr = Addr::new("[::1]:9900".parse().unwrap());
        let mut wire = encode_init(Role::MANAGER, &addr).expect("encode");
        wire.extend(encode_request(1, 2, &array_of_strs(&["a", "b"])).expect("encode"));

        let mut rd = FrameReader::new();
        let mut frames = vec![];
        for b in wire {
            rd.extend(&[b]);
            while let Some(f) = rd.next().expect("parse") {
                frames.push(f);
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Frame::Init { role: Role::MANAGER, addr });
    }

    #[test]
    fn back_to_back_frames() {
        let params = array_of_strs(&[]);
        let mut wire = vec![];
        for msgid in 0..10u32 {
            wire.extend(encode_request(msgid, 1, &params).expect("encode"));
        }

        let mut rd = FrameReader::new();
        rd.extend(&wire);
        let mut count = 0;
        while let Some(f) = rd.next().expect("parse") {
            match f {
                Frame::Request { msgid, .. } => assert_eq!(msgid, count),
                other => panic!("unexpected frame: {:?}", other),
            }
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[test]
    fn junk_is_an_error() {
        let mut rd = FrameReader::new();
        // a bare string is not an envelope
        rd.extend(&str_value("hello"));
        assert!(rd.next().is_err());
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let mut buf = vec![];
        rmp::encode::write_array_len(&mut buf, 3).unwrap();
        rmp::encode::write_uint(&mut buf, 9).unwrap();
        rmp::encode::write_uint(&mut buf, 0).unwrap();
        rmp::encode::write_uint(&mut buf, 0).unwrap();

        let mut rd = FrameReader::new();
        rd.extend(&buf);
        assert!(rd.next().is_err());
    }

    #[test]
    fn nested_payload_skips_cleanly() {
        // params = ["k", {"a": [1, 2, 3]}, bin]
        let mut params = vec![];
        rmp::encode::write_array_len(&mut params, 3).unwrap();
        rmp::encode::write_str(&mut params, "k").unwrap();
        rmp::encode::write_map_len(&mut params, 1).unwrap();
        rmp::encode::write_str(&mut params, "a").unwrap();
        rmp::encode::write_array_len(&mut params, 3).unwrap();
        for i in 1..=3 {
            rmp::encode::write_uint(&mut params, i).unwrap();
        }
        rmp::encode::write_bin(&mut params, &[0xde, 0xad]).unwrap();

        let buf = encode_request(42, 1, &params).expect("encode");
        let mut rd = FrameReader::new();
        rd.extend(&buf);
        match rd.next().expect("parse").expect("complete frame") {
            Frame::Request { params: got, .. } => assert_eq!(got, params),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
