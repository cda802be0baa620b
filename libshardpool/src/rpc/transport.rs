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

//! A transport is the concrete binding of one socket to (at most)
//! one session.
//!
//! The write half is a dedicated thread draining a channel of owned
//! buffers. Handing a buffer to `send` transfers ownership to that
//! thread; the buffer is freed (dropped) once its bytes have hit the
//! socket, which is the write finalization contract the rest of the
//! fabric relies on. Writes on one socket are thereby serialized, so
//! a peer decodes frames in exactly the order they were submitted.
//!
//! The read half lives in `cluster::Cluster`, which owns the framing
//! loop and the connection state machine.

use std::{
    io::Write as _,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{Arc, Mutex},
    thread,
};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, trace};

use super::session::Session;

enum WriteReq {
    Single(Vec<u8>),
    Vectored(Vec<Vec<u8>>),
}

pub struct Transport {
    peer: SocketAddr,
    /// Clone of the socket used for shutdown; the writer thread and
    /// the reader loop each hold their own clone.
    stream: TcpStream,
    writer: Sender<WriteReq>,
    session: Mutex<Option<Arc<Session>>>,
}

impl Transport {
    /// Take ownership of a connected socket and spin up its writer
    /// thread.
    pub fn start(stream: TcpStream) -> anyhow::Result<Arc<Transport>> {
        let peer = stream.peer_addr().context("resolving peer address")?;
        let write_stream = stream.try_clone().context("cloning stream for writer")?;
        let (tx, rx) = crossbeam_channel::unbounded();

        let transport = Arc::new(Transport {
            peer,
            stream,
            writer: tx,
            session: Mutex::new(None),
        });

        thread::spawn(move || {
            writer_loop(write_stream, rx, peer);
        });

        Ok(transport)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Submit one owned buffer for writing. On failure the buffer
    /// comes back so the caller can requeue it on the session.
    pub fn send(&self, buf: Vec<u8>) -> Result<(), Vec<u8>> {
        self.writer.send(WriteReq::Single(buf)).map_err(|e| match e.0 {
            WriteReq::Single(buf) => buf,
            WriteReq::Vectored(_) => unreachable!("single send returned vectored"),
        })
    }

    /// Scatter-gather submission: all buffers are flushed as one unit
    /// before any later submission.
    pub fn sendv(&self, bufs: Vec<Vec<u8>>) -> Result<(), Vec<Vec<u8>>> {
        self.writer.send(WriteReq::Vectored(bufs)).map_err(|e| match e.0 {
            WriteReq::Vectored(bufs) => bufs,
            WriteReq::Single(_) => unreachable!("vectored send returned single"),
        })
    }

    /// Bind `session` to this transport. A transport serves at most
    /// one session, so any previously bound session is unbound first.
    pub fn bind(self: &Arc<Self>, session: &Arc<Session>) {
        let mut slot = self.session.lock().unwrap();
        if let Some(old) = slot.take() {
            old.unbind_transport(Arc::as_ptr(self));
        }
        *slot = Some(Arc::clone(session));
        session.bind_transport(self);
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap().clone()
    }

    /// Half-close the read side and hand the bound session back to
    /// the caller so it can settle pending work.
    pub fn shutdown(&self) -> Option<Arc<Session>> {
        let _ = self.stream.shutdown(Shutdown::Read);
        self.session()
    }

    /// Tear down the session binding, returning the session that was
    /// bound (if any).
    pub fn unbind(self: &Arc<Self>) -> Option<Arc<Session>> {
        let session = self.session.lock().unwrap().take();
        if let Some(s) = &session {
            s.unbind_transport(Arc::as_ptr(self));
        }
        session
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // normally unbind() already ran; this covers error paths
        if let Some(s) = self.session.lock().unwrap().take() {
            s.unbind_transport(self as *const Transport);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn writer_loop(mut stream: TcpStream, rx: Receiver<WriteReq>, peer: SocketAddr) {
    for req in rx.iter() {
        let res = match &req {
            WriteReq::Single(buf) => stream.write_all(buf),
            WriteReq::Vectored(bufs) => bufs.iter().try_for_each(|buf| stream.write_all(buf)),
        };
        if let Err(e) = res {
            debug!("write to {} failed: {}", peer, e);
            // kill the read side too so the reader loop notices
            let _ = stream.shutdown(Shutdown::Both);
            break;
        }
        // req drops here: ownership of the bytes ends once they have
        // been handed to the kernel
        trace!("flushed write to {}", peer);
    }
    // any requests still queued drop undelivered when rx drops
}
