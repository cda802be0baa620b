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

//! A session is the long lived, logical half of a peer connection.
//!
//! Sessions outlive the sockets that serve them: when a transport
//! drops, the session keeps its pending calls and its queued writes
//! and waits for the reconnect machinery to bind a fresh transport.
//! A session dies only when nothing references it any more, and its
//! death fails whatever calls were still in flight.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicI16, AtomicU32, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use shardpool_protocol::{frame, Addr, Role};
use tracing::trace;

use super::transport::Transport;

const ROLE_UNSET: i16 = -1;

/// Why a pending call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The transport serving this session died and the retry budget
    /// ran out (or reconnection was impossible).
    TransportLost,
    /// The caller's deadline expired. The call itself may still
    /// complete later; this layer imposes no deadline of its own.
    TimedOut,
    /// The peer answered with an error payload. The bytes are raw
    /// MessagePack, opaque at this layer.
    Remote(Vec<u8>),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::TransportLost => write!(f, "transport lost"),
            CallError::TimedOut => write!(f, "timed out waiting for response"),
            CallError::Remote(raw) => write!(f, "remote error ({} raw bytes)", raw.len()),
        }
    }
}

impl std::error::Error for CallError {}

/// The continuation slot a response gets resolved into. Waiters block
/// on the condvar; the reader thread that decodes the response fills
/// the slot and wakes them.
struct CallSlot {
    slot: Mutex<Option<Result<Vec<u8>, CallError>>>,
    cond: Condvar,
}

impl CallSlot {
    fn new() -> Self {
        CallSlot { slot: Mutex::new(None), cond: Condvar::new() }
    }

    /// First resolution wins, later ones are dropped on the floor.
    fn resolve(&self, value: Result<Vec<u8>, CallError>) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(value);
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<u8>, CallError> {
        let slot = self.slot.lock().unwrap();
        let resolved = match timeout {
            Some(t) => {
                // unwrap to propagate the lock poisoning
                let (resolved, wait_res) =
                    self.cond.wait_timeout_while(slot, t, |s| s.is_none()).unwrap();
                if wait_res.timed_out() && resolved.is_none() {
                    return Err(CallError::TimedOut);
                }
                resolved
            }
            None => self.cond.wait_while(slot, |s| s.is_none()).unwrap(),
        };
        resolved.clone().expect("resolved slot must hold a value")
    }
}

/// A handle on an in flight call. Detached from the session so the
/// caller can wait without holding any session locks.
pub struct CallHandle {
    slot: Arc<CallSlot>,
}

impl CallHandle {
    /// Block until the response lands. With no timeout this waits as
    /// long as the session lives; transport loss resolves the slot
    /// with an error rather than leaving waiters stuck.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<u8>, CallError> {
        self.slot.wait(timeout)
    }
}

pub struct Session {
    /// The peer's advertised address. None for external subsystem
    /// clients, which have nothing we could dial back.
    addr: Mutex<Option<Addr>>,
    /// Write-once role tag, ROLE_UNSET until the first init message.
    role: AtomicI16,
    next_msgid: AtomicU32,
    pending: Mutex<HashMap<u32, Arc<CallSlot>>>,
    /// Frames queued while no transport is bound; flushed on rebind.
    sendq: Mutex<Vec<Vec<u8>>>,
    /// Non owning link to the currently bound transport. The
    /// transport owns the session strongly, never the reverse.
    transport: Mutex<Weak<Transport>>,
    retried: AtomicU32,
    created_at: Instant,
}

impl Session {
    pub fn new(addr: Option<Addr>) -> Arc<Session> {
        Arc::new(Session {
            addr: Mutex::new(addr),
            role: AtomicI16::new(ROLE_UNSET),
            next_msgid: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            sendq: Mutex::new(Vec::new()),
            transport: Mutex::new(Weak::new()),
            retried: AtomicU32::new(0),
            created_at: Instant::now(),
        })
    }

    pub fn addr(&self) -> Option<Addr> {
        *self.addr.lock().unwrap()
    }

    pub fn set_addr(&self, addr: Addr) {
        *self.addr.lock().unwrap() = Some(addr);
    }

    pub fn role(&self) -> Option<Role> {
        match self.role.load(Ordering::Acquire) {
            ROLE_UNSET => None,
            r => Some(Role(r as u8)),
        }
    }

    pub fn is_role_set(&self) -> bool {
        self.role.load(Ordering::Acquire) != ROLE_UNSET
    }

    /// Set the role if it has never been set. Returns true only on
    /// the unset -> set transition; a session's role never changes
    /// after that.
    pub fn set_role(&self, role: Role) -> bool {
        self.role
            .compare_exchange(ROLE_UNSET, role.0 as i16, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn connect_retried_count(&self) -> u32 {
        self.retried.load(Ordering::Acquire)
    }

    pub fn inc_retried(&self) -> u32 {
        self.retried.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_retried(&self) {
        self.retried.store(0, Ordering::Release);
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Issue a request. Allocates a fresh msgid, registers the
    /// continuation and hands the encoded frame to the bound
    /// transport (or the queue, if none is bound right now).
    pub fn call(&self, method: u16, params: &[u8]) -> anyhow::Result<CallHandle> {
        let slot = Arc::new(CallSlot::new());
        let msgid = {
            let mut pending = self.pending.lock().unwrap();
            // u32 wraparound makes collisions with a still pending id
            // possible in principle, so probe past them.
            let mut msgid = self.next_msgid.fetch_add(1, Ordering::AcqRel);
            while pending.contains_key(&msgid) {
                msgid = self.next_msgid.fetch_add(1, Ordering::AcqRel);
            }
            pending.insert(msgid, Arc::clone(&slot));
            msgid
        };
        let buf = frame::encode_request(msgid, method, params)?;
        self.send_frame(buf);
        Ok(CallHandle { slot })
    }

    /// Route a decoded response to its continuation. A response with
    /// no matching pending call is dropped; the peer may legitimately
    /// answer after we gave up on it.
    pub fn process_response(&self, msgid: u32, result: Option<Vec<u8>>, error: Option<Vec<u8>>) {
        let slot = self.pending.lock().unwrap().remove(&msgid);
        match slot {
            Some(slot) => slot.resolve(match error {
                Some(raw) => Err(CallError::Remote(raw)),
                None => Ok(result.unwrap_or_default()),
            }),
            None => trace!("dropping response for unknown msgid {}", msgid),
        }
    }

    /// Ship one encoded frame to the peer, or queue it if the session
    /// is between transports.
    pub fn send_frame(&self, buf: Vec<u8>) {
        let transport = self.transport.lock().unwrap().upgrade();
        match transport {
            Some(t) => {
                if let Err(buf) = t.send(buf) {
                    // the transport is on its way down; the reconnect
                    // path will flush the queue on rebind
                    self.sendq.lock().unwrap().push(buf);
                }
            }
            None => self.sendq.lock().unwrap().push(buf),
        }
    }

    /// Attach a transport and flush everything that queued up while
    /// the session was dark.
    pub fn bind_transport(&self, transport: &Arc<Transport>) {
        *self.transport.lock().unwrap() = Arc::downgrade(transport);
        let queued: Vec<Vec<u8>> = {
            let mut sendq = self.sendq.lock().unwrap();
            sendq.drain(..).collect()
        };
        for buf in queued {
            if let Err(buf) = transport.send(buf) {
                self.sendq.lock().unwrap().push(buf);
                break;
            }
        }
    }

    /// Detach `transport` if it is the one currently bound. A stale
    /// unbind from an already replaced transport is a no-op.
    pub fn unbind_transport(&self, transport: *const Transport) {
        let mut cur = self.transport.lock().unwrap();
        if cur.as_ptr() == transport {
            *cur = Weak::new();
        }
    }

    pub fn has_transport(&self) -> bool {
        self.transport.lock().unwrap().upgrade().is_some()
    }

    /// Fail every pending call. Used on session death and when the
    /// reconnect machinery gives up on the peer.
    pub fn fail_pending(&self, err: CallError) {
        let slots: Vec<Arc<CallSlot>> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            slot.resolve(Err(err.clone()));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.fail_pending(CallError::TransportLost);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("addr", &self.addr())
            .field("role", &self.role())
            .field("pending", &self.pending_count())
            .finish()
    }
}
