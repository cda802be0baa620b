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

//! The cluster owns every peer connection on a node.
//!
//! One listening port serves two kinds of traffic. A peer storage
//! node opens its connection with an init message carrying its role
//! and advertised address; an external client just starts issuing
//! requests. Each accepted connection therefore begins in an init
//! state and is classified by its first decoded frame, which keeps
//! the invariant that every endpoint is identified before any RPC of
//! its own is dispatched.

use std::{
    collections::HashMap,
    io::Read as _,
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use nix::sys::socket::{setsockopt, sockopt};
use shardpool_protocol::{frame, Addr, Frame, FrameReader, Role};
use tracing::{debug, info, instrument, span, trace, warn, Level};

use super::{
    session::{CallError, Session},
    transport::Transport,
};
use crate::consts;

/// The upcalls the cluster makes into the node logic.
///
/// Dispatch methods are invoked inline on the connection's reader
/// thread, so they MUST NOT block for extended periods of time.
/// Storage operations are synchronous and fast, which is the budget
/// these handlers are expected to live within; anything slower should
/// hand off to a worker thread.
pub trait Dispatch: Send + Sync {
    /// A request from an identified peer storage node.
    fn cluster_dispatch(
        &self,
        _from: &Arc<Session>,
        _response: Responder,
        _method: u16,
        _params: &[u8],
    ) {
        // reaching this without a handler wired up is a bug in the
        // daemon assembly, not a runtime condition
        panic!("cluster dispatch invoked with no handler");
    }

    /// A request from an external subsystem client.
    fn subsystem_dispatch(
        &self,
        _from: &Arc<Session>,
        _response: Responder,
        _method: u16,
        _params: &[u8],
    ) {
        panic!("subsystem dispatch invoked with no handler");
    }

    /// A peer completed its first identity handshake on this session.
    /// Fires once per (session, role) transition.
    fn new_node(&self, _addr: Addr, _role: Role, _session: &Arc<Session>) {}

    /// A peer with a known role is gone for good: its retry budget is
    /// exhausted. Fires exactly once per lost session.
    fn lost_node(&self, _addr: Addr, _role: Role) {}
}

/// One-shot reply handle for a dispatched request. Holds the session
/// weakly so a reply races harmlessly with session teardown.
pub struct Responder {
    session: Weak<Session>,
    msgid: u32,
}

impl Responder {
    fn new(session: &Arc<Session>, msgid: u32) -> Responder {
        Responder { session: Arc::downgrade(session), msgid }
    }

    /// Answer with a result payload (one raw MessagePack value).
    pub fn result(self, raw: &[u8]) -> anyhow::Result<()> {
        let buf = frame::encode_response(self.msgid, None, Some(raw))?;
        if let Some(session) = self.session.upgrade() {
            session.send_frame(buf);
        }
        Ok(())
    }

    /// Answer with an error payload (one raw MessagePack value).
    pub fn error(self, raw: &[u8]) -> anyhow::Result<()> {
        let buf = frame::encode_response(self.msgid, Some(raw), None)?;
        if let Some(session) = self.session.upgrade() {
            session.send_frame(buf);
        }
        Ok(())
    }
}

/// Where a connection is in its lifecycle. Every connection starts in
/// Init and moves exactly once, driven by its first decoded frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ConnState {
    Init,
    Cluster,
    Subsys,
}

pub struct Cluster {
    self_role: Role,
    self_addr: Addr,
    connect_timeout: Duration,
    retry_limit: u32,
    /// Peer node sessions keyed by their advertised address.
    nodes: Mutex<HashMap<Addr, Arc<Session>>>,
    subsys: Subsys,
    dispatch: Arc<dyn Dispatch>,
    /// Back-reference to our own Arc so connection threads can hold
    /// the cluster alive. Always upgradable while any method runs.
    self_ref: Weak<Cluster>,
}

impl Cluster {
    pub fn new(
        self_role: Role,
        self_addr: Addr,
        connect_timeout: Duration,
        retry_limit: u32,
        dispatch: Arc<dyn Dispatch>,
    ) -> Arc<Cluster> {
        let cluster = Arc::new_cyclic(|self_ref| Cluster {
            self_role,
            self_addr,
            connect_timeout,
            retry_limit,
            nodes: Mutex::new(HashMap::new()),
            subsys: Subsys::new(),
            dispatch,
            self_ref: self_ref.clone(),
        });

        // sweep sessions that never complete a handshake; holding the
        // cluster weakly lets the sweeper die with it
        let sweeper = Arc::downgrade(&cluster);
        thread::spawn(move || loop {
            thread::sleep(consts::SWEEP_INTERVAL);
            match sweeper.upgrade() {
                Some(cluster) => cluster.sweep_unset_roles(),
                None => return,
            }
        });

        cluster
    }

    pub fn self_addr(&self) -> Addr {
        self.self_addr
    }

    pub fn subsystem(&self) -> &Subsys {
        &self.subsys
    }

    /// The Arc this cluster lives in. Safe while any caller holds a
    /// reference, which is every context a method runs in.
    fn arc(&self) -> Arc<Cluster> {
        self.self_ref.upgrade().expect("cluster outlives its methods")
    }

    /// Accept connections forever, one reader thread per connection.
    #[instrument(skip_all)]
    pub fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    trace!("accepted connection from {:?}", stream.peer_addr());
                    self.accepted(stream);
                }
                Err(err) => {
                    warn!("accepting stream: {:?}", err);
                }
            }
        }

        Ok(())
    }

    /// Take ownership of a freshly accepted socket.
    pub fn accepted(&self, stream: TcpStream) {
        // both options are best effort: a socket we cannot tune is
        // still a socket
        let _ = stream.set_nodelay(true);
        let _ = setsockopt(&stream, sockopt::Linger, &libc::linger { l_onoff: 0, l_linger: 0 });

        let cluster = self.arc();
        thread::spawn(move || {
            if let Err(err) = cluster.run_transport(stream, None) {
                debug!("connection ended: {:?}", err);
            }
        });
    }

    /// Look up or create the session for a peer address. A cached
    /// session that never learned a dialable address adopts the one
    /// we are being asked about.
    pub fn get_node(&self, addr: Addr) -> Arc<Session> {
        let _s = span!(Level::DEBUG, "lock(nodes)").entered();
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(session) = nodes.get(&addr) {
            if !session.addr().map(|a| a.connectable()).unwrap_or(false) {
                session.set_addr(addr);
            }
            return Arc::clone(session);
        }

        let session = Session::new(Some(addr));
        nodes.insert(addr, Arc::clone(&session));
        session
    }

    /// Peek at the session table without creating anything.
    pub fn lookup_node(&self, addr: Addr) -> Option<Arc<Session>> {
        self.nodes.lock().unwrap().get(&addr).cloned()
    }

    /// Dial a peer, creating its session if this is the first time we
    /// hear of it. Safe to call for an already connected peer.
    pub fn connect_node(&self, addr: Addr) -> Arc<Session> {
        let session = self.get_node(addr);
        if !session.has_transport() {
            self.async_connect(addr, &session);
        }
        session
    }

    /// One reconnect attempt on a dedicated thread. Every call counts
    /// against the session's retry budget.
    fn async_connect(&self, addr: Addr, session: &Arc<Session>) {
        let attempt = session.inc_retried();
        debug!("connect attempt {} to {}", attempt, addr);

        let cluster = self.arc();
        let session = Arc::clone(session);
        thread::spawn(move || {
            match TcpStream::connect_timeout(&addr.sock(), cluster.connect_timeout) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    if let Err(err) = cluster.run_transport(stream, Some(Arc::clone(&session))) {
                        debug!("connection to {} ended: {:?}", addr, err);
                    }
                }
                Err(err) => {
                    debug!("connect to {} failed: {}", addr, err);
                    cluster.transport_lost(&session);
                }
            }
        });
    }

    /// Drive one connection from socket to teardown. `outbound` is
    /// the session we are dialing on behalf of, None for accepted
    /// connections that have yet to identify themselves.
    fn run_transport(
        &self,
        stream: TcpStream,
        outbound: Option<Arc<Session>>,
    ) -> anyhow::Result<()> {
        let mut read_stream = stream.try_clone().context("cloning stream for reader")?;
        let transport = Transport::start(stream)?;

        if let Some(session) = &outbound {
            // the dialing side identifies itself immediately; binding
            // also flushes any requests queued while we were dark
            let init = frame::encode_init(self.self_role, &self.self_addr)?;
            let _ = transport.send(init);
            transport.bind(session);
        }

        let res = self.conn_loop(&transport, &mut read_stream);

        if let Some(session) = transport.unbind() {
            if session.addr().is_some() {
                // a node session: hand it to the reconnect machinery
                self.transport_lost(&session);
            }
            // subsystem peers just die with their socket; the registry
            // holds them weakly and forgets them on its own
        }

        res
    }

    fn conn_loop(
        &self,
        transport: &Arc<Transport>,
        read_stream: &mut TcpStream,
    ) -> anyhow::Result<()> {
        let mut state = ConnState::Init;
        let mut frames = FrameReader::new();
        let mut buf = vec![0u8; consts::BUF_SIZE];

        loop {
            let nread = read_stream.read(&mut buf).context("reading from peer")?;
            if nread == 0 {
                trace!("peer {} hung up", transport.peer());
                return Ok(());
            }
            frames.extend(&buf[..nread]);
            // a framing error below poisons the whole stream, which is
            // exactly what we want for a protocol violation
            while let Some(frame) = frames.next()? {
                state = self.process(transport, state, frame)?;
            }
        }
    }

    /// The connection state machine. Returns the state the next frame
    /// should be processed under.
    fn process(
        &self,
        transport: &Arc<Transport>,
        state: ConnState,
        frame: Frame,
    ) -> anyhow::Result<ConnState> {
        match state {
            ConnState::Init => match frame {
                Frame::Init { role, addr } => {
                    trace!("received init message: {} {}", role, addr);
                    if transport.session().is_none() {
                        // inbound accept: answer with our own identity
                        // and bind the session the peer advertised
                        if !addr.connectable() {
                            bail!("peer advertised non-connectable address {}", addr);
                        }
                        let init = frame::encode_init(self.self_role, &self.self_addr)?;
                        let _ = transport.send(init);
                        let session = self.get_node(addr);
                        transport.bind(&session);
                    }

                    let session = transport
                        .session()
                        .ok_or_else(|| anyhow!("init handshake left transport unbound"))?;
                    session.reset_retried();
                    if session.set_role(role) {
                        let advertised = session.addr().unwrap_or(addr);
                        self.dispatch.new_node(advertised, role, &session);
                    }
                    Ok(ConnState::Cluster)
                }
                other => {
                    // not a cluster peer: an external client started
                    // talking without introducing itself, which is fine
                    // on this port
                    if transport.session().is_some() {
                        bail!("non-init first message on an already bound transport");
                    }
                    debug!("enter subsys state");
                    let peer = self.subsys.add_session();
                    transport.bind(&peer);
                    // run this same message again under the new state
                    self.process(transport, ConnState::Subsys, other)
                }
            },
            ConnState::Cluster | ConnState::Subsys => match frame {
                Frame::Request { msgid, method, params } => {
                    let session = transport
                        .session()
                        .ok_or_else(|| anyhow!("request on an unbound transport"))?;
                    let response = Responder::new(&session, msgid);
                    if state == ConnState::Cluster {
                        self.dispatch.cluster_dispatch(&session, response, method, &params);
                    } else {
                        self.dispatch.subsystem_dispatch(&session, response, method, &params);
                    }
                    Ok(state)
                }
                Frame::Response { msgid, error, result } => {
                    let session = transport
                        .session()
                        .ok_or_else(|| anyhow!("response on an unbound transport"))?;
                    session.process_response(msgid, result, error);
                    Ok(state)
                }
                Frame::Init { .. } => {
                    bail!("unexpected init message after handshake");
                }
            },
        }
    }

    /// The reconnect policy. Runs every time a node session's
    /// transport goes away, including failed connect attempts.
    pub fn transport_lost(&self, session: &Arc<Session>) {
        let addr = session.addr();
        let retried = session.connect_retried_count();

        if retried > self.retry_limit {
            info!("giving up on {:?} after {} connect attempts", addr, retried);
            self.mark_lost(session);
            if let (Some(addr), Some(role)) = (addr, session.role()) {
                self.dispatch.lost_node(addr, role);
            }
        } else if let Some(addr) = addr.filter(|a| a.connectable()) {
            debug!("reconnect to {}", addr);
            self.async_connect(addr, session);
        } else {
            // nothing to dial: the peer never advertised a usable
            // address, so there is no way to get it back
            debug!("lost node is not connectable {:?}", addr);
            self.mark_lost(session);
        }
    }

    /// Drop a session from the node table and fail its callers.
    fn mark_lost(&self, session: &Arc<Session>) {
        session.fail_pending(CallError::TransportLost);
        if let Some(addr) = session.addr() {
            let _s = span!(Level::DEBUG, "lock(nodes)").entered();
            let mut nodes = self.nodes.lock().unwrap();
            if let Some(cur) = nodes.get(&addr) {
                if Arc::ptr_eq(cur, session) {
                    nodes.remove(&addr);
                }
            }
        }
    }

    /// Prune sessions that never completed a handshake. A peer that
    /// has not identified itself within the whole connect budget is
    /// not going to.
    fn sweep_unset_roles(&self) {
        let horizon = self.connect_timeout * (self.retry_limit + 1);
        let mut stale = vec![];
        {
            let _s = span!(Level::DEBUG, "lock(nodes)").entered();
            let mut nodes = self.nodes.lock().unwrap();
            nodes.retain(|addr, session| {
                if !session.is_role_set() && session.created_at().elapsed() > horizon {
                    debug!("sweeping role-unset session for {}", addr);
                    stale.push(Arc::clone(session));
                    false
                } else {
                    true
                }
            });
        }
        for session in stale {
            session.fail_pending(CallError::TransportLost);
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }
}

/// The registry of external (non cluster) client sessions. Entries
/// are held weakly and forget themselves once the underlying session
/// dies with its socket.
pub struct Subsys {
    peers: Mutex<HashMap<u64, Weak<Session>>>,
    next_id: AtomicU64,
}

impl Subsys {
    fn new() -> Subsys {
        Subsys { peers: Mutex::new(HashMap::new()), next_id: AtomicU64::new(0) }
    }

    /// Register a fresh external peer session.
    pub fn add_session(&self) -> Arc<Session> {
        let session = Session::new(None);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let _s = span!(Level::DEBUG, "lock(peers)").entered();
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|_, weak| weak.strong_count() > 0);
        peers.insert(id, Arc::downgrade(&session));
        session
    }

    /// Snapshot the live peers. Callers must tolerate sessions dying
    /// between this call and their use of the handles.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let peers = self.peers.lock().unwrap();
        peers.values().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    struct NoDispatch;
    impl Dispatch for NoDispatch {}

    fn test_cluster(timeout: Duration, retry_limit: u32) -> Arc<Cluster> {
        Cluster::new(
            Role::SERVER,
            Addr::new("127.0.0.1:19999".parse().unwrap()),
            timeout,
            retry_limit,
            Arc::new(NoDispatch),
        )
    }

    #[test]
    #[timeout(30000)]
    fn get_node_caches_by_address() {
        let cluster = test_cluster(Duration::from_secs(1), 2);
        let addr = Addr::new("10.0.0.7:1234".parse().unwrap());

        let first = cluster.get_node(addr);
        let second = cluster.get_node(addr);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cluster.node_count(), 1);
    }

    #[test]
    #[timeout(30000)]
    fn get_node_upgrades_non_connectable_address() {
        let cluster = test_cluster(Duration::from_secs(1), 2);
        let addr = Addr::new("10.0.0.7:1234".parse().unwrap());

        let session = cluster.get_node(addr);
        // simulate a session that only ever saw the accept side peer
        // address
        session.set_addr(Addr::new("0.0.0.0:0".parse().unwrap()));

        let again = cluster.get_node(addr);
        assert!(Arc::ptr_eq(&session, &again));
        assert_eq!(again.addr(), Some(addr));
    }

    #[test]
    #[timeout(30000)]
    fn subsys_registry_forgets_dead_peers() {
        let cluster = test_cluster(Duration::from_secs(1), 2);

        let keep = cluster.subsystem().add_session();
        {
            let _dies = cluster.subsystem().add_session();
        }
        let live = cluster.subsystem().sessions();
        assert_eq!(live.len(), 1);
        assert!(Arc::ptr_eq(&live[0], &keep));
    }

    #[test]
    #[timeout(30000)]
    fn sweep_prunes_only_role_unset_sessions() {
        // zero connect budget makes the sweep horizon immediate
        let cluster = test_cluster(Duration::from_millis(0), 0);

        let unset = Addr::new("10.0.0.8:1111".parse().unwrap());
        let set = Addr::new("10.0.0.9:2222".parse().unwrap());
        cluster.get_node(unset);
        let with_role = cluster.get_node(set);
        with_role.set_role(Role::SERVER);

        std::thread::sleep(Duration::from_millis(5));
        cluster.sweep_unset_roles();

        assert!(cluster.lookup_node(unset).is_none());
        assert!(cluster.lookup_node(set).is_some());
    }
}
