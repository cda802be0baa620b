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

//! End to end tests for the cluster RPC fabric: handshakes, external
//! clients sharing the listen port, and the reconnect policy.

use std::{
    io::{Read as _, Write as _},
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread,
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use libshardpool::{
    protocol,
    rpc::{Cluster, Dispatch, Responder, Session},
};
use ntest::timeout;
use shardpool_protocol::{frame, method, Addr, Role};

const EVENT_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq)]
enum Event {
    New(Addr, Role),
    Lost(Addr, Role),
}

/// A node brain that records lifecycle events, pongs external
/// clients and echoes cluster requests back at the sender.
struct Events {
    tx: Sender<Event>,
}

impl Dispatch for Events {
    fn cluster_dispatch(
        &self,
        _from: &Arc<Session>,
        response: Responder,
        _method: u16,
        params: &[u8],
    ) {
        // echo the raw params back as the result
        response.result(params).expect("echoing request");
    }

    fn subsystem_dispatch(
        &self,
        _from: &Arc<Session>,
        response: Responder,
        method_id: u16,
        _params: &[u8],
    ) {
        if method_id == method::PING {
            let raw = rmp_serde::to_vec(&"pong").expect("encoding pong");
            response.result(&raw).expect("writing pong");
        } else {
            let raw = rmp_serde::to_vec(&"unknown method").expect("encoding error");
            response.error(&raw).expect("writing error");
        }
    }

    fn new_node(&self, addr: Addr, role: Role, _session: &Arc<Session>) {
        let _ = self.tx.send(Event::New(addr, role));
    }

    fn lost_node(&self, addr: Addr, role: Role) {
        let _ = self.tx.send(Event::Lost(addr, role));
    }
}

fn start_node(
    role: Role,
    connect_timeout: Duration,
    retry_limit: u32,
) -> (Arc<Cluster>, Receiver<Event>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("binding listener");
    let addr = listener.local_addr().expect("resolving listener address");

    let (tx, rx) = unbounded();
    let cluster = Cluster::new(
        role,
        Addr::new(addr),
        connect_timeout,
        retry_limit,
        Arc::new(Events { tx }),
    );

    let serving = Arc::clone(&cluster);
    thread::spawn(move || {
        let _ = serving.serve(listener);
    });

    (cluster, rx, addr)
}

#[test]
#[timeout(30000)]
fn init_handshake_is_mutual() {
    let (a, rx_a, addr_a) = start_node(Role(1), Duration::from_secs(1), 2);
    let (_b, rx_b, addr_b) = start_node(Role(2), Duration::from_secs(1), 2);

    a.connect_node(Addr::new(addr_b));

    // each side learns the other's advertised identity
    assert_eq!(
        rx_a.recv_timeout(EVENT_WAIT).expect("a observes b"),
        Event::New(Addr::new(addr_b), Role(2))
    );
    assert_eq!(
        rx_b.recv_timeout(EVENT_WAIT).expect("b observes a"),
        Event::New(Addr::new(addr_a), Role(1))
    );
}

#[test]
#[timeout(30000)]
fn calls_round_trip_between_nodes() {
    let (a, rx_a, _addr_a) = start_node(Role(1), Duration::from_secs(1), 2);
    let (_b, _rx_b, addr_b) = start_node(Role(2), Duration::from_secs(1), 2);

    // issue the call before the handshake has completed; it must
    // queue behind the init exchange, never jump it
    let session = a.connect_node(Addr::new(addr_b));
    let params = rmp_serde::to_vec(&("hello", 42)).expect("encoding params");
    let handle = session.call(0x99, &params).expect("issuing call");

    let echoed = handle.wait(Some(EVENT_WAIT)).expect("call to round trip");
    assert_eq!(echoed, params);

    // the handshake happened along the way
    assert_eq!(
        rx_a.recv_timeout(EVENT_WAIT).expect("a observes b"),
        Event::New(Addr::new(addr_b), Role(2))
    );
}

#[test]
#[timeout(30000)]
fn external_client_shares_the_port() {
    let (_a, _rx_a, addr_a) = start_node(Role(1), Duration::from_secs(1), 2);

    // no init message, straight to requests: that marks us as an
    // external client
    let mut client = protocol::Client::new(addr_a).expect("dialing node");
    let pong: String = client.call(method::PING, &("ping",)).expect("ping round trip");
    assert_eq!(pong, "pong");

    // unknown methods surface the daemon's error payload
    let res: anyhow::Result<String> = client.call(0x7777, &("bogus",));
    let err = format!("{:?}", res.expect_err("unknown method must fail"));
    assert!(err.contains("unknown method"), "unexpected error: {err}");
}

#[test]
#[timeout(30000)]
fn repeat_handshake_does_not_reannounce() {
    let (a, rx_a, _addr_a) = start_node(Role(1), Duration::from_secs(1), 2);
    let (_b, _rx_b, addr_b) = start_node(Role(2), Duration::from_secs(1), 2);

    let session = a.connect_node(Addr::new(addr_b));
    assert_eq!(
        rx_a.recv_timeout(EVENT_WAIT).expect("a observes b"),
        Event::New(Addr::new(addr_b), Role(2))
    );

    // the role was set by the first handshake and never changes
    assert_eq!(session.role(), Some(Role(2)));

    // no second announcement shows up out of nowhere
    assert!(rx_a.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
#[timeout(60000)]
fn lost_node_fires_once_after_retry_budget() {
    let (a, rx_a, _addr_a) = start_node(Role(1), Duration::from_millis(300), 2);

    // a hand rolled peer that completes one handshake then dies for
    // good, leaving nothing listening on its port
    let listener = TcpListener::bind("127.0.0.1:0").expect("binding fake peer");
    let addr_b = listener.local_addr().expect("resolving fake peer address");
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accepting");
        let init =
            frame::encode_init(Role(2), &Addr::new(addr_b)).expect("encoding init");
        stream.write_all(&init).expect("writing init");
        // wait for the dialer's init so the handshake completes on
        // both sides before we vanish
        let mut buf = [0u8; 64];
        let _ = stream.read(&mut buf);
        drop(stream);
        drop(listener);
    });

    let session = a.connect_node(Addr::new(addr_b));
    assert_eq!(
        rx_a.recv_timeout(EVENT_WAIT).expect("a observes b"),
        Event::New(Addr::new(addr_b), Role(2))
    );
    peer.join().expect("fake peer thread");

    // a pending call rides through the outage and fails with the
    // session when the budget runs out
    let params = rmp_serde::to_vec(&("stranded",)).expect("encoding params");
    let handle = session.call(0x1, &params).expect("issuing call");

    // retry_limit = 2 gives three doomed connect attempts, then
    // exactly one lost_node
    assert_eq!(
        rx_a.recv_timeout(EVENT_WAIT).expect("lost event"),
        Event::Lost(Addr::new(addr_b), Role(2))
    );
    assert!(rx_a.recv_timeout(Duration::from_millis(500)).is_err(), "lost_node fired twice");

    assert!(handle.wait(Some(EVENT_WAIT)).is_err());
    // the session was dropped from the node table
    assert!(a.lookup_node(Addr::new(addr_b)).is_none());
}
