// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End to end session scenarios, driven over channel connections: a test
//! plays the roles of listener, peer manager and remote peer around a
//! running `Session`.

use crate::config::{PeerConfig, RouterConfig};
use crate::connection::SessionConnection;
use crate::connection_channel::{pair, BgpConnectionChannel};
use crate::error::Error;
use crate::messages::{
    Afi, Capability, Message, OpenMessage, Prefix, Safi, UpdateMessage,
    AS_TRANS, BGP4,
};
use crate::session::{FsmMessage, FsmStateKind, Session};
use std::net::{IpAddr, SocketAddr};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};
use std::time::{Duration, Instant};

const RESOLUTION_MS: u64 = 10;
const DEADLINE: Duration = Duration::from_secs(5);

struct Harness {
    session: Arc<Session<BgpConnectionChannel>>,
    conn_tx: Sender<BgpConnectionChannel>,
    incoming: Receiver<FsmMessage>,
    outgoing: Sender<Message>,
    handle: JoinHandle<()>,
}

impl Harness {
    fn start(asn: u32, host: IpAddr, keepalive: u64) -> Self {
        let (conn_tx, conn_rx) = channel();
        let (incoming_tx, incoming) = channel();
        let (outgoing, outgoing_rx) = channel();
        let session = Arc::new(Session::new(
            RouterConfig {
                asn,
                id: "10.0.0.1".parse().unwrap(),
            },
            PeerConfig {
                host,
                hold_time: 90,
                keepalive,
                resolution: RESOLUTION_MS,
            },
            conn_rx,
            incoming_tx,
            outgoing_rx,
            crate::log::init_logger(),
        ));
        let s = session.clone();
        let handle = spawn(move || s.run());
        Self {
            session,
            conn_tx,
            incoming,
            outgoing,
            handle,
        }
    }

    /// Hand the session a passive connection the way the listener would,
    /// returning the remote peer's end of it.
    fn connect(&self) -> BgpConnectionChannel {
        let local =
            SocketAddr::new("10.0.0.1".parse().unwrap(), crate::BGP_PORT);
        let peer = SocketAddr::new(self.session.neighbor.host, crate::BGP_PORT);
        let (session_side, peer_side) =
            pair(local, peer, Duration::from_millis(RESOLUTION_MS));
        self.conn_tx.send(session_side).expect("hand over connection");
        peer_side
    }

    fn expect_state(&self, want: FsmStateKind) {
        match self.incoming.recv_timeout(DEADLINE) {
            Ok(FsmMessage::StateChange(got)) => assert_eq!(got, want),
            other => panic!("expected state change to {want}, got {other:?}"),
        }
    }

    fn expect_message(&self) -> Message {
        match self.incoming.recv_timeout(DEADLINE) {
            Ok(FsmMessage::Message(m)) => m,
            other => panic!("expected peer message, got {other:?}"),
        }
    }

    /// Walk the session from idle all the way to established, acting as
    /// the remote peer.
    fn establish(&self) -> BgpConnectionChannel {
        self.expect_state(FsmStateKind::Active);
        let peer = self.connect();
        self.expect_state(FsmStateKind::OpenSent);

        let m = peer.recv_deadline(DEADLINE).expect("local open");
        assert!(matches!(m, Message::Open(_)), "expected open, got {m:?}");
        peer.send(&peer_open(65002)).expect("send peer open");

        let m = self.expect_message();
        assert!(matches!(m, Message::Open(_)));

        let m = peer.recv_deadline(DEADLINE).expect("local keepalive");
        assert_eq!(m, Message::KeepAlive);
        self.expect_state(FsmStateKind::OpenConfirm);

        peer.send(&Message::KeepAlive).expect("send peer keepalive");
        self.expect_state(FsmStateKind::Established);
        peer
    }

    fn stop(self) {
        self.session.shutdown();
        self.handle.join().expect("session thread");
    }
}

fn peer_open(asn: u16) -> Message {
    Message::Open(OpenMessage {
        version: BGP4,
        asn,
        hold_time: 90,
        id: 0x0a000002,
        parameters: vec![
            Capability::RouteRefresh {}.into(),
            Capability::MultiprotocolExtensions {
                afi: Afi::Ipv4 as u16,
                safi: Safi::Unicast as u8,
            }
            .into(),
        ],
    })
}

#[test]
fn session_establishes() {
    let h = Harness::start(65001, "192.0.2.2".parse().unwrap(), 30);

    h.expect_state(FsmStateKind::Active);
    assert!(!h.session.keepalive_armed());

    let peer = h.connect();
    h.expect_state(FsmStateKind::OpenSent);

    let m = peer.recv_deadline(DEADLINE).expect("local open");
    let Message::Open(open) = m else {
        panic!("expected open, got {m:?}");
    };
    assert_eq!(open.version, BGP4);
    assert_eq!(open.asn, 65001);
    assert_eq!(open.hold_time, 90);
    assert_eq!(open.id, u32::from_be_bytes([10, 0, 0, 1]));
    let caps: Vec<_> = open.capabilities().cloned().collect();
    assert_eq!(
        caps,
        vec![
            Capability::RouteRefresh {},
            Capability::MultiprotocolExtensions {
                afi: Afi::Ipv4 as u16,
                safi: Safi::Unicast as u8,
            },
            Capability::FourOctetAs { asn: 65001 },
        ]
    );
    assert!(!h.session.keepalive_armed());

    peer.send(&peer_open(65002)).expect("send peer open");
    let m = h.expect_message();
    assert!(matches!(m, Message::Open(_)));

    let m = peer.recv_deadline(DEADLINE).expect("local keepalive");
    assert_eq!(m, Message::KeepAlive);
    h.expect_state(FsmStateKind::OpenConfirm);

    // The open confirm handler arms the ticker just after the transition
    // is reported, so give it a moment.
    let armed_by = Instant::now() + DEADLINE;
    while !h.session.keepalive_armed() {
        assert!(Instant::now() < armed_by, "keepalive ticker never armed");
        std::thread::sleep(Duration::from_millis(1));
    }

    peer.send(&Message::KeepAlive).expect("send peer keepalive");
    h.expect_state(FsmStateKind::Established);
    assert_eq!(h.session.state(), FsmStateKind::Established);
    assert!(h.session.keepalive_armed());

    let c = &h.session.counters;
    use std::sync::atomic::Ordering::Relaxed;
    assert_eq!(c.opens_sent.load(Relaxed), 1);
    assert_eq!(c.opens_received.load(Relaxed), 1);
    assert_eq!(c.keepalives_sent.load(Relaxed), 1);
    assert_eq!(c.keepalives_received.load(Relaxed), 1);
    assert_eq!(c.total_sent.load(Relaxed), 2);
    assert_eq!(c.total_received.load(Relaxed), 2);

    h.stop();
}

#[test]
fn open_uses_as_trans_for_wide_asn() {
    let h = Harness::start(200000, "192.0.2.2".parse().unwrap(), 30);

    h.expect_state(FsmStateKind::Active);
    let peer = h.connect();
    h.expect_state(FsmStateKind::OpenSent);

    let m = peer.recv_deadline(DEADLINE).expect("local open");
    let Message::Open(open) = m else {
        panic!("expected open, got {m:?}");
    };
    assert_eq!(open.asn, AS_TRANS);
    assert!(open
        .capabilities()
        .any(|c| *c == Capability::FourOctetAs { asn: 200000 }));

    h.stop();
}

#[test]
fn open_advertises_ipv6_for_ipv6_neighbor() {
    let h = Harness::start(65001, "2001:db8::2".parse().unwrap(), 30);

    h.expect_state(FsmStateKind::Active);
    let peer = h.connect();
    h.expect_state(FsmStateKind::OpenSent);

    let m = peer.recv_deadline(DEADLINE).expect("local open");
    let Message::Open(open) = m else {
        panic!("expected open, got {m:?}");
    };
    assert!(open.capabilities().any(|c| *c
        == Capability::MultiprotocolExtensions {
            afi: Afi::Ipv6 as u16,
            safi: Safi::Unicast as u8,
        }));

    h.stop();
}

#[test]
fn unexpected_message_in_open_sent_drops_session() {
    let h = Harness::start(65001, "192.0.2.2".parse().unwrap(), 30);

    h.expect_state(FsmStateKind::Active);
    let peer = h.connect();
    h.expect_state(FsmStateKind::OpenSent);

    peer.recv_deadline(DEADLINE).expect("local open");
    peer.send(&Message::KeepAlive).expect("send keepalive");

    h.expect_state(FsmStateKind::Idle);
    // The session re-arms for the next connection.
    h.expect_state(FsmStateKind::Active);

    use std::sync::atomic::Ordering::Relaxed;
    assert_eq!(h.session.counters.keepalives_received.load(Relaxed), 1);

    // The connection bound in open sent was closed on the way down.
    assert!(matches!(
        peer.recv_deadline(DEADLINE),
        Err(Error::Disconnected)
    ));

    h.stop();
}

#[test]
fn established_error_returns_to_idle() {
    let h = Harness::start(65001, "192.0.2.2".parse().unwrap(), 30);
    let peer = h.establish();

    // Messages flow both ways while established.
    let update = Message::Update(UpdateMessage {
        withdrawn: Vec::new(),
        path_attributes: vec![0x40, 0x01, 0x01, 0x00],
        nlri: vec![Prefix {
            length: 24,
            value: vec![198, 51, 100],
        }],
    });
    h.outgoing.send(update.clone()).expect("queue outgoing");
    let m = peer.recv_deadline(DEADLINE).expect("forwarded update");
    assert_eq!(m, update);

    peer.send(&update).expect("send peer update");
    let m = h.expect_message();
    assert_eq!(m, update);

    use std::sync::atomic::Ordering::Relaxed;
    assert_eq!(h.session.counters.updates_sent.load(Relaxed), 1);
    assert_eq!(h.session.counters.updates_received.load(Relaxed), 1);
    assert!(h.session.counters.update_recv_time().is_some());

    // Kill the transport out from under the session and queue one more
    // message so the send loop trips over the dead connection.
    drop(peer);
    let _ = h.outgoing.send(update);

    h.expect_state(FsmStateKind::Idle);
    h.expect_state(FsmStateKind::Active);
    assert!(!h.session.keepalive_armed());

    h.stop();
}

#[test]
fn keepalive_ticker_fires_in_open_confirm() {
    let h = Harness::start(65001, "192.0.2.2".parse().unwrap(), 1);

    h.expect_state(FsmStateKind::Active);
    let peer = h.connect();
    h.expect_state(FsmStateKind::OpenSent);

    peer.recv_deadline(DEADLINE).expect("local open");
    peer.send(&peer_open(65002)).expect("send peer open");
    h.expect_message();
    let m = peer.recv_deadline(DEADLINE).expect("local keepalive");
    assert_eq!(m, Message::KeepAlive);
    h.expect_state(FsmStateKind::OpenConfirm);

    // With a one second interval the ticker comes due while the session
    // waits for our keepalive, and the session stays in open confirm.
    let m = peer.recv_deadline(DEADLINE).expect("ticker keepalive");
    assert_eq!(m, Message::KeepAlive);
    assert_eq!(h.session.state(), FsmStateKind::OpenConfirm);

    peer.send(&Message::KeepAlive).expect("send peer keepalive");
    h.expect_state(FsmStateKind::Established);

    h.stop();
}

#[test]
fn cancellation_in_open_confirm_is_silent() {
    let h = Harness::start(65001, "192.0.2.2".parse().unwrap(), 30);

    h.expect_state(FsmStateKind::Active);
    let peer = h.connect();
    h.expect_state(FsmStateKind::OpenSent);

    peer.recv_deadline(DEADLINE).expect("local open");
    peer.send(&peer_open(65002)).expect("send peer open");
    h.expect_message();
    peer.recv_deadline(DEADLINE).expect("local keepalive");
    h.expect_state(FsmStateKind::OpenConfirm);

    // Stop the session while it waits for the peer's keepalive. The wait
    // returns cleanly, the connection closes, and no further state change
    // is reported.
    h.session.shutdown();
    h.handle.join().expect("session thread");

    assert_eq!(h.incoming.try_iter().count(), 0);
    assert!(matches!(
        peer.recv_deadline(DEADLINE),
        Err(Error::Disconnected)
    ));
}
