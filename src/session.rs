// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-peer BGP session finite state machine.
//!
//! One [`Session`] drives a single neighbor relationship. The listener
//! hands accepted connections in over the `connection-in` channel, the
//! peer manager queues messages to transmit on `outgoing`, and the session
//! reports every completed state transition and every parsed peer message
//! on `incoming`. Errors are not surfaced through the state driver: a
//! handler that hits one absorbs it and falls back to idle, where the
//! session re-arms for the next connection.

use crate::clock::Timer;
use crate::config::{PeerConfig, RouterConfig};
use crate::connection::SessionConnection;
use crate::counters::MessageCounters;
use crate::error::Error;
use crate::lock;
use crate::messages::{
    Afi, Capability, Message, MessageType, OpenMessage, Safi, AS_TRANS, BGP4,
};
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, warn, Logger};
use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// The states a BGP session state machine moves through. States with a
/// live connection to the peer carry it by value: the same connection
/// moves from state to state as the session progresses, and a transition
/// into a state without one drops, and thereby closes, the connection.
pub enum FsmState<Cnx: SessionConnection> {
    /// Initial state. No resources allocated to the peer.
    Idle,

    /// Waiting for an outbound TCP connection to complete.
    //TODO active connect path
    Connect,

    /// Waiting for the listener to hand over a passive connection.
    Active,

    /// Our open is on the wire, waiting for the peer's.
    OpenSent(Cnx),

    /// Waiting for a keepalive from the peer.
    OpenConfirm(Cnx),

    /// Messages flow freely between the peers.
    Established(Cnx),
}

impl<Cnx: SessionConnection> FsmState<Cnx> {
    pub fn kind(&self) -> FsmStateKind {
        match self {
            FsmState::Idle => FsmStateKind::Idle,
            FsmState::Connect => FsmStateKind::Connect,
            FsmState::Active => FsmStateKind::Active,
            FsmState::OpenSent(_) => FsmStateKind::OpenSent,
            FsmState::OpenConfirm(_) => FsmStateKind::OpenConfirm,
            FsmState::Established(_) => FsmStateKind::Established,
        }
    }
}

impl<Cnx: SessionConnection> Display for FsmState<Cnx> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

/// Simplified representation of a session state without having to carry a
/// connection.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub enum FsmStateKind {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl FsmStateKind {
    fn as_str(&self) -> &str {
        match self {
            FsmStateKind::Idle => "idle",
            FsmStateKind::Connect => "connect",
            FsmStateKind::Active => "active",
            FsmStateKind::OpenSent => "open sent",
            FsmStateKind::OpenConfirm => "open confirm",
            FsmStateKind::Established => "established",
        }
    }
}

impl Display for FsmStateKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events a session emits to the peer manager on its `incoming` channel.
#[derive(Debug)]
pub enum FsmMessage {
    /// The state machine completed a transition into the given state.
    StateChange(FsmStateKind),

    /// A message from the peer was received and parsed.
    Message(Message),
}

/// A BGP session state machine for one neighbor.
///
/// Create the session with its channels wired, then call [`Session::run`]
/// on a dedicated thread. The session lives as long as the neighbor is
/// configured; [`Session::shutdown`] winds it down.
pub struct Session<Cnx: SessionConnection> {
    /// Configuration of the local speaker.
    pub router: RouterConfig,

    /// Configuration for the neighbor this session peers with.
    pub neighbor: PeerConfig,

    /// Counters for messages exchanged over this session.
    pub counters: Arc<MessageCounters>,

    /// Keepalive ticker. Armed while the session is in open confirm or
    /// established, empty in every other state.
    keepalive: Mutex<Option<Timer>>,

    state: Mutex<FsmStateKind>,
    shutdown: AtomicBool,
    running: AtomicBool,

    /// Passive connections accepted by the listener arrive here. The
    /// session takes ownership of each connection it receives.
    conn_rx: Mutex<Receiver<Cnx>>,

    /// Messages the peer manager asks us to transmit while established.
    outgoing: Mutex<Receiver<Message>>,

    /// State changes and parsed peer messages flow out to the peer manager
    /// here.
    incoming: Sender<FsmMessage>,

    resolution: Duration,
    log: Logger,
}

impl<Cnx: SessionConnection> Session<Cnx> {
    pub fn new(
        router: RouterConfig,
        neighbor: PeerConfig,
        conn_rx: Receiver<Cnx>,
        incoming: Sender<FsmMessage>,
        outgoing: Receiver<Message>,
        log: Logger,
    ) -> Self {
        Self {
            router,
            neighbor,
            counters: Arc::new(MessageCounters::default()),
            keepalive: Mutex::new(None),
            state: Mutex::new(FsmStateKind::Idle),
            shutdown: AtomicBool::new(false),
            running: AtomicBool::new(false),
            conn_rx: Mutex::new(conn_rx),
            outgoing: Mutex::new(outgoing),
            incoming,
            resolution: Duration::from_millis(neighbor.resolution),
            log,
        }
    }

    /// Current state of the state machine.
    pub fn state(&self) -> FsmStateKind {
        *lock!(self.state)
    }

    /// True while the keepalive ticker is armed.
    pub fn keepalive_armed(&self) -> bool {
        lock!(self.keepalive).is_some()
    }

    /// Ask the session to stop. The request is observed at the next
    /// resolution tick; `run` returns once the current state handler and
    /// any loops it spawned have wound down, closing the bound connection
    /// on the way out.
    pub fn shutdown(&self) {
        info!(self.log, "[{}] shutdown requested", self.neighbor.host);
        self.shutdown.store(true, Ordering::Release);
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// State machine entry point. Runs the handler for the current state,
    /// reports the transition it returns on `incoming`, and repeats. A
    /// handler that was cancelled returns no transition; nothing is
    /// reported and `run` returns. Run this on its own thread.
    pub fn run(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        info!(
            self.log,
            "[{}] starting peer state machine", self.neighbor.host
        );
        let mut current = FsmState::<Cnx>::Idle;

        loop {
            if self.stopping() {
                info!(self.log, "[{}] peer state machine stopping", self.neighbor.host);
                return;
            }

            let previous = current.kind();
            let next = match current {
                FsmState::Idle => self.fsm_idle(),
                FsmState::Connect => self.fsm_connect(),
                FsmState::Active => self.fsm_active(),
                FsmState::OpenSent(conn) => self.fsm_open_sent(conn),
                FsmState::OpenConfirm(conn) => self.fsm_open_confirm(conn),
                FsmState::Established(conn) => self.fsm_established(conn),
            };
            current = match next {
                Some(next) => next,
                None => {
                    debug!(
                        self.log,
                        "[{}] fsm cancelled in {previous}", self.neighbor.host
                    );
                    return;
                }
            };

            debug!(
                self.log,
                "[{}] fsm transition {previous} -> {}",
                self.neighbor.host,
                current.kind()
            );
            *lock!(self.state) = current.kind();
            if self
                .incoming
                .send(FsmMessage::StateChange(current.kind()))
                .is_err()
            {
                // The peer manager is gone, there is nothing left to
                // drive.
                return;
            }
        }
    }

    /// Initial state. Release the keepalive ticker if one is armed and
    /// re-arm for the next passive connection.
    fn fsm_idle(&self) -> Option<FsmState<Cnx>> {
        //TODO idle hold timer
        lock!(self.keepalive).take();
        Some(FsmState::Active)
    }

    /// Outbound connections are not implemented; nothing transitions into
    /// this state.
    //TODO active connect path
    fn fsm_connect(&self) -> Option<FsmState<Cnx>> {
        warn!(
            self.log,
            "[{}] connect state is not implemented", self.neighbor.host
        );
        Some(FsmState::Idle)
    }

    /// Wait for the listener to hand over a passive connection, then move
    /// straight to open sent. There is no delayed open timer.
    fn fsm_active(&self) -> Option<FsmState<Cnx>> {
        let conn_rx = lock!(self.conn_rx);
        loop {
            if self.stopping() {
                return None;
            }
            match conn_rx.recv_timeout(self.resolution) {
                Ok(conn) => {
                    info!(
                        self.log,
                        "[{}] passive connection from {}",
                        self.neighbor.host,
                        conn.peer()
                    );
                    return Some(FsmState::OpenSent(conn));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                // The listener side is gone. No connection can ever
                // arrive, so treat this the same as a cancellation.
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Send our open, then wait for the peer's. An open moves the session
    /// forward to open confirm; anything else tears it back down to idle.
    fn fsm_open_sent(&self, conn: Cnx) -> Option<FsmState<Cnx>> {
        let open = Message::Open(self.build_open());
        if let Err(e) = self.send_message(&conn, &open) {
            error!(self.log, "[{}] send open: {e}", self.neighbor.host);
            return Some(FsmState::Idle);
        }

        let (msg_tx, msg_rx) = channel();
        let next = thread::scope(|s| {
            s.spawn(|| Self::recv_one(&conn, msg_tx));
            loop {
                if self.stopping() {
                    conn.shutdown();
                    return None;
                }
                let msg = match msg_rx.recv_timeout(self.resolution) {
                    Ok(Ok(msg)) => msg,
                    Ok(Err(e)) => {
                        debug!(
                            self.log,
                            "[{}] open sent: recv: {e}", self.neighbor.host
                        );
                        return Some(FsmStateKind::Idle);
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Some(FsmStateKind::Idle)
                    }
                };
                self.counters.message_received(&msg);
                if !matches!(msg, Message::Open(_)) {
                    //TODO send a notification instead of silently
                    // dropping the session
                    warn!(
                        self.log,
                        "[{}] expected open, got {:?}",
                        self.neighbor.host,
                        MessageType::from(&msg)
                    );
                    return Some(FsmStateKind::Idle);
                }
                if self.incoming.send(FsmMessage::Message(msg)).is_err() {
                    return Some(FsmStateKind::Idle);
                }
                if let Err(e) = self.send_message(&conn, &Message::KeepAlive) {
                    error!(
                        self.log,
                        "[{}] send keepalive: {e}", self.neighbor.host
                    );
                    return Some(FsmStateKind::Idle);
                }
                return Some(FsmStateKind::OpenConfirm);
            }
        });

        match next {
            Some(FsmStateKind::OpenConfirm) => {
                Some(FsmState::OpenConfirm(conn))
            }
            Some(_) => Some(FsmState::Idle),
            None => None,
        }
    }

    /// Arm the keepalive ticker and wait for the peer to confirm with a
    /// keepalive of its own. Ticks that come due while we wait are sent
    /// from this loop.
    fn fsm_open_confirm(&self, conn: Cnx) -> Option<FsmState<Cnx>> {
        lock!(self.keepalive).replace(Timer::new(Duration::from_secs(
            self.neighbor.keepalive,
        )));

        let (msg_tx, msg_rx) = channel();
        let next = thread::scope(|s| {
            s.spawn(|| Self::recv_one(&conn, msg_tx));
            loop {
                if self.stopping() {
                    conn.shutdown();
                    return None;
                }
                // Write errors on the ticker are swallowed here; if the
                // connection is really gone the pending receive fails.
                let _ = self.keepalive_tick(&conn);
                match msg_rx.recv_timeout(self.resolution) {
                    Ok(Ok(msg)) => {
                        self.counters.message_received(&msg);
                        if matches!(msg, Message::KeepAlive) {
                            return Some(FsmStateKind::Established);
                        }
                        //TODO send a notification instead of silently
                        // dropping the session
                        warn!(
                            self.log,
                            "[{}] expected keepalive, got {:?}",
                            self.neighbor.host,
                            MessageType::from(&msg)
                        );
                        return Some(FsmStateKind::Idle);
                    }
                    Ok(Err(e)) => {
                        debug!(
                            self.log,
                            "[{}] open confirm: recv: {e}", self.neighbor.host
                        );
                        return Some(FsmStateKind::Idle);
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Some(FsmStateKind::Idle)
                    }
                }
            }
        });

        match next {
            Some(FsmStateKind::Established) => {
                Some(FsmState::Established(conn))
            }
            Some(_) => Some(FsmState::Idle),
            None => None,
        }
    }

    /// Bidirectional message flow. Two loops share the connection: the
    /// send loop drains `outgoing` and the keepalive ticker, the receive
    /// loop parses inbound messages onto `incoming`. The first error on
    /// either side tears the session down to idle.
    fn fsm_established(&self, conn: Cnx) -> Option<FsmState<Cnx>> {
        let stop = AtomicBool::new(false);
        let (error_tx, error_rx) = channel();

        let next = thread::scope(|s| {
            let etx = error_tx.clone();
            s.spawn(|| self.send_loop(&conn, &stop, etx));
            s.spawn(|| self.recv_loop(&conn, &stop, error_tx));

            let next = loop {
                if self.stopping() {
                    break None;
                }
                match error_rx.recv_timeout(self.resolution) {
                    Ok(e) => {
                        debug!(
                            self.log,
                            "[{}] established: {e}", self.neighbor.host
                        );
                        break Some(FsmStateKind::Idle);
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        break Some(FsmStateKind::Idle)
                    }
                }
            };
            conn.shutdown();
            stop.store(true, Ordering::Release);
            next
        });

        match next {
            Some(_) => Some(FsmState::Idle),
            None => None,
        }
    }

    /// Established-state send half. Drains the outgoing channel and the
    /// keepalive ticker onto the connection until the handler raises
    /// `stop` or a write fails.
    fn send_loop(&self, conn: &Cnx, stop: &AtomicBool, error_tx: Sender<Error>) {
        let outgoing = lock!(self.outgoing);
        loop {
            if stop.load(Ordering::Acquire) {
                return;
            }
            match outgoing.recv_timeout(self.resolution) {
                Ok(msg) => {
                    if let Err(e) = self.send_message(conn, &msg) {
                        let _ = error_tx.send(e);
                        return;
                    }
                    match serde_json::to_string(&msg) {
                        Ok(json) => debug!(
                            self.log,
                            "[{}] sent {json}", self.neighbor.host
                        ),
                        Err(e) => warn!(
                            self.log,
                            "[{}] serializing sent message for log: {e}",
                            self.neighbor.host
                        ),
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // The peer manager dropped its sender. Nothing more
                    // will be queued, but keepalives still need to go out.
                    thread::sleep(self.resolution);
                }
            }
            if let Err(e) = self.keepalive_tick(conn) {
                let _ = error_tx.send(e);
                return;
            }
        }
    }

    /// Established-state receive half. Parsed messages flow directly to
    /// the peer manager on `incoming`.
    fn recv_loop(&self, conn: &Cnx, stop: &AtomicBool, error_tx: Sender<Error>) {
        loop {
            match conn.recv() {
                Ok(msg) => {
                    self.counters.message_received(&msg);
                    if self.incoming.send(FsmMessage::Message(msg)).is_err() {
                        return;
                    }
                }
                Err(Error::Shutdown) => return,
                Err(e) => {
                    let _ = error_tx.send(e);
                    return;
                }
            }
            if stop.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// One-shot receive used by the open sent and open confirm handlers.
    /// Delivers a single message, or the error that prevented one.
    /// Cancellation is not delivered; the handler already knows.
    fn recv_one(conn: &Cnx, tx: Sender<Result<Message, Error>>) {
        match conn.recv() {
            Err(Error::Shutdown) => {}
            result => {
                let _ = tx.send(result);
            }
        }
    }

    /// Send a keepalive if the ticker is armed and due, then re-arm it.
    /// In open confirm write errors are swallowed and the ticker keeps
    /// going; the established send loop propagates them instead.
    //TODO check send errors in open confirm
    fn keepalive_tick(&self, conn: &Cnx) -> Result<(), Error> {
        let keepalive = lock!(self.keepalive);
        if let Some(t) = keepalive.as_ref() {
            if t.expired() {
                let result = self.send_message(conn, &Message::KeepAlive);
                t.reset();
                return result;
            }
        }
        Ok(())
    }

    /// Write one message to the peer, updating outbound counters on
    /// success.
    fn send_message(&self, conn: &Cnx, msg: &Message) -> Result<(), Error> {
        conn.send(msg)?;
        self.counters.message_sent(msg);
        Ok(())
    }

    /// Construct our open message. The 2-byte my-as field carries the
    /// local ASN when it fits and AS_TRANS otherwise; the true 32-bit ASN
    /// always rides in the four-octet-as capability. The multiprotocol
    /// capability follows the neighbor's address family, with v4-mapped
    /// v6 addresses counting as IPv4.
    fn build_open(&self) -> OpenMessage {
        let afi = match self.neighbor.host.to_canonical() {
            IpAddr::V4(_) => Afi::Ipv4,
            IpAddr::V6(_) => Afi::Ipv6,
        };
        let asn = if self.router.asn > u32::from(u16::MAX) {
            AS_TRANS
        } else {
            self.router.asn as u16
        };
        OpenMessage {
            version: BGP4,
            asn,
            hold_time: self.neighbor.hold_time,
            id: self.router.id.into(),
            parameters: vec![
                Capability::RouteRefresh {}.into(),
                Capability::MultiprotocolExtensions {
                    afi: afi as u16,
                    safi: Safi::Unicast as u8,
                }
                .into(),
                Capability::FourOctetAs {
                    asn: self.router.asn,
                }
                .into(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_channel::BgpConnectionChannel;
    use pretty_assertions::assert_eq;

    fn test_session(asn: u32, host: IpAddr) -> Session<BgpConnectionChannel> {
        let (_conn_tx, conn_rx) = channel::<BgpConnectionChannel>();
        let (incoming_tx, _incoming_rx) = channel();
        let (_outgoing_tx, outgoing_rx) = channel();
        Session::new(
            RouterConfig {
                asn,
                id: "10.0.0.1".parse().unwrap(),
            },
            PeerConfig {
                host,
                hold_time: 90,
                keepalive: 30,
                resolution: 10,
            },
            conn_rx,
            incoming_tx,
            outgoing_rx,
            crate::log::init_logger(),
        )
    }

    #[test]
    fn open_asn_fits_in_two_bytes() {
        let s = test_session(65535, "192.0.2.2".parse().unwrap());
        let open = s.build_open();
        assert_eq!(open.asn, 65535);
        assert_eq!(open.hold_time, 90);
        assert_eq!(open.id, u32::from_be_bytes([10, 0, 0, 1]));
        assert!(open
            .capabilities()
            .any(|c| *c == Capability::FourOctetAs { asn: 65535 }));
    }

    #[test]
    fn open_asn_needs_four_bytes() {
        let s = test_session(65536, "192.0.2.2".parse().unwrap());
        let open = s.build_open();
        assert_eq!(open.asn, AS_TRANS);
        assert!(open
            .capabilities()
            .any(|c| *c == Capability::FourOctetAs { asn: 65536 }));
    }

    #[test]
    fn open_afi_follows_neighbor_address_family() {
        let mp = |s: &Session<BgpConnectionChannel>| {
            s.build_open()
                .capabilities()
                .find_map(|c| match c {
                    Capability::MultiprotocolExtensions { afi, safi } => {
                        Some((*afi, *safi))
                    }
                    _ => None,
                })
                .expect("multiprotocol capability present")
        };

        let s = test_session(65001, "192.0.2.2".parse().unwrap());
        assert_eq!(mp(&s), (Afi::Ipv4 as u16, Safi::Unicast as u8));

        let s = test_session(65001, "::ffff:192.0.2.2".parse().unwrap());
        assert_eq!(mp(&s), (Afi::Ipv4 as u16, Safi::Unicast as u8));

        let s = test_session(65001, "2001:db8::2".parse().unwrap());
        assert_eq!(mp(&s), (Afi::Ipv6 as u16, Safi::Unicast as u8));
    }

    #[test]
    fn open_capability_order_and_framing() {
        let s = test_session(65001, "192.0.2.2".parse().unwrap());
        let open = s.build_open();

        // One capability per option parameter envelope, in a fixed order.
        assert_eq!(open.parameters.len(), 3);
        let caps: Vec<_> = open.capabilities().collect();
        assert_eq!(
            caps,
            vec![
                &Capability::RouteRefresh {},
                &Capability::MultiprotocolExtensions {
                    afi: Afi::Ipv4 as u16,
                    safi: Safi::Unicast as u8,
                },
                &Capability::FourOctetAs { asn: 65001 },
            ]
        );
    }
}
