// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In tests the session state machine runs over in-memory channel
//! connections rather than TCP, so scenarios can inject messages, drop
//! the peer side and observe everything the session sends without
//! touching sockets.

use crate::connection::SessionConnection;
use crate::error::Error;
use crate::lock;
use crate::messages::Message;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

/// One end of a bidirectional in-memory connection carrying already-typed
/// messages.
pub struct BgpConnectionChannel {
    peer: SocketAddr,
    tx: Sender<Message>,
    rx: Mutex<Receiver<Message>>,
    dropped: AtomicBool,
    resolution: Duration,
}

/// Analogous to a connected socket pair: two endpoints, each seeing the
/// other as its peer.
pub fn pair(
    a: SocketAddr,
    b: SocketAddr,
    resolution: Duration,
) -> (BgpConnectionChannel, BgpConnectionChannel) {
    let (tx_a, rx_b) = channel();
    let (tx_b, rx_a) = channel();
    (
        BgpConnectionChannel::new(b, tx_a, rx_a, resolution),
        BgpConnectionChannel::new(a, tx_b, rx_b, resolution),
    )
}

impl BgpConnectionChannel {
    fn new(
        peer: SocketAddr,
        tx: Sender<Message>,
        rx: Receiver<Message>,
        resolution: Duration,
    ) -> Self {
        Self {
            peer,
            tx,
            rx: Mutex::new(rx),
            dropped: AtomicBool::new(false),
            resolution,
        }
    }

    /// Receive with a hard deadline. Test scenarios use this instead of
    /// `recv` so a missing message fails the test rather than hanging it.
    pub fn recv_deadline(&self, deadline: Duration) -> Result<Message, Error> {
        lock!(self.rx).recv_timeout(deadline).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout,
            RecvTimeoutError::Disconnected => Error::Disconnected,
        })
    }
}

impl SessionConnection for BgpConnectionChannel {
    fn send(&self, msg: &Message) -> Result<(), Error> {
        if self.dropped.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        self.tx
            .send(msg.clone())
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    fn recv(&self) -> Result<Message, Error> {
        let rx = lock!(self.rx);
        loop {
            if self.dropped.load(Ordering::Relaxed) {
                return Err(Error::Shutdown);
            }
            match rx.recv_timeout(self.resolution) {
                Ok(msg) => return Ok(msg),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Disconnected)
                }
            }
        }
    }

    fn shutdown(&self) {
        self.dropped.store(true, Ordering::SeqCst);
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}
