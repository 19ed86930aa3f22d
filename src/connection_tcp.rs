// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::connection::{frame_message, read_message, SessionConnection};
use crate::error::Error;
use crate::lock;
use crate::messages::Message;
use slog::{trace, Logger};
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A BGP peer connection over TCP. The underlying stream is held as two
/// cloned handles so the established-state send and receive loops can
/// operate on disjoint halves without contending for a lock.
pub struct BgpConnectionTcp {
    peer: SocketAddr,
    rx: Mutex<TcpStream>,
    tx: Mutex<TcpStream>,
    dropped: AtomicBool,
    log: Logger,
}

impl BgpConnectionTcp {
    /// Wrap a stream accepted by the listener. `resolution` becomes the
    /// read timeout, which bounds how long a blocked receiver takes to
    /// notice a shutdown.
    pub fn new(
        conn: TcpStream,
        peer: SocketAddr,
        resolution: Duration,
        log: Logger,
    ) -> Result<Self, Error> {
        conn.set_read_timeout(Some(resolution))?;
        let rx = conn.try_clone()?;
        Ok(Self {
            peer,
            rx: Mutex::new(rx),
            tx: Mutex::new(conn),
            dropped: AtomicBool::new(false),
            log,
        })
    }
}

impl SessionConnection for BgpConnectionTcp {
    fn send(&self, msg: &Message) -> Result<(), Error> {
        if self.dropped.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        let buf = frame_message(msg)?;
        trace!(self.log, "[{}] send {:x?}", self.peer, buf);
        let mut stream = lock!(self.tx);
        stream.write_all(&buf)?;
        Ok(())
    }

    fn recv(&self) -> Result<Message, Error> {
        let mut stream = lock!(self.rx);
        let msg = read_message(&mut *stream, &self.dropped)?;
        trace!(self.log, "[{}] recv {:?}", self.peer, msg);
        Ok(msg)
    }

    fn shutdown(&self) {
        if self.dropped.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!(self.log, "[{}] closing connection", self.peer);
        if let Err(e) = lock!(self.tx).shutdown(Shutdown::Both) {
            // Already torn down by the peer.
            trace!(self.log, "[{}] shutdown: {e}", self.peer);
        }
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for BgpConnectionTcp {
    fn drop(&mut self) {
        self.shutdown();
    }
}
