// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use crate::messages::{Header, Message, MessageType};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

/// A connection to a BGP peer, as seen by the session state machine. The
/// state machine takes ownership of a connection when the listener hands
/// one over and keeps it until the session falls back to idle.
///
/// Implementations must support concurrent use of `send` and `recv` from
/// different threads; in the established state one loop writes while
/// another reads.
pub trait SessionConnection: Send + Sync {
    /// Serialize and transmit one framed message to the peer.
    fn send(&self, msg: &Message) -> Result<(), Error>;

    /// Block until one full message has been received and parsed, or until
    /// the transport fails or `shutdown` is called. Returns
    /// `Error::Shutdown` in the latter case.
    fn recv(&self) -> Result<Message, Error>;

    /// Close the connection. Idempotent. Unblocks any `recv` in progress.
    fn shutdown(&self);

    /// Address of the peer on the other end.
    fn peer(&self) -> SocketAddr;
}

/// Frame a message for the wire: serialize the body and prepend a header
/// carrying the total length.
pub fn frame_message(msg: &Message) -> Result<Vec<u8>, Error> {
    let body = msg.to_wire()?;
    let length = (body.len() + Header::WIRE_SIZE)
        .try_into()
        .map_err(|_| Error::TooLarge("message being framed".into()))?;
    let header = Header::new(length, MessageType::from(msg))?;
    let mut buf = header.to_wire();
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Read one framed message off a byte stream: the fixed size header first,
/// then however many body bytes the header says follow. Fails on the first
/// transport or parse error, or with `Error::Shutdown` once `dropped` has
/// been raised.
pub fn read_message<R: Read>(
    stream: &mut R,
    dropped: &AtomicBool,
) -> Result<Message, Error> {
    let mut hbuf = [0u8; Header::WIRE_SIZE];
    read_exact(stream, &mut hbuf, dropped)?;
    let header = Header::from_wire(&hbuf)?;

    // Header::from_wire bounds the length field below by the header size.
    let mut body = vec![0u8; usize::from(header.length) - Header::WIRE_SIZE];
    read_exact(stream, &mut body, dropped)?;

    Message::from_wire(&header, &body)
}

/// Fill `buf` from the stream, accumulating across short reads. Each read
/// asks for exactly the bytes still missing, so a message boundary is
/// never crossed. Read timeouts are how blocked readers notice `dropped`;
/// they are not errors.
fn read_exact<R: Read>(
    stream: &mut R,
    buf: &mut [u8],
    dropped: &AtomicBool,
) -> Result<(), Error> {
    let mut n = 0;
    while n < buf.len() {
        if dropped.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        match stream.read(&mut buf[n..]) {
            Ok(0) => return Err(Error::Disconnected),
            Ok(len) => n += len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}
