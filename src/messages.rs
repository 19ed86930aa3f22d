// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};

/// BGP Message types.
///
/// Ref: RFC 4271 §4.1
#[derive(
    Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum MessageType {
    /// The first message sent by each side once a TCP connection is
    /// established.
    ///
    /// RFC 4271 §4.2
    Open = 1,

    /// Used to transfer routing information between BGP peers.
    ///
    /// RFC 4271 §4.3
    Update = 2,

    /// Sent when an error condition is detected.
    ///
    /// RFC 4271 §4.5
    Notification = 3,

    /// Exchanged between peers often enough not to cause the hold timer to
    /// expire.
    ///
    /// RFC 4271 §4.4
    KeepAlive = 4,

    /// Asks the peer to re-advertise its routes for an address family.
    ///
    /// RFC 2918 §3
    RouteRefresh = 5,
}

/// Each BGP message has a fixed sized header.
///
/// ```text
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                                                               |
///   +                                                               +
///   |                                                               |
///   +                                                               +
///   |                           Marker                              |
///   +                                                               +
///   |                                                               |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |          Length               |      Type     |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// This object contains the length and type fields. The marker is filled
/// in by [`Header::to_wire`] and checked by [`Header::from_wire`].
///
/// Ref: RFC 4271 §4.1
#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    /// Total length of the message, including the header. May be no larger
    /// than 4096.
    pub length: u16,

    /// Indicates the type of message.
    pub typ: MessageType,
}

/// According to RFC 4271 §4.1 the header marker is all ones.
const MARKER: [u8; 16] = [0xff; 16];

impl Header {
    pub const WIRE_SIZE: usize = 19;
    pub const MAX_MESSAGE_SIZE: usize = 4096;

    /// Create a new BGP message header. Length must be between 19 and 4096
    /// per RFC 4271 §4.1.
    pub fn new(length: u16, typ: MessageType) -> Result<Header, Error> {
        if usize::from(length) < Self::WIRE_SIZE {
            return Err(Error::TooSmall("message length".into()));
        }
        if usize::from(length) > Self::MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge("message length".into()));
        }
        Ok(Header { length, typ })
    }

    /// Serialize the header to wire format.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = MARKER.to_vec();
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.push(self.typ as u8);
        buf
    }

    /// Deserialize a header from wire format.
    pub fn from_wire(buf: &[u8]) -> Result<Header, Error> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::TooSmall("message header".into()));
        }
        if buf[..16] != MARKER {
            return Err(Error::NoMarker);
        }
        let length = u16::from_be_bytes([buf[16], buf[17]]);
        let typ = MessageType::try_from(buf[18])?;
        Header::new(length, typ)
    }
}

/// The autonomous system number carried in the my-as field of open
/// messages when the local ASN does not fit in two bytes.
///
/// Ref: RFC 6793 §9
pub const AS_TRANS: u16 = 23456;

/// The version number for BGP-4.
pub const BGP4: u8 = 4;

/// Address family identifiers.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[repr(u16)]
pub enum Afi {
    Ipv4 = 1,
    Ipv6 = 2,
}

/// Subsequent address family identifiers.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum Safi {
    Unicast = 1,
}

/// A fully typed BGP message, header omitted. Headers are synthesized when
/// a message is framed for the wire and consumed when one is read off it.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Message {
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(NotificationMessage),
    KeepAlive,
    RouteRefresh(RouteRefreshMessage),
}

impl Message {
    /// Serialize the message body. Framing, including the header, is the
    /// connection layer's business.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Open(m) => m.to_wire(),
            Self::Update(m) => m.to_wire(),
            Self::Notification(m) => m.to_wire(),
            Self::KeepAlive => Ok(Vec::new()),
            Self::RouteRefresh(m) => m.to_wire(),
        }
    }

    /// Deserialize a message body of the type named in `header`.
    pub fn from_wire(header: &Header, body: &[u8]) -> Result<Message, Error> {
        match header.typ {
            MessageType::Open => Ok(OpenMessage::from_wire(body)?.into()),
            MessageType::Update => Ok(UpdateMessage::from_wire(body)?.into()),
            MessageType::Notification => {
                Ok(NotificationMessage::from_wire(body)?.into())
            }
            MessageType::KeepAlive => {
                if !body.is_empty() {
                    return Err(Error::TooLarge(
                        "keepalive with a body".into(),
                    ));
                }
                Ok(Message::KeepAlive)
            }
            MessageType::RouteRefresh => {
                Ok(RouteRefreshMessage::from_wire(body)?.into())
            }
        }
    }
}

impl From<&Message> for MessageType {
    fn from(m: &Message) -> MessageType {
        match m {
            Message::Open(_) => MessageType::Open,
            Message::Update(_) => MessageType::Update,
            Message::Notification(_) => MessageType::Notification,
            Message::KeepAlive => MessageType::KeepAlive,
            Message::RouteRefresh(_) => MessageType::RouteRefresh,
        }
    }
}

impl From<OpenMessage> for Message {
    fn from(m: OpenMessage) -> Message {
        Message::Open(m)
    }
}

impl From<UpdateMessage> for Message {
    fn from(m: UpdateMessage) -> Message {
        Message::Update(m)
    }
}

impl From<NotificationMessage> for Message {
    fn from(m: NotificationMessage) -> Message {
        Message::Notification(m)
    }
}

impl From<RouteRefreshMessage> for Message {
    fn from(m: RouteRefreshMessage) -> Message {
        Message::RouteRefresh(m)
    }
}

/// The first message sent by each side once a TCP connection is
/// established.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |    Version    |     My Autonomous System      |   Hold Time   :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               |                BGP Identifier                 :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :               | Opt Parm Len  |     Optional Parameters       :
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// :                                                               :
/// :             Optional Parameters (cont, variable)              :
/// :                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Ref: RFC 4271 §4.2
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct OpenMessage {
    /// BGP protocol version.
    pub version: u8,

    /// Autonomous system number of the sender. When 4-byte ASNs are in use
    /// this value is set to AS_TRANS which has a value of 23456.
    ///
    /// Ref: RFC 6793 §9
    pub asn: u16,

    /// Number of seconds the sender proposes for the hold timer.
    pub hold_time: u16,

    /// BGP identifier of the sender.
    pub id: u32,

    /// A list of optional parameters.
    pub parameters: Vec<OptionalParameter>,
}

impl OpenMessage {
    /// Serialize an open message to wire format.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();

        // version
        buf.push(self.version);

        // as
        buf.extend_from_slice(&self.asn.to_be_bytes());

        // hold time
        buf.extend_from_slice(&self.hold_time.to_be_bytes());

        // id
        buf.extend_from_slice(&self.id.to_be_bytes());

        // opt param len
        let opt_buf = self.parameters_to_wire()?;
        if opt_buf.len() > u8::MAX as usize {
            return Err(Error::TooLarge("optional parameters".into()));
        }
        buf.push(opt_buf.len() as u8);
        buf.extend_from_slice(&opt_buf);

        Ok(buf)
    }

    fn parameters_to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        for p in &self.parameters {
            buf.extend_from_slice(&p.to_wire()?);
        }
        Ok(buf)
    }

    /// Deserialize an open message from wire format.
    pub fn from_wire(buf: &[u8]) -> Result<OpenMessage, Error> {
        if buf.len() < 10 {
            return Err(Error::TooSmall("open message".into()));
        }

        // version
        let version = buf[0];
        if version != BGP4 {
            return Err(Error::BadVersion);
        }

        // as
        let asn = u16::from_be_bytes([buf[1], buf[2]]);

        // hold time
        let hold_time = u16::from_be_bytes([buf[3], buf[4]]);

        // id
        let id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);

        // parameters
        let param_len = buf[9] as usize;
        if buf.len() < 10 + param_len {
            return Err(Error::TooSmall("optional parameters".into()));
        }
        let parameters = Self::parameters_from_wire(&buf[10..10 + param_len])?;

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            id,
            parameters,
        })
    }

    fn parameters_from_wire(
        mut buf: &[u8],
    ) -> Result<Vec<OptionalParameter>, Error> {
        let mut result = Vec::new();
        while !buf.is_empty() {
            let (params, n) = OptionalParameter::from_wire(buf)?;
            result.extend(params);
            buf = &buf[n..];
        }
        Ok(result)
    }

    /// The capabilities advertised by this open message, across all of its
    /// option parameter envelopes.
    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.parameters.iter().map(|p| match p {
            OptionalParameter::Capability(c) => c,
        })
    }
}

/// An optional parameter carried in an open message. Capabilities are the
/// only parameter type in current use; anything else fails the parse.
///
/// Ref: RFC 5492 §4
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum OptionalParameter {
    /// Code 2: RFC 5492
    Capability(Capability),
}

/// Code points for optional open message parameters.
#[derive(Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum OptionalParameterCode {
    Capability = 2,
}

impl From<Capability> for OptionalParameter {
    fn from(c: Capability) -> OptionalParameter {
        OptionalParameter::Capability(c)
    }
}

impl OptionalParameter {
    /// Serialize as a parameter envelope. Each capability gets an envelope
    /// of its own even though RFC 5492 permits grouping.
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Capability(c) => {
                let cbuf = c.to_wire()?;
                if cbuf.len() > u8::MAX as usize {
                    return Err(Error::TooLarge("capability".into()));
                }
                let mut buf = vec![
                    OptionalParameterCode::Capability as u8,
                    cbuf.len() as u8,
                ];
                buf.extend_from_slice(&cbuf);
                Ok(buf)
            }
        }
    }

    /// Deserialize one parameter envelope, returning the parameters it
    /// carries and the number of bytes consumed. A peer may pack several
    /// capabilities into a single envelope; each becomes its own entry.
    pub fn from_wire(
        buf: &[u8],
    ) -> Result<(Vec<OptionalParameter>, usize), Error> {
        if buf.len() < 2 {
            return Err(Error::TooSmall("optional parameter".into()));
        }
        let code = match OptionalParameterCode::try_from(buf[0]) {
            Ok(code) => code,
            Err(_) => {
                return Err(Error::UnsupportedOptionalParameterCode(buf[0]))
            }
        };
        let len = buf[1] as usize;
        if buf.len() < 2 + len {
            return Err(Error::TooSmall("optional parameter".into()));
        }

        match code {
            OptionalParameterCode::Capability => {
                let mut value = &buf[2..2 + len];
                let mut result = Vec::new();
                while !value.is_empty() {
                    let (cap, n) = Capability::from_wire(value)?;
                    result.push(cap.into());
                    value = &value[n..];
                }
                Ok((result, 2 + len))
            }
        }
    }
}

/// A capability advertised in an open message.
///
/// Ref: RFC 5492 §4
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Capability {
    /// RFC 4760
    MultiprotocolExtensions { afi: u16, safi: u8 },

    /// RFC 2918
    RouteRefresh {},

    /// RFC 6793
    FourOctetAs { asn: u32 },

    /// Any capability we do not implement is carried opaquely so a peer
    /// open that advertises one still parses.
    Unknown { code: u8, data: Vec<u8> },
}

/// Capability code points we interpret.
///
/// Ref: IANA capability-codes registry
#[derive(Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum CapabilityCode {
    /// RFC 4760
    MultiprotocolExtensions = 1,

    /// RFC 2918
    RouteRefresh = 2,

    /// RFC 6793
    FourOctetAs = 65,
}

impl Capability {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::MultiprotocolExtensions { afi, safi } => {
                let mut buf =
                    vec![CapabilityCode::MultiprotocolExtensions as u8, 4];
                buf.extend_from_slice(&afi.to_be_bytes());
                buf.push(0); // reserved
                buf.push(*safi);
                Ok(buf)
            }
            Self::RouteRefresh {} => {
                Ok(vec![CapabilityCode::RouteRefresh as u8, 0])
            }
            Self::FourOctetAs { asn } => {
                let mut buf = vec![CapabilityCode::FourOctetAs as u8, 4];
                buf.extend_from_slice(&asn.to_be_bytes());
                Ok(buf)
            }
            Self::Unknown { code, data } => {
                if data.len() > u8::MAX as usize {
                    return Err(Error::TooLarge("capability value".into()));
                }
                let mut buf = vec![*code, data.len() as u8];
                buf.extend_from_slice(data);
                Ok(buf)
            }
        }
    }

    /// Deserialize one capability, returning it along with the number of
    /// bytes consumed.
    pub fn from_wire(buf: &[u8]) -> Result<(Capability, usize), Error> {
        if buf.len() < 2 {
            return Err(Error::TooSmall("capability".into()));
        }
        let len = buf[1] as usize;
        if buf.len() < 2 + len {
            return Err(Error::TooSmall("capability value".into()));
        }
        let value = &buf[2..2 + len];

        let cap = match CapabilityCode::try_from(buf[0]) {
            Ok(CapabilityCode::MultiprotocolExtensions) => {
                if len != 4 {
                    return Err(Error::BadLength {
                        expected: 4,
                        found: len as u8,
                    });
                }
                Capability::MultiprotocolExtensions {
                    afi: u16::from_be_bytes([value[0], value[1]]),
                    safi: value[3],
                }
            }
            Ok(CapabilityCode::RouteRefresh) => {
                if len != 0 {
                    return Err(Error::BadLength {
                        expected: 0,
                        found: len as u8,
                    });
                }
                Capability::RouteRefresh {}
            }
            Ok(CapabilityCode::FourOctetAs) => {
                if len != 4 {
                    return Err(Error::BadLength {
                        expected: 4,
                        found: len as u8,
                    });
                }
                Capability::FourOctetAs {
                    asn: u32::from_be_bytes([
                        value[0], value[1], value[2], value[3],
                    ]),
                }
            }
            Err(_) => Capability::Unknown {
                code: buf[0],
                data: value.to_vec(),
            },
        };
        Ok((cap, 2 + len))
    }
}

/// An update message advertises feasible routes that share common path
/// attributes, or withdraws unfeasible routes from service.
///
/// The path attribute block is carried opaquely here; interpreting it is
/// the routing layer's concern, the session layer only frames it.
///
/// Ref: RFC 4271 §4.3
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct UpdateMessage {
    pub withdrawn: Vec<Prefix>,
    pub path_attributes: Vec<u8>,
    pub nlri: Vec<Prefix>,
}

impl UpdateMessage {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();

        // withdrawn
        let withdrawn = Self::prefixes_to_wire(&self.withdrawn)?;
        if withdrawn.len() > u16::MAX as usize {
            return Err(Error::TooLarge("withdrawn routes".into()));
        }
        buf.extend_from_slice(&(withdrawn.len() as u16).to_be_bytes());
        buf.extend_from_slice(&withdrawn);

        // path attributes
        if self.path_attributes.len() > u16::MAX as usize {
            return Err(Error::TooLarge("path attributes".into()));
        }
        buf.extend_from_slice(
            &(self.path_attributes.len() as u16).to_be_bytes(),
        );
        buf.extend_from_slice(&self.path_attributes);

        // nlri
        buf.extend_from_slice(&Self::prefixes_to_wire(&self.nlri)?);

        Ok(buf)
    }

    pub fn from_wire(buf: &[u8]) -> Result<UpdateMessage, Error> {
        // withdrawn
        if buf.len() < 2 {
            return Err(Error::TooSmall("withdrawn length".into()));
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let buf = &buf[2..];
        if buf.len() < len {
            return Err(Error::TooSmall("withdrawn routes".into()));
        }
        let withdrawn = Self::prefixes_from_wire(&buf[..len])?;
        let buf = &buf[len..];

        // path attributes
        if buf.len() < 2 {
            return Err(Error::TooSmall("path attribute length".into()));
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let buf = &buf[2..];
        if buf.len() < len {
            return Err(Error::TooSmall("path attributes".into()));
        }
        let path_attributes = buf[..len].to_vec();
        let buf = &buf[len..];

        // nlri
        let nlri = Self::prefixes_from_wire(buf)?;

        Ok(UpdateMessage {
            withdrawn,
            path_attributes,
            nlri,
        })
    }

    fn prefixes_to_wire(prefixes: &[Prefix]) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        for p in prefixes {
            buf.extend_from_slice(&p.to_wire()?);
        }
        Ok(buf)
    }

    fn prefixes_from_wire(mut buf: &[u8]) -> Result<Vec<Prefix>, Error> {
        let mut result = Vec::new();
        while !buf.is_empty() {
            let (pfx, n) = Prefix::from_wire(buf)?;
            result.push(pfx);
            buf = &buf[n..];
        }
        Ok(result)
    }
}

/// A route prefix as found in update message withdrawn and NLRI blocks: a
/// bit length followed by just enough bytes to hold that many bits.
///
/// Ref: RFC 4271 §4.3
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Prefix {
    /// Prefix length in bits.
    pub length: u8,

    /// Packed prefix bytes, `(length + 7) / 8` of them.
    pub value: Vec<u8>,
}

impl Prefix {
    fn wire_len(length: u8) -> usize {
        (usize::from(length) + 7) / 8
    }

    fn to_wire(&self) -> Result<Vec<u8>, Error> {
        if self.value.len() != Self::wire_len(self.length) {
            return Err(Error::BadLength {
                expected: Self::wire_len(self.length) as u8,
                found: self.value.len() as u8,
            });
        }
        let mut buf = vec![self.length];
        buf.extend_from_slice(&self.value);
        Ok(buf)
    }

    fn from_wire(buf: &[u8]) -> Result<(Prefix, usize), Error> {
        if buf.is_empty() {
            return Err(Error::TooSmall("prefix".into()));
        }
        let length = buf[0];
        if length > 128 {
            return Err(Error::TooLarge("prefix length".into()));
        }
        let n = Self::wire_len(length);
        if buf.len() < 1 + n {
            return Err(Error::TooSmall("prefix value".into()));
        }
        Ok((
            Prefix {
                length,
                value: buf[1..1 + n].to_vec(),
            },
            1 + n,
        ))
    }
}

/// Sent when an error condition is detected; the connection is closed
/// immediately after.
///
/// Ref: RFC 4271 §4.5
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub error_code: ErrorCode,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

/// Top-level notification error codes.
///
/// Ref: RFC 4271 §4.5
#[derive(
    Debug, Eq, PartialEq, TryFromPrimitive, Copy, Clone, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ErrorCode {
    Header = 1,
    Open = 2,
    Update = 3,
    HoldTimerExpired = 4,
    Fsm = 5,
    Cease = 6,
}

impl NotificationMessage {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![self.error_code as u8, self.error_subcode];
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn from_wire(buf: &[u8]) -> Result<NotificationMessage, Error> {
        if buf.len() < 2 {
            return Err(Error::TooSmall("notification message".into()));
        }
        Ok(NotificationMessage {
            error_code: ErrorCode::try_from(buf[0])?,
            error_subcode: buf[1],
            data: buf[2..].to_vec(),
        })
    }
}

/// Asks the peer to re-advertise its routes for one address family.
///
/// Ref: RFC 2918 §3
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RouteRefreshMessage {
    pub afi: u16,
    pub safi: u8,
}

impl RouteRefreshMessage {
    pub fn to_wire(&self) -> Result<Vec<u8>, Error> {
        let mut buf = self.afi.to_be_bytes().to_vec();
        buf.push(0); // reserved
        buf.push(self.safi);
        Ok(buf)
    }

    pub fn from_wire(buf: &[u8]) -> Result<RouteRefreshMessage, Error> {
        if buf.len() != 4 {
            return Err(Error::BadLength {
                expected: 4,
                found: buf.len() as u8,
            });
        }
        Ok(RouteRefreshMessage {
            afi: u16::from_be_bytes([buf[0], buf[1]]),
            safi: buf[3],
        })
    }
}
