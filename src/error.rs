// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_enum::TryFromPrimitiveError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("too small: {0}")]
    TooSmall(String),

    #[error("too large: {0}")]
    TooLarge(String),

    #[error("no marker")]
    NoMarker,

    #[error("bad version")]
    BadVersion,

    #[error("bad length: expected {expected} found {found}")]
    BadLength { expected: u8, found: u8 },

    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,

    #[error("disconnected")]
    Disconnected,

    #[error("connection shut down")]
    Shutdown,

    #[error("channel send {0}")]
    ChannelSend(String),

    #[error("message type error")]
    MessageType(#[from] TryFromPrimitiveError<crate::messages::MessageType>),

    #[error("notification error code")]
    ErrorCode(#[from] TryFromPrimitiveError<crate::messages::ErrorCode>),

    #[error("unsupported optional parameter code {0}")]
    UnsupportedOptionalParameterCode(u8),
}
