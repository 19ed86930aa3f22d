// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Configuration of the local speaker, shared by all of its sessions.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RouterConfig {
    /// Local autonomous system number.
    pub asn: u32,

    /// Router id of the local speaker.
    pub id: Ipv4Addr,
}

/// Per-neighbor session configuration.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PeerConfig {
    /// Address of the neighbor.
    pub host: IpAddr,

    /// Hold time proposed in our open message, in seconds.
    pub hold_time: u16,

    /// Interval between keepalive messages, in seconds.
    pub keepalive: u64,

    /// How often blocking waits wake up to check for cancellation and
    /// due timers, in milliseconds.
    pub resolution: u64,
}
