// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::lock;
use crate::messages::Message;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Running totals for messages exchanged with a peer. Counters are
/// advisory: they are updated by whichever side of the session performs
/// the send or the successful parse, and readers must tolerate slightly
/// stale values.
#[derive(Default)]
pub struct MessageCounters {
    pub total_sent: AtomicU64,
    pub total_received: AtomicU64,
    pub opens_sent: AtomicU64,
    pub opens_received: AtomicU64,
    pub updates_sent: AtomicU64,
    pub updates_received: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_received: AtomicU64,
    pub keepalives_sent: AtomicU64,
    pub keepalives_received: AtomicU64,
    pub route_refreshes_sent: AtomicU64,
    pub route_refreshes_received: AtomicU64,

    update_recv_time: Mutex<Option<DateTime<Utc>>>,
}

impl MessageCounters {
    /// Account for one message written to the peer. Called by the side
    /// performing the send, once per serialized message.
    pub fn message_sent(&self, msg: &Message) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        match msg {
            Message::Open(_) => {
                self.opens_sent.fetch_add(1, Ordering::Relaxed);
            }
            Message::Update(_) => {
                self.updates_sent.fetch_add(1, Ordering::Relaxed);
            }
            Message::Notification(_) => {
                self.notifications_sent.fetch_add(1, Ordering::Relaxed);
            }
            Message::KeepAlive => {
                self.keepalives_sent.fetch_add(1, Ordering::Relaxed);
            }
            Message::RouteRefresh(_) => {
                self.route_refreshes_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Account for one message successfully parsed off the wire. Called by
    /// the receiving side, once per parsed message.
    pub fn message_received(&self, msg: &Message) {
        self.total_received.fetch_add(1, Ordering::Relaxed);
        match msg {
            Message::Open(_) => {
                self.opens_received.fetch_add(1, Ordering::Relaxed);
            }
            Message::Update(_) => {
                self.updates_received.fetch_add(1, Ordering::Relaxed);
                *lock!(self.update_recv_time) = Some(Utc::now());
            }
            Message::Notification(_) => {
                self.notifications_received.fetch_add(1, Ordering::Relaxed);
            }
            Message::KeepAlive => {
                self.keepalives_received.fetch_add(1, Ordering::Relaxed);
            }
            Message::RouteRefresh(_) => {
                self.route_refreshes_received.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// When the most recent update message arrived, if one ever has.
    pub fn update_recv_time(&self) -> Option<DateTime<Utc>> {
        *lock!(self.update_recv_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::UpdateMessage;

    #[test]
    fn per_type_accounting() {
        let c = MessageCounters::default();

        c.message_sent(&Message::KeepAlive);
        c.message_sent(&Message::KeepAlive);
        c.message_received(&Message::Update(UpdateMessage::default()));

        assert_eq!(c.total_sent.load(Ordering::Relaxed), 2);
        assert_eq!(c.keepalives_sent.load(Ordering::Relaxed), 2);
        assert_eq!(c.total_received.load(Ordering::Relaxed), 1);
        assert_eq!(c.updates_received.load(Ordering::Relaxed), 1);
        assert_eq!(c.updates_sent.load(Ordering::Relaxed), 0);
        assert!(c.update_recv_time().is_some());
    }
}
