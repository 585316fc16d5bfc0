// SPDX-License-Identifier: AGPL-3.0
// CryptPort Core - Outbound event channel

use crate::types::SessionEvent;
use async_channel::{Receiver, Sender};

/// Cloneable handle used by every component to publish events.
///
/// The channel is unbounded so a slow frontend never stalls a transfer.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<SessionEvent>,
}

impl EventSink {
    /// Create a sink and the receiver frontends read from
    pub fn channel() -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: SessionEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::debug!("Event dropped, no receivers left");
        }
    }
}
