//! Typed event stream between the connection driver and the caller.
//!
//! Events are queued on an unbounded channel after the internal state
//! mutation completes, so no caller code ever runs synchronously with the
//! I/O task. Dropping the stream silently discards later events; destroying
//! the client closes the channel and nothing is emitted afterwards.

use tokio::sync::mpsc;

use crate::artifact::{ArtifactDocument, BtpsEnvelope};
use crate::client::retry::RetryInfo;
use crate::errors::BtpsError;

/// Everything a connection can tell its caller, in order of occurrence.
#[derive(Debug)]
pub enum BtpsEvent {
    /// TLS session established, connection is ready to send.
    Connected,
    /// A verified (and, where applicable, decrypted) inbound artifact.
    Message {
        envelope: BtpsEnvelope,
        document: ArtifactDocument,
    },
    /// An outbound artifact was fully written to the socket.
    MessageSent { id: String },
    Error {
        error: BtpsError,
        retry: RetryInfo,
    },
    /// The connection closed; `retry.will_retry` says whether the driver
    /// will dial again.
    End { retry: RetryInfo },
    /// The instance is fully torn down; no further events follow.
    Closed,
}

/// Receiving half handed to the caller by `connect`.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<BtpsEvent>,
}

impl EventStream {
    /// Next event, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<BtpsEvent> {
        self.rx.recv().await
    }
}

pub(crate) struct EventEmitter {
    tx: mpsc::UnboundedSender<BtpsEvent>,
}

impl EventEmitter {
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, EventStream { rx })
    }

    pub fn emit(&self, event: BtpsEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event dropped, subscriber went away");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::client::retry::RetryPolicy;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let (emitter, mut stream) = EventEmitter::channel();
        let retry = RetryPolicy::default().info(0, false, false, None);

        emitter.emit(BtpsEvent::Connected);
        emitter.emit(BtpsEvent::MessageSent { id: "artifact-1".into() });
        emitter.emit(BtpsEvent::End { retry });
        drop(emitter);

        assert!(matches!(stream.next().await, Some(BtpsEvent::Connected)));
        assert!(
            matches!(stream.next().await, Some(BtpsEvent::MessageSent { id }) if id == "artifact-1")
        );
        assert!(matches!(stream.next().await, Some(BtpsEvent::End { .. })));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn emitting_after_the_stream_is_gone_is_harmless() {
        let (emitter, stream) = EventEmitter::channel();
        drop(stream);
        emitter.emit(BtpsEvent::Connected);
    }
}
