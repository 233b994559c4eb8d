//! Message bus abstraction for client-to-cluster delivery.
//!
//! The bus is an external collaborator: it allocates message buffers and
//! delivers them to replicas on a fire-and-forget basis. Messages may be
//! lost, reordered, or duplicated in transit; the session protocol handles
//! all reliability concerns through retransmission and the hash chain.
//!
//! Inbound delivery is inverted: the embedder reads from its transport and
//! calls [`Client::on_message`](crate::Client::on_message) for each message
//! received.

use keel_wire::Header;

use crate::pool::{MessageHandle, MessagePool};

// ============================================================================
// MessageBus Trait
// ============================================================================

/// Abstraction over message allocation and outbound delivery.
///
/// All sends are fire-and-forget: no delivery guarantee, no error surface.
pub trait MessageBus {
    /// Returns the total number of message buffers the bus can hold.
    ///
    /// The client reserves one for receiving, so its request queue holds at
    /// most `messages_max() - 1` requests.
    fn messages_max(&self) -> usize;

    /// Acquires a message buffer, or `None` if none are free.
    fn get_message(&mut self) -> Option<MessageHandle>;

    /// Sends a bare header (a body-less message) to one replica.
    fn send_header_to_replica(&mut self, replica: u8, header: Header);

    /// Sends a full message to one replica.
    fn send_message_to_replica(&mut self, replica: u8, message: &MessageHandle);

    /// Advances bus internals by one tick.
    fn tick(&mut self);
}

// ============================================================================
// RecordingBus (for testing)
// ============================================================================

/// A send recorded by [`RecordingBus`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// The replica the message was addressed to.
    pub replica: u8,
    /// Snapshot of the header at send time.
    pub header: Header,
    /// Snapshot of the body at send time.
    pub body: Vec<u8>,
    /// True if this was a header-only send.
    pub header_only: bool,
}

/// A pool-backed bus that records every send for inspection.
///
/// Snapshots are taken at send time, so later mutation of a pooled message
/// (e.g. by reuse) does not disturb recorded history.
#[derive(Debug)]
pub struct RecordingBus {
    pool: MessagePool,
    sent: Vec<SentMessage>,
    ticks: u64,
}

impl RecordingBus {
    /// Creates a recording bus with a pool of `messages_max` buffers.
    #[must_use]
    pub fn new(messages_max: usize) -> Self {
        Self {
            pool: MessagePool::new(messages_max),
            sent: Vec::new(),
            ticks: 0,
        }
    }

    /// Returns all recorded sends in order.
    #[must_use]
    pub fn sent(&self) -> &[SentMessage] {
        &self.sent
    }

    /// Removes and returns all recorded sends.
    pub fn drain(&mut self) -> Vec<SentMessage> {
        std::mem::take(&mut self.sent)
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }

    /// Returns the number of ticks the bus has seen.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl MessageBus for RecordingBus {
    fn messages_max(&self) -> usize {
        self.pool.messages_max()
    }

    fn get_message(&mut self) -> Option<MessageHandle> {
        self.pool.get()
    }

    fn send_header_to_replica(&mut self, replica: u8, header: Header) {
        self.sent.push(SentMessage {
            replica,
            header,
            body: Vec::new(),
            header_only: true,
        });
    }

    fn send_message_to_replica(&mut self, replica: u8, message: &MessageHandle) {
        let message = message.borrow();
        self.sent.push(SentMessage {
            replica,
            header: message.header,
            body: message.body().to_vec(),
            header_only: false,
        });
    }

    fn tick(&mut self) {
        self.ticks += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_wire::Command;

    #[test]
    fn recording_bus_snapshots_sends() {
        let mut bus = RecordingBus::new(4);

        let message = bus.get_message().unwrap();
        message.borrow_mut().body_mut().extend_from_slice(b"abc");
        bus.send_message_to_replica(2, &message);

        // Mutating the pooled message afterwards must not rewrite history.
        message.borrow_mut().body_mut().clear();

        let sent = bus.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].replica, 2);
        assert_eq!(sent[0].body, b"abc");
        assert!(!sent[0].header_only);
    }

    #[test]
    fn recording_bus_records_header_sends() {
        let mut bus = RecordingBus::new(4);
        bus.send_header_to_replica(0, Header::new(Command::Ping));

        assert_eq!(bus.sent().len(), 1);
        assert!(bus.sent()[0].header_only);
        assert_eq!(bus.sent()[0].header.command, Command::Ping);
    }

    #[test]
    fn ticks_accumulate() {
        let mut bus = RecordingBus::new(4);
        bus.tick();
        bus.tick();
        assert_eq!(bus.ticks(), 2);
    }
}
