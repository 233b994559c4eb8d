//! Pooled, reference-counted message buffers.
//!
//! Messages are shared between the message bus, the client's request queue,
//! and (briefly) reply callbacks. They are modelled as [`Rc`] handles over a
//! fixed pool of buffers: cloning a handle takes a reference, dropping it
//! releases one, and a pool slot becomes reusable once the pool's own
//! reference is the only one left.
//!
//! Everything here is single-threaded by construction (`Rc`, not `Arc`):
//! the client is driven from one scheduler context and never shares
//! messages across threads.

use std::cell::RefCell;
use std::rc::Rc;

use keel_wire::{checksum, Command, Header, HEADER_SIZE};

/// A shared handle to a pooled message.
pub type MessageHandle = Rc<RefCell<Message>>;

// ============================================================================
// Message
// ============================================================================

/// A protocol message: a header plus an optional body.
///
/// The body buffer is retained across pool reuse, so steady-state operation
/// allocates nothing.
#[derive(Debug, Clone)]
pub struct Message {
    /// The message header.
    pub header: Header,
    body: Vec<u8>,
}

impl Message {
    /// Creates an empty request message.
    #[must_use]
    pub fn new() -> Self {
        Self {
            header: Header::new(Command::Request),
            body: Vec::new(),
        }
    }

    /// Returns the message body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns the message body for writing.
    pub fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }

    /// Resets the message for reuse, keeping the body's capacity.
    pub fn reset(&mut self) {
        self.header = Header::new(Command::Request);
        self.body.clear();
    }

    /// Computes the body checksum and then the header checksum.
    ///
    /// Must be the last mutation before the message is sent: any later
    /// change to the header or body invalidates both checksums.
    pub fn finalize_checksums(&mut self) {
        debug_assert_eq!(
            self.header.size as usize,
            HEADER_SIZE + self.body.len(),
            "header size must cover the body"
        );
        self.header.checksum_body = checksum(&self.body);
        self.header.set_checksum();
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MessagePool
// ============================================================================

/// A fixed pool of message buffers.
///
/// The pool never grows: once all `messages_max` buffers are referenced
/// elsewhere, [`MessagePool::get`] returns `None` until a handle is dropped.
/// One buffer is conventionally reserved for receiving, which is why the
/// client's request queue is bounded at `messages_max - 1`.
#[derive(Debug)]
pub struct MessagePool {
    slots: Vec<MessageHandle>,
}

impl MessagePool {
    /// Creates a pool with `messages_max` buffers.
    ///
    /// # Panics
    ///
    /// Panics if `messages_max < 2`: the client needs at least one buffer
    /// for the inflight request and one reserved for receiving.
    #[must_use]
    pub fn new(messages_max: usize) -> Self {
        assert!(messages_max >= 2, "pool needs at least two messages");
        Self {
            slots: (0..messages_max)
                .map(|_| Rc::new(RefCell::new(Message::new())))
                .collect(),
        }
    }

    /// Returns the total number of buffers in the pool.
    #[must_use]
    pub fn messages_max(&self) -> usize {
        self.slots.len()
    }

    /// Returns the number of buffers not currently referenced elsewhere.
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| Rc::strong_count(slot) == 1)
            .count()
    }

    /// Acquires a message buffer, or `None` if the pool is exhausted.
    ///
    /// The returned message is reset.
    #[must_use]
    pub fn get(&self) -> Option<MessageHandle> {
        let slot = self
            .slots
            .iter()
            .find(|slot| Rc::strong_count(slot) == 1)?;
        slot.borrow_mut().reset();
        Some(Rc::clone(slot))
    }
}
