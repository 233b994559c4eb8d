//! The session client state machine.
//!
//! A [`Client`] registers a session with a replicated cluster and then
//! issues linearizable requests, one inflight at a time, each hash-chained
//! to the reply before it. The client tolerates leader failover, message
//! loss, duplication, and reordering:
//!
//! - Requests are retransmitted on timeout with multiplicative backoff,
//!   rotating past suspected-dead leaders.
//! - Retransmissions are byte-identical to the first send, so the cluster
//!   can deduplicate them; linearizability depends on this.
//! - Replies are filtered against the head of the request queue, dropping
//!   late duplicates.
//! - The `parent` hash chain makes any break in the request/reply sequence
//!   detectable from the headers alone.
//!
//! ## Request lifecycle
//!
//! ```text
//! Queued ──(becomes head)──► Sent ──(reply matches)──► Retired
//!                              │
//!                              └──(request timeout)──► Sent (next replica)
//! ```
//!
//! ## Session lifecycle
//!
//! ```text
//! Unregistered ──(first request or pong)──► Registering ──(reply 0)──► Registered
//! ```
//!
//! The client is single-threaded and tick-driven: all state mutation happens
//! from [`Client::tick`], [`Client::on_message`], and [`Client::request`],
//! all called from one scheduler context. No locks, no suspension points.

use std::collections::VecDeque;
use std::rc::Rc;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, warn};

use keel_wire::{Command, Header, Operation, HEADER_SIZE};

use crate::bus::MessageBus;
use crate::error::RequestError;
use crate::pool::MessageHandle;
use crate::timeout::Timeout;

// ============================================================================
// Constants
// ============================================================================

/// Wall-clock length of one tick, by convention.
pub const TICK_MS: u64 = 10;

/// Ping interval: 30 seconds of ticks.
const PING_TIMEOUT_TICKS: u64 = 30_000 / TICK_MS;

/// Estimated round-trip time in ticks (300 ms).
const RTT_TICKS: u64 = 300 / TICK_MS;

/// Initial request timeout as a multiple of the estimated round trip.
const RTT_MULTIPLE: u64 = 2;

// ============================================================================
// Callbacks and queue entries
// ============================================================================

/// Completion callback for an application request.
///
/// Invoked exactly once: with `Ok(body)` when the reply is accepted, or
/// synchronously with `Err` if the request could not be enqueued.
pub type RequestCallback = Box<dyn FnOnce(u128, Operation, Result<&[u8], RequestError>)>;

/// A queued request awaiting its reply.
///
/// Holds one reference to the message from enqueue until retirement. The
/// register request carries no callback; it is protocol-internal.
struct PendingRequest {
    user_data: u128,
    callback: Option<RequestCallback>,
    message: MessageHandle,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("user_data", &self.user_data)
            .field("request", &self.message.borrow().header.request)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Client
// ============================================================================

/// A session client for a replicated cluster.
pub struct Client<B: MessageBus> {
    /// Ephemeral client id, nonzero, drawn from the OS CSPRNG.
    id: u128,
    cluster: u32,
    replica_count: u8,
    ticks: u64,
    /// Hash-chain link: alternates between the checksum of the last sent
    /// request and the checksum of the last accepted reply.
    parent: u128,
    /// Session number; zero until registration completes, then immutable.
    session: u64,
    /// Monotonic request number; 0 is the register request.
    request_number: u32,
    /// Highest view observed; presumed leader is `view % replica_count`.
    view: u32,
    bus: B,
    request_queue: VecDeque<PendingRequest>,
    request_queue_max: usize,
    request_timeout: Timeout,
    ping_timeout: Timeout,
    /// Jitter source for retransmission backoff, seeded from the client id
    /// so simulations replay deterministically.
    prng: SmallRng,
}

impl<B: MessageBus> Client<B> {
    /// Creates a client with a random id.
    ///
    /// # Panics
    ///
    /// Panics if `replica_count` is zero or the OS CSPRNG fails.
    #[must_use]
    pub fn new(cluster: u32, replica_count: u8, bus: B) -> Self {
        let mut id = 0u128;
        while id == 0 {
            let mut bytes = [0u8; 16];
            getrandom::getrandom(&mut bytes).expect("CSPRNG failure is catastrophic");
            id = u128::from_le_bytes(bytes);
        }
        Self::with_id(id, cluster, replica_count, bus)
    }

    /// Creates a client with a caller-chosen id, for deterministic tests.
    ///
    /// # Panics
    ///
    /// Panics if `id` or `replica_count` is zero.
    #[must_use]
    pub fn with_id(id: u128, cluster: u32, replica_count: u8, bus: B) -> Self {
        assert!(id > 0, "client id must be nonzero");
        assert!(replica_count > 0, "cluster must have at least one replica");
        assert!(
            bus.messages_max() >= 2,
            "bus needs an inflight message and one reserved for receiving"
        );

        let request_queue_max = bus.messages_max() - 1;
        let mut ping_timeout = Timeout::new("ping_timeout", PING_TIMEOUT_TICKS);
        ping_timeout.start();

        Self {
            id,
            cluster,
            replica_count,
            ticks: 0,
            parent: 0,
            session: 0,
            request_number: 0,
            view: 0,
            bus,
            request_queue: VecDeque::with_capacity(request_queue_max),
            request_queue_max,
            request_timeout: Timeout::new("request_timeout", RTT_TICKS * RTT_MULTIPLE),
            ping_timeout,
            prng: SmallRng::seed_from_u64(id as u64),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Returns the client id.
    #[must_use]
    pub fn id(&self) -> u128 {
        self.id
    }

    /// Returns the cluster id.
    #[must_use]
    pub fn cluster(&self) -> u32 {
        self.cluster
    }

    /// Returns the session number (zero until registered).
    #[must_use]
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Returns the next request number to be assigned.
    #[must_use]
    pub fn request_number(&self) -> u32 {
        self.request_number
    }

    /// Returns the highest view observed.
    #[must_use]
    pub fn view(&self) -> u32 {
        self.view
    }

    /// Returns the current hash-chain link.
    #[must_use]
    pub fn parent(&self) -> u128 {
        self.parent
    }

    /// Returns the tick count.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Returns the number of queued (including inflight) requests.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.request_queue.len()
    }

    /// Returns the bus.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Returns the bus for mutation (test inspection, draining).
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Acquires a message buffer from the bus.
    #[must_use]
    pub fn get_message(&mut self) -> Option<MessageHandle> {
        self.bus.get_message()
    }

    // ------------------------------------------------------------------
    // Tick driver
    // ------------------------------------------------------------------

    /// Advances the client by one tick, firing any elapsed timeouts.
    pub fn tick(&mut self) {
        self.ticks += 1;

        self.ping_timeout.tick();
        self.request_timeout.tick();

        if self.ping_timeout.fired() {
            self.on_ping_timeout();
        }
        if self.request_timeout.fired() {
            self.on_request_timeout();
        }

        self.bus.tick();
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Enqueues an application request.
    ///
    /// The message must have been acquired from this client's bus, with the
    /// body (of `body_size` bytes) already written. Header routing fields
    /// are populated here; the hash-chain fields (`parent`, `context`,
    /// `view`) and checksums are deliberately left unset until the request
    /// first becomes the queue head and is sent.
    ///
    /// If the queue is full, `callback` is invoked synchronously with
    /// [`RequestError::TooManyOutstandingRequests`] and nothing is enqueued
    /// (and no request number is consumed).
    ///
    /// # Panics
    ///
    /// Panics if `operation` is the reserved register operation, or if
    /// `body_size` disagrees with the message body.
    pub fn request(
        &mut self,
        user_data: u128,
        callback: RequestCallback,
        operation: Operation,
        message: MessageHandle,
        body_size: usize,
    ) {
        assert!(
            !operation.is_register(),
            "register is internal to the client"
        );

        self.register();

        if self.request_queue.len() >= self.request_queue_max {
            debug!(
                user_data,
                operation = %operation,
                "request queue full, rejecting request"
            );
            callback(
                user_data,
                operation,
                Err(RequestError::TooManyOutstandingRequests),
            );
            return;
        }

        {
            let mut message = message.borrow_mut();
            assert_eq!(message.body().len(), body_size, "body size mismatch");

            let header = &mut message.header;
            header.client = self.id;
            header.request = self.request_number;
            header.cluster = self.cluster;
            header.command = Command::Request;
            header.operation = operation;
            header.size = (HEADER_SIZE + body_size) as u32;
        }

        self.request_number += 1;

        let was_empty = self.request_queue.is_empty();
        self.request_queue.push_back(PendingRequest {
            user_data,
            callback: Some(callback),
            message: Rc::clone(&message),
        });

        if was_empty {
            self.send_request_for_the_first_time();
        }
    }

    /// Registers a session if registration has not yet been attempted.
    ///
    /// Registration occupies request number 0 and is retried like any other
    /// request; the session number arrives in the reply's `commit` field.
    ///
    /// # Panics
    ///
    /// Panics if no message buffer is available: registration is mandatory
    /// and without it no request can ever complete.
    pub fn register(&mut self) {
        if self.request_number > 0 {
            return;
        }

        let message = self
            .bus
            .get_message()
            .expect("registration requires a message buffer");

        {
            let mut message = message.borrow_mut();
            let header = &mut message.header;
            header.client = self.id;
            header.request = 0;
            header.cluster = self.cluster;
            header.command = Command::Request;
            header.operation = Operation::REGISTER;
            header.size = HEADER_SIZE as u32;
        }

        self.request_number += 1;

        assert!(
            self.request_queue.is_empty(),
            "register must be the first request"
        );
        self.request_queue.push_back(PendingRequest {
            user_data: 0,
            callback: None,
            message,
        });

        debug!(client = %self.id, "registering a session");
        self.send_request_for_the_first_time();
    }

    /// Sends the queue head for the first time.
    ///
    /// Invoked exactly once per request, the moment it becomes the head.
    /// This is where the hash chain advances: the header absorbs `parent`,
    /// `context`, and `view`, the checksums are computed, and the request's
    /// checksum becomes the expected `parent` of the next reply.
    fn send_request_for_the_first_time(&mut self) {
        let head = self
            .request_queue
            .front()
            .expect("no request to send");
        let message = Rc::clone(&head.message);

        {
            let mut message = message.borrow_mut();
            debug_assert_eq!(message.header.command, Command::Request);
            debug_assert_eq!(message.header.client, self.id);
            debug_assert_eq!(message.header.checksum, 0, "request already sent");

            message.header.parent = self.parent;
            message.header.context = self.session;
            message.header.view = self.view;
            message.finalize_checksums();

            // The next reply must chain to this request.
            self.parent = message.header.checksum;
        }

        self.request_timeout.start();

        let replica = self.replica_for_view(0);
        debug!(
            replica,
            request = message.borrow().header.request,
            operation = %message.borrow().header.operation,
            "sending request for the first time"
        );
        self.bus.send_message_to_replica(replica, &message);
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handles an inbound message from the cluster.
    ///
    /// Malformed messages and messages for other clusters are logged and
    /// dropped; the network is not trusted. Invariant violations in
    /// messages that pass validation are fatal.
    pub fn on_message(&mut self, message: &MessageHandle) {
        let header = {
            let message = message.borrow();
            let header = message.header;

            if let Err(error) = header.validate() {
                warn!(%error, "dropping malformed message");
                return;
            }
            if !header.valid_checksum() {
                warn!(command = %header.command, "dropping message with invalid header checksum");
                return;
            }
            if message.body().len() != header.body_size() {
                warn!(command = %header.command, "dropping message with truncated body");
                return;
            }
            if !header.valid_checksum_body(message.body()) {
                warn!(command = %header.command, "dropping message with invalid body checksum");
                return;
            }
            header
        };

        if header.cluster != self.cluster {
            warn!(
                cluster = header.cluster,
                "dropping message from wrong cluster"
            );
            return;
        }

        match header.command {
            Command::Pong => self.on_pong(&header),
            Command::Reply => self.on_reply(message),
            other => {
                warn!(command = %other, "ignoring unexpected command");
            }
        }
    }

    /// Handles a pong: adopt a newer view and seize the chance to register.
    fn on_pong(&mut self, pong: &Header) {
        if pong.client != 0 {
            debug!("ignoring pong targeted at a client");
            return;
        }

        if pong.view > self.view {
            debug!(view = pong.view, "adopting newer view from pong");
            self.view = pong.view;
        }

        self.register();
    }

    /// Handles a reply: retire the inflight request and advance the chain.
    fn on_reply(&mut self, message: &MessageHandle) {
        let message = message.borrow();
        let reply = message.header;

        // on_message already validated these; a mismatch here means
        // corruption between validation and dispatch.
        assert!(reply.valid_checksum());
        assert!(reply.valid_checksum_body(message.body()));

        if reply.client != self.id {
            debug!(client = %reply.client, "dropping reply for another client");
            return;
        }

        let Some(head) = self.request_queue.front() else {
            debug!(request = reply.request, "dropping reply with no inflight request");
            return;
        };
        let inflight_header = head.message.borrow().header;

        if reply.request < inflight_header.request {
            debug!(request = reply.request, "dropping late duplicate reply");
            return;
        }

        let PendingRequest {
            user_data,
            callback,
            message: inflight_message,
        } = self
            .request_queue
            .pop_front()
            .expect("head checked above");

        // The linearizability chain: the reply must descend from the
        // request we actually sent. Any mismatch is a protocol break.
        assert_eq!(reply.parent, self.parent, "reply breaks the hash chain");
        assert_eq!(reply.cluster, self.cluster);
        assert_eq!(reply.request, inflight_header.request);
        assert_eq!(reply.operation, inflight_header.operation);
        assert_eq!(reply.op, reply.commit);
        assert_eq!(reply.context, 0);

        // The next request must chain to this reply.
        self.parent = reply.checksum;

        if reply.view > self.view {
            debug!(view = reply.view, "adopting newer view from reply");
            self.view = reply.view;
        }

        self.request_timeout.stop();

        if inflight_header.operation.is_register() {
            assert!(reply.commit > 0, "session number must be nonzero");
            assert_eq!(self.session, 0, "session is immutable once set");
            debug_assert!(callback.is_none());
            self.session = reply.commit;
            debug!(session = reply.commit, "session registered");
        } else {
            let callback = callback.expect("application request without callback");
            callback(user_data, reply.operation, Ok(message.body()));
        }

        // Retirement: the queue's reference is released here, after the
        // callback has returned.
        drop(inflight_message);

        if !self.request_queue.is_empty() {
            self.send_request_for_the_first_time();
        }
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    /// Broadcasts a ping to every replica.
    ///
    /// Pongs carry the cluster's view, which is how an idle client learns
    /// about leader changes before it has anything to send.
    fn on_ping_timeout(&mut self) {
        self.ping_timeout.reset();

        let mut ping = Header::new(Command::Ping);
        ping.client = self.id;
        ping.cluster = self.cluster;
        ping.set_checksum_body(&[]);
        ping.set_checksum();

        for replica in 0..self.replica_count {
            self.bus.send_header_to_replica(replica, ping);
        }
    }

    /// Retransmits the inflight request to the next candidate leader.
    ///
    /// The message is resent exactly as first sent (same checksum): the
    /// cluster relies on identical retransmissions to deduplicate.
    fn on_request_timeout(&mut self) {
        self.request_timeout.backoff(&mut self.prng);

        let head = self
            .request_queue
            .front()
            .expect("request timeout fired without an inflight request");
        let message = Rc::clone(&head.message);

        // Rotate past the presumed-dead leader: each attempt targets the
        // next replica after the view's leader.
        let replica = self.replica_for_view(u32::from(self.request_timeout.attempts()));
        debug!(
            replica,
            request = message.borrow().header.request,
            attempts = self.request_timeout.attempts(),
            "request timed out, retransmitting"
        );
        self.bus.send_message_to_replica(replica, &message);
    }

    /// Returns the replica `offset` places after the view's leader.
    fn replica_for_view(&self, offset: u32) -> u8 {
        let count = u32::from(self.replica_count);
        ((self.view.wrapping_add(offset)) % count) as u8
    }
}

impl<B: MessageBus> std::fmt::Debug for Client<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &format_args!("{:x}", self.id))
            .field("cluster", &self.cluster)
            .field("session", &self.session)
            .field("request_number", &self.request_number)
            .field("view", &self.view)
            .field("pending", &self.request_queue.len())
            .finish_non_exhaustive()
    }
}
