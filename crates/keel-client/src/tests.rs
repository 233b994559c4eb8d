//! End-to-end scenario tests for the session client.
//!
//! These drive a [`Client`] over a [`RecordingBus`] and assert on the exact
//! sequence of sends and state transitions: registration, the hash chain,
//! timeout rotation, duplicate filtering, and view adoption.

use std::cell::RefCell;
use std::rc::Rc;

use keel_wire::{Command, Header, Operation, HEADER_SIZE};

use crate::bus::{RecordingBus, SentMessage};
use crate::client::{Client, RequestCallback};
use crate::error::RequestError;
use crate::pool::{Message, MessageHandle};

const CLUSTER: u32 = 1;
const REPLICAS: u8 = 3;
const CLIENT_ID: u128 = 0xC11E_17;

fn test_client(messages_max: usize) -> Client<RecordingBus> {
    Client::with_id(CLIENT_ID, CLUSTER, REPLICAS, RecordingBus::new(messages_max))
}

fn handle_from(header: Header, body: &[u8]) -> MessageHandle {
    let mut message = Message::new();
    message.header = header;
    message.body_mut().extend_from_slice(body);
    Rc::new(RefCell::new(message))
}

/// Builds a well-formed reply to a recorded request, chained to its checksum.
fn reply_to(request: &SentMessage, commit: u64, view: u32, body: &[u8]) -> MessageHandle {
    let mut header = Header::new(Command::Reply);
    header.client = request.header.client;
    header.cluster = request.header.cluster;
    header.request = request.header.request;
    header.operation = request.header.operation;
    header.parent = request.header.checksum;
    header.op = commit;
    header.commit = commit;
    header.view = view;
    header.size = (HEADER_SIZE + body.len()) as u32;
    header.set_checksum_body(body);
    header.set_checksum();
    handle_from(header, body)
}

fn pong(view: u32) -> MessageHandle {
    let mut header = Header::new(Command::Pong);
    header.cluster = CLUSTER;
    header.view = view;
    header.set_checksum_body(&[]);
    header.set_checksum();
    handle_from(header, &[])
}

type Completions = Rc<RefCell<Vec<(u128, Operation, Result<Vec<u8>, RequestError>)>>>;

fn recording_callback(completions: &Completions) -> RequestCallback {
    let completions = Rc::clone(completions);
    Box::new(move |user_data, operation, result| {
        completions
            .borrow_mut()
            .push((user_data, operation, result.map(<[u8]>::to_vec)));
    })
}

fn issue(
    client: &mut Client<RecordingBus>,
    user_data: u128,
    operation: u8,
    body: &[u8],
    completions: &Completions,
) {
    let message = client.get_message().expect("pool exhausted");
    message.borrow_mut().body_mut().extend_from_slice(body);
    client.request(
        user_data,
        recording_callback(completions),
        Operation::new(operation),
        message,
        body.len(),
    );
}

/// Recorded sends with command Request (ignores pings).
fn request_sends(client: &Client<RecordingBus>) -> Vec<SentMessage> {
    client
        .bus()
        .sent()
        .iter()
        .filter(|sent| sent.header.command == Command::Request)
        .cloned()
        .collect()
}

// ============================================================================
// Registration and the hash chain (S1)
// ============================================================================

#[test]
fn register_then_request() {
    let mut client = test_client(8);
    let completions = Completions::default();

    issue(&mut client, 10, 5, b"payload", &completions);

    // Only the register went out; the user request waits behind it.
    let sent = request_sends(&client);
    assert_eq!(sent.len(), 1);
    let register = sent[0].clone();
    assert_eq!(register.replica, 0);
    assert_eq!(register.header.request, 0);
    assert_eq!(register.header.parent, 0);
    assert_eq!(register.header.context, 0);
    assert_eq!(register.header.client, CLIENT_ID);
    assert!(register.header.operation.is_register());
    assert!(register.header.valid_checksum());

    // Register is request 0, the user request is 1.
    assert_eq!(client.request_number(), 2);
    assert_eq!(client.pending_requests(), 2);
    assert_eq!(client.session(), 0);

    // Accept the register reply: the session is established, no user
    // callback fires, and the user request goes out chained to the reply.
    let register_reply = reply_to(&register, 99, 0, &[]);
    let register_reply_checksum = register_reply.borrow().header.checksum;
    client.on_message(&register_reply);

    assert_eq!(client.session(), 99);
    assert!(completions.borrow().is_empty());

    let sent = request_sends(&client);
    assert_eq!(sent.len(), 2);
    let first = sent[1].clone();
    assert_eq!(first.replica, 0);
    assert_eq!(first.header.request, 1);
    assert_eq!(first.header.operation, Operation::new(5));
    assert_eq!(first.header.context, 99);
    assert_eq!(first.header.parent, register_reply_checksum);
    assert_eq!(first.body, b"payload");
    assert!(first.header.valid_checksum());
    assert!(first.header.valid_checksum_body(&first.body));

    // Accept the reply: the callback fires with the body, and the chain
    // advances to the reply's checksum.
    let reply = reply_to(&first, 7, 0, b"result");
    let reply_checksum = reply.borrow().header.checksum;
    client.on_message(&reply);

    let completions = completions.borrow();
    assert_eq!(completions.len(), 1);
    let (user_data, operation, result) = &completions[0];
    assert_eq!(*user_data, 10);
    assert_eq!(*operation, Operation::new(5));
    assert_eq!(result.as_deref(), Ok(&b"result"[..]));

    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.parent(), reply_checksum);

    // All pooled messages were released on retirement.
    assert_eq!(client.bus().pool().available(), 8);
}

#[test]
fn session_is_immutable_after_registration() {
    let mut client = test_client(8);
    let completions = Completions::default();

    issue(&mut client, 1, 5, b"", &completions);
    let register = request_sends(&client)[0].clone();
    client.on_message(&reply_to(&register, 42, 0, &[]));
    assert_eq!(client.session(), 42);

    // A second request/reply cycle leaves the session untouched.
    let first = request_sends(&client)[1].clone();
    client.on_message(&reply_to(&first, 3, 0, b"ok"));
    assert_eq!(client.session(), 42);

    issue(&mut client, 2, 6, b"", &completions);
    let second = request_sends(&client)[2].clone();
    assert_eq!(second.header.context, 42);
    client.on_message(&reply_to(&second, 4, 0, b"ok"));
    assert_eq!(client.session(), 42);
}

// ============================================================================
// Timeout rotation and idempotent retransmission (S2)
// ============================================================================

#[test]
fn timeout_rotates_to_next_replica_with_identical_checksum() {
    let mut client = test_client(8);
    let completions = Completions::default();

    issue(&mut client, 1, 5, b"body", &completions);
    let register = request_sends(&client)[0].clone();
    client.on_message(&reply_to(&register, 99, 0, &[]));

    let first = request_sends(&client)[1].clone();
    assert_eq!(first.replica, 0);

    // Replica 0 stays silent; the request timeout fires after its base
    // interval and the client retries the next replica.
    while request_sends(&client).len() < 3 {
        client.tick();
    }
    let resend = request_sends(&client)[2].clone();
    assert_eq!(resend.replica, 1);
    assert_eq!(resend.header.checksum, first.header.checksum);
    assert_eq!(resend.body, first.body);

    // A second timeout rotates one replica further.
    while request_sends(&client).len() < 4 {
        client.tick();
    }
    let resend = request_sends(&client)[3].clone();
    assert_eq!(resend.replica, 2);
    assert_eq!(resend.header.checksum, first.header.checksum);
}

// ============================================================================
// Duplicate filtering (S3)
// ============================================================================

#[test]
fn late_duplicate_reply_is_dropped() {
    let mut client = test_client(8);
    let completions = Completions::default();

    issue(&mut client, 1, 5, b"a", &completions);
    let register = request_sends(&client)[0].clone();
    client.on_message(&reply_to(&register, 99, 0, &[]));

    // Queue a second request behind the first.
    issue(&mut client, 2, 6, b"b", &completions);
    assert_eq!(client.pending_requests(), 2);

    // Retire the first request; the second goes out.
    let first = request_sends(&client)[1].clone();
    client.on_message(&reply_to(&first, 3, 0, b"r1"));
    assert_eq!(completions.borrow().len(), 1);
    assert_eq!(client.pending_requests(), 1);
    let sends_before = request_sends(&client).len();
    let parent_before = client.parent();

    // A stale duplicate of the first reply arrives: dropped silently.
    client.on_message(&reply_to(&first, 3, 0, b"r1"));

    assert_eq!(client.parent(), parent_before);
    assert_eq!(client.pending_requests(), 1);
    assert_eq!(completions.borrow().len(), 1);
    assert_eq!(request_sends(&client).len(), sends_before);
}

#[test]
fn reply_with_no_inflight_request_is_dropped() {
    let mut client = test_client(8);
    let completions = Completions::default();

    issue(&mut client, 1, 5, b"", &completions);
    let register = request_sends(&client)[0].clone();
    client.on_message(&reply_to(&register, 99, 0, &[]));
    let first = request_sends(&client)[1].clone();
    client.on_message(&reply_to(&first, 3, 0, b"ok"));
    assert_eq!(client.pending_requests(), 0);

    // The queue is empty now; a replayed reply is ignored.
    let parent_before = client.parent();
    client.on_message(&reply_to(&first, 3, 0, b"ok"));
    assert_eq!(client.parent(), parent_before);
    assert_eq!(completions.borrow().len(), 1);
}

// ============================================================================
// View adoption (S4)
// ============================================================================

#[test]
fn pong_adopts_view_and_triggers_registration() {
    let mut client = test_client(8);

    client.on_message(&pong(7));

    assert_eq!(client.view(), 7);

    // Registration was sent to the presumed leader of view 7.
    let sent = request_sends(&client);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].header.operation.is_register());
    assert_eq!(sent[0].replica, (7 % u32::from(REPLICAS)) as u8);
    assert_eq!(sent[0].header.view, 7);
}

#[test]
fn pong_with_older_view_is_not_adopted() {
    let mut client = test_client(8);

    client.on_message(&pong(7));
    assert_eq!(client.view(), 7);

    client.on_message(&pong(3));
    assert_eq!(client.view(), 7);
}

#[test]
fn client_targeted_pong_is_ignored() {
    let mut client = test_client(8);

    let mut header = Header::new(Command::Pong);
    header.cluster = CLUSTER;
    header.client = CLIENT_ID;
    header.view = 9;
    header.set_checksum_body(&[]);
    header.set_checksum();
    client.on_message(&handle_from(header, &[]));

    assert_eq!(client.view(), 0);
    assert!(request_sends(&client).is_empty());
}

// ============================================================================
// Queue bound
// ============================================================================

#[test]
fn queue_full_rejects_synchronously_without_a_request_number() {
    // messages_max 3 → queue capacity 2: register plus one user request.
    let mut client = test_client(3);
    let completions = Completions::default();

    issue(&mut client, 1, 5, b"", &completions);
    assert_eq!(client.pending_requests(), 2);
    assert_eq!(client.request_number(), 2);
    assert!(completions.borrow().is_empty());

    issue(&mut client, 2, 6, b"", &completions);

    let completions = completions.borrow();
    assert_eq!(completions.len(), 1);
    let (user_data, operation, result) = &completions[0];
    assert_eq!(*user_data, 2);
    assert_eq!(*operation, Operation::new(6));
    assert_eq!(*result, Err(RequestError::TooManyOutstandingRequests));

    // Nothing was enqueued and no request number was consumed.
    assert_eq!(client.pending_requests(), 2);
    assert_eq!(client.request_number(), 2);
}

// ============================================================================
// Pings
// ============================================================================

#[test]
fn ping_timeout_broadcasts_to_all_replicas() {
    let mut client = test_client(4);

    // 30 seconds of ticks.
    for _ in 0..3000 {
        client.tick();
    }

    let pings: Vec<_> = client
        .bus()
        .sent()
        .iter()
        .filter(|sent| sent.header.command == Command::Ping)
        .cloned()
        .collect();
    assert_eq!(pings.len(), REPLICAS as usize);
    for (replica, ping) in pings.iter().enumerate() {
        assert_eq!(ping.replica, replica as u8);
        assert!(ping.header_only);
        assert_eq!(ping.header.client, CLIENT_ID);
        assert_eq!(ping.header.cluster, CLUSTER);
        assert!(ping.header.valid_checksum());
    }

    // The ping timer resets: another interval, another broadcast.
    for _ in 0..3000 {
        client.tick();
    }
    let ping_count = client
        .bus()
        .sent()
        .iter()
        .filter(|sent| sent.header.command == Command::Ping)
        .count();
    assert_eq!(ping_count, 2 * REPLICAS as usize);
}

// ============================================================================
// Dropped inbound messages
// ============================================================================

#[test]
fn wrong_cluster_is_dropped() {
    let mut client = test_client(8);

    let mut header = Header::new(Command::Pong);
    header.cluster = CLUSTER + 1;
    header.view = 9;
    header.set_checksum_body(&[]);
    header.set_checksum();
    client.on_message(&handle_from(header, &[]));

    assert_eq!(client.view(), 0);
    assert!(request_sends(&client).is_empty());
}

#[test]
fn corrupt_checksum_is_dropped() {
    let mut client = test_client(8);

    let mut header = Header::new(Command::Pong);
    header.cluster = CLUSTER;
    header.view = 9;
    header.set_checksum_body(&[]);
    header.set_checksum();
    // Flip a field after checksumming.
    header.view = 10;
    client.on_message(&handle_from(header, &[]));

    assert_eq!(client.view(), 0);
}

#[test]
fn corrupt_body_is_dropped() {
    let mut client = test_client(8);
    let completions = Completions::default();

    issue(&mut client, 1, 5, b"", &completions);
    let register = request_sends(&client)[0].clone();

    let reply = reply_to(&register, 99, 0, b"body");
    reply.borrow_mut().body_mut()[0] ^= 0xff;
    client.on_message(&reply);

    assert_eq!(client.session(), 0);
    assert_eq!(client.pending_requests(), 1);
}

#[test]
fn reply_for_another_client_is_dropped() {
    let mut client = test_client(8);
    let completions = Completions::default();

    issue(&mut client, 1, 5, b"", &completions);
    let register = request_sends(&client)[0].clone();

    let reply = reply_to(&register, 99, 0, &[]);
    {
        let mut message = reply.borrow_mut();
        message.header.client = CLIENT_ID + 1;
        message.header.set_checksum();
    }
    client.on_message(&reply);

    assert_eq!(client.session(), 0);
    assert_eq!(client.pending_requests(), 1);
}

#[test]
fn replica_commands_are_ignored() {
    let mut client = test_client(8);

    let mut header = Header::new(Command::Prepare);
    header.cluster = CLUSTER;
    header.set_checksum_body(&[]);
    header.set_checksum();
    client.on_message(&handle_from(header, &[]));

    assert!(request_sends(&client).is_empty());
    assert_eq!(client.pending_requests(), 0);
}
