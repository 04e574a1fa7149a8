// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate reply cookies, orphan replies, and deadline synthetics.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use waggle_bus::{
    AttachMask, BusError, BusSpec, Clock, ConnectionHandle, ControlHandle, EndpointRef,
    ProcessContext, Subsystem,
};
use waggle_wire::{MessageBuilder, Record};

const POOL: u64 = 16 * 1024;

/// Manually advanced clock so deadline tests never sleep.
struct MockClock {
    epoch: Instant,
    offset: Mutex<Duration>,
}

impl MockClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        })
    }

    fn advance(&self, by: Duration) {
        *self.offset.lock().expect("mock clock lock") += by;
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.epoch + *self.offset.lock().expect("mock clock lock")
    }

    fn monotonic_ns(&self) -> u64 {
        self.offset.lock().expect("mock clock lock").as_nanos() as u64
    }

    fn realtime_ns(&self) -> u64 {
        self.monotonic_ns()
    }
}

fn setup_with_clock(clock: Arc<MockClock>) -> (Subsystem, ControlHandle, EndpointRef) {
    let subsystem = Subsystem::with_clock(clock);
    let mut control = subsystem.open_control().expect("control");
    let bus = control.make_bus(BusSpec::new("replies")).expect("make bus");
    let endpoint = bus.default_endpoint().expect("endpoint");
    (subsystem, control, endpoint)
}

fn open_active(endpoint: &EndpointRef) -> ConnectionHandle {
    let conn = endpoint.open(ProcessContext::root()).expect("open");
    conn.hello(POOL, AttachMask::NONE).expect("hello");
    conn
}

#[test]
fn reply_round_trip_consumes_the_waiter() {
    let clock = MockClock::new();
    let (_subsystem, _control, endpoint) = setup_with_clock(clock);
    let caller = open_active(&endpoint);
    let callee = open_active(&endpoint);

    let request = MessageBuilder::unicast(callee.id())
        .cookie(11)
        .expect_reply(1_000_000_000)
        .inline(b"request")
        .encode()
        .expect("encode");
    caller.send(&request).expect("send request");

    let inbound = callee.recv().expect("recv request");
    callee.free(inbound.offset).expect("free");
    let reply = MessageBuilder::unicast(inbound.src_id)
        .cookie(99)
        .reply_to(inbound.cookie)
        .inline(b"response")
        .encode()
        .expect("encode");
    callee.send(&reply).expect("send reply");

    let outcome = caller.recv().expect("recv reply");
    assert_eq!(outcome.src_id, callee.id());
    caller.free(outcome.offset).expect("free");

    // The waiter is spent: a second identical reply is an orphan.
    assert!(matches!(
        callee.send(&reply),
        Err(BusError::ReplyOrphan { cookie: 11 })
    ));
}

#[test]
fn unsolicited_reply_is_an_orphan() {
    let clock = MockClock::new();
    let (_subsystem, _control, endpoint) = setup_with_clock(clock);
    let a = open_active(&endpoint);
    let b = open_active(&endpoint);

    let reply = MessageBuilder::unicast(b.id())
        .reply_to(1234)
        .inline(b"nobody asked")
        .encode()
        .expect("encode");
    assert!(matches!(
        a.send(&reply),
        Err(BusError::ReplyOrphan { cookie: 1234 })
    ));
}

#[test]
fn expect_reply_requires_a_timeout() {
    let clock = MockClock::new();
    let (_subsystem, _control, endpoint) = setup_with_clock(clock);
    let a = open_active(&endpoint);
    let b = open_active(&endpoint);

    let frame = MessageBuilder::unicast(b.id())
        .expect_reply(0)
        .inline(b"no deadline")
        .encode()
        .expect("encode");
    assert!(matches!(
        a.send(&frame),
        Err(BusError::ReplyWithoutDeadline)
    ));
}

#[test]
fn expired_reply_deadline_synthesizes_a_timeout_message() {
    let clock = MockClock::new();
    let (_subsystem, _control, endpoint) = setup_with_clock(clock.clone());
    let caller = open_active(&endpoint);
    let callee = open_active(&endpoint);

    let request = MessageBuilder::unicast(callee.id())
        .cookie(77)
        .expect_reply(Duration::from_millis(5).as_nanos() as u64)
        .inline(b"will time out")
        .encode()
        .expect("encode");
    caller.send(&request).expect("send");

    assert!(caller.try_recv().expect("nothing yet").is_none());
    clock.advance(Duration::from_millis(10));

    let delivery = caller
        .try_recv()
        .expect("poll")
        .expect("timeout synthetic delivered");
    assert_eq!(delivery.src_id, 0);
    let message = caller.read_message(delivery.offset).expect("read");
    assert!(message
        .records
        .iter()
        .any(|record| matches!(record, Record::ReplyTimeout { cookie: 77 })));
    caller.free(delivery.offset).expect("free");

    // The waiter is gone: a late reply from the callee is an orphan.
    let inbound = callee.recv().expect("recv request");
    let late = MessageBuilder::unicast(inbound.src_id)
        .reply_to(inbound.cookie)
        .inline(b"too late")
        .encode()
        .expect("encode");
    assert!(matches!(
        callee.send(&late),
        Err(BusError::ReplyOrphan { .. })
    ));
    callee.free(inbound.offset).expect("free");
}
