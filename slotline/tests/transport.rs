//! End-to-end tests over the loopback fabric: an originator and a responder
//! in one process, each with its own pump thread.

use slotline::transport::loopback::LoopbackFabric;
use slotline::{BufferPool, FrameHeader, Message, Originator, Responder, SlotlineConfig};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Inbox = Arc<Mutex<Vec<Arc<Message>>>>;

/// Poll `cond` until it holds or `timeout` passes.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// A responder whose handler keeps every message it is given.
fn retaining_responder(fabric: &LoopbackFabric) -> (Responder<LoopbackFabric>, Inbox) {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    let responder = Responder::new(fabric.clone(), &SlotlineConfig::default(), move |msg| {
        sink.lock().unwrap().push(msg);
    })
    .unwrap();
    (responder, inbox)
}

/// A responder whose handler records headers and payloads and lets the
/// slot go straight back to the pool.
fn recording_responder(
    fabric: &LoopbackFabric,
) -> (
    Responder<LoopbackFabric>,
    Arc<Mutex<Vec<(FrameHeader, Vec<u8>)>>>,
) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let responder = Responder::new(fabric.clone(), &SlotlineConfig::default(), move |msg| {
        sink.lock()
            .unwrap()
            .push((msg.header(), msg.payload().to_vec()));
    })
    .unwrap();
    (responder, log)
}

fn frame(pool: &Arc<BufferPool>, seq: i32, payload: &[u8]) -> Arc<Message> {
    let mut msg = Message::from_slot(pool.acquire().unwrap()).unwrap();
    let header = FrameHeader {
        seq,
        data_len: payload.len() as u32,
        ..Default::default()
    };
    msg.set_header(&header).unwrap();
    msg.write_payload(payload).unwrap();
    Arc::new(msg)
}

// ── Delivery ────────────────────────────────────────────────────────

#[test]
fn single_message_arrives_intact() {
    let fabric = LoopbackFabric::new();
    let (responder, log) = recording_responder(&fabric);
    let listener = responder.listen(7300, 256, 8).unwrap();

    let originator = Originator::new(fabric.clone(), &SlotlineConfig::default()).unwrap();
    let pool = BufferPool::new(256, 8).unwrap();
    let dest = originator.connect("localhost", 7300, &pool).unwrap();
    let conn = responder.accept(listener).unwrap();

    let mut msg = Message::from_slot(pool.acquire().unwrap()).unwrap();
    let header = FrameHeader {
        idx: 5,
        send_node_id: 1,
        recv_node_id: 2,
        request: true,
        seq: 42,
        data_len: 11,
        ..Default::default()
    };
    msg.set_header(&header).unwrap();
    msg.write_payload(b"hello world").unwrap();
    originator.send(Arc::new(msg), dest).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        responder.received(conn).unwrap() == 1
    }));
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0, header);
    assert_eq!(log[0].1, b"hello world");
}

#[test]
fn messages_arrive_in_send_order() {
    let fabric = LoopbackFabric::new();
    let (responder, log) = recording_responder(&fabric);
    let listener = responder.listen(7301, 128, 4).unwrap();

    let originator = Originator::new(fabric.clone(), &SlotlineConfig::default()).unwrap();
    let pool = BufferPool::new(128, 128).unwrap();
    let dest = originator.connect("localhost", 7301, &pool).unwrap();
    responder.accept(listener).unwrap();

    for seq in 0..100 {
        originator
            .send(frame(&pool, seq, &seq.to_le_bytes()), dest)
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        responder.total_received() == 100
    }));
    let seqs: Vec<i32> = log.lock().unwrap().iter().map(|(h, _)| h.seq).collect();
    assert_eq!(seqs, (0..100).collect::<Vec<_>>());
    assert_eq!(originator.stats().dropped, 0);
    assert!(wait_until(Duration::from_secs(5), || {
        originator.stats().sent == 100
    }));
}

#[test]
fn at_most_one_send_in_flight_per_destination() {
    let fabric = LoopbackFabric::new();
    let (responder, _log) = recording_responder(&fabric);
    let listener = responder.listen(7302, 128, 4).unwrap();

    let originator = Originator::new(fabric.clone(), &SlotlineConfig::default()).unwrap();
    let pool = BufferPool::new(128, 64).unwrap();
    let dest = originator.connect("localhost", 7302, &pool).unwrap();
    responder.accept(listener).unwrap();

    for seq in 0..64 {
        originator.send(frame(&pool, seq, b"x"), dest).unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        responder.total_received() == 64
    }));
    assert_eq!(fabric.max_sends_in_flight(), 1);
    // The pump runs without ever tripping the one-outstanding-send limit.
    assert!(originator.is_running());
}

#[test]
fn sender_slots_return_after_completion() {
    let fabric = LoopbackFabric::new();
    let (responder, _log) = recording_responder(&fabric);
    let listener = responder.listen(7303, 128, 4).unwrap();

    let originator = Originator::new(fabric.clone(), &SlotlineConfig::default()).unwrap();
    let pool = BufferPool::new(128, 16).unwrap();
    let dest = originator.connect("localhost", 7303, &pool).unwrap();
    responder.accept(listener).unwrap();

    for seq in 0..16 {
        originator.send(frame(&pool, seq, b"slot"), dest).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || {
        pool.free_slots() == 16
    }));
}

#[test]
fn fan_out_to_two_responders() {
    let fabric = LoopbackFabric::new();
    let (left, left_log) = recording_responder(&fabric);
    let (right, right_log) = recording_responder(&fabric);
    let l = left.listen(7304, 128, 4).unwrap();
    let r = right.listen(7305, 128, 4).unwrap();

    let originator = Originator::new(fabric.clone(), &SlotlineConfig::default()).unwrap();
    let pool = BufferPool::new(128, 16).unwrap();
    let to_left = originator.connect("localhost", 7304, &pool).unwrap();
    let to_right = originator.connect("localhost", 7305, &pool).unwrap();
    left.accept(l).unwrap();
    right.accept(r).unwrap();

    originator.send(frame(&pool, 1, b"left"), to_left).unwrap();
    originator.send(frame(&pool, 2, b"right"), to_right).unwrap();
    originator.send(frame(&pool, 3, b"left"), to_left).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        left.total_received() == 2 && right.total_received() == 1
    }));
    let left_seqs: Vec<i32> = left_log.lock().unwrap().iter().map(|(h, _)| h.seq).collect();
    assert_eq!(left_seqs, [1, 3]);
    assert_eq!(right_log.lock().unwrap()[0].1, b"right");
}

#[test]
fn one_listener_serves_several_originators() {
    let fabric = LoopbackFabric::new();
    let (responder, log) = recording_responder(&fabric);
    let listener = responder.listen(7306, 128, 8).unwrap();

    let a = Originator::new(fabric.clone(), &SlotlineConfig::default()).unwrap();
    let b = Originator::new(fabric.clone(), &SlotlineConfig::default()).unwrap();
    let pool_a = BufferPool::new(128, 4).unwrap();
    let pool_b = BufferPool::new(128, 4).unwrap();
    let dest_a = a.connect("localhost", 7306, &pool_a).unwrap();
    let conn_a = responder.accept(listener).unwrap();
    let dest_b = b.connect("localhost", 7306, &pool_b).unwrap();
    let conn_b = responder.accept(listener).unwrap();
    assert_eq!((conn_a, conn_b), (0, 1));

    a.send(frame(&pool_a, 10, b"a"), dest_a).unwrap();
    b.send(frame(&pool_b, 20, b"b"), dest_b).unwrap();
    b.send(frame(&pool_b, 21, b"b"), dest_b).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        responder.received(conn_a).unwrap() == 1 && responder.received(conn_b).unwrap() == 2
    }));
    assert_eq!(log.lock().unwrap().len(), 3);
}

// ── Backpressure ────────────────────────────────────────────────────

#[test]
fn retained_handles_stall_the_receiver() {
    let fabric = LoopbackFabric::new();
    let (responder, inbox) = retaining_responder(&fabric);
    let listener = responder.listen(7310, 128, 2).unwrap();

    let originator = Originator::new(fabric.clone(), &SlotlineConfig::default()).unwrap();
    let pool = BufferPool::new(128, 8).unwrap();
    let dest = originator.connect("localhost", 7310, &pool).unwrap();
    let conn = responder.accept(listener).unwrap();

    for seq in 0..3 {
        originator.send(frame(&pool, seq, b"held"), dest).unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || {
        responder.received(conn).unwrap() == 1
    }));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(responder.received(conn).unwrap(), 1);
    assert_eq!(originator.stats().dropped, 0);

    for expected in 2..=3 {
        inbox.lock().unwrap().clear();
        assert!(wait_until(Duration::from_secs(5), || {
            responder.received(conn).unwrap() == expected
        }));
    }
    let seq = inbox.lock().unwrap()[0].header().seq;
    assert_eq!(seq, 2);
}

#[test]
fn overflowing_handoff_queue_drops_newest() {
    let fabric = LoopbackFabric::new();
    let (responder, _inbox) = retaining_responder(&fabric);
    let listener = responder.listen(7311, 128, 2).unwrap();

    let cfg = SlotlineConfig {
        queue_depth: 4,
        ..Default::default()
    };
    let originator = Originator::new(fabric.clone(), &cfg).unwrap();
    let pool = BufferPool::new(128, 32).unwrap();
    let dest = originator.connect("localhost", 7311, &pool).unwrap();
    let conn = responder.accept(listener).unwrap();

    // Stall the receiver so the queue fills up behind the blocked send.
    originator.send(frame(&pool, 0, b"first"), dest).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        responder.received(conn).unwrap() == 1
    }));
    originator.send(frame(&pool, 1, b"lands"), dest).unwrap();
    originator.send(frame(&pool, 2, b"blocked"), dest).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        originator.queued(dest).unwrap() == 0
    }));

    for seq in 3..10 {
        originator.send(frame(&pool, seq, b"queued"), dest).unwrap();
    }
    assert_eq!(originator.queued(dest).unwrap(), 4);
    assert_eq!(originator.stats().dropped, 3);
}

// ── Shutdown ────────────────────────────────────────────────────────

#[test]
fn stop_is_idempotent() {
    let fabric = LoopbackFabric::new();
    let (responder, _log) = recording_responder(&fabric);
    let listener = responder.listen(7320, 128, 4).unwrap();
    let originator = Originator::new(fabric.clone(), &SlotlineConfig::default()).unwrap();
    let pool = BufferPool::new(128, 4).unwrap();
    let dest = originator.connect("localhost", 7320, &pool).unwrap();
    responder.accept(listener).unwrap();

    originator.stop().unwrap();
    originator.stop().unwrap();
    responder.stop().unwrap();
    responder.stop().unwrap();
    assert!(!originator.is_running());
    assert!(!responder.is_running());

    // Sends after stop are accepted but never transmitted.
    originator.send(frame(&pool, 0, b"late"), dest).unwrap();
    assert_eq!(originator.queued(dest).unwrap(), 1);
}

#[test]
fn drop_without_stop_joins_pumps() {
    let fabric = LoopbackFabric::new();
    let (responder, _log) = recording_responder(&fabric);
    let listener = responder.listen(7321, 128, 4).unwrap();
    let originator = Originator::new(fabric.clone(), &SlotlineConfig::default()).unwrap();
    let pool = BufferPool::new(128, 4).unwrap();
    let dest = originator.connect("localhost", 7321, &pool).unwrap();
    responder.accept(listener).unwrap();
    originator.send(frame(&pool, 0, b"bye"), dest).unwrap();

    drop(originator);
    drop(responder);
    assert_eq!(pool.free_slots(), 4);
}
