//! Send side: one connection per destination, drained by a single send pump.
//!
//! Application threads enqueue `Arc<Message>` handles into per-destination
//! [`HandoffQueue`]s. The pump keeps at most one send in flight per
//! destination: it posts the next queued message only after the previous
//! send completed, and holds a reference to the in-flight message so its
//! slot stays alive until the hardware is done with it.

use crate::config::SlotlineConfig;
use crate::error::{Result, SlotlineError};
use crate::frame::Message;
use crate::handoff::HandoffQueue;
use crate::pool::BufferPool;
use crate::pump::Pump;
use crate::transport::{
    Connection, CqKind, QpAttributes, Sge, VerbProvider, advance_qp_state, poll_completions,
};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Counters exposed by [`Originator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OriginatorStats {
    pub sent: u64,
    pub dropped: u64,
    pub destinations: usize,
}

struct Destination {
    queue: HandoffQueue,
    pool: Arc<BufferPool>,
}

struct SendShared<C> {
    /// Connections not yet picked up by the pump. Declared before
    /// `destinations` so a leftover connection is closed before the pool it
    /// registered goes away.
    arriving: SegQueue<(usize, C)>,
    destinations: Box<[OnceLock<Destination>]>,
    count: AtomicUsize,
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Pump-owned state of one destination.
struct Lane<C> {
    conn: C,
    in_flight: Option<Arc<Message>>,
}

pub struct Originator<P: VerbProvider> {
    provider: P,
    queue_depth: usize,
    shared: Arc<SendShared<P::Connection>>,
    control: Mutex<()>,
    pump: Mutex<Pump>,
}

impl<P: VerbProvider> Originator<P> {
    /// Validate `config` and start the send pump.
    pub fn new(provider: P, config: &SlotlineConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(SendShared {
            arriving: SegQueue::new(),
            destinations: (0..config.max_destinations)
                .map(|_| OnceLock::new())
                .collect(),
            count: AtomicUsize::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let pump_shared = Arc::clone(&shared);
        let pump = Pump::spawn("send", config.send_pump_core, move |running| {
            send_loop(&pump_shared, running)
        })?;
        tracing::info!(
            max_destinations = config.max_destinations,
            queue_depth = config.queue_depth,
            "originator: ready"
        );
        Ok(Self {
            provider,
            queue_depth: config.queue_depth,
            shared,
            control: Mutex::new(()),
            pump: Mutex::new(pump),
        })
    }

    /// Connect to `host:port` and register `pool` for sending to it.
    ///
    /// Every message later sent to the returned destination index must live
    /// in `pool`. Indices are dense, starting at 0.
    pub fn connect(&self, host: &str, port: u16, pool: &Arc<BufferPool>) -> Result<usize> {
        let _guard = self
            .control
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("originator control"))?;

        let dest = self.shared.count.load(Ordering::Acquire);
        let capacity = self.shared.destinations.len();
        if dest >= capacity {
            return Err(SlotlineError::CapacityExhausted { capacity });
        }

        let endpoint = self.provider.resolve(port, Some(host))?;
        let mut conn = self.provider.connect(endpoint)?;
        // Safety: `pool` is kept alive in `destinations` for as long as the
        // shared state exists, which outlives every connection it holds.
        unsafe { conn.register(pool.region())? };
        advance_qp_state(&mut conn, &QpAttributes::default())?;
        conn.ready()?;

        let installed = self.shared.destinations[dest].set(Destination {
            queue: HandoffQueue::new(self.queue_depth),
            pool: Arc::clone(pool),
        });
        if installed.is_err() {
            return Err(SlotlineError::CapacityExhausted { capacity });
        }
        self.shared.arriving.push((dest, conn));
        self.shared.count.store(dest + 1, Ordering::Release);

        tracing::info!(dest, host, port, "originator: connected");
        Ok(dest)
    }

    /// Hand `msg` to the send pump for destination `dest`.
    ///
    /// Never blocks. When the destination's queue is full the message is
    /// dropped and counted; that is not an error.
    pub fn send(&self, msg: Arc<Message>, dest: usize) -> Result<()> {
        if dest >= self.shared.count.load(Ordering::Acquire) {
            return Err(SlotlineError::UnknownDestination(dest));
        }
        let target = self.shared.destinations[dest]
            .get()
            .ok_or(SlotlineError::UnknownDestination(dest))?;
        if !Arc::ptr_eq(msg.pool(), &target.pool) {
            return Err(SlotlineError::ForeignBuffer { dest });
        }
        if !target.queue.push(msg) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(dest, "originator: handoff queue full, message dropped");
        }
        Ok(())
    }

    /// Stop the send pump and wait for it. Returns the pump's fatal error,
    /// if it hit one. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.pump
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("originator pump"))?
            .stop()
    }

    /// Whether the send pump is still running.
    pub fn is_running(&self) -> bool {
        self.pump.lock().map(|p| p.is_running()).unwrap_or(false)
    }

    pub fn stats(&self) -> OriginatorStats {
        OriginatorStats {
            sent: self.shared.sent.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            destinations: self.shared.count.load(Ordering::Acquire),
        }
    }

    /// Messages waiting in `dest`'s handoff queue.
    pub fn queued(&self, dest: usize) -> Result<usize> {
        self.shared
            .destinations
            .get(dest)
            .and_then(OnceLock::get)
            .map(|d| d.queue.len())
            .ok_or(SlotlineError::UnknownDestination(dest))
    }
}

impl<P: VerbProvider> Drop for Originator<P> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("originator: send pump ended with error: {e}");
        }
    }
}

fn send_loop<C: Connection>(shared: &SendShared<C>, running: &AtomicBool) -> Result<()> {
    let mut lanes: Vec<Option<Lane<C>>> = (0..shared.destinations.len()).map(|_| None).collect();

    while running.load(Ordering::Acquire) {
        while let Some((dest, conn)) = shared.arriving.pop() {
            lanes[dest] = Some(Lane {
                conn,
                in_flight: None,
            });
        }

        for (dest, lane) in lanes.iter_mut().enumerate() {
            let Some(lane) = lane else { continue };

            if lane.in_flight.is_some() {
                if !poll_completions(&mut lane.conn, CqKind::Send)? {
                    continue;
                }
                lane.in_flight = None;
                shared.sent.fetch_add(1, Ordering::Relaxed);
            }

            let Some(msg) = shared.destinations[dest].get().and_then(|d| d.queue.pop()) else {
                continue;
            };
            let sge = Sge {
                addr: msg.addr(),
                len: msg.wire_len() as u32,
            };
            lane.conn.post_send(sge, dest as u64)?;
            lane.in_flight = Some(msg);
        }

        std::hint::spin_loop();
    }
    Ok(())
}
