//! Receive side: listeners with their own slot pools, accepted connections
//! drained by a single receive pump.
//!
//! Every connection keeps one receive posted (the active slot) and one slot
//! in reserve (the standby). When the active receive completes, the standby
//! is posted in its place and the filled slot goes to the handler as an
//! `Arc<Message>`. A connection without a standby does not poll: it retries
//! the pool until a slot comes back, which stalls the sender through RNR
//! retries instead of dropping data.

use crate::config::SlotlineConfig;
use crate::error::{Result, SlotlineError};
use crate::frame::{HEADER_SIZE, Message};
use crate::pool::{BufferPool, PooledSlot};
use crate::pump::Pump;
use crate::transport::{
    AcceptParams, Connection, CqKind, QpAttributes, Sge, VerbProvider, advance_qp_state,
    poll_completions,
};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct ListenerEntry<L> {
    listener: L,
    pool: Arc<BufferPool>,
    port: u16,
}

/// Pump-owned state of one accepted connection. `conn` is declared first so
/// the queue pair is gone before its slots return to the pool.
struct Lane<C> {
    conn: C,
    index: usize,
    active: PooledSlot,
    standby: Option<PooledSlot>,
    pool: Arc<BufferPool>,
}

struct RecvShared<C> {
    arriving: SegQueue<Lane<C>>,
    received: Box<[AtomicU64]>,
    connections: AtomicUsize,
}

pub struct Responder<P: VerbProvider> {
    provider: P,
    backlog: usize,
    default_slot_count: usize,
    listeners: Mutex<Vec<Arc<ListenerEntry<P::Listener>>>>,
    control: Mutex<()>,
    shared: Arc<RecvShared<P::Connection>>,
    pump: Mutex<Pump>,
}

impl<P: VerbProvider> Responder<P> {
    /// Validate `config` and start the receive pump. `handler` runs on the
    /// pump thread for every received message.
    pub fn new<H>(provider: P, config: &SlotlineConfig, handler: H) -> Result<Self>
    where
        H: FnMut(Arc<Message>) + Send + 'static,
    {
        config.validate()?;
        let shared = Arc::new(RecvShared {
            arriving: SegQueue::new(),
            received: (0..config.max_connections)
                .map(|_| AtomicU64::new(0))
                .collect(),
            connections: AtomicUsize::new(0),
        });
        let pump_shared = Arc::clone(&shared);
        let pump = Pump::spawn("recv", config.recv_pump_core, move |running| {
            recv_loop(&pump_shared, running, handler)
        })?;
        tracing::info!(
            max_connections = config.max_connections,
            "responder: ready"
        );
        Ok(Self {
            provider,
            backlog: config.listen_backlog,
            default_slot_count: config.default_slot_count,
            listeners: Mutex::new(Vec::new()),
            control: Mutex::new(()),
            shared,
            pump: Mutex::new(pump),
        })
    }

    /// Listen on `port` with a fresh pool of `slot_count` slots of
    /// `slot_size` bytes shared by every connection accepted from it.
    pub fn listen(&self, port: u16, slot_size: usize, slot_count: usize) -> Result<usize> {
        if slot_size < HEADER_SIZE {
            return Err(SlotlineError::InvalidConfig(format!(
                "slot_size {slot_size} is smaller than the {HEADER_SIZE}-byte frame header"
            )));
        }
        if slot_count < 2 {
            return Err(SlotlineError::InvalidConfig(format!(
                "slot_count must be at least 2, got {slot_count}"
            )));
        }
        let pool = BufferPool::new(slot_size, slot_count)?;
        let endpoint = self.provider.resolve(port, None)?;
        let listener = self.provider.listen(endpoint, self.backlog)?;

        let mut listeners = self
            .listeners
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("responder listeners"))?;
        listeners.push(Arc::new(ListenerEntry {
            listener,
            pool,
            port,
        }));
        let index = listeners.len() - 1;
        tracing::info!(listener = index, port, slot_size, slot_count, "responder: listening");
        Ok(index)
    }

    /// [`Responder::listen`] with the configured default slot count.
    pub fn listen_default(&self, port: u16, slot_size: usize) -> Result<usize> {
        self.listen(port, slot_size, self.default_slot_count)
    }

    /// Block until a peer connects to `listener`, bring the connection up
    /// and hand it to the receive pump.
    pub fn accept(&self, listener: usize) -> Result<usize> {
        let entry = self.listener(listener)?;
        let _guard = self
            .control
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("responder control"))?;

        let index = self.shared.connections.load(Ordering::Acquire);
        let capacity = self.shared.received.len();
        if index >= capacity {
            return Err(SlotlineError::CapacityExhausted { capacity });
        }

        let mut conn = self.provider.get_request(&entry.listener)?;
        let pool = Arc::clone(&entry.pool);
        let active = pool.acquire().ok_or(SlotlineError::PoolExhausted {
            purpose: "active receive",
        })?;
        let standby = pool.acquire().ok_or(SlotlineError::PoolExhausted {
            purpose: "standby receive",
        })?;

        // Safety: the lane keeps `pool` alive for as long as the connection.
        unsafe { conn.register(pool.region())? };
        advance_qp_state(&mut conn, &QpAttributes::for_accept(&AcceptParams::FIXED))?;
        conn.post_recv(recv_sge(&active), index as u64)?;
        self.provider.accept(&mut conn, &AcceptParams::FIXED)?;
        conn.ready()?;

        self.shared.arriving.push(Lane {
            conn,
            index,
            active,
            standby: Some(standby),
            pool,
        });
        self.shared.connections.store(index + 1, Ordering::Release);

        tracing::info!(conn = index, listener, port = entry.port, "responder: accepted");
        Ok(index)
    }

    /// Messages received so far on connection `conn`.
    pub fn received(&self, conn: usize) -> Result<u64> {
        if conn >= self.shared.connections.load(Ordering::Acquire) {
            return Err(SlotlineError::UnknownConnection(conn));
        }
        Ok(self.shared.received[conn].load(Ordering::Acquire))
    }

    /// Messages received across all connections.
    pub fn total_received(&self) -> u64 {
        self.shared
            .received
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .sum()
    }

    /// Number of accepted connections.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }

    /// The slot pool behind `listener`.
    pub fn pool(&self, listener: usize) -> Result<Arc<BufferPool>> {
        Ok(Arc::clone(&self.listener(listener)?.pool))
    }

    /// Stop the receive pump and wait for it. Returns the pump's fatal
    /// error, if it hit one. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.pump
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("responder pump"))?
            .stop()
    }

    /// Whether the receive pump is still running.
    pub fn is_running(&self) -> bool {
        self.pump.lock().map(|p| p.is_running()).unwrap_or(false)
    }

    fn listener(&self, index: usize) -> Result<Arc<ListenerEntry<P::Listener>>> {
        self.listeners
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("responder listeners"))?
            .get(index)
            .cloned()
            .ok_or(SlotlineError::UnknownListener(index))
    }
}

impl<P: VerbProvider> Drop for Responder<P> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("responder: receive pump ended with error: {e}");
        }
    }
}

fn recv_sge(slot: &PooledSlot) -> Sge {
    Sge {
        addr: slot.addr(),
        len: slot.len() as u32,
    }
}

fn recv_loop<C, H>(shared: &RecvShared<C>, running: &AtomicBool, mut handler: H) -> Result<()>
where
    C: Connection,
    H: FnMut(Arc<Message>),
{
    let mut lanes: Vec<Lane<C>> = Vec::with_capacity(shared.received.len());

    while running.load(Ordering::Acquire) {
        while let Some(lane) = shared.arriving.pop() {
            lanes.push(lane);
        }

        for lane in lanes.iter_mut() {
            let Some(standby) = lane.standby.take() else {
                lane.standby = lane.pool.acquire();
                continue;
            };
            if !poll_completions(&mut lane.conn, CqKind::Recv)? {
                lane.standby = Some(standby);
                continue;
            }

            lane.conn.post_recv(recv_sge(&standby), lane.index as u64)?;
            let filled = std::mem::replace(&mut lane.active, standby);
            shared.received[lane.index].fetch_add(1, Ordering::Release);
            handler(Arc::new(Message::received(filled)?));
            lane.standby = lane.pool.acquire();
        }

        std::hint::spin_loop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackFabric;
    use std::time::Duration;

    fn responder(fabric: &LoopbackFabric) -> Responder<LoopbackFabric> {
        Responder::new(fabric.clone(), &SlotlineConfig::default(), |_| {}).unwrap()
    }

    #[test]
    fn test_listen_rejects_tiny_slots() {
        let responder = responder(&LoopbackFabric::new());
        let err = responder.listen(7200, HEADER_SIZE - 1, 4).unwrap_err();
        assert!(matches!(err, SlotlineError::InvalidConfig(_)));
        let err = responder.listen(7200, 256, 1).unwrap_err();
        assert!(matches!(err, SlotlineError::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_listener_and_connection() {
        let responder = responder(&LoopbackFabric::new());
        assert!(matches!(
            responder.accept(3),
            Err(SlotlineError::UnknownListener(3))
        ));
        assert!(matches!(
            responder.pool(0),
            Err(SlotlineError::UnknownListener(0))
        ));
        assert!(matches!(
            responder.received(0),
            Err(SlotlineError::UnknownConnection(0))
        ));
    }

    #[test]
    fn test_listen_default_uses_configured_count() {
        let fabric = LoopbackFabric::new();
        let cfg = SlotlineConfig {
            default_slot_count: 6,
            ..Default::default()
        };
        let responder = Responder::new(fabric, &cfg, |_| {}).unwrap();
        let l = responder.listen_default(7201, 128).unwrap();
        assert_eq!(responder.pool(l).unwrap().capacity(), 6);
    }

    #[test]
    fn test_accept_takes_two_slots() {
        let fabric = LoopbackFabric::new();
        let responder = responder(&fabric);
        let l = responder.listen(7202, 128, 4).unwrap();
        let ep = fabric.resolve(7202, Some("localhost")).unwrap();
        let _client = fabric.connect(ep).unwrap();

        assert_eq!(responder.accept(l).unwrap(), 0);
        assert_eq!(responder.pool(l).unwrap().free_slots(), 2);
        assert_eq!(responder.connections(), 1);
        assert_eq!(fabric.accepted(), vec![AcceptParams::FIXED]);
    }

    #[test]
    fn test_accept_with_drained_pool() {
        let fabric = LoopbackFabric::new();
        let responder = responder(&fabric);
        let l = responder.listen(7203, 128, 2).unwrap();
        let pool = responder.pool(l).unwrap();
        let _held = pool.acquire().unwrap();

        let ep = fabric.resolve(7203, Some("localhost")).unwrap();
        let _client = fabric.connect(ep).unwrap();
        let err = responder.accept(l).unwrap_err();
        assert!(matches!(err, SlotlineError::PoolExhausted { .. }));
        assert_eq!(responder.connections(), 0);
        assert_eq!(pool.free_slots(), 1);
    }

    #[test]
    fn test_accept_times_out_without_peer() {
        let fabric = LoopbackFabric::with_accept_timeout(Duration::from_millis(20));
        let responder = responder(&fabric);
        let l = responder.listen(7204, 128, 4).unwrap();
        let err = responder.accept(l).unwrap_err();
        assert_eq!(err.code(), Some(libc::ETIMEDOUT));
    }
}
