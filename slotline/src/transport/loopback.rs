//! In-process verb provider.
//!
//! Both ends of a loopback connection share one [`Link`]. A posted send sits
//! in its sender's queue until the peer has a receive posted and has reached
//! RTR, at which point the bytes are copied between the two registered
//! regions and a completion lands on each side. Work-request limits match
//! the RDMA provider: one outstanding send and one posted receive per
//! queue pair.

use super::{
    AcceptParams, AttrMask, Connection, CqKind, QpState, QpTransition, Sge, VerbProvider,
    WC_LOC_LEN_ERR, WC_RETRY_EXC_ERR, WC_SUCCESS, WC_WR_FLUSH_ERR, WorkCompletion,
};
use crate::error::{Result, SlotlineError};
use crate::pool::Region;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

const MAX_SEND_WR: usize = 1;
const MAX_RECV_WR: usize = 1;
const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// A process-local fabric. Clones share the same port space.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<Fabric>,
}

struct Fabric {
    listeners: Mutex<HashMap<u16, Arc<Backlog>>>,
    links: Mutex<Vec<Weak<Link>>>,
    send_faults: AtomicUsize,
    failing_transition: Mutex<Option<QpState>>,
    accept_timeout: Duration,
}

struct Backlog {
    limit: usize,
    pending: Mutex<VecDeque<LoopbackConnection>>,
    arrived: Condvar,
}

#[derive(Debug, Clone)]
pub struct LoopbackEndpoint {
    port: u16,
    passive: bool,
}

pub struct LoopbackListener {
    port: u16,
    backlog: Arc<Backlog>,
    fabric: Arc<Fabric>,
}

struct Link {
    ends: Mutex<[EndState; 2]>,
}

struct EndState {
    qp: QpState,
    regions: Vec<Region>,
    accepted: Option<AcceptParams>,
    posted_recvs: VecDeque<(Sge, u64)>,
    queued_sends: VecDeque<(Sge, u64)>,
    send_cq: VecDeque<WorkCompletion>,
    recv_cq: VecDeque<WorkCompletion>,
    sends_in_flight: usize,
    max_sends_in_flight: usize,
    delivered: u64,
    closed: bool,
}

impl EndState {
    fn new() -> Self {
        Self {
            qp: QpState::Reset,
            regions: Vec::new(),
            accepted: None,
            posted_recvs: VecDeque::new(),
            queued_sends: VecDeque::new(),
            send_cq: VecDeque::new(),
            recv_cq: VecDeque::new(),
            sends_in_flight: 0,
            max_sends_in_flight: 0,
            delivered: 0,
            closed: false,
        }
    }

    fn can_receive(&self) -> bool {
        !self.closed && matches!(self.qp, QpState::ReadyToReceive | QpState::ReadyToSend)
    }

    /// Complete every outstanding work request with a flush error.
    fn flush(&mut self) {
        let flushed = |(_, wr_id): (Sge, u64)| WorkCompletion {
            wr_id,
            status: WC_WR_FLUSH_ERR,
            byte_len: 0,
        };
        self.recv_cq.extend(self.posted_recvs.drain(..).map(flushed));
        self.send_cq.extend(self.queued_sends.drain(..).map(flushed));
    }

    fn is_registered(&self, sge: Sge) -> bool {
        self.regions
            .iter()
            .any(|r| r.contains(sge.addr, sge.len as usize))
    }
}

/// One end of a loopback queue pair.
pub struct LoopbackConnection {
    link: Arc<Link>,
    side: usize,
    fabric: Arc<Fabric>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::with_accept_timeout(DEFAULT_ACCEPT_TIMEOUT)
    }

    /// A fabric whose `get_request` gives up with `ETIMEDOUT` after `timeout`.
    pub fn with_accept_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Fabric {
                listeners: Mutex::new(HashMap::new()),
                links: Mutex::new(Vec::new()),
                send_faults: AtomicUsize::new(0),
                failing_transition: Mutex::new(None),
                accept_timeout: timeout,
            }),
        }
    }

    /// Complete the next `n` deliveries on this fabric with a retry-exceeded
    /// status instead of copying data.
    pub fn inject_send_failures(&self, n: usize) {
        self.inner.send_faults.fetch_add(n, Ordering::SeqCst);
    }

    /// Make the next queue-pair transition into `state` fail with `EINVAL`.
    pub fn fail_next_transition(&self, state: QpState) {
        if let Ok(mut slot) = self.inner.failing_transition.lock() {
            *slot = Some(state);
        }
    }

    /// Highest number of sends any queue pair ever had in flight at once.
    pub fn max_sends_in_flight(&self) -> usize {
        self.fold_ends(0, |acc, end| acc.max(end.max_sends_in_flight))
    }

    /// Messages copied end to end across all links.
    pub fn delivered(&self) -> u64 {
        self.fold_ends(0, |acc, end| acc + end.delivered)
    }

    /// Receives currently posted across all links.
    pub fn posted_receives(&self) -> usize {
        self.fold_ends(0, |acc, end| acc + end.posted_recvs.len())
    }

    /// Parameters every accepted connection was accepted with.
    pub fn accepted(&self) -> Vec<AcceptParams> {
        let mut out = Vec::new();
        self.fold_ends((), |(), end| {
            if let Some(p) = end.accepted {
                out.push(p);
            }
        });
        out
    }

    fn fold_ends<T>(&self, init: T, mut f: impl FnMut(T, &EndState) -> T) -> T {
        let Ok(links) = self.inner.links.lock() else {
            return init;
        };
        let mut acc = init;
        for link in links.iter().filter_map(Weak::upgrade) {
            if let Ok(ends) = link.ends.lock() {
                for end in ends.iter() {
                    acc = f(acc, end);
                }
            }
        }
        acc
    }
}

impl VerbProvider for LoopbackFabric {
    type Endpoint = LoopbackEndpoint;
    type Listener = LoopbackListener;
    type Connection = LoopbackConnection;

    fn resolve(&self, port: u16, host: Option<&str>) -> Result<LoopbackEndpoint> {
        if host.is_some_and(str::is_empty) {
            return Err(SlotlineError::os("rdma_getaddrinfo", libc::EINVAL));
        }
        Ok(LoopbackEndpoint {
            port,
            passive: host.is_none(),
        })
    }

    fn listen(&self, endpoint: LoopbackEndpoint, backlog: usize) -> Result<LoopbackListener> {
        if !endpoint.passive {
            return Err(SlotlineError::os("rdma_listen", libc::EINVAL));
        }
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("loopback listeners"))?;
        if listeners.contains_key(&endpoint.port) {
            return Err(SlotlineError::os("rdma_listen", libc::EADDRINUSE));
        }
        let queue = Arc::new(Backlog {
            limit: backlog.max(1),
            pending: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
        });
        listeners.insert(endpoint.port, queue.clone());
        Ok(LoopbackListener {
            port: endpoint.port,
            backlog: queue,
            fabric: self.inner.clone(),
        })
    }

    fn connect(&self, endpoint: LoopbackEndpoint) -> Result<LoopbackConnection> {
        if endpoint.passive {
            return Err(SlotlineError::os("rdma_connect", libc::EINVAL));
        }
        let backlog = self
            .inner
            .listeners
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("loopback listeners"))?
            .get(&endpoint.port)
            .cloned()
            .ok_or_else(|| SlotlineError::os("rdma_connect", libc::ECONNREFUSED))?;

        let mut pending = backlog
            .pending
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("loopback backlog"))?;
        if pending.len() >= backlog.limit {
            return Err(SlotlineError::os("rdma_connect", libc::ECONNREFUSED));
        }

        let link = Arc::new(Link {
            ends: Mutex::new([EndState::new(), EndState::new()]),
        });
        let mut links = self
            .inner
            .links
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("loopback links"))?;
        links.retain(|l| l.strong_count() > 0);
        links.push(Arc::downgrade(&link));
        drop(links);

        pending.push_back(LoopbackConnection {
            link: link.clone(),
            side: 1,
            fabric: self.inner.clone(),
        });
        backlog.arrived.notify_one();

        Ok(LoopbackConnection {
            link,
            side: 0,
            fabric: self.inner.clone(),
        })
    }

    fn get_request(&self, listener: &LoopbackListener) -> Result<LoopbackConnection> {
        let deadline = Instant::now() + listener.fabric.accept_timeout;
        let mut pending = listener
            .backlog
            .pending
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("loopback backlog"))?;
        loop {
            if let Some(conn) = pending.pop_front() {
                return Ok(conn);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SlotlineError::os("rdma_get_request", libc::ETIMEDOUT));
            }
            pending = listener
                .backlog
                .arrived
                .wait_timeout(pending, deadline - now)
                .map_err(|_| SlotlineError::LockPoisoned("loopback backlog"))?
                .0;
        }
    }

    fn accept(&self, conn: &mut LoopbackConnection, params: &AcceptParams) -> Result<()> {
        let side = conn.side;
        conn.ends()?[side].accepted = Some(*params);
        Ok(())
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        if let Ok(mut listeners) = self.fabric.listeners.lock() {
            listeners.remove(&self.port);
        }
    }
}

impl LoopbackConnection {
    fn ends(&self) -> Result<MutexGuard<'_, [EndState; 2]>> {
        self.link
            .ends
            .lock()
            .map_err(|_| SlotlineError::LockPoisoned("loopback link"))
    }

    fn take_transition_fault(&self, target: QpState) -> bool {
        match self.fabric.failing_transition.lock() {
            Ok(mut slot) if *slot == Some(target) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

/// Match queued sends from `from` against receives posted on the other end.
fn deliver(ends: &mut [EndState; 2], from: usize, faults: &AtomicUsize) {
    let to = 1 - from;
    while ends[to].can_receive()
        && !ends[from].queued_sends.is_empty()
        && !ends[to].posted_recvs.is_empty()
    {
        let Some((sge, wr_id)) = ends[from].queued_sends.pop_front() else {
            break;
        };
        let injected = faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            ends[from].send_cq.push_back(WorkCompletion {
                wr_id,
                status: WC_RETRY_EXC_ERR,
                byte_len: 0,
            });
            continue;
        }

        let Some((recv, recv_id)) = ends[to].posted_recvs.pop_front() else {
            break;
        };
        if sge.len > recv.len {
            ends[to].recv_cq.push_back(WorkCompletion {
                wr_id: recv_id,
                status: WC_LOC_LEN_ERR,
                byte_len: 0,
            });
            ends[from].send_cq.push_back(WorkCompletion {
                wr_id,
                status: WC_RETRY_EXC_ERR,
                byte_len: 0,
            });
            continue;
        }

        // Safety: both ranges were checked against regions registered on
        // their connection, and registration requires the memory to outlive
        // the connection. Closing an end clears its posted receives under
        // this same lock.
        unsafe {
            std::ptr::copy(
                sge.addr as *const u8,
                recv.addr as *mut u8,
                sge.len as usize,
            );
        }
        ends[to].recv_cq.push_back(WorkCompletion {
            wr_id: recv_id,
            status: WC_SUCCESS,
            byte_len: sge.len,
        });
        ends[from].send_cq.push_back(WorkCompletion {
            wr_id,
            status: WC_SUCCESS,
            byte_len: sge.len,
        });
        ends[from].delivered += 1;
    }
}

fn transition_allowed(from: QpState, to: QpState) -> bool {
    match to {
        QpState::Reset | QpState::Error => true,
        QpState::Init => from == QpState::Reset,
        QpState::ReadyToReceive => from == QpState::Init,
        QpState::ReadyToSend => from == QpState::ReadyToReceive,
    }
}

fn required_mask(to: QpState) -> AttrMask {
    match to {
        QpState::Reset | QpState::Error => AttrMask::STATE,
        QpState::Init => AttrMask::INIT,
        QpState::ReadyToReceive => AttrMask::RTR,
        QpState::ReadyToSend => AttrMask::RTS,
    }
}

impl Connection for LoopbackConnection {
    unsafe fn register(&mut self, region: Region) -> Result<()> {
        if region.len == 0 {
            return Err(SlotlineError::os("ibv_reg_mr", libc::EINVAL));
        }
        let side = self.side;
        self.ends()?[side].regions.push(region);
        Ok(())
    }

    fn qp_state(&self) -> QpState {
        self.ends()
            .map(|ends| ends[self.side].qp)
            .unwrap_or(QpState::Error)
    }

    fn modify_qp(&mut self, transition: &QpTransition) -> Result<()> {
        if self.take_transition_fault(transition.target) {
            return Err(SlotlineError::os("ibv_modify_qp", libc::EINVAL));
        }
        let side = self.side;
        let mut ends = self.ends()?;
        let end = &mut ends[side];
        if !transition_allowed(end.qp, transition.target)
            || !transition.mask.contains(required_mask(transition.target))
        {
            return Err(SlotlineError::os("ibv_modify_qp", libc::EINVAL));
        }
        end.qp = transition.target;
        match transition.target {
            QpState::Reset => {
                end.posted_recvs.clear();
                end.queued_sends.clear();
                end.sends_in_flight = 0;
            }
            QpState::Error => end.flush(),
            _ => {}
        }
        if transition.target == QpState::ReadyToReceive {
            deliver(&mut ends, 1 - side, &self.fabric.send_faults);
        }
        Ok(())
    }

    fn post_send(&mut self, sge: Sge, wr_id: u64) -> Result<()> {
        let side = self.side;
        let mut ends = self.ends()?;
        let end = &mut ends[side];
        if end.qp != QpState::ReadyToSend || !end.is_registered(sge) {
            return Err(SlotlineError::os("ibv_post_send", libc::EINVAL));
        }
        if end.sends_in_flight >= MAX_SEND_WR {
            return Err(SlotlineError::os("ibv_post_send", libc::ENOMEM));
        }
        end.sends_in_flight += 1;
        end.max_sends_in_flight = end.max_sends_in_flight.max(end.sends_in_flight);
        end.queued_sends.push_back((sge, wr_id));
        deliver(&mut ends, side, &self.fabric.send_faults);
        Ok(())
    }

    fn post_recv(&mut self, sge: Sge, wr_id: u64) -> Result<()> {
        let side = self.side;
        let mut ends = self.ends()?;
        let end = &mut ends[side];
        if matches!(end.qp, QpState::Reset | QpState::Error) || !end.is_registered(sge) {
            return Err(SlotlineError::os("ibv_post_recv", libc::EINVAL));
        }
        if end.posted_recvs.len() >= MAX_RECV_WR {
            return Err(SlotlineError::os("ibv_post_recv", libc::ENOMEM));
        }
        end.posted_recvs.push_back((sge, wr_id));
        deliver(&mut ends, 1 - side, &self.fabric.send_faults);
        Ok(())
    }

    fn poll_cq(&mut self, cq: CqKind, completions: &mut [WorkCompletion]) -> Result<usize> {
        let side = self.side;
        let mut ends = self.ends()?;
        let end = &mut ends[side];
        let queue = match cq {
            CqKind::Send => &mut end.send_cq,
            CqKind::Recv => &mut end.recv_cq,
        };
        let n = queue.len().min(completions.len());
        for (slot, wc) in completions.iter_mut().zip(queue.drain(..n)) {
            *slot = wc;
        }
        if cq == CqKind::Send {
            end.sends_in_flight = end.sends_in_flight.saturating_sub(n);
        }
        Ok(n)
    }

    fn ready(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        // Sends still queued towards a closed end are never completed.
        if let Ok(mut ends) = self.link.ends.lock() {
            let end = &mut ends[self.side];
            end.closed = true;
            end.qp = QpState::Error;
            end.posted_recvs.clear();
            end.queued_sends.clear();
            end.regions.clear();
        }
    }
}
