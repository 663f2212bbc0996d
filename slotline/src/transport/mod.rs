//! Transport endpoint: the verb-provider seam plus the pieces both roles
//! share — the queue-pair state machine and completion-queue polling.
//!
//! A [`VerbProvider`] resolves addresses and produces [`Connection`]s; a
//! connection owns one reliable-connected queue pair with its own send and
//! receive completion queues. Every provider call is fallible and treated as
//! an external system call.

pub mod loopback;

use crate::error::{Result, SlotlineError};
use crate::pool::Region;

/// Completions drained per poll call.
pub const POLL_BATCH: usize = 32;

/// Work-completion status codes (values follow `enum ibv_wc_status`).
pub const WC_SUCCESS: u32 = 0;
pub const WC_LOC_LEN_ERR: u32 = 1;
pub const WC_WR_FLUSH_ERR: u32 = 5;
pub const WC_RETRY_EXC_ERR: u32 = 12;

/// Queue-pair states a connection moves through before carrying traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

impl std::fmt::Display for QpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::ReadyToReceive => "RTR",
            QpState::ReadyToSend => "RTS",
            QpState::Error => "ERR",
        })
    }
}

bitflags::bitflags! {
    /// Attribute mask for a queue-pair modification. Bit values match
    /// `enum ibv_qp_attr_mask` so providers can pass them straight through.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttrMask: u32 {
        const STATE = 1 << 0;
        const ACCESS_FLAGS = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const PORT = 1 << 5;
        const AV = 1 << 7;
        const PATH_MTU = 1 << 8;
        const TIMEOUT = 1 << 9;
        const RETRY_CNT = 1 << 10;
        const RNR_RETRY = 1 << 11;
        const RQ_PSN = 1 << 12;
        const MAX_QP_RD_ATOMIC = 1 << 13;
        const MIN_RNR_TIMER = 1 << 15;
        const SQ_PSN = 1 << 16;
        const MAX_DEST_RD_ATOMIC = 1 << 17;
        const DEST_QPN = 1 << 20;

        const INIT = Self::STATE.bits()
            | Self::PKEY_INDEX.bits()
            | Self::PORT.bits()
            | Self::ACCESS_FLAGS.bits();
        const RTR = Self::STATE.bits()
            | Self::AV.bits()
            | Self::PATH_MTU.bits()
            | Self::DEST_QPN.bits()
            | Self::RQ_PSN.bits()
            | Self::MAX_DEST_RD_ATOMIC.bits()
            | Self::MIN_RNR_TIMER.bits();
        const RTS = Self::STATE.bits()
            | Self::SQ_PSN.bits()
            | Self::TIMEOUT.bits()
            | Self::RETRY_CNT.bits()
            | Self::RNR_RETRY.bits()
            | Self::MAX_QP_RD_ATOMIC.bits();
    }
}

bitflags::bitflags! {
    /// Remote/local access granted on a queue pair (`enum ibv_access_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
    }
}

/// Path MTU (`enum ibv_mtu`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

/// Flow-control parameters a responder accepts every connection with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptParams {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub rnr_retry_count: u8,
}

impl AcceptParams {
    pub const FIXED: AcceptParams = AcceptParams {
        initiator_depth: 1,
        responder_resources: 1,
        rnr_retry_count: 7,
    };
}

/// Queue-pair attributes applied during the state sequence. Address vector
/// and destination QPN come from the provider's view of the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpAttributes {
    pub port_num: u8,
    pub pkey_index: u16,
    pub access: Access,
    pub path_mtu: Mtu,
    pub rq_psn: u32,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub sq_psn: u32,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub max_rd_atomic: u8,
}

impl Default for QpAttributes {
    /// Fixed tuning; nothing is negotiated with the peer.
    fn default() -> Self {
        Self {
            port_num: 1,
            pkey_index: 0,
            access: Access::LOCAL_WRITE | Access::REMOTE_WRITE | Access::REMOTE_READ,
            path_mtu: Mtu::Mtu4096,
            rq_psn: 0,
            max_dest_rd_atomic: 1,
            min_rnr_timer: 1,
            sq_psn: 0,
            timeout: 1,
            retry_cnt: 7,
            rnr_retry: 7,
            max_rd_atomic: 1,
        }
    }
}

impl QpAttributes {
    /// Attributes for the responder side of an accepted connection.
    pub fn for_accept(params: &AcceptParams) -> Self {
        Self {
            max_rd_atomic: params.initiator_depth,
            max_dest_rd_atomic: params.responder_resources,
            rnr_retry: params.rnr_retry_count,
            ..Self::default()
        }
    }
}

/// One step of the queue-pair state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpTransition {
    pub target: QpState,
    pub mask: AttrMask,
    pub attrs: QpAttributes,
}

/// The mandatory RESET → INIT → RTR → RTS sequence.
pub fn qp_transitions(attrs: &QpAttributes) -> [QpTransition; 4] {
    let step = |target, mask| QpTransition {
        target,
        mask,
        attrs: *attrs,
    };
    [
        step(QpState::Reset, AttrMask::STATE),
        step(QpState::Init, AttrMask::INIT),
        step(QpState::ReadyToReceive, AttrMask::RTR),
        step(QpState::ReadyToSend, AttrMask::RTS),
    ]
}

/// Which of a connection's completion queues to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqKind {
    Send,
    Recv,
}

/// Scatter/gather entry: a byte range inside a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: u32,
    pub byte_len: u32,
}

impl WorkCompletion {
    pub fn is_success(&self) -> bool {
        self.status == WC_SUCCESS
    }
}

/// Address resolution and connection management of an RDMA verb provider.
pub trait VerbProvider: Send + Sync + 'static {
    /// A resolved address, not yet listening or connected.
    type Endpoint: Send;
    type Listener: Send + Sync;
    type Connection: Connection;

    /// Resolve `host:port`; `host == None` resolves a passive (listening)
    /// endpoint.
    fn resolve(&self, port: u16, host: Option<&str>) -> Result<Self::Endpoint>;

    fn listen(&self, endpoint: Self::Endpoint, backlog: usize) -> Result<Self::Listener>;

    /// Open a connection to a passive endpoint. The queue pair starts in
    /// RESET and is driven by [`advance_qp_state`].
    fn connect(&self, endpoint: Self::Endpoint) -> Result<Self::Connection>;

    /// Block until a peer connects to `listener`.
    fn get_request(&self, listener: &Self::Listener) -> Result<Self::Connection>;

    fn accept(&self, conn: &mut Self::Connection, params: &AcceptParams) -> Result<()>;
}

/// One reliable-connected queue pair with its send and receive CQs.
pub trait Connection: Send + 'static {
    /// Register `region` for local and remote access on this connection.
    ///
    /// # Safety
    ///
    /// The memory behind `region` must stay valid for as long as this
    /// connection exists; the provider reads and writes it on posted work
    /// requests without further checks.
    unsafe fn register(&mut self, region: Region) -> Result<()>;

    fn qp_state(&self) -> QpState;

    fn modify_qp(&mut self, transition: &QpTransition) -> Result<()>;

    fn post_send(&mut self, sge: Sge, wr_id: u64) -> Result<()>;

    fn post_recv(&mut self, sge: Sge, wr_id: u64) -> Result<()>;

    /// Move up to `completions.len()` finished work requests from `cq` into
    /// `completions`, returning how many were written.
    fn poll_cq(&mut self, cq: CqKind, completions: &mut [WorkCompletion]) -> Result<usize>;

    /// Rendezvous with the peer once this side can receive.
    fn ready(&mut self) -> Result<()>;
}

/// Drive `conn` through RESET → INIT → RTR → RTS.
///
/// Stops at the first failed step; the error names the state that could not
/// be reached.
pub fn advance_qp_state<C: Connection + ?Sized>(conn: &mut C, attrs: &QpAttributes) -> Result<()> {
    for transition in qp_transitions(attrs) {
        conn.modify_qp(&transition)
            .map_err(|e| SlotlineError::QpTransition {
                state: transition.target,
                reason: e.to_string(),
            })?;
    }
    let state = conn.qp_state();
    if state != QpState::ReadyToSend {
        return Err(SlotlineError::QpTransition {
            state: QpState::ReadyToSend,
            reason: format!("provider reports {state} after the sequence"),
        });
    }
    Ok(())
}

/// Drain up to [`POLL_BATCH`] completions from `cq`.
///
/// `Ok(true)` when at least one completion arrived and all of them
/// succeeded, `Ok(false)` when the queue was empty. A failed completion
/// anywhere in the batch fails the whole call; callers treat that as fatal.
pub fn poll_completions<C: Connection + ?Sized>(conn: &mut C, cq: CqKind) -> Result<bool> {
    let mut wc = [WorkCompletion::default(); POLL_BATCH];
    let n = conn.poll_cq(cq, &mut wc)?.min(POLL_BATCH);
    if let Some(failed) = wc[..n].iter().find(|c| !c.is_success()) {
        return Err(SlotlineError::CompletionFailed {
            status: failed.status,
            wr_id: failed.wr_id,
        });
    }
    Ok(n > 0)
}
