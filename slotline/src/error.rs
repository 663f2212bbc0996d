use crate::transport::QpState;

pub type Result<T> = std::result::Result<T, SlotlineError>;

#[derive(Debug, thiserror::Error)]
pub enum SlotlineError {
    /// A verb-provider or OS call failed. Carries the underlying errno.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("queue pair transition to {state} failed: {reason}")]
    QpTransition { state: QpState, reason: String },

    #[error("work completion failed (status={status}, wr_id={wr_id})")]
    CompletionFailed { status: u32, wr_id: u64 },

    #[error("unknown destination {0}")]
    UnknownDestination(usize),

    #[error("unknown listener {0}")]
    UnknownListener(usize),

    #[error("unknown connection {0}")]
    UnknownConnection(usize),

    #[error("connection table full: capacity is {capacity}")]
    CapacityExhausted { capacity: usize },

    #[error("payload of {len} bytes exceeds slot capacity of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("buffer pool has no free slot for {purpose}")]
    PoolExhausted { purpose: &'static str },

    #[error("message slot is not from the pool registered with destination {dest}")]
    ForeignBuffer { dest: usize },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to pin {thread} to core {core}")]
    Affinity { thread: &'static str, core: usize },

    #[error("{0} pump thread panicked")]
    PumpPanicked(&'static str),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SlotlineError {
    /// Wrap `errno` from the last failed OS or verbs call.
    pub fn last_os(op: &'static str) -> Self {
        Self::Os {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Wrap an explicit errno value, e.g. a verbs return code.
    pub fn os(op: &'static str, errno: i32) -> Self {
        Self::Os {
            op,
            source: std::io::Error::from_raw_os_error(errno),
        }
    }

    /// The system error code behind this error, if it has one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } | Self::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }

    /// Whether the failure leaves the transport unusable.
    ///
    /// Caller mistakes (bad index, oversized payload, ...) are not fatal: the
    /// device is still healthy and the call can be corrected.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Os { .. }
                | Self::QpTransition { .. }
                | Self::CompletionFailed { .. }
                | Self::Affinity { .. }
                | Self::PumpPanicked(_)
                | Self::LockPoisoned(_)
                | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_carries_code() {
        let e = SlotlineError::os("rdma_getaddrinfo", libc::ENODEV);
        assert_eq!(e.code(), Some(libc::ENODEV));
        assert!(e.to_string().starts_with("rdma_getaddrinfo failed"));
        assert!(e.is_fatal());
    }

    #[test]
    fn test_qp_transition_display() {
        let e = SlotlineError::QpTransition {
            state: QpState::ReadyToReceive,
            reason: "rc=22".into(),
        };
        assert_eq!(e.to_string(), "queue pair transition to RTR failed: rc=22");
        assert_eq!(e.code(), None);
    }

    #[test]
    fn test_caller_errors_are_not_fatal() {
        assert!(!SlotlineError::UnknownDestination(3).is_fatal());
        assert!(!SlotlineError::PayloadTooLarge { len: 10, max: 4 }.is_fatal());
        assert!(!SlotlineError::CapacityExhausted { capacity: 2 }.is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port busy");
        let e: SlotlineError = io_err.into();
        assert!(e.to_string().contains("port busy"));
    }

    #[test]
    fn test_all_variants_display() {
        let errors = vec![
            SlotlineError::last_os("ibv_reg_mr"),
            SlotlineError::CompletionFailed {
                status: 12,
                wr_id: 1,
            },
            SlotlineError::UnknownListener(0),
            SlotlineError::PoolExhausted { purpose: "standby" },
            SlotlineError::ForeignBuffer { dest: 1 },
            SlotlineError::InvalidFrame("short".into()),
            SlotlineError::InvalidConfig("queue_depth".into()),
            SlotlineError::Affinity {
                thread: "send pump",
                core: 18,
            },
            SlotlineError::PumpPanicked("receive"),
            SlotlineError::LockPoisoned("control"),
        ];
        for e in errors {
            assert!(!e.to_string().is_empty());
        }
    }
}
