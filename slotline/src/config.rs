//! Construction-time parameters for originators and responders.
//!
//! Everything here is fixed once a device is built; nothing is
//! reconfigurable at runtime. Override via environment variables (prefixed
//! `SLOTLINE_`) or by constructing a custom `SlotlineConfig`.

use crate::error::{Result, SlotlineError};

/// Tuning and capacity parameters for both roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotlineConfig {
    /// Maximum number of destinations an originator can connect to.
    pub max_destinations: usize,

    /// Maximum number of accepted connections a responder can hold.
    pub max_connections: usize,

    /// Capacity of each destination's handoff queue. Sends beyond this are
    /// dropped.
    pub queue_depth: usize,

    /// Slot count used by `Responder::listen_default`.
    pub default_slot_count: usize,

    /// Backlog passed to the provider's listen call.
    pub listen_backlog: usize,

    /// Core the send pump pins itself to. `None` leaves placement to the OS.
    pub send_pump_core: Option<usize>,

    /// Core the receive pump pins itself to.
    pub recv_pump_core: Option<usize>,
}

impl Default for SlotlineConfig {
    fn default() -> Self {
        Self {
            max_destinations: 16,
            max_connections: 16,
            queue_depth: 500,
            default_slot_count: 500,
            listen_backlog: 100,
            send_pump_core: None,
            recv_pump_core: None,
        }
    }
}

impl SlotlineConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `SLOTLINE_MAX_DESTINATIONS`
    /// - `SLOTLINE_MAX_CONNECTIONS`
    /// - `SLOTLINE_QUEUE_DEPTH`
    /// - `SLOTLINE_DEFAULT_SLOT_COUNT`
    /// - `SLOTLINE_LISTEN_BACKLOG`
    /// - `SLOTLINE_SEND_PUMP_CORE`
    /// - `SLOTLINE_RECV_PUMP_CORE`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_usize("SLOTLINE_MAX_DESTINATIONS") {
            cfg.max_destinations = n;
        }
        if let Some(n) = env_usize("SLOTLINE_MAX_CONNECTIONS") {
            cfg.max_connections = n;
        }
        if let Some(n) = env_usize("SLOTLINE_QUEUE_DEPTH") {
            cfg.queue_depth = n;
        }
        if let Some(n) = env_usize("SLOTLINE_DEFAULT_SLOT_COUNT") {
            cfg.default_slot_count = n;
        }
        if let Some(n) = env_usize("SLOTLINE_LISTEN_BACKLOG") {
            cfg.listen_backlog = n;
        }
        if let Some(core) = env_usize("SLOTLINE_SEND_PUMP_CORE") {
            cfg.send_pump_core = Some(core);
        }
        if let Some(core) = env_usize("SLOTLINE_RECV_PUMP_CORE") {
            cfg.recv_pump_core = Some(core);
        }

        cfg
    }

    /// Reject values the pumps cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_destinations == 0 {
            return Err(SlotlineError::InvalidConfig(
                "max_destinations must be at least 1".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(SlotlineError::InvalidConfig(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(SlotlineError::InvalidConfig(
                "queue_depth must be at least 1".into(),
            ));
        }
        // One slot is posted and one is held as standby per connection.
        if self.default_slot_count < 2 {
            return Err(SlotlineError::InvalidConfig(format!(
                "default_slot_count must be at least 2, got {}",
                self.default_slot_count
            )));
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}
