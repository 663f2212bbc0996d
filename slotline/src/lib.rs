pub mod config;
pub mod error;
pub mod frame;
pub mod handoff;
pub mod originator;
pub mod pool;
mod pump;
pub mod responder;
pub mod transport;

pub use config::SlotlineConfig;
pub use error::{Result, SlotlineError};
pub use frame::{FrameHeader, HEADER_SIZE, Message};
pub use handoff::HandoffQueue;
pub use originator::{Originator, OriginatorStats};
pub use pool::{BufferPool, PooledSlot, Region};
pub use pump::pin_current;
pub use responder::Responder;
pub use transport::loopback::LoopbackFabric;
pub use transport::{AcceptParams, Connection, VerbProvider};
