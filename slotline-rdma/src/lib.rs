//! ibverbs-backed verb provider for slotline.
//!
//! Opens an InfiniBand/RoCE device through raw `ibverbs-sys` FFI and
//! creates one RC queue pair per connection, each with its own send and
//! receive completion queues. Peers find each other's queue pairs over a
//! short TCP side channel.
//!
//! ```ignore
//! let provider = slotline_rdma::RdmaProvider::open(None)?;
//! let originator = slotline::Originator::new(provider, &SlotlineConfig::from_env())?;
//! ```

pub mod connection;
pub mod device;
pub mod provider;

pub use connection::{RdmaConnection, RdmaEndpoint};
pub use device::RdmaDevice;
pub use provider::{RdmaAddr, RdmaProvider};
