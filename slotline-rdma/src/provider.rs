//! [`VerbProvider`] over ibverbs. Queue-pair endpoints are exchanged over a
//! TCP side channel that also carries the readiness rendezvous.

use crate::connection::{RdmaConnection, Role};
use crate::device::RdmaDevice;
use slotline::error::{Result, SlotlineError};
use slotline::transport::{AcceptParams, VerbProvider};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;

/// A resolved side-channel address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaAddr {
    /// Where to connect.
    Active(SocketAddr),
    /// Where to listen.
    Passive(SocketAddr),
}

pub struct RdmaProvider {
    device: Arc<RdmaDevice>,
}

impl RdmaProvider {
    /// Open the RDMA device at `device_index` (first device when `None`).
    pub fn open(device_index: Option<usize>) -> Result<Self> {
        Ok(Self::with_device(RdmaDevice::open(device_index)?))
    }

    pub fn with_device(device: Arc<RdmaDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<RdmaDevice> {
        &self.device
    }
}

fn io_err(op: &'static str) -> impl FnOnce(std::io::Error) -> SlotlineError {
    move |source| SlotlineError::Os { op, source }
}

impl VerbProvider for RdmaProvider {
    type Endpoint = RdmaAddr;
    type Listener = TcpListener;
    type Connection = RdmaConnection;

    fn resolve(&self, port: u16, host: Option<&str>) -> Result<RdmaAddr> {
        let Some(host) = host else {
            return Ok(RdmaAddr::Passive(SocketAddr::from(([0, 0, 0, 0], port))));
        };
        (host, port)
            .to_socket_addrs()
            .map_err(io_err("getaddrinfo"))?
            .next()
            .map(RdmaAddr::Active)
            .ok_or_else(|| SlotlineError::os("getaddrinfo", libc::EADDRNOTAVAIL))
    }

    /// Bind the side channel. The OS default backlog applies.
    fn listen(&self, endpoint: RdmaAddr, _backlog: usize) -> Result<TcpListener> {
        let RdmaAddr::Passive(addr) = endpoint else {
            return Err(SlotlineError::os("listen", libc::EINVAL));
        };
        let listener = TcpListener::bind(addr).map_err(io_err("listen"))?;
        tracing::info!(%addr, "rdma: listening");
        Ok(listener)
    }

    fn connect(&self, endpoint: RdmaAddr) -> Result<RdmaConnection> {
        let RdmaAddr::Active(addr) = endpoint else {
            return Err(SlotlineError::os("connect", libc::EINVAL));
        };
        let stream = TcpStream::connect(addr).map_err(io_err("connect"))?;
        let mut conn = RdmaConnection::create(Arc::clone(&self.device), stream, Role::Active)?;
        conn.send_endpoint()?;
        // Blocks until the peer accepts.
        conn.recv_endpoint()?;
        tracing::info!(%addr, qpn = conn.local_endpoint().qp_num, "rdma: connected");
        Ok(conn)
    }

    fn get_request(&self, listener: &TcpListener) -> Result<RdmaConnection> {
        let (stream, peer) = listener.accept().map_err(io_err("accept"))?;
        let mut conn = RdmaConnection::create(Arc::clone(&self.device), stream, Role::Passive)?;
        conn.recv_endpoint()?;
        tracing::debug!(%peer, "rdma: connection request");
        Ok(conn)
    }

    fn accept(&self, conn: &mut RdmaConnection, params: &AcceptParams) -> Result<()> {
        conn.send_endpoint()?;
        tracing::info!(
            qpn = conn.local_endpoint().qp_num,
            initiator_depth = params.initiator_depth,
            responder_resources = params.responder_resources,
            rnr_retry = params.rnr_retry_count,
            "rdma: accepted"
        );
        Ok(())
    }
}
