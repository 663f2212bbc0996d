//! One reliable-connected queue pair with dedicated send and receive CQs,
//! plus the TCP side channel used to exchange endpoints with the peer.

use crate::device::{PORT_NUM, RdmaDevice};
use ibverbs_sys::{ibv_qp_state, ibv_qp_type, ibv_send_flags, ibv_wr_opcode};
use slotline::error::{Result, SlotlineError};
use slotline::pool::Region;
use slotline::transport::{
    Access, Connection, CqKind, Mtu, POLL_BATCH, QpState, QpTransition, Sge, WorkCompletion,
};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;

/// CQ depth; one send and one receive are outstanding at most.
const CQ_DEPTH: c_int = 16;

/// Queue-pair address handed to the peer over the side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaEndpoint {
    pub qp_num: u32,
    pub gid: [u8; 16],
}

pub(crate) const ENDPOINT_SIZE: usize = 20;

impl RdmaEndpoint {
    pub fn to_bytes(&self) -> [u8; ENDPOINT_SIZE] {
        let mut buf = [0u8; ENDPOINT_SIZE];
        buf[0..4].copy_from_slice(&self.qp_num.to_le_bytes());
        buf[4..20].copy_from_slice(&self.gid);
        buf
    }

    pub fn from_bytes(buf: &[u8; ENDPOINT_SIZE]) -> Self {
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[4..20]);
        Self {
            qp_num: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            gid,
        }
    }
}

/// Which side of the side channel this connection sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Active,
    Passive,
}

struct Registration {
    region: Region,
    mr: *mut ibverbs_sys::ibv_mr,
}

pub struct RdmaConnection {
    qp: *mut ibverbs_sys::ibv_qp,
    send_cq: *mut ibverbs_sys::ibv_cq,
    recv_cq: *mut ibverbs_sys::ibv_cq,
    registrations: Vec<Registration>,
    state: QpState,
    local: RdmaEndpoint,
    remote: Option<RdmaEndpoint>,
    role: Role,
    channel: TcpStream,
    device: Arc<RdmaDevice>,
}

unsafe impl Send for RdmaConnection {}

impl RdmaConnection {
    /// Create a queue pair in RESET bound to `channel`.
    pub(crate) fn create(device: Arc<RdmaDevice>, channel: TcpStream, role: Role) -> Result<Self> {
        channel.set_nodelay(true)?;
        unsafe {
            let send_cq =
                ibverbs_sys::ibv_create_cq(device.ctx, CQ_DEPTH, ptr::null_mut(), ptr::null_mut(), 0);
            if send_cq.is_null() {
                return Err(SlotlineError::last_os("ibv_create_cq"));
            }
            let recv_cq =
                ibverbs_sys::ibv_create_cq(device.ctx, CQ_DEPTH, ptr::null_mut(), ptr::null_mut(), 0);
            if recv_cq.is_null() {
                let err = SlotlineError::last_os("ibv_create_cq");
                ibverbs_sys::ibv_destroy_cq(send_cq);
                return Err(err);
            }

            let mut init_attr: ibverbs_sys::ibv_qp_init_attr = std::mem::zeroed();
            init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
            init_attr.send_cq = send_cq;
            init_attr.recv_cq = recv_cq;
            init_attr.cap.max_send_wr = 1;
            init_attr.cap.max_recv_wr = 1;
            init_attr.cap.max_send_sge = 1;
            init_attr.cap.max_recv_sge = 1;

            let qp = ibverbs_sys::ibv_create_qp(device.pd, &mut init_attr);
            if qp.is_null() {
                let err = SlotlineError::last_os("ibv_create_qp");
                ibverbs_sys::ibv_destroy_cq(recv_cq);
                ibverbs_sys::ibv_destroy_cq(send_cq);
                return Err(err);
            }

            let local = RdmaEndpoint {
                qp_num: (*qp).qp_num,
                gid: device.gid,
            };
            Ok(Self {
                qp,
                send_cq,
                recv_cq,
                registrations: Vec::new(),
                state: QpState::Reset,
                local,
                remote: None,
                role,
                channel,
                device,
            })
        }
    }

    pub fn local_endpoint(&self) -> RdmaEndpoint {
        self.local
    }

    pub fn remote_endpoint(&self) -> Option<RdmaEndpoint> {
        self.remote
    }

    pub(crate) fn send_endpoint(&mut self) -> Result<()> {
        self.channel.write_all(&self.local.to_bytes())?;
        Ok(())
    }

    pub(crate) fn recv_endpoint(&mut self) -> Result<()> {
        let mut buf = [0u8; ENDPOINT_SIZE];
        self.channel.read_exact(&mut buf)?;
        let remote = RdmaEndpoint::from_bytes(&buf);
        tracing::debug!(
            local_qpn = self.local.qp_num,
            remote_qpn = remote.qp_num,
            "rdma: endpoints exchanged"
        );
        self.remote = Some(remote);
        Ok(())
    }

    fn lkey(&self, sge: Sge) -> Result<u32> {
        self.registrations
            .iter()
            .find(|r| r.region.contains(sge.addr, sge.len as usize))
            .map(|r| unsafe { (*r.mr).lkey })
            .ok_or_else(|| SlotlineError::os("lkey lookup", libc::EINVAL))
    }

    fn raw_sge(&self, sge: Sge) -> Result<ibverbs_sys::ibv_sge> {
        let lkey = self.lkey(sge)?;
        let mut raw: ibverbs_sys::ibv_sge = unsafe { std::mem::zeroed() };
        raw.addr = sge.addr;
        raw.length = sge.len;
        raw.lkey = lkey;
        Ok(raw)
    }
}

impl Connection for RdmaConnection {
    unsafe fn register(&mut self, region: Region) -> Result<()> {
        let mr = unsafe {
            ibverbs_sys::ibv_reg_mr(
                self.device.pd,
                region.addr as *mut _,
                region.len,
                Access::all().bits() as c_int,
            )
        };
        if mr.is_null() {
            return Err(SlotlineError::last_os("ibv_reg_mr"));
        }
        self.registrations.push(Registration { region, mr });
        Ok(())
    }

    fn qp_state(&self) -> QpState {
        self.state
    }

    fn modify_qp(&mut self, transition: &QpTransition) -> Result<()> {
        let attrs = &transition.attrs;
        let rc = unsafe {
            let mut attr: ibverbs_sys::ibv_qp_attr = std::mem::zeroed();
            attr.qp_state = match transition.target {
                QpState::Reset => ibv_qp_state::IBV_QPS_RESET,
                QpState::Init => ibv_qp_state::IBV_QPS_INIT,
                QpState::ReadyToReceive => ibv_qp_state::IBV_QPS_RTR,
                QpState::ReadyToSend => ibv_qp_state::IBV_QPS_RTS,
                QpState::Error => ibv_qp_state::IBV_QPS_ERR,
            };
            attr.pkey_index = attrs.pkey_index;
            attr.port_num = attrs.port_num;
            attr.qp_access_flags = attrs.access.bits();
            attr.path_mtu = match attrs.path_mtu {
                Mtu::Mtu256 => ibverbs_sys::IBV_MTU_256,
                Mtu::Mtu512 => ibverbs_sys::IBV_MTU_512,
                Mtu::Mtu1024 => ibverbs_sys::IBV_MTU_1024,
                Mtu::Mtu2048 => ibverbs_sys::IBV_MTU_2048,
                Mtu::Mtu4096 => ibverbs_sys::IBV_MTU_4096,
            };
            attr.rq_psn = attrs.rq_psn;
            attr.max_dest_rd_atomic = attrs.max_dest_rd_atomic;
            attr.min_rnr_timer = attrs.min_rnr_timer;
            attr.sq_psn = attrs.sq_psn;
            attr.timeout = attrs.timeout;
            attr.retry_cnt = attrs.retry_cnt;
            attr.rnr_retry = attrs.rnr_retry;
            attr.max_rd_atomic = attrs.max_rd_atomic;

            if let Some(remote) = self.remote {
                attr.dest_qp_num = remote.qp_num;
                attr.ah_attr.is_global = 1;
                attr.ah_attr.grh.dgid.raw = remote.gid;
                attr.ah_attr.grh.sgid_index = 0;
                attr.ah_attr.grh.hop_limit = 64;
                attr.ah_attr.port_num = PORT_NUM;
            }

            ibverbs_sys::ibv_modify_qp(self.qp, &mut attr, transition.mask.bits() as c_int)
        };
        if rc != 0 {
            return Err(SlotlineError::os("ibv_modify_qp", rc));
        }
        self.state = transition.target;
        Ok(())
    }

    fn post_send(&mut self, sge: Sge, wr_id: u64) -> Result<()> {
        let mut raw = self.raw_sge(sge)?;
        let rc = unsafe {
            let mut wr: ibverbs_sys::ibv_send_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut raw;
            wr.num_sge = 1;
            wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
            wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

            let mut bad_wr: *mut ibverbs_sys::ibv_send_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let post = (*ctx)
                .ops
                .post_send
                .ok_or_else(|| SlotlineError::os("ibv_post_send", libc::EOPNOTSUPP))?;
            post(self.qp, &mut wr, &mut bad_wr)
        };
        if rc != 0 {
            return Err(SlotlineError::os("ibv_post_send", rc));
        }
        Ok(())
    }

    fn post_recv(&mut self, sge: Sge, wr_id: u64) -> Result<()> {
        let mut raw = self.raw_sge(sge)?;
        let rc = unsafe {
            let mut wr: ibverbs_sys::ibv_recv_wr = std::mem::zeroed();
            wr.wr_id = wr_id;
            wr.sg_list = &mut raw;
            wr.num_sge = 1;

            let mut bad_wr: *mut ibverbs_sys::ibv_recv_wr = ptr::null_mut();
            let ctx = (*self.qp).context;
            let post = (*ctx)
                .ops
                .post_recv
                .ok_or_else(|| SlotlineError::os("ibv_post_recv", libc::EOPNOTSUPP))?;
            post(self.qp, &mut wr, &mut bad_wr)
        };
        if rc != 0 {
            return Err(SlotlineError::os("ibv_post_recv", rc));
        }
        Ok(())
    }

    fn poll_cq(&mut self, cq: CqKind, completions: &mut [WorkCompletion]) -> Result<usize> {
        let cq = match cq {
            CqKind::Send => self.send_cq,
            CqKind::Recv => self.recv_cq,
        };
        let mut raw: [ibverbs_sys::ibv_wc; POLL_BATCH] =
            std::array::from_fn(|_| ibverbs_sys::ibv_wc::default());
        let want = completions.len().min(POLL_BATCH) as c_int;
        let n = unsafe {
            let ctx = (*self.qp).context;
            let poll = (*ctx)
                .ops
                .poll_cq
                .ok_or_else(|| SlotlineError::os("ibv_poll_cq", libc::EOPNOTSUPP))?;
            poll(cq, want, raw.as_mut_ptr())
        };
        if n < 0 {
            return Err(SlotlineError::os("ibv_poll_cq", libc::EIO));
        }
        let n = n as usize;
        for (out, wc) in completions.iter_mut().zip(&raw[..n]) {
            *out = WorkCompletion {
                wr_id: wc.wr_id(),
                status: wc.error().map_or(0, |(status, _vendor)| status as u32),
                byte_len: wc.len() as u32,
            };
        }
        Ok(n)
    }

    fn ready(&mut self) -> Result<()> {
        match self.role {
            Role::Passive => self.channel.write_all(&[1])?,
            Role::Active => {
                let mut byte = [0u8; 1];
                self.channel.read_exact(&mut byte)?;
            }
        }
        Ok(())
    }
}

impl Drop for RdmaConnection {
    fn drop(&mut self) {
        unsafe {
            if !self.qp.is_null() {
                ibverbs_sys::ibv_destroy_qp(self.qp);
            }
            if !self.send_cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.send_cq);
            }
            if !self.recv_cq.is_null() {
                ibverbs_sys::ibv_destroy_cq(self.recv_cq);
            }
            for reg in self.registrations.drain(..) {
                ibverbs_sys::ibv_dereg_mr(reg.mr);
            }
        }
    }
}
