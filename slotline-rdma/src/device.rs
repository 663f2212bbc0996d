//! RDMA device context: raw FFI device, protection domain and local GID.

use slotline::error::{Result, SlotlineError};
use std::os::raw::c_int;
use std::sync::Arc;

/// Port every queue pair is bound to.
pub(crate) const PORT_NUM: u8 = 1;

/// An opened RDMA device with one protection domain shared by every
/// connection created from it.
pub struct RdmaDevice {
    pub(crate) ctx: *mut ibverbs_sys::ibv_context,
    pub(crate) pd: *mut ibverbs_sys::ibv_pd,
    pub(crate) gid: [u8; 16],
}

unsafe impl Send for RdmaDevice {}
unsafe impl Sync for RdmaDevice {}

impl RdmaDevice {
    /// Open the device at `device_index` (first device when `None`).
    pub fn open(device_index: Option<usize>) -> Result<Arc<Self>> {
        unsafe {
            let mut num_devices: c_int = 0;
            let dev_list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
            if dev_list.is_null() || num_devices == 0 {
                if !dev_list.is_null() {
                    ibverbs_sys::ibv_free_device_list(dev_list);
                }
                return Err(SlotlineError::os("ibv_get_device_list", libc::ENODEV));
            }

            let idx = device_index.unwrap_or(0);
            if idx >= num_devices as usize {
                ibverbs_sys::ibv_free_device_list(dev_list);
                return Err(SlotlineError::os("ibv_get_device_list", libc::ENODEV));
            }

            let dev = *dev_list.add(idx);
            let ctx = ibverbs_sys::ibv_open_device(dev);
            ibverbs_sys::ibv_free_device_list(dev_list);
            if ctx.is_null() {
                return Err(SlotlineError::last_os("ibv_open_device"));
            }

            let pd = ibverbs_sys::ibv_alloc_pd(ctx);
            if pd.is_null() {
                let err = SlotlineError::last_os("ibv_alloc_pd");
                ibverbs_sys::ibv_close_device(ctx);
                return Err(err);
            }

            let mut gid: ibverbs_sys::ibv_gid = std::mem::zeroed();
            let rc = ibverbs_sys::ibv_query_gid(ctx, PORT_NUM, 0, &mut gid);
            if rc != 0 {
                ibverbs_sys::ibv_dealloc_pd(pd);
                ibverbs_sys::ibv_close_device(ctx);
                return Err(SlotlineError::os("ibv_query_gid", rc));
            }

            tracing::info!(device = idx, "rdma: device opened");
            Ok(Arc::new(Self {
                ctx,
                pd,
                gid: gid.raw,
            }))
        }
    }
}

impl Drop for RdmaDevice {
    fn drop(&mut self) {
        unsafe {
            if !self.pd.is_null() {
                ibverbs_sys::ibv_dealloc_pd(self.pd);
            }
            if !self.ctx.is_null() {
                ibverbs_sys::ibv_close_device(self.ctx);
            }
        }
    }
}
