//! Fixed-slot lock-free buffer pool over one registered memory region.
//!
//! The region is carved into `capacity` slots of `slot_size` bytes. Free
//! slots are chained through a parallel `next` array of indices, and the
//! chain head is swung with compare-and-swap. Every slot is, at any instant,
//! either on the free chain or owned by exactly one [`PooledSlot`].
//!
//! The head word packs the slot index with a generation counter that changes
//! on every successful swing. A thread that read `head = a` and `next[a] = b`
//! cannot install a stale `b` after `a` was popped and pushed back by others,
//! because the generation no longer matches.

use crate::error::{Result, SlotlineError};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Terminal marker for the free chain.
const NIL: u32 = u32::MAX;

/// Slots are carved from a page-aligned region so the whole pool can be
/// pinned and registered as one memory region.
pub const REGION_ALIGN: usize = 4096;

/// Address range of a pool's backing memory, as handed to the verb provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub addr: u64,
    pub len: usize,
}

impl Region {
    /// Whether `[addr, addr + len)` lies inside this region.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let Some(end) = addr.checked_add(len as u64) else {
            return false;
        };
        addr >= self.addr && end <= self.addr + self.len as u64
    }
}

pub struct BufferPool {
    base: NonNull<u8>,
    layout: Layout,
    slot_size: usize,
    capacity: u32,
    next: Box<[AtomicU32]>,
    /// `generation << 32 | index`; index is `NIL` when every slot is out.
    head: AtomicU64,
}

// Safety: the region is only reached through `PooledSlot`, which hands out
// each slot to one owner at a time; the free chain is all atomics.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

#[inline]
fn pack(index: u32, generation: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

impl BufferPool {
    /// Allocate a zeroed region of `slot_count` slots of `slot_size` bytes.
    ///
    /// All slots start on the free chain in index order.
    pub fn new(slot_size: usize, slot_count: usize) -> Result<Arc<Self>> {
        if slot_size == 0 || slot_count == 0 {
            return Err(SlotlineError::InvalidConfig(format!(
                "buffer pool needs non-zero slot size and count (got {slot_size} x {slot_count})"
            )));
        }
        if u32::try_from(slot_size).is_err() {
            return Err(SlotlineError::InvalidConfig(format!(
                "buffer pool slot size {slot_size} does not fit a work-request length"
            )));
        }
        if slot_count >= NIL as usize {
            return Err(SlotlineError::InvalidConfig(format!(
                "buffer pool slot count {slot_count} exceeds the index range"
            )));
        }
        let total = slot_size.checked_mul(slot_count).ok_or_else(|| {
            SlotlineError::InvalidConfig(format!(
                "buffer pool size overflows: {slot_size} x {slot_count}"
            ))
        })?;
        let layout = Layout::from_size_align(total, REGION_ALIGN)
            .map_err(|e| SlotlineError::InvalidConfig(format!("buffer pool layout: {e}")))?;

        // SAFETY: layout has non-zero size (both factors checked above).
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| SlotlineError::os("buffer pool allocation", libc::ENOMEM))?;

        let capacity = slot_count as u32;
        let next = (0..capacity)
            .map(|i| AtomicU32::new(if i + 1 < capacity { i + 1 } else { NIL }))
            .collect();

        Ok(Arc::new(Self {
            base,
            layout,
            slot_size,
            capacity,
            next,
            head: AtomicU64::new(pack(0, 0)),
        }))
    }

    /// Take a free slot, or `None` when the pool is drained.
    ///
    /// Never blocks. An empty pool is backpressure, not a failure.
    pub fn acquire(self: &Arc<Self>) -> Option<PooledSlot> {
        self.pop().map(|index| PooledSlot {
            pool: Arc::clone(self),
            index,
        })
    }

    fn pop(&self) -> Option<u32> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (index, generation) = unpack(current);
            if index == NIL {
                return None;
            }
            // May be stale if `index` is concurrently popped; the generation
            // check in the CAS rejects it in that case.
            let next = self.next[index as usize].load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                current,
                pack(next, generation.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => current = actual,
            }
        }
    }

    /// Put `index` back on the free chain.
    fn release(&self, index: u32) {
        debug_assert!(index < self.capacity);
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            let (head, generation) = unpack(current);
            self.next[index as usize].store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                current,
                pack(index, generation.wrapping_add(1)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Size of each slot in bytes.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Base address and length of the backing memory, for registration.
    pub fn region(&self) -> Region {
        Region {
            addr: self.base.as_ptr() as u64,
            len: self.layout.size(),
        }
    }

    /// Number of slots reachable from the free-chain head.
    ///
    /// Only exact while no other thread is acquiring or releasing.
    pub fn free_slots(&self) -> usize {
        let (mut index, _) = unpack(self.head.load(Ordering::Acquire));
        let mut count = 0;
        while index != NIL && count <= self.capacity() {
            count += 1;
            index = self.next[index as usize].load(Ordering::Relaxed);
        }
        count
    }

    fn slot_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: index < capacity, so the offset stays inside the allocation.
        unsafe { self.base.as_ptr().add(index as usize * self.slot_size) }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout. No `PooledSlot`
        // can outlive the pool since each holds an `Arc` to it.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("base", &self.base)
            .field("slot_size", &self.slot_size)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// One checked-out slot. Derefs to the slot's bytes and returns the slot to
/// its pool on drop, from whichever thread drops it.
pub struct PooledSlot {
    pool: Arc<BufferPool>,
    index: u32,
}

impl PooledSlot {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Address of the first byte, as used in scatter/gather entries.
    pub fn addr(&self) -> u64 {
        self.pool.slot_ptr(self.index) as u64
    }
}

impl Deref for PooledSlot {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: this handle is the slot's only owner until drop.
        unsafe { std::slice::from_raw_parts(self.pool.slot_ptr(self.index), self.pool.slot_size) }
    }
}

impl DerefMut for PooledSlot {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` rules out other borrows.
        unsafe {
            std::slice::from_raw_parts_mut(self.pool.slot_ptr(self.index), self.pool.slot_size)
        }
    }
}

impl Drop for PooledSlot {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl std::fmt::Debug for PooledSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSlot")
            .field("index", &self.index)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .finish()
    }
}
