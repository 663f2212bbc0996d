//! Wire frame: a packed 68-byte header followed by the payload, written
//! directly into a pool slot and transmitted verbatim.
//!
//! ```text
//! [0..2]   idx:12 | cmd:4  (u16 LE, idx in the low bits)
//! [2..4]   send_node_id: u16 LE
//! [4..6]   recv_node_id: u16 LE
//! [6]      request: u8 (0/1)
//! [7..11]  priority: i32 LE
//! [11..15] seq: i32 LE
//! [15..19] ver: i32 LE
//! [19..23] ver_sum: i32 LE
//! [23..27] block_id: u32 LE
//! [27..31] minibatch_size: u32 LE
//! [31..35] data_len: u32 LE
//! [35]     update: u8 (0/1)
//! [36..68] handle_id: [u8; 32]
//! [68..]   payload (data_len bytes)
//! ```

use crate::error::{Result, SlotlineError};
use crate::pool::{BufferPool, PooledSlot};
use std::sync::Arc;

/// Size of the wire header in bytes.
pub const HEADER_SIZE: usize = 68;

/// Largest value the 12-bit `idx` field holds.
pub const MAX_IDX: u16 = 0x0FFF;

/// Largest value the 4-bit `cmd` field holds.
pub const MAX_CMD: u8 = 0x0F;

/// Length of the opaque handle identifier.
pub const HANDLE_ID_LEN: usize = 32;

const DATA_LEN_OFFSET: usize = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Opaque slot index chosen by the application (12 bits).
    pub idx: u16,
    /// Command nibble (4 bits).
    pub cmd: u8,
    pub send_node_id: u16,
    pub recv_node_id: u16,
    pub request: bool,
    pub priority: i32,
    pub seq: i32,
    pub ver: i32,
    pub ver_sum: i32,
    pub block_id: u32,
    pub minibatch_size: u32,
    /// Payload bytes following the header.
    pub data_len: u32,
    pub update: bool,
    pub handle_id: [u8; HANDLE_ID_LEN],
}

impl FrameHeader {
    /// Encode into the first `HEADER_SIZE` bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < HEADER_SIZE {
            return Err(SlotlineError::InvalidFrame(format!(
                "buffer of {} bytes cannot hold a {HEADER_SIZE}-byte header",
                buf.len()
            )));
        }
        if self.idx > MAX_IDX {
            return Err(SlotlineError::InvalidFrame(format!(
                "idx {} does not fit in 12 bits",
                self.idx
            )));
        }
        if self.cmd > MAX_CMD {
            return Err(SlotlineError::InvalidFrame(format!(
                "cmd {} does not fit in 4 bits",
                self.cmd
            )));
        }

        let packed = self.idx | ((self.cmd as u16) << 12);
        buf[0..2].copy_from_slice(&packed.to_le_bytes());
        buf[2..4].copy_from_slice(&self.send_node_id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.recv_node_id.to_le_bytes());
        buf[6] = self.request as u8;
        buf[7..11].copy_from_slice(&self.priority.to_le_bytes());
        buf[11..15].copy_from_slice(&self.seq.to_le_bytes());
        buf[15..19].copy_from_slice(&self.ver.to_le_bytes());
        buf[19..23].copy_from_slice(&self.ver_sum.to_le_bytes());
        buf[23..27].copy_from_slice(&self.block_id.to_le_bytes());
        buf[27..31].copy_from_slice(&self.minibatch_size.to_le_bytes());
        buf[31..35].copy_from_slice(&self.data_len.to_le_bytes());
        buf[35] = self.update as u8;
        buf[36..68].copy_from_slice(&self.handle_id);
        Ok(())
    }

    /// Decode from the first `HEADER_SIZE` bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(SlotlineError::InvalidFrame(format!(
                "need {HEADER_SIZE} header bytes, got {}",
                buf.len()
            )));
        }
        Ok(Self::read(buf))
    }

    /// Decode without the length check. `buf` must hold a full header.
    fn read(buf: &[u8]) -> Self {
        let packed = u16_at(buf, 0);
        let mut handle_id = [0u8; HANDLE_ID_LEN];
        handle_id.copy_from_slice(&buf[36..68]);
        Self {
            idx: packed & MAX_IDX,
            cmd: (packed >> 12) as u8,
            send_node_id: u16_at(buf, 2),
            recv_node_id: u16_at(buf, 4),
            request: buf[6] != 0,
            priority: u32_at(buf, 7) as i32,
            seq: u32_at(buf, 11) as i32,
            ver: u32_at(buf, 15) as i32,
            ver_sum: u32_at(buf, 19) as i32,
            block_id: u32_at(buf, 23),
            minibatch_size: u32_at(buf, 27),
            data_len: u32_at(buf, DATA_LEN_OFFSET),
            update: buf[35] != 0,
            handle_id,
        }
    }
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// A frame living in one pool slot.
///
/// Shared as `Arc<Message>` between the application, the pumps and the
/// receive handler; when the last reference goes, the slot returns to its
/// pool.
pub struct Message {
    slot: PooledSlot,
}

impl Message {
    /// Start a fresh frame in `slot` with an all-zero header.
    pub fn from_slot(slot: PooledSlot) -> Result<Self> {
        let mut msg = Self::received(slot)?;
        msg.slot[..HEADER_SIZE].fill(0);
        Ok(msg)
    }

    /// Wrap a slot whose bytes already hold a frame, e.g. a completed receive.
    pub(crate) fn received(slot: PooledSlot) -> Result<Self> {
        if slot.len() < HEADER_SIZE {
            return Err(SlotlineError::InvalidFrame(format!(
                "slot of {} bytes cannot hold a {HEADER_SIZE}-byte header",
                slot.len()
            )));
        }
        Ok(Self { slot })
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader::read(&self.slot)
    }

    /// Write `header` into the slot. `data_len` must fit in the slot.
    pub fn set_header(&mut self, header: &FrameHeader) -> Result<()> {
        self.check_len(header.data_len as usize)?;
        header.encode_into(&mut self.slot)
    }

    /// Payload bytes as declared by `data_len`, clamped to the slot.
    pub fn payload(&self) -> &[u8] {
        &self.slot[HEADER_SIZE..HEADER_SIZE + self.data_len()]
    }

    /// The whole payload area, for building a payload in place before
    /// calling [`Message::set_data_len`].
    pub fn payload_area_mut(&mut self) -> &mut [u8] {
        &mut self.slot[HEADER_SIZE..]
    }

    /// Copy `bytes` into the payload area and set `data_len` to match.
    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_len(bytes.len())?;
        self.slot[HEADER_SIZE..HEADER_SIZE + bytes.len()].copy_from_slice(bytes);
        self.write_data_len(bytes.len());
        Ok(())
    }

    pub fn set_data_len(&mut self, len: usize) -> Result<()> {
        self.check_len(len)?;
        self.write_data_len(len);
        Ok(())
    }

    pub fn data_len(&self) -> usize {
        (u32_at(&self.slot, DATA_LEN_OFFSET) as usize).min(self.max_payload())
    }

    /// Largest payload this slot can carry.
    pub fn max_payload(&self) -> usize {
        self.slot.len() - HEADER_SIZE
    }

    /// Bytes put on the wire: header plus payload.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.data_len()
    }

    /// Address of the frame's first byte.
    pub fn addr(&self) -> u64 {
        self.slot.addr()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        self.slot.pool()
    }

    /// Give the slot back without returning it to the pool yet.
    pub fn into_slot(self) -> PooledSlot {
        self.slot
    }

    fn check_len(&self, len: usize) -> Result<()> {
        let max = self.max_payload();
        if len > max {
            return Err(SlotlineError::PayloadTooLarge { len, max });
        }
        Ok(())
    }

    fn write_data_len(&mut self, len: usize) {
        self.slot[DATA_LEN_OFFSET..DATA_LEN_OFFSET + 4].copy_from_slice(&(len as u32).to_le_bytes());
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("slot", &self.slot.index())
            .field("header", &self.header())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FrameHeader {
        FrameHeader {
            idx: 5,
            send_node_id: 1,
            recv_node_id: 2,
            request: true,
            seq: 42,
            data_len: 11,
            ..Default::default()
        }
    }

    #[test]
    fn test_frame_roundtrip_through_slot() {
        let pool = BufferPool::new(HEADER_SIZE + 64, 2).unwrap();
        let mut msg = Message::from_slot(pool.acquire().unwrap()).unwrap();
        msg.set_header(&sample_header()).unwrap();
        msg.write_payload(b"hello world").unwrap();

        // Reinterpret the same bytes as a received frame.
        let received = Message::received(msg.into_slot()).unwrap();
        let header = received.header();
        assert_eq!(header, sample_header());
        assert_eq!(header.data_len as usize, received.payload().len());
        assert_eq!(received.payload(), b"hello world");
    }

    #[test]
    fn test_field_offsets() {
        let header = FrameHeader {
            idx: 0x123,
            cmd: 0xA,
            send_node_id: 0x0102,
            recv_node_id: 0x0304,
            request: true,
            priority: -1,
            seq: 7,
            block_id: 0xDEADBEEF,
            data_len: 0x0A0B0C0D,
            update: true,
            handle_id: [0x77; HANDLE_ID_LEN],
            ..Default::default()
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut buf).unwrap();
        assert_eq!(&buf[0..2], &[0x23, 0xA1]);
        assert_eq!(&buf[2..6], &[0x02, 0x01, 0x04, 0x03]);
        assert_eq!(buf[6], 1);
        assert_eq!(&buf[7..11], &[0xFF; 4]);
        assert_eq!(&buf[11..15], &[7, 0, 0, 0]);
        assert_eq!(&buf[23..27], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&buf[31..35], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(buf[35], 1);
        assert!(buf[36..].iter().all(|&b| b == 0x77));
        assert_eq!(FrameHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_bitfield_limits() {
        let mut buf = [0u8; HEADER_SIZE];
        let too_wide_idx = FrameHeader {
            idx: MAX_IDX + 1,
            ..Default::default()
        };
        assert!(too_wide_idx.encode_into(&mut buf).is_err());
        let too_wide_cmd = FrameHeader {
            cmd: MAX_CMD + 1,
            ..Default::default()
        };
        assert!(too_wide_cmd.encode_into(&mut buf).is_err());
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert!(FrameHeader::decode(&[0u8; HEADER_SIZE - 1]).is_err());
        let mut small = [0u8; 10];
        assert!(sample_header().encode_into(&mut small).is_err());

        let pool = BufferPool::new(HEADER_SIZE - 1, 1).unwrap();
        assert!(Message::from_slot(pool.acquire().unwrap()).is_err());
    }

    #[test]
    fn test_payload_too_large() {
        let pool = BufferPool::new(HEADER_SIZE + 8, 1).unwrap();
        let mut msg = Message::from_slot(pool.acquire().unwrap()).unwrap();
        assert_eq!(msg.max_payload(), 8);
        let err = msg.write_payload(b"123456789").unwrap_err();
        assert!(matches!(err, SlotlineError::PayloadTooLarge { len: 9, max: 8 }));

        let header = FrameHeader {
            data_len: 9,
            ..Default::default()
        };
        assert!(msg.set_header(&header).is_err());
        msg.write_payload(b"12345678").unwrap();
        assert_eq!(msg.wire_len(), HEADER_SIZE + 8);
    }

    #[test]
    fn test_received_data_len_clamped() {
        let pool = BufferPool::new(HEADER_SIZE + 4, 1).unwrap();
        let mut slot = pool.acquire().unwrap();
        slot[DATA_LEN_OFFSET..DATA_LEN_OFFSET + 4].copy_from_slice(&1000u32.to_le_bytes());
        let msg = Message::received(slot).unwrap();
        assert_eq!(msg.header().data_len, 1000);
        assert_eq!(msg.payload().len(), 4);
    }

    #[test]
    fn test_from_slot_clears_stale_header() {
        let pool = BufferPool::new(HEADER_SIZE + 4, 1).unwrap();
        let mut slot = pool.acquire().unwrap();
        slot.fill(0xFF);
        let msg = Message::from_slot(slot).unwrap();
        assert_eq!(msg.header(), FrameHeader::default());
        assert_eq!(msg.data_len(), 0);
    }

    #[test]
    fn test_in_place_payload() {
        let pool = BufferPool::new(HEADER_SIZE + 16, 1).unwrap();
        let mut msg = Message::from_slot(pool.acquire().unwrap()).unwrap();
        msg.payload_area_mut()[..3].copy_from_slice(b"abc");
        msg.set_data_len(3).unwrap();
        assert_eq!(msg.payload(), b"abc");
        assert!(msg.set_data_len(17).is_err());
    }

    #[test]
    fn test_drop_returns_slot() {
        let pool = BufferPool::new(HEADER_SIZE, 1).unwrap();
        let msg = Arc::new(Message::from_slot(pool.acquire().unwrap()).unwrap());
        let clone = Arc::clone(&msg);
        drop(msg);
        assert!(pool.acquire().is_none());
        drop(clone);
        assert!(pool.acquire().is_some());
    }
}
