//! Segment memory layout definitions.
//!
//! This module defines the `repr(C)` structures that make up the shared
//! segment. The layouts are ABI: every field offset is observable by foreign
//! processes and must not change within a major format version.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Control block (128 bytes, cache-line aligned)                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Metadata region (4096 bytes, NUL-terminated JSON)              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Slot 0: FrameHeader (64 bytes) + pixel bytes                   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ...                                                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Slot N−1                                                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::ShmError;

/// Size of the control block in bytes (two cache lines; the trailing pad
/// keeps slot bytes off the hot line).
pub const CONTROL_BLOCK_SIZE: usize = 128;

/// Size of the JSON metadata region in bytes.
pub const METADATA_REGION_SIZE: usize = 4096;

/// Offset of slot 0 from the start of the segment.
pub const DATA_OFFSET: usize = CONTROL_BLOCK_SIZE + METADATA_REGION_SIZE;

/// Size of the binary frame header at the start of every slot.
pub const FRAME_HEADER_SIZE: usize = 64;

/// Control block at the start of the segment.
///
/// The single coordination point between the producer and all readers. The
/// producer publishes progress with release stores on `write_index`; readers
/// observe it with acquire loads. The sequential reader publishes `read_index`
/// the same way in the opposite direction. No field is protected by a lock
/// held across processes.
#[repr(C, align(64))]
pub struct ControlBlock {
    /// Next absolute slot index to be written. Producer store, reader load.
    pub write_index: AtomicU64,
    /// Next absolute slot index the sequential reader will consume.
    pub read_index: AtomicU64,
    /// Advisory count of unread slots (`write_index − read_index`).
    pub frame_count: AtomicU64,
    /// Lifetime count of published frames.
    pub total_frames_written: AtomicU64,
    /// Lifetime count of sequentially consumed frames.
    pub total_frames_read: AtomicU64,
    /// Frames refused or overwritten under backpressure.
    pub dropped_frames: AtomicU64,
    /// UNIX-epoch nanoseconds of the most recent publication.
    pub last_write_time_ns: AtomicU64,
    /// UNIX-epoch nanoseconds of the most recent sequential read.
    pub last_read_time_ns: AtomicU64,
    /// Byte offset of the metadata region. Fixed before `active` is set.
    pub metadata_offset: u64,
    /// Byte length of the metadata region. Fixed before `active` is set.
    pub metadata_size: u64,
    /// 0 until producer initialization completes, 1 afterwards, 0 again on
    /// orderly shutdown.
    pub active: AtomicU32,
    /// Reserved for protocol extensions.
    pub flags: AtomicU32,
    _pad: [u8; 40],
}

const _: () = assert!(core::mem::size_of::<ControlBlock>() == CONTROL_BLOCK_SIZE);
const _: () = assert!(core::mem::align_of::<ControlBlock>() == 64);

impl ControlBlock {
    /// Reset every counter and record the metadata region extent.
    ///
    /// Must only be called by the creator before any other process can
    /// observe the segment; `active` stays 0 until [`activate`](Self::activate).
    pub fn init(&mut self, metadata_offset: u64, metadata_size: u64) {
        self.write_index = AtomicU64::new(0);
        self.read_index = AtomicU64::new(0);
        self.frame_count = AtomicU64::new(0);
        self.total_frames_written = AtomicU64::new(0);
        self.total_frames_read = AtomicU64::new(0);
        self.dropped_frames = AtomicU64::new(0);
        self.last_write_time_ns = AtomicU64::new(0);
        self.last_read_time_ns = AtomicU64::new(0);
        self.metadata_offset = metadata_offset;
        self.metadata_size = metadata_size;
        self.active = AtomicU32::new(0);
        self.flags = AtomicU32::new(0);
        self._pad = [0; 40];
    }

    /// Mark the segment ready. Release-ordered so that attachers observing
    /// `active == 1` also observe the initialized geometry fields.
    pub fn activate(&self) {
        self.active.store(1, Ordering::Release);
    }

    /// Mark the segment torn down (orderly shutdown).
    pub fn deactivate(&self) {
        self.active.store(0, Ordering::Release);
    }

    /// Whether the producer has completed initialization.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }
}

/// Binary frame header stored at the base of every slot.
///
/// 64 bytes, naturally aligned, little-endian on supported platforms.
/// `sequence_number` equals the absolute ring counter of the write that
/// produced the slot; readers use it to detect slots overwritten under them.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Producer-assigned frame identifier.
    pub frame_id: u64,
    /// Capture timestamp, UNIX-epoch nanoseconds.
    pub timestamp_ns: u64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bytes per pixel.
    pub bytes_per_pixel: u32,
    /// Payload length in bytes (≤ `slot_size − FRAME_HEADER_SIZE`).
    pub data_size: u32,
    /// Pixel format code, see [`PixelFormat`](crate::frame::PixelFormat).
    pub format_code: u32,
    /// Frame flag bits, see [`FrameFlags`](crate::frame::FrameFlags).
    pub flags: u32,
    /// Absolute ring counter for this write.
    pub sequence_number: u64,
    /// Reserved for per-frame metadata (0 for now).
    pub metadata_offset: u32,
    /// Reserved for per-frame metadata (0 for now).
    pub metadata_size: u32,
    _pad: [u8; 8],
}

const _: () = assert!(core::mem::size_of::<FrameHeader>() == FRAME_HEADER_SIZE);
const _: () = assert!(core::mem::align_of::<FrameHeader>() == 8);

impl FrameHeader {
    /// A zeroed header (slot never written).
    pub fn zeroed() -> Self {
        Self {
            frame_id: 0,
            timestamp_ns: 0,
            width: 0,
            height: 0,
            bytes_per_pixel: 0,
            data_size: 0,
            format_code: 0,
            flags: 0,
            sequence_number: 0,
            metadata_offset: 0,
            metadata_size: 0,
            _pad: [0; 8],
        }
    }
}

/// Round `value` up to the next multiple of 64.
#[inline]
pub const fn align64(value: usize) -> usize {
    (value + 63) & !63
}

/// Fixed slot geometry of a segment.
///
/// Computed once at create time (and recorded in the metadata region), or
/// recovered from metadata on attach. Slot addressing never changes after
/// creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentGeometry {
    /// Total mapped bytes.
    pub segment_size: usize,
    /// Offset of slot 0.
    pub data_offset: usize,
    /// Bytes per slot (header + pixel capacity), 64-byte aligned.
    pub slot_size: usize,
    /// Number of slots.
    pub slot_count: u64,
}

impl SegmentGeometry {
    /// Compute the geometry for a new segment.
    ///
    /// `max_frame_size` is the producer's slot-size hint: the largest payload
    /// a slot must hold. `max_frames`, when given, caps the slot count below
    /// what the segment could fit.
    pub fn for_create(
        segment_size: usize,
        max_frame_size: usize,
        max_frames: Option<u64>,
    ) -> Result<Self, ShmError> {
        let slot_size = align64(FRAME_HEADER_SIZE + max_frame_size);
        let minimum = DATA_OFFSET + slot_size;
        let available = segment_size
            .checked_sub(DATA_OFFSET)
            .ok_or(ShmError::InvalidSize {
                required: minimum,
                actual: segment_size,
            })?;
        let mut slot_count = (available / slot_size) as u64;
        if let Some(cap) = max_frames {
            slot_count = slot_count.min(cap);
        }
        if slot_count == 0 {
            return Err(ShmError::InvalidSize {
                required: minimum,
                actual: segment_size,
            });
        }
        Ok(Self {
            segment_size,
            data_offset: DATA_OFFSET,
            slot_size,
            slot_count,
        })
    }

    /// Rebuild the geometry an attacher learned from the metadata region,
    /// checking it against the actual mapping size.
    pub fn from_metadata(
        segment_size: usize,
        data_offset: usize,
        slot_size: usize,
        slot_count: u64,
    ) -> Result<Self, ShmError> {
        if slot_size < FRAME_HEADER_SIZE || slot_count == 0 {
            return Err(ShmError::Internal("metadata describes degenerate slots"));
        }
        let end = (slot_count as usize)
            .checked_mul(slot_size)
            .and_then(|bytes| bytes.checked_add(data_offset));
        match end {
            Some(end) if end <= segment_size => Ok(Self {
                segment_size,
                data_offset,
                slot_size,
                slot_count,
            }),
            _ => Err(ShmError::Internal("slots address past segment end")),
        }
    }

    /// Byte offset of the slot holding absolute index `index`.
    #[inline]
    pub fn slot_offset(&self, index: u64) -> usize {
        self.data_offset + (index % self.slot_count) as usize * self.slot_size
    }

    /// Largest payload a slot can hold.
    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.slot_size - FRAME_HEADER_SIZE
    }
}
