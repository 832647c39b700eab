//! Shared-memory ring buffer transport for high-rate medical imaging frames.
//!
//! One producer process writes ultrasound video frames into a named shared
//! segment; any number of consumer processes, in any language, read them with
//! zero copying against a fixed, versioned binary layout. Cross-process
//! coordination is a single cache-line-aligned control block of atomics;
//! geometry discovery is a human-readable JSON region; every wait is a
//! bounded short sleep.
//!
//! Unix only (POSIX shm, System V shm, mmap-backed files, huge pages).
#![forbid(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod layout;
pub mod metadata;
pub mod registry;
pub mod shm;
pub mod stats;
pub mod watcher;

pub use buffer::FrameBuffer;
pub use config::{BackendKind, SegmentOptions, DEFAULT_MAX_FRAME_SIZE, DEFAULT_SEGMENT_SIZE};
pub use error::{ShmError, StatusCode};
pub use frame::{FrameFlags, FrameRecord, FrameView, PixelFormat};
pub use layout::{ControlBlock, FrameHeader, SegmentGeometry, FRAME_HEADER_SIZE};
pub use metadata::{LastFrameMeta, SegmentMetadata, FORMAT_VERSION, SEGMENT_TYPE};
pub use registry::SegmentRegistry;
pub use shm::SharedSegment;
pub use stats::BufferStats;
pub use watcher::{FrameCallback, FrameWatcher, WatcherOptions};
