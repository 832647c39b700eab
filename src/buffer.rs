//! The frame ring buffer: producer publication and reader consumption.
//!
//! One producer process creates the segment and advances `write_index`; any
//! number of latest-frame readers and at most one sequential reader attach to
//! it. All coordination happens through the control block atomics with
//! release/acquire pairing at publication and consumption points; waits are
//! bounded short sleeps, never cross-process locks.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::config::SegmentOptions;
use crate::error::ShmError;
use crate::frame::{FrameFlags, FrameRecord, FrameView, PixelFormat};
use crate::layout::{
    ControlBlock, FrameHeader, SegmentGeometry, CONTROL_BLOCK_SIZE, DATA_OFFSET,
    FRAME_HEADER_SIZE, METADATA_REGION_SIZE,
};
use crate::metadata::SegmentMetadata;
use crate::shm::SharedSegment;
use crate::stats::{BufferStats, StatsRecorder};

/// Granularity of the producer's full-buffer wait.
const WRITE_POLL: Duration = Duration::from_millis(1);

/// Granularity of the sequential reader's empty-buffer wait.
const READ_POLL: Duration = Duration::from_millis(1);

/// Granularity of the attach wait for `active`.
const ATTACH_POLL: Duration = Duration::from_millis(10);

/// Bound on the attach wait before giving up on an inactive segment.
const ATTACH_WAIT: Duration = Duration::from_secs(1);

/// Attempts to sample a stable latest frame before reporting failure.
const LATEST_RETRIES: usize = 8;

/// UNIX-epoch nanoseconds from the system wall clock.
///
/// The segment is shared with foreign processes, so every cross-process
/// timestamp uses the wall clock; the monotonic clock stays process-local
/// (statistics only).
pub(crate) fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A handle to a shared frame ring.
///
/// The creator owns segment initialization and teardown; attachers map the
/// same bytes and follow the control block. All methods take `&self`: the
/// shared state is the segment itself.
pub struct FrameBuffer {
    segment: SharedSegment,
    geometry: SegmentGeometry,
    options: SegmentOptions,
    stats: StatsRecorder,
    /// Producer-side cache of the metadata document, so per-frame updates do
    /// not reparse the region.
    meta: Mutex<Option<SegmentMetadata>>,
}

impl FrameBuffer {
    /// Create (producer) or attach (consumer) per `options.create`.
    pub fn open(options: SegmentOptions) -> Result<Self, ShmError> {
        if options.create {
            Self::create(options)
        } else {
            Self::attach(options)
        }
    }

    /// Create the segment, initialize the control block and metadata region,
    /// and activate it.
    pub fn create(options: SegmentOptions) -> Result<Self, ShmError> {
        options.validate()?;
        // Fail fast on impossible geometry before touching the namespace.
        SegmentGeometry::for_create(options.size, options.max_frame_size, options.max_frames)?;

        let segment = SharedSegment::create_or_open(
            &options.name,
            options.size,
            options.backend,
            true,
            options.file_path.as_deref(),
        )?;
        // Huge-page rounding may have grown the mapping; geometry follows the
        // actual extent.
        let geometry =
            SegmentGeometry::for_create(segment.len(), options.max_frame_size, options.max_frames)?;

        if options.lock_in_memory {
            if let Err(err) = segment.lock_in_memory() {
                tracing::warn!(%err, name = %options.name, "could not pin segment in RAM");
            }
        }

        unsafe {
            std::ptr::write_bytes(segment.as_ptr(), 0, DATA_OFFSET);
            let control = &mut *(segment.as_ptr() as *mut ControlBlock);
            control.init(CONTROL_BLOCK_SIZE as u64, METADATA_REGION_SIZE as u64);
        }

        let meta = SegmentMetadata::new(&geometry, PixelFormat::Yuv422, unix_now_ns());
        let buffer = Self {
            segment,
            geometry,
            options,
            stats: StatsRecorder::new(),
            meta: Mutex::new(Some(meta)),
        };
        {
            let guard = buffer.meta.lock();
            let meta = guard.as_ref().expect("metadata cache initialized above");
            meta.write_into(unsafe { buffer.metadata_region_mut() })?;
        }

        buffer.control_block().activate();
        tracing::debug!(
            name = %buffer.options.name,
            backend = %buffer.options.backend,
            slots = buffer.geometry.slot_count,
            slot_size = buffer.geometry.slot_size,
            "segment created"
        );
        Ok(buffer)
    }

    /// Attach to an existing segment, waiting (bounded) for the producer to
    /// finish initialization, then recover the geometry from metadata.
    pub fn attach(options: SegmentOptions) -> Result<Self, ShmError> {
        options.validate()?;
        let segment = SharedSegment::create_or_open(
            &options.name,
            0,
            options.backend,
            false,
            options.file_path.as_deref(),
        )?;
        if segment.len() < DATA_OFFSET + FRAME_HEADER_SIZE {
            return Err(ShmError::InvalidSize {
                required: DATA_OFFSET + FRAME_HEADER_SIZE,
                actual: segment.len(),
            });
        }

        let control = unsafe { &*(segment.as_ptr() as *const ControlBlock) };
        let attach_started = Instant::now();
        while !control.is_active() {
            if attach_started.elapsed() >= ATTACH_WAIT {
                return Err(ShmError::Internal("segment never became active"));
            }
            thread::sleep(ATTACH_POLL);
        }

        let geometry = match Self::geometry_from_metadata(&segment, control) {
            Ok(geometry) => geometry,
            Err(err) => {
                tracing::warn!(
                    %err,
                    name = %options.name,
                    "metadata unusable, falling back to default geometry"
                );
                SegmentGeometry::for_create(segment.len(), options.max_frame_size, None)?
            }
        };

        if options.lock_in_memory {
            if let Err(err) = segment.lock_in_memory() {
                tracing::warn!(%err, name = %options.name, "could not pin segment in RAM");
            }
        }

        Ok(Self {
            segment,
            geometry,
            options,
            stats: StatsRecorder::new(),
            meta: Mutex::new(None),
        })
    }

    fn geometry_from_metadata(
        segment: &SharedSegment,
        control: &ControlBlock,
    ) -> Result<SegmentGeometry, ShmError> {
        let offset = control.metadata_offset as usize;
        let size = control.metadata_size as usize;
        let (offset, size) = if size == 0
            || offset.checked_add(size).map_or(true, |end| end > segment.len())
        {
            // Control block describes a bogus extent; try the fixed location.
            (CONTROL_BLOCK_SIZE, METADATA_REGION_SIZE)
        } else {
            (offset, size)
        };
        let region = unsafe { std::slice::from_raw_parts(segment.as_ptr().add(offset), size) };
        let meta = SegmentMetadata::read_from(region)?;
        meta.check_version()?;
        SegmentGeometry::from_metadata(
            segment.len(),
            meta.data_offset as usize,
            meta.frame_slot_size as usize,
            meta.max_frames,
        )
    }

    // =========================================================================
    // Producer path
    // =========================================================================

    /// Publish one frame.
    ///
    /// When the ring is full the configured policy applies: refuse and count
    /// (`drop_when_full`) or overwrite the oldest slot, advancing the
    /// sequential reader past it. Returns the sequence number of the write.
    pub fn write_frame(&self, frame: &FrameRecord<'_>) -> Result<u64, ShmError> {
        self.publish(frame, None)
    }

    /// Publish one frame, waiting up to `timeout` for space when the ring is
    /// full. On expiry the frame is dropped and counted.
    pub fn write_frame_timeout(
        &self,
        frame: &FrameRecord<'_>,
        timeout: Duration,
    ) -> Result<u64, ShmError> {
        self.publish(frame, Some(timeout))
    }

    fn publish(
        &self,
        frame: &FrameRecord<'_>,
        timeout: Option<Duration>,
    ) -> Result<u64, ShmError> {
        let started = Instant::now();
        if frame.data.is_empty() {
            return Err(ShmError::InvalidFrame("empty pixel payload"));
        }
        let max = self.geometry.max_data_size();
        if frame.data.len() > max {
            return Err(ShmError::FrameTooLarge {
                len: frame.data.len(),
                max,
            });
        }

        let control = self.control_block();
        if !control.is_active() {
            return Err(ShmError::NotInitialized);
        }

        let slot_count = self.geometry.slot_count;
        let write_index = control.write_index.load(Ordering::Relaxed);

        loop {
            let read_index = control.read_index.load(Ordering::Acquire);
            let pending = write_index.saturating_sub(read_index);
            if pending < slot_count {
                break;
            }
            match timeout {
                Some(limit) => {
                    if started.elapsed() >= limit {
                        control.dropped_frames.fetch_add(1, Ordering::Relaxed);
                        self.stats.record_buffer_full();
                        return Err(ShmError::BufferFull);
                    }
                    thread::sleep(WRITE_POLL);
                }
                None if self.options.drop_when_full => {
                    control.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    self.stats.record_buffer_full();
                    return Err(ShmError::BufferFull);
                }
                None => {
                    // Ring mode: push the oldest slot out from under the
                    // sequential reader and take its place.
                    let target = write_index - slot_count + 1;
                    let previous = control.read_index.fetch_max(target, Ordering::AcqRel);
                    if previous < target {
                        control
                            .dropped_frames
                            .fetch_add(target - previous, Ordering::Relaxed);
                    }
                    self.stats.record_buffer_full();
                    break;
                }
            }
        }

        let slot = unsafe { self.slot_ptr(write_index) };
        let pixels = unsafe { slot.add(FRAME_HEADER_SIZE) };

        let mut flags = frame.flags;
        let in_place = std::ptr::eq(frame.data.as_ptr(), pixels as *const u8);
        if in_place {
            flags |= FrameFlags::IN_SEGMENT;
        }

        let mut header = FrameHeader::zeroed();
        header.frame_id = frame.frame_id;
        header.timestamp_ns = frame.timestamp_ns;
        header.width = frame.width;
        header.height = frame.height;
        header.bytes_per_pixel = frame.bytes_per_pixel;
        header.data_size = frame.data.len() as u32;
        header.format_code = frame.format.code();
        header.flags = flags.bits();
        header.sequence_number = write_index;

        // Slot contents must be complete before the index advances.
        unsafe {
            std::ptr::write_volatile(slot as *mut FrameHeader, header);
            if !in_place {
                if self.segment.contains(frame.data.as_ptr()) {
                    // Source aliases the mapping (possibly this very slot);
                    // the ranges may overlap.
                    std::ptr::copy(frame.data.as_ptr(), pixels, frame.data.len());
                } else {
                    std::ptr::copy_nonoverlapping(frame.data.as_ptr(), pixels, frame.data.len());
                }
            }
        }

        let next = write_index + 1;
        control.write_index.store(next, Ordering::Release);
        control.total_frames_written.fetch_add(1, Ordering::Relaxed);
        let read_index = control.read_index.load(Ordering::Relaxed);
        let occupancy = next.saturating_sub(read_index).min(slot_count);
        control.frame_count.store(occupancy, Ordering::Relaxed);
        control
            .last_write_time_ns
            .store(unix_now_ns(), Ordering::Release);

        if self.options.enable_metadata {
            self.update_last_frame(&header);
        }
        self.stats
            .record_write(started.elapsed(), frame.data.len(), occupancy);
        Ok(write_index)
    }

    fn update_last_frame(&self, header: &FrameHeader) {
        let mut guard = self.meta.lock();
        if let Some(meta) = guard.as_mut() {
            meta.frame_format = PixelFormat::from_code(header.format_code).name().to_string();
            meta.set_last_frame(header);
            if let Err(err) = meta.write_into(unsafe { self.metadata_region_mut() }) {
                tracing::warn!(%err, "metadata region update failed, keeping previous document");
            }
        }
    }

    /// Pixel staging area of the slot the next `write_frame` will fill.
    ///
    /// Filling this slice and publishing a [`FrameRecord`] whose `data`
    /// borrows it skips the copy; the published header carries
    /// [`FrameFlags::IN_SEGMENT`].
    ///
    /// # Safety
    /// Only the single producer may call this, and the slice must not be
    /// held across any operation other than the publication that consumes it.
    pub unsafe fn staging_slot(&self) -> &mut [u8] {
        let write_index = self.control_block().write_index.load(Ordering::Relaxed);
        let pixels = unsafe { self.slot_ptr(write_index).add(FRAME_HEADER_SIZE) };
        unsafe { std::slice::from_raw_parts_mut(pixels, self.geometry.max_data_size()) }
    }

    // =========================================================================
    // Reader paths
    // =========================================================================

    /// Sample the most recently published frame without consuming it.
    ///
    /// Repeated calls with no intervening write return header-equal views.
    /// The view stays valid only until the producer laps the slot; a slot
    /// that changes while being sampled is discarded and re-sampled.
    pub fn read_latest_frame(&self) -> Result<FrameView<'_>, ShmError> {
        let control = self.control_block();
        for _ in 0..LATEST_RETRIES {
            let write_index = control.write_index.load(Ordering::Acquire);
            if write_index == 0 {
                return Err(ShmError::BufferEmpty);
            }
            let latest = write_index - 1;
            let header = unsafe { self.header_at(latest) };
            if header.sequence_number != latest {
                self.stats.record_overrun(1);
                continue;
            }
            let data = match unsafe { self.pixels_at(latest, &header) } {
                Ok(data) => data,
                Err(err) => return Err(err),
            };
            // The slot may have been overwritten while we copied the header;
            // a stale view must never escape.
            if unsafe { self.header_at(latest) }.sequence_number != latest {
                self.stats.record_overrun(1);
                continue;
            }
            return Ok(FrameView::new(header, data));
        }
        Err(ShmError::ReadFailed("latest slot kept changing under the reader"))
    }

    /// Consume the next unread frame in publication order.
    ///
    /// With a zero `wait` an empty ring returns `BufferEmpty` immediately;
    /// otherwise the reader sleep-polls until the deadline and returns
    /// `Timeout` with no side effects. A reader that has been lapped
    /// resynchronizes to the oldest slot still live and counts the skip in
    /// its local statistics.
    pub fn read_next_frame(&self, wait: Duration) -> Result<FrameView<'_>, ShmError> {
        let started = Instant::now();
        let control = self.control_block();
        let slot_count = self.geometry.slot_count;

        loop {
            let read_index = control.read_index.load(Ordering::Relaxed);
            let write_index = control.write_index.load(Ordering::Acquire);

            if read_index >= write_index {
                if wait.is_zero() {
                    return Err(ShmError::BufferEmpty);
                }
                if started.elapsed() >= wait {
                    return Err(ShmError::Timeout);
                }
                thread::sleep(READ_POLL);
                continue;
            }

            let mut index = read_index;
            if write_index - read_index > slot_count {
                // Lapped: jump to the oldest slot the producer has not
                // reclaimed yet.
                let oldest = write_index - slot_count;
                let previous = control.read_index.fetch_max(oldest, Ordering::AcqRel);
                if previous < oldest {
                    self.stats.record_overrun(oldest - previous);
                }
                index = oldest.max(previous);
            }

            let header = unsafe { self.header_at(index) };
            if header.sequence_number != index {
                // Slot overwritten between our index loads; resample.
                self.stats.record_overrun(1);
                continue;
            }
            let data = unsafe { self.pixels_at(index, &header)? };
            if unsafe { self.header_at(index) }.sequence_number != index {
                self.stats.record_overrun(1);
                continue;
            }

            control.read_index.fetch_max(index + 1, Ordering::AcqRel);
            let _ = control
                .frame_count
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                    Some(count.saturating_sub(1))
                });
            control.total_frames_read.fetch_add(1, Ordering::Relaxed);
            control
                .last_read_time_ns
                .store(unix_now_ns(), Ordering::Release);
            self.stats.record_read(started.elapsed());
            return Ok(FrameView::new(header, data));
        }
    }

    // =========================================================================
    // Metadata and statistics
    // =========================================================================

    /// Parse the current metadata document from the segment.
    pub fn metadata(&self) -> Result<SegmentMetadata, ShmError> {
        let region = unsafe { self.metadata_region() };
        SegmentMetadata::read_from(region)
    }

    /// Replace the metadata document. Oversize documents are rejected and
    /// the previous content stays intact.
    pub fn set_metadata(&self, meta: &SegmentMetadata) -> Result<(), ShmError> {
        meta.write_into(unsafe { self.metadata_region_mut() })?;
        let mut guard = self.meta.lock();
        if guard.is_some() {
            *guard = Some(meta.clone());
        }
        Ok(())
    }

    /// Snapshot of this handle's operation statistics.
    pub fn stats(&self) -> BufferStats {
        self.stats.snapshot()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Mapped segment size in bytes.
    pub fn size(&self) -> usize {
        self.segment.len()
    }

    /// Fixed slot geometry.
    pub fn geometry(&self) -> &SegmentGeometry {
        &self.geometry
    }

    /// Number of slots in the ring.
    pub fn slot_count(&self) -> u64 {
        self.geometry.slot_count
    }

    /// Bytes per slot.
    pub fn slot_size(&self) -> usize {
        self.geometry.slot_size
    }

    /// Whether this handle created the segment.
    pub fn is_creator(&self) -> bool {
        self.segment.is_creator()
    }

    /// Whether the producer currently marks the segment active.
    pub fn is_active(&self) -> bool {
        self.control_block().is_active()
    }

    /// Unread frames currently pending for the sequential reader.
    pub fn occupancy(&self) -> u64 {
        let control = self.control_block();
        let write_index = control.write_index.load(Ordering::Acquire);
        let read_index = control.read_index.load(Ordering::Acquire);
        write_index.saturating_sub(read_index).min(self.geometry.slot_count)
    }

    /// The shared control block.
    pub fn control_block(&self) -> &ControlBlock {
        unsafe { &*(self.segment.as_ptr() as *const ControlBlock) }
    }

    /// Flip `active` off ahead of teardown so readers observe an orderly
    /// shutdown rather than a stalled producer.
    pub fn shutdown(&self) {
        if self.segment.is_creator() {
            self.control_block().deactivate();
        }
    }

    // =========================================================================
    // Raw segment access
    // =========================================================================

    unsafe fn slot_ptr(&self, index: u64) -> *mut u8 {
        unsafe { self.segment.as_ptr().add(self.geometry.slot_offset(index)) }
    }

    unsafe fn header_at(&self, index: u64) -> FrameHeader {
        unsafe { std::ptr::read_volatile(self.slot_ptr(index) as *const FrameHeader) }
    }

    /// Pixel slice of slot `index` as described by `header`, bounds-checked
    /// against the slot capacity.
    unsafe fn pixels_at(&self, index: u64, header: &FrameHeader) -> Result<&[u8], ShmError> {
        let len = header.data_size as usize;
        if len > self.geometry.max_data_size() {
            return Err(ShmError::ReadFailed("header data_size exceeds slot capacity"));
        }
        let pixels = unsafe { self.slot_ptr(index).add(FRAME_HEADER_SIZE) };
        Ok(unsafe { std::slice::from_raw_parts(pixels, len) })
    }

    /// The metadata region bytes.
    ///
    /// # Safety
    /// The producer may be rewriting the region concurrently; callers must
    /// tolerate torn documents (the JSON parse will fail, not corrupt).
    unsafe fn metadata_region(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.segment.as_ptr().add(CONTROL_BLOCK_SIZE),
                METADATA_REGION_SIZE,
            )
        }
    }

    /// # Safety
    /// Only the producer writes the region, and only from one thread.
    #[allow(clippy::mut_from_ref)]
    unsafe fn metadata_region_mut(&self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.segment.as_ptr().add(CONTROL_BLOCK_SIZE),
                METADATA_REGION_SIZE,
            )
        }
    }

}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("name", &self.options.name)
            .field("backend", &self.options.backend)
            .field("size", &self.segment.len())
            .field("slot_count", &self.geometry.slot_count)
            .field("slot_size", &self.geometry.slot_size)
            .field("creator", &self.segment.is_creator())
            .finish()
    }
}
