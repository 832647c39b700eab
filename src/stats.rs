//! Per-segment operation statistics.
//!
//! Latencies are sampled with the process-local monotonic clock and folded
//! into a running average and max. Everything lives behind one local mutex;
//! nothing here crosses the segment boundary (the cross-process counters are
//! the control block's job).

use std::time::Duration;

use parking_lot::Mutex;

/// Snapshot of a segment handle's statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Frames this handle published.
    pub frames_written: u64,
    /// Frames this handle consumed sequentially.
    pub frames_read: u64,
    /// Running average publication latency, nanoseconds.
    pub avg_write_latency_ns: u64,
    /// Worst publication latency, nanoseconds.
    pub max_write_latency_ns: u64,
    /// Running average sequential-read latency, nanoseconds.
    pub avg_read_latency_ns: u64,
    /// Worst sequential-read latency, nanoseconds.
    pub max_read_latency_ns: u64,
    /// Running average payload size, bytes.
    pub avg_frame_bytes: u64,
    /// Highest observed occupancy (`write_index − read_index`).
    pub peak_occupancy: u64,
    /// Times the ring was observed full at publication.
    pub buffer_full_events: u64,
    /// Times this reader was lapped and had to resynchronize.
    pub reader_overruns: u64,
}

#[derive(Default)]
struct LatencyTrack {
    count: u64,
    total_ns: u128,
    max_ns: u64,
}

impl LatencyTrack {
    fn record(&mut self, latency: Duration) {
        let ns = latency.as_nanos();
        self.count += 1;
        self.total_ns += ns;
        self.max_ns = self.max_ns.max(ns as u64);
    }

    fn average(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            (self.total_ns / self.count as u128) as u64
        }
    }
}

#[derive(Default)]
struct StatsInner {
    write: LatencyTrack,
    read: LatencyTrack,
    payload_bytes_total: u128,
    peak_occupancy: u64,
    buffer_full_events: u64,
    reader_overruns: u64,
}

/// Accumulator owned by each segment handle.
pub(crate) struct StatsRecorder {
    inner: Mutex<StatsInner>,
}

impl StatsRecorder {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner::default()),
        }
    }

    pub(crate) fn record_write(&self, latency: Duration, payload_bytes: usize, occupancy: u64) {
        let mut inner = self.inner.lock();
        inner.write.record(latency);
        inner.payload_bytes_total += payload_bytes as u128;
        inner.peak_occupancy = inner.peak_occupancy.max(occupancy);
    }

    pub(crate) fn record_read(&self, latency: Duration) {
        self.inner.lock().read.record(latency);
    }

    pub(crate) fn record_buffer_full(&self) {
        self.inner.lock().buffer_full_events += 1;
    }

    pub(crate) fn record_overrun(&self, skipped: u64) {
        self.inner.lock().reader_overruns += skipped;
    }

    /// Consistent snapshot of all counters.
    pub(crate) fn snapshot(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            frames_written: inner.write.count,
            frames_read: inner.read.count,
            avg_write_latency_ns: inner.write.average(),
            max_write_latency_ns: inner.write.max_ns,
            avg_read_latency_ns: inner.read.average(),
            max_read_latency_ns: inner.read.max_ns,
            avg_frame_bytes: if inner.write.count == 0 {
                0
            } else {
                (inner.payload_bytes_total / inner.write.count as u128) as u64
            },
            peak_occupancy: inner.peak_occupancy,
            buffer_full_events: inner.buffer_full_events,
            reader_overruns: inner.reader_overruns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_is_zero() {
        let recorder = StatsRecorder::new();
        assert_eq!(recorder.snapshot(), BufferStats::default());
    }

    #[test]
    fn write_latency_average_and_max() {
        let recorder = StatsRecorder::new();
        recorder.record_write(Duration::from_nanos(100), 10, 1);
        recorder.record_write(Duration::from_nanos(300), 30, 2);

        let stats = recorder.snapshot();
        assert_eq!(stats.frames_written, 2);
        assert_eq!(stats.avg_write_latency_ns, 200);
        assert_eq!(stats.max_write_latency_ns, 300);
        assert_eq!(stats.avg_frame_bytes, 20);
        assert_eq!(stats.peak_occupancy, 2);
    }

    #[test]
    fn peak_occupancy_never_decreases() {
        let recorder = StatsRecorder::new();
        recorder.record_write(Duration::from_nanos(1), 1, 5);
        recorder.record_write(Duration::from_nanos(1), 1, 2);
        assert_eq!(recorder.snapshot().peak_occupancy, 5);
    }

    #[test]
    fn full_events_and_overruns() {
        let recorder = StatsRecorder::new();
        recorder.record_buffer_full();
        recorder.record_buffer_full();
        recorder.record_overrun(3);

        let stats = recorder.snapshot();
        assert_eq!(stats.buffer_full_events, 2);
        assert_eq!(stats.reader_overruns, 3);
    }

    #[test]
    fn read_latency_tracked_separately() {
        let recorder = StatsRecorder::new();
        recorder.record_read(Duration::from_nanos(50));
        recorder.record_read(Duration::from_nanos(150));

        let stats = recorder.snapshot();
        assert_eq!(stats.frames_read, 2);
        assert_eq!(stats.avg_read_latency_ns, 100);
        assert_eq!(stats.max_read_latency_ns, 150);
        assert_eq!(stats.frames_written, 0);
    }
}
