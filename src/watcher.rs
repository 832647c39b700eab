//! Frame-change notification watcher.
//!
//! A reader that wants callbacks instead of polling spawns one watcher
//! thread. The watcher consumes frames via the sequential read path and
//! invokes the callback strictly in publication order; it observes the
//! cancellation flag at every poll boundary and exits within one poll
//! interval. Callback panics are absorbed and logged, never propagated.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::buffer::FrameBuffer;
use crate::error::ShmError;
use crate::frame::FrameView;

/// Callback invoked for every newly published frame.
///
/// The view is only valid for the duration of the call; copy the pixels out
/// if they must outlive it.
pub type FrameCallback = Box<dyn for<'a> FnMut(FrameView<'a>) + Send + 'static>;

/// Scheduling knobs for the watcher thread.
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    /// Sleep between polls of `write_index` when the ring is empty.
    pub poll_interval: Duration,
    /// Pin the watcher to a CPU core (soft; failure is logged).
    pub pin_cpu: Option<usize>,
    /// Elevate the watcher to a real-time scheduling policy (soft).
    pub realtime: bool,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2),
            pin_cpu: None,
            realtime: false,
        }
    }
}

/// Handle to a running watcher thread.
///
/// Dropping the handle cancels the watcher and joins it.
pub struct FrameWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameWatcher {
    /// Spawn a watcher over `buffer`.
    ///
    /// The watcher advances the segment's sequential read cursor; do not run
    /// it alongside another sequential reader on the same segment.
    pub fn spawn(
        buffer: Arc<FrameBuffer>,
        options: WatcherOptions,
        mut callback: FrameCallback,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let poll = options.poll_interval;

        let handle = thread::Builder::new()
            .name(format!("sonoring-watch-{}", buffer.name()))
            .spawn(move || {
                apply_scheduling(&options);

                while !thread_stop.load(Ordering::Relaxed) {
                    match buffer.read_next_frame(Duration::ZERO) {
                        Ok(view) => {
                            let delivery =
                                std::panic::catch_unwind(AssertUnwindSafe(|| callback(view)));
                            if delivery.is_err() {
                                tracing::warn!(
                                    segment = %buffer.name(),
                                    "frame callback panicked; watcher continues"
                                );
                            }
                        }
                        Err(ShmError::BufferEmpty) => thread::sleep(poll),
                        Err(err) => {
                            tracing::warn!(%err, segment = %buffer.name(), "watcher read failed");
                            thread::sleep(poll);
                        }
                    }
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Cancel the watcher and wait for it to exit (within one poll interval
    /// plus any in-flight callback).
    pub fn cancel(mut self) {
        self.stop_and_join();
    }

    /// Whether the watcher thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameWatcher {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(target_os = "linux")]
fn apply_scheduling(options: &WatcherOptions) {
    if let Some(cpu) = options.pin_cpu {
        let rc = unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            tracing::warn!(
                cpu,
                err = %io::Error::last_os_error(),
                "could not pin watcher thread"
            );
        }
    }
    if options.realtime {
        let param = libc::sched_param { sched_priority: 10 };
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if rc != 0 {
            tracing::warn!(
                err = %io::Error::last_os_error(),
                "could not elevate watcher to SCHED_FIFO"
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_scheduling(options: &WatcherOptions) {
    if options.pin_cpu.is_some() || options.realtime {
        tracing::warn!("watcher scheduling knobs are not supported on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentOptions;
    use crate::frame::{FrameRecord, PixelFormat};
    use crate::layout::{align64, DATA_OFFSET, FRAME_HEADER_SIZE};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    fn test_buffer(tag: &str, slots: u64) -> Arc<FrameBuffer> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let name = format!("sonoring-watch-{}-{}-{}", tag, std::process::id(), id);
        let slot_size = align64(FRAME_HEADER_SIZE + 1024);
        let options = SegmentOptions::producer(name, DATA_OFFSET + slots as usize * slot_size)
            .max_frame_size(1024);
        Arc::new(FrameBuffer::create(options).unwrap())
    }

    fn write(buffer: &FrameBuffer, frame_id: u64) {
        let payload = [frame_id as u8; 32];
        let record = FrameRecord::new(
            frame_id,
            8,
            4,
            1,
            PixelFormat::Bgra,
            crate::buffer::unix_now_ns(),
            &payload,
        );
        buffer.write_frame(&record).unwrap();
    }

    fn wait_for<F: Fn() -> bool>(deadline: Duration, condition: F) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn delivers_frames_in_publication_order() {
        let buffer = test_buffer("order", 8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let watcher = FrameWatcher::spawn(
            Arc::clone(&buffer),
            WatcherOptions::default(),
            Box::new(move |view| sink.lock().push(view.frame_id())),
        )
        .unwrap();

        for id in 0..5 {
            write(&buffer, id);
        }

        assert!(wait_for(Duration::from_secs(1), || seen.lock().len() == 5));
        watcher.cancel();

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(
            buffer
                .control_block()
                .total_frames_read
                .load(Ordering::Relaxed),
            5
        );
    }

    #[test]
    fn cancellation_stops_the_thread() {
        let buffer = test_buffer("cancel", 4);
        let watcher = FrameWatcher::spawn(
            Arc::clone(&buffer),
            WatcherOptions::default(),
            Box::new(|_| {}),
        )
        .unwrap();

        assert!(watcher.is_running());
        watcher.cancel();
        // cancel() joined; a fresh watcher can take over the cursor.
        let second = FrameWatcher::spawn(
            buffer,
            WatcherOptions::default(),
            Box::new(|_| {}),
        )
        .unwrap();
        second.cancel();
    }

    #[test]
    fn callback_panic_is_absorbed() {
        let buffer = test_buffer("panic", 4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let watcher = FrameWatcher::spawn(
            Arc::clone(&buffer),
            WatcherOptions::default(),
            Box::new(move |view| {
                if view.frame_id() == 0 {
                    panic!("boom");
                }
                sink.lock().push(view.frame_id());
            }),
        )
        .unwrap();

        write(&buffer, 0);
        write(&buffer, 1);

        assert!(wait_for(Duration::from_secs(1), || seen.lock().len() == 1));
        watcher.cancel();
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn scheduling_failures_are_soft() {
        // Pinning to an absurd CPU and requesting SCHED_FIFO without
        // privileges must not prevent delivery.
        let buffer = test_buffer("sched", 4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let options = WatcherOptions {
            poll_interval: Duration::from_millis(1),
            pin_cpu: Some(4095),
            realtime: true,
        };
        let watcher = FrameWatcher::spawn(
            Arc::clone(&buffer),
            options,
            Box::new(move |view| sink.lock().push(view.frame_id())),
        )
        .unwrap();

        write(&buffer, 9);
        assert!(wait_for(Duration::from_secs(1), || !seen.lock().is_empty()));
        watcher.cancel();
        assert_eq!(*seen.lock(), vec![9]);
    }
}
