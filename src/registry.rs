//! Process-local registry of open segments.
//!
//! Segment handles are plain values; code that wants "open once, share by
//! name" semantics constructs a registry explicitly and owns its lifetime.
//! There is deliberately no global instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::FrameBuffer;
use crate::config::SegmentOptions;
use crate::error::ShmError;

/// An explicitly constructed map of segment name → shared handle.
#[derive(Default)]
pub struct SegmentRegistry {
    inner: Mutex<HashMap<String, Arc<FrameBuffer>>>,
}

impl SegmentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the handle registered under `options.name`, opening it (create
    /// or attach, per `options.create`) on first use.
    pub fn open(&self, options: SegmentOptions) -> Result<Arc<FrameBuffer>, ShmError> {
        let mut inner = self.inner.lock();
        if let Some(buffer) = inner.get(&options.name) {
            return Ok(Arc::clone(buffer));
        }
        let buffer = Arc::new(FrameBuffer::open(options)?);
        inner.insert(buffer.name().to_string(), Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Look up an already-open segment.
    pub fn get(&self, name: &str) -> Option<Arc<FrameBuffer>> {
        self.inner.lock().get(name).cloned()
    }

    /// Drop the registry's reference to `name`. The segment itself is torn
    /// down once the last outstanding handle goes away.
    pub fn remove(&self, name: &str) -> Option<Arc<FrameBuffer>> {
        self.inner.lock().remove(name)
    }

    /// Names of every registered segment.
    pub fn names(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    /// Number of registered segments.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{align64, DATA_OFFSET, FRAME_HEADER_SIZE};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn producer_options(tag: &str) -> SegmentOptions {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let name = format!("sonoring-reg-{}-{}-{}", tag, std::process::id(), id);
        let slot_size = align64(FRAME_HEADER_SIZE + 1024);
        SegmentOptions::producer(name, DATA_OFFSET + 2 * slot_size).max_frame_size(1024)
    }

    #[test]
    fn open_is_idempotent_per_name() {
        let registry = SegmentRegistry::new();
        let options = producer_options("idem");
        let name = options.name.clone();

        let first = registry.open(options.clone()).unwrap();
        // A second open by the same name returns the existing handle rather
        // than racing to re-create the segment.
        let second = registry.open(options).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec![name]);
    }

    #[test]
    fn get_and_remove() {
        let registry = SegmentRegistry::new();
        let options = producer_options("rm");
        let name = options.name.clone();

        assert!(registry.get(&name).is_none());
        registry.open(options).unwrap();
        assert!(registry.get(&name).is_some());

        registry.remove(&name);
        assert!(registry.get(&name).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn open_failure_is_not_cached() {
        let registry = SegmentRegistry::new();
        let mut options = producer_options("fail");
        options.size = 16; // impossible geometry
        assert!(registry.open(options).is_err());
        assert!(registry.is_empty());
    }
}
