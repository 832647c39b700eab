//! Segment configuration.

use std::path::PathBuf;

use crate::error::ShmError;

/// Default segment size (64 MiB, enough for a handful of 4K frames).
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

/// Default largest anticipated frame payload: 1080p packed YUV 4:2:2.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1920 * 1080 * 2;

/// Shared memory backend selection.
///
/// All four backends expose identical byte-level semantics; they differ only
/// in how the byte range is obtained from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// POSIX named segment (`shm_open`).
    #[default]
    Posix,
    /// System V segment keyed by a token derived from a filesystem path.
    SysV,
    /// Memory-mapped file (RAM-backed filesystem by default).
    File,
    /// POSIX segment mapped with huge pages; falls back to `Posix` when the
    /// huge-page mapping is refused.
    HugePages,
}

impl BackendKind {
    /// Short name used in diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Posix => "posix",
            Self::SysV => "sysv",
            Self::File => "file",
            Self::HugePages => "hugepages",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Options recognised when creating or attaching to a segment.
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    /// Segment identifier. Must be non-empty, without '/' or NUL bytes.
    pub name: String,
    /// Total segment size in bytes. Ignored on attach (the existing size wins).
    pub size: usize,
    /// Backend used to obtain the byte range.
    pub backend: BackendKind,
    /// True for the producer (creates the segment), false for attachers.
    pub create: bool,
    /// Upper bound on the slot count; `None` lets the geometry use all space.
    pub max_frames: Option<u64>,
    /// Ask the kernel to pin the mapping in RAM (soft; failure is logged).
    pub lock_in_memory: bool,
    /// Maintain the JSON metadata region on every write.
    pub enable_metadata: bool,
    /// Backing path for the `File` backend and key path for `SysV`.
    pub file_path: Option<PathBuf>,
    /// Refuse and count writes when the ring is full instead of overwriting
    /// the oldest slot.
    pub drop_when_full: bool,
    /// Largest frame payload a slot must hold; sizes the slots.
    pub max_frame_size: usize,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: DEFAULT_SEGMENT_SIZE,
            backend: BackendKind::Posix,
            create: false,
            max_frames: None,
            lock_in_memory: false,
            enable_metadata: true,
            file_path: None,
            drop_when_full: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl SegmentOptions {
    /// Options for the producer side: create a segment of `size` bytes.
    pub fn producer(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            create: true,
            ..Self::default()
        }
    }

    /// Options for a consumer: attach to an existing segment.
    pub fn consumer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            create: false,
            ..Self::default()
        }
    }

    /// Select the backend.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Bound the slot count.
    pub fn max_frames(mut self, max_frames: u64) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    /// Size slots for payloads up to `bytes`.
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the drop-when-full policy.
    pub fn drop_when_full(mut self, drop: bool) -> Self {
        self.drop_when_full = drop;
        self
    }

    /// Request that the mapping be pinned in RAM.
    pub fn lock_in_memory(mut self, lock: bool) -> Self {
        self.lock_in_memory = lock;
        self
    }

    /// Enable or disable the per-write metadata update.
    pub fn enable_metadata(mut self, enable: bool) -> Self {
        self.enable_metadata = enable;
        self
    }

    /// Backing path for the `File` backend (or the `SysV` key file).
    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Validate fields that do not depend on segment geometry.
    pub fn validate(&self) -> Result<(), ShmError> {
        if self.name.is_empty() {
            return Err(ShmError::InvalidFrame("segment name must not be empty"));
        }
        if self.name.contains('/') || self.name.contains('\0') {
            return Err(ShmError::InvalidFrame(
                "segment name must not contain '/' or NUL",
            ));
        }
        if self.create && self.size == 0 {
            return Err(ShmError::InvalidSize {
                required: 1,
                actual: 0,
            });
        }
        if self.max_frame_size == 0 {
            return Err(ShmError::InvalidFrame("max_frame_size must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = SegmentOptions::default();
        assert_eq!(opts.backend, BackendKind::Posix);
        assert_eq!(opts.size, DEFAULT_SEGMENT_SIZE);
        assert_eq!(opts.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(!opts.drop_when_full);
        assert!(opts.enable_metadata);
    }

    #[test]
    fn producer_and_consumer_constructors() {
        let p = SegmentOptions::producer("frames", 1 << 20);
        assert!(p.create);
        assert_eq!(p.size, 1 << 20);

        let c = SegmentOptions::consumer("frames");
        assert!(!c.create);
        assert_eq!(c.name, "frames");
    }

    #[test]
    fn builder_chain() {
        let opts = SegmentOptions::producer("x", 4096)
            .backend(BackendKind::File)
            .max_frames(4)
            .drop_when_full(true)
            .max_frame_size(1024);
        assert_eq!(opts.backend, BackendKind::File);
        assert_eq!(opts.max_frames, Some(4));
        assert!(opts.drop_when_full);
        assert_eq!(opts.max_frame_size, 1024);
    }

    #[test]
    fn validate_rejects_bad_names() {
        let mut opts = SegmentOptions::producer("", 4096);
        assert!(opts.validate().is_err());

        opts.name = "a/b".into();
        assert!(opts.validate().is_err());

        opts.name = "ok".into();
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let opts = SegmentOptions::producer("x", 0);
        assert!(opts.validate().is_err());

        let opts = SegmentOptions::producer("x", 4096).max_frame_size(0);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn backend_names() {
        assert_eq!(BackendKind::Posix.as_str(), "posix");
        assert_eq!(BackendKind::SysV.as_str(), "sysv");
        assert_eq!(BackendKind::File.as_str(), "file");
        assert_eq!(BackendKind::HugePages.as_str(), "hugepages");
    }
}
