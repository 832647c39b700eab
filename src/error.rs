//! Status codes and error types.
//!
//! Every public operation returns `Result<T, ShmError>`. The `StatusCode`
//! numbering is part of the cross-language contract: foreign consumers that
//! only see a `u32` must be able to classify outcomes without Rust types.

use std::fmt;
use std::io;

/// Operation status codes.
///
/// The numeric values are stable and shared with non-Rust consumers of the
/// segment; do not reorder.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Operation completed successfully.
    Ok = 0,
    /// Segment (or handle) already exists / already initialized.
    AlreadyExists = 1,
    /// Failed to create or map the segment.
    CreationFailed = 2,
    /// Segment not initialized.
    NotInitialized = 3,
    /// Failed to write a frame.
    WriteFailed = 4,
    /// Failed to read a frame.
    ReadFailed = 5,
    /// Ring buffer is full.
    BufferFull = 6,
    /// Ring buffer is empty.
    BufferEmpty = 7,
    /// Invalid size (segment too small, frame too large).
    InvalidSize = 8,
    /// Permission denied by the host.
    PermissionDenied = 9,
    /// Bounded wait expired.
    Timeout = 10,
    /// Unspecified internal error.
    InternalError = 11,
    /// Requested backend is unavailable on this host.
    NotSupported = 12,
}

impl StatusCode {
    /// Convert from a u32 wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::AlreadyExists,
            2 => Self::CreationFailed,
            3 => Self::NotInitialized,
            4 => Self::WriteFailed,
            5 => Self::ReadFailed,
            6 => Self::BufferFull,
            7 => Self::BufferEmpty,
            8 => Self::InvalidSize,
            9 => Self::PermissionDenied,
            10 => Self::Timeout,
            11 => Self::InternalError,
            12 => Self::NotSupported,
            _ => return None,
        })
    }

    /// Convert to u32 for wire transmission.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Get a human-readable description of this status.
    pub fn description(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::AlreadyExists => "already exists",
            Self::CreationFailed => "creation failed",
            Self::NotInitialized => "not initialized",
            Self::WriteFailed => "write failed",
            Self::ReadFailed => "read failed",
            Self::BufferFull => "buffer full",
            Self::BufferEmpty => "buffer empty",
            Self::InvalidSize => "invalid size",
            Self::PermissionDenied => "permission denied",
            Self::Timeout => "timeout",
            Self::InternalError => "internal error",
            Self::NotSupported => "not supported",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Error type for segment and frame operations.
#[derive(Debug)]
pub enum ShmError {
    /// The named segment already exists (create) or the handle is already
    /// initialized.
    AlreadyExists,
    /// Backend create/attach failed.
    CreationFailed {
        backend: &'static str,
        source: io::Error,
    },
    /// Operation attempted before the segment became active.
    NotInitialized,
    /// Frame could not be written.
    WriteFailed(&'static str),
    /// Frame could not be read.
    ReadFailed(&'static str),
    /// Ring is full and the drop-when-full policy is in effect.
    BufferFull,
    /// No frame has been published yet (or the sequential reader is caught up).
    BufferEmpty,
    /// Segment too small for the requested geometry.
    InvalidSize { required: usize, actual: usize },
    /// Frame payload exceeds the slot capacity.
    FrameTooLarge { len: usize, max: usize },
    /// Malformed frame descriptor (zero-sized payload, inconsistent fields).
    InvalidFrame(&'static str),
    /// The host refused access to the backend.
    PermissionDenied(io::Error),
    /// A bounded wait expired without progress.
    Timeout,
    /// The selected backend is unavailable on this host.
    NotSupported(&'static str),
    /// Invariant violation; the segment stays readable.
    Internal(&'static str),
    /// Metadata region could not be serialized or parsed.
    Metadata(serde_json::Error),
}

impl ShmError {
    /// The wire status corresponding to this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyExists => StatusCode::AlreadyExists,
            Self::CreationFailed { .. } => StatusCode::CreationFailed,
            Self::NotInitialized => StatusCode::NotInitialized,
            Self::WriteFailed(_) => StatusCode::WriteFailed,
            Self::ReadFailed(_) => StatusCode::ReadFailed,
            Self::BufferFull => StatusCode::BufferFull,
            Self::BufferEmpty => StatusCode::BufferEmpty,
            Self::InvalidSize { .. } => StatusCode::InvalidSize,
            Self::FrameTooLarge { .. } => StatusCode::InvalidSize,
            Self::InvalidFrame(_) => StatusCode::InvalidSize,
            Self::PermissionDenied(_) => StatusCode::PermissionDenied,
            Self::Timeout => StatusCode::Timeout,
            Self::NotSupported(_) => StatusCode::NotSupported,
            Self::Internal(_) => StatusCode::InternalError,
            Self::Metadata(_) => StatusCode::InternalError,
        }
    }

    /// True for the steady-state backpressure outcomes that callers are
    /// expected to retry or absorb.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BufferFull | Self::BufferEmpty | Self::Timeout)
    }
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "segment already exists"),
            Self::CreationFailed { backend, source } => {
                write!(f, "{} backend creation failed: {}", backend, source)
            }
            Self::NotInitialized => write!(f, "segment not initialized"),
            Self::WriteFailed(msg) => write!(f, "write failed: {}", msg),
            Self::ReadFailed(msg) => write!(f, "read failed: {}", msg),
            Self::BufferFull => write!(f, "ring buffer is full"),
            Self::BufferEmpty => write!(f, "ring buffer is empty"),
            Self::InvalidSize { required, actual } => {
                write!(f, "invalid size: need {} bytes, have {}", required, actual)
            }
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame too large for slot: {} bytes, max {}", len, max)
            }
            Self::InvalidFrame(msg) => write!(f, "invalid frame: {}", msg),
            Self::PermissionDenied(source) => write!(f, "permission denied: {}", source),
            Self::Timeout => write!(f, "operation timed out"),
            Self::NotSupported(msg) => write!(f, "backend not supported: {}", msg),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
            Self::Metadata(source) => write!(f, "metadata error: {}", source),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreationFailed { source, .. } => Some(source),
            Self::PermissionDenied(source) => Some(source),
            Self::Metadata(source) => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ShmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Metadata(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_roundtrip() {
        for value in 0..=12u32 {
            let code = StatusCode::from_u32(value).unwrap();
            assert_eq!(code.as_u32(), value);
        }
        assert!(StatusCode::from_u32(13).is_none());
        assert!(StatusCode::from_u32(u32::MAX).is_none());
    }

    #[test]
    fn status_code_values_are_stable() {
        assert_eq!(StatusCode::Ok as u32, 0);
        assert_eq!(StatusCode::BufferFull as u32, 6);
        assert_eq!(StatusCode::BufferEmpty as u32, 7);
        assert_eq!(StatusCode::Timeout as u32, 10);
        assert_eq!(StatusCode::NotSupported as u32, 12);
    }

    #[test]
    fn error_maps_to_status() {
        assert_eq!(ShmError::BufferFull.status_code(), StatusCode::BufferFull);
        assert_eq!(
            ShmError::FrameTooLarge { len: 10, max: 5 }.status_code(),
            StatusCode::InvalidSize
        );
        assert_eq!(ShmError::Timeout.status_code(), StatusCode::Timeout);
        assert_eq!(
            ShmError::Internal("x").status_code(),
            StatusCode::InternalError
        );
    }

    #[test]
    fn transient_classification() {
        assert!(ShmError::BufferFull.is_transient());
        assert!(ShmError::BufferEmpty.is_transient());
        assert!(ShmError::Timeout.is_transient());
        assert!(!ShmError::NotInitialized.is_transient());
        assert!(!ShmError::AlreadyExists.is_transient());
    }

    #[test]
    fn error_display() {
        let err = ShmError::FrameTooLarge { len: 300, max: 256 };
        let s = format!("{}", err);
        assert!(s.contains("300"));
        assert!(s.contains("256"));

        let err = ShmError::InvalidSize {
            required: 8192,
            actual: 1024,
        };
        let s = format!("{}", err);
        assert!(s.contains("8192"));
        assert!(s.contains("1024"));
    }
}
