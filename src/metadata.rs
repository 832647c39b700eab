//! Self-describing JSON metadata region.
//!
//! A NUL-terminated UTF-8 JSON document sits between the control block and
//! slot 0 so that consumers in any language can discover the buffer geometry
//! without understanding the binary layout. The producer rewrites it in
//! place, at most once per written frame; readers parse it defensively.

use serde::{Deserialize, Serialize};

use crate::error::ShmError;
use crate::frame::{FrameFlags, PixelFormat};
use crate::layout::{FrameHeader, SegmentGeometry};

/// Current metadata format version. Consumers reject unknown major versions.
pub const FORMAT_VERSION: &str = "1.0";

/// The `type` discriminator identifying this segment family.
pub const SEGMENT_TYPE: &str = "medical_imaging_frames";

/// Segment-level metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    /// Layout version, "major.minor".
    pub format_version: String,
    /// Segment creation time, UNIX-epoch nanoseconds.
    pub created_at: u64,
    /// Always [`SEGMENT_TYPE`] for buffers written by this crate.
    #[serde(rename = "type")]
    pub kind: String,
    /// Canonical name of the pixel format the producer emits.
    pub frame_format: String,
    /// Number of slots in the ring.
    pub max_frames: u64,
    /// Total segment size in bytes.
    pub buffer_size: u64,
    /// Byte offset of slot 0.
    pub data_offset: u64,
    /// Bytes per slot.
    pub frame_slot_size: u64,
    /// Descriptors of the most recently written frame, when the producer
    /// maintains them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_frame: Option<LastFrameMeta>,
}

/// Annotations of the most recently published frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastFrameMeta {
    pub frame_id: u64,
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub format: String,
    /// Segmentation annotations accompany the frame.
    #[serde(default)]
    pub segmentation: bool,
    /// Calibration annotations accompany the frame.
    #[serde(default)]
    pub calibration: bool,
    /// Frame was pipeline-processed before publication.
    #[serde(default)]
    pub processed: bool,
}

impl LastFrameMeta {
    /// Build the subtree from a just-published header.
    pub fn from_header(header: &FrameHeader) -> Self {
        let flags = FrameFlags::from_bits_truncate(header.flags);
        Self {
            frame_id: header.frame_id,
            sequence: header.sequence_number,
            timestamp_ns: header.timestamp_ns,
            width: header.width,
            height: header.height,
            format: PixelFormat::from_code(header.format_code).name().to_string(),
            segmentation: flags.contains(FrameFlags::SEGMENTATION),
            calibration: flags.contains(FrameFlags::CALIBRATION),
            processed: flags.contains(FrameFlags::PROCESSED),
        }
    }
}

impl SegmentMetadata {
    /// Metadata for a freshly created segment.
    pub fn new(geometry: &SegmentGeometry, frame_format: PixelFormat, created_at: u64) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            created_at,
            kind: SEGMENT_TYPE.to_string(),
            frame_format: frame_format.name().to_string(),
            max_frames: geometry.slot_count,
            buffer_size: geometry.segment_size as u64,
            data_offset: geometry.data_offset as u64,
            frame_slot_size: geometry.slot_size as u64,
            last_frame: None,
        }
    }

    /// Reject documents written by an incompatible layout.
    pub fn check_version(&self) -> Result<(), ShmError> {
        let major = self.format_version.split('.').next().unwrap_or("");
        let ours = FORMAT_VERSION.split('.').next().unwrap_or("");
        if major != ours {
            return Err(ShmError::Internal("unknown metadata format_version major"));
        }
        Ok(())
    }

    /// Serialize into `region` as a NUL-terminated document.
    ///
    /// Oversize documents are rejected before any byte of the region is
    /// touched, leaving the previous content intact.
    pub fn write_into(&self, region: &mut [u8]) -> Result<(), ShmError> {
        let encoded = serde_json::to_vec(self)?;
        if encoded.len() + 1 > region.len() {
            return Err(ShmError::InvalidSize {
                required: encoded.len() + 1,
                actual: region.len(),
            });
        }
        region[..encoded.len()].copy_from_slice(&encoded);
        region[encoded.len()] = 0;
        Ok(())
    }

    /// Parse the NUL-terminated document from `region`.
    pub fn read_from(region: &[u8]) -> Result<Self, ShmError> {
        let end = region
            .iter()
            .position(|&b| b == 0)
            .ok_or(ShmError::Internal("metadata region is not NUL-terminated"))?;
        if end == 0 {
            return Err(ShmError::Internal("metadata region is empty"));
        }
        let meta: Self = serde_json::from_slice(&region[..end])?;
        Ok(meta)
    }

    /// Record the most recently written frame.
    pub fn set_last_frame(&mut self, header: &FrameHeader) {
        self.last_frame = Some(LastFrameMeta::from_header(header));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DATA_OFFSET;

    fn test_geometry() -> SegmentGeometry {
        SegmentGeometry::for_create(DATA_OFFSET + 4 * 1088, 1024, None).unwrap()
    }

    #[test]
    fn roundtrip_through_region() {
        let meta = SegmentMetadata::new(&test_geometry(), PixelFormat::Yuv422, 1234);
        let mut region = vec![0u8; 4096];
        meta.write_into(&mut region).unwrap();

        let parsed = SegmentMetadata::read_from(&region).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.format_version, "1.0");
        assert_eq!(parsed.kind, "medical_imaging_frames");
        assert_eq!(parsed.max_frames, 4);
        assert_eq!(parsed.frame_slot_size, 1088);
        assert_eq!(parsed.data_offset, DATA_OFFSET as u64);
    }

    #[test]
    fn required_keys_appear_in_json() {
        let meta = SegmentMetadata::new(&test_geometry(), PixelFormat::Bgra, 99);
        let json = serde_json::to_string(&meta).unwrap();
        for key in [
            "format_version",
            "created_at",
            "\"type\"",
            "frame_format",
            "max_frames",
            "buffer_size",
            "data_offset",
            "frame_slot_size",
        ] {
            assert!(json.contains(key), "missing key {} in {}", key, json);
        }
        // last_frame is omitted until a frame is written
        assert!(!json.contains("last_frame"));
    }

    #[test]
    fn oversize_write_leaves_region_intact() {
        let meta = SegmentMetadata::new(&test_geometry(), PixelFormat::Yuv422, 0);
        let mut region = vec![0u8; 256];
        meta.write_into(&mut region).unwrap();
        let before = region.clone();

        let mut big = meta.clone();
        big.frame_format = "x".repeat(512);
        let err = big.write_into(&mut region).unwrap_err();
        assert!(matches!(err, ShmError::InvalidSize { .. }));
        assert_eq!(region, before);
    }

    #[test]
    fn last_frame_subtree() {
        let mut header = FrameHeader::zeroed();
        header.frame_id = 42;
        header.sequence_number = 3;
        header.timestamp_ns = 777;
        header.width = 1920;
        header.height = 1080;
        header.format_code = PixelFormat::Yuv422.code();
        header.flags = (FrameFlags::SEGMENTATION | FrameFlags::PROCESSED).bits();

        let mut meta = SegmentMetadata::new(&test_geometry(), PixelFormat::Yuv422, 0);
        meta.set_last_frame(&header);

        let last = meta.last_frame.as_ref().unwrap();
        assert_eq!(last.frame_id, 42);
        assert_eq!(last.sequence, 3);
        assert_eq!(last.format, "YUV");
        assert!(last.segmentation);
        assert!(!last.calibration);
        assert!(last.processed);
    }

    #[test]
    fn parse_tolerates_missing_optional_fields() {
        let json = br#"{"format_version":"1.0","created_at":1,"type":"medical_imaging_frames","frame_format":"YUV","max_frames":7,"buffer_size":1000000,"data_offset":4224,"frame_slot_size":8192}"#;
        let mut region = vec![0u8; 4096];
        region[..json.len()].copy_from_slice(json);

        let meta = SegmentMetadata::read_from(&region).unwrap();
        assert_eq!(meta.max_frames, 7);
        assert!(meta.last_frame.is_none());
        assert!(meta.check_version().is_ok());
    }

    #[test]
    fn version_check_rejects_unknown_major() {
        let mut meta = SegmentMetadata::new(&test_geometry(), PixelFormat::Yuv422, 0);
        assert!(meta.check_version().is_ok());

        meta.format_version = "2.0".to_string();
        assert!(meta.check_version().is_err());

        // Minor bumps stay compatible
        meta.format_version = "1.7".to_string();
        assert!(meta.check_version().is_ok());
    }

    #[test]
    fn garbage_region_is_rejected() {
        let region = vec![0xFFu8; 64];
        assert!(SegmentMetadata::read_from(&region).is_err());

        let mut region = vec![0u8; 64];
        region[..5].copy_from_slice(b"not{j");
        assert!(SegmentMetadata::read_from(&region).is_err());
    }
}
