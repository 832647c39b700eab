//! Frame descriptors and views.
//!
//! [`FrameRecord`] is what the capture side hands to the producer: borrowed
//! pixel bytes plus the header-compatible descriptors. [`FrameView`] is what
//! readers get back: a borrowed view into the mapped segment, valid only
//! until the producer laps the slot.

use crate::layout::FrameHeader;

/// Pixel format identifiers stored in the frame header.
///
/// The numeric codes are part of the on-wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Packed 8-bit YUV 4:2:2 (code 0x01).
    Yuv422,
    /// 8-bit BGRA (code 0x02).
    Bgra,
    /// 10-bit YUV 4:2:2 (code 0x03).
    Yuv10,
    /// 10-bit RGB (code 0x04).
    Rgb10,
    /// Anything else (code 0xFF).
    Unknown,
}

impl PixelFormat {
    /// Convert to the u32 wire code.
    pub fn code(self) -> u32 {
        match self {
            Self::Yuv422 => 0x01,
            Self::Bgra => 0x02,
            Self::Yuv10 => 0x03,
            Self::Rgb10 => 0x04,
            Self::Unknown => 0xFF,
        }
    }

    /// Convert from a u32 wire code. Unrecognized codes map to `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0x01 => Self::Yuv422,
            0x02 => Self::Bgra,
            0x03 => Self::Yuv10,
            0x04 => Self::Rgb10,
            _ => Self::Unknown,
        }
    }

    /// Canonical string form.
    pub fn name(self) -> &'static str {
        match self {
            Self::Yuv422 => "YUV",
            Self::Bgra => "BGRA",
            Self::Yuv10 => "YUV10",
            Self::Rgb10 => "RGB10",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse a capture-driver format name, including the aliases the driver
    /// family emits ("YUV422", "RGB", "YUV422_10").
    pub fn from_name(name: &str) -> Self {
        match name {
            "YUV" | "YUV422" => Self::Yuv422,
            "RGB" | "BGRA" => Self::Bgra,
            "YUV10" | "YUV422_10" => Self::Yuv10,
            "RGB10" => Self::Rgb10,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

bitflags::bitflags! {
    /// Frame-header flag bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// Pixel bytes already live in the segment (publication skipped the copy).
        const IN_SEGMENT    = 0b0000_0001;
        /// Frame is accompanied by segmentation annotations.
        const SEGMENTATION  = 0b0000_0010;
        /// Frame is accompanied by calibration annotations.
        const CALIBRATION   = 0b0000_0100;
        /// Frame went through the processing pipeline before publication.
        const PROCESSED     = 0b0000_1000;
    }
}

/// A frame handed to the producer for publication.
///
/// Borrows the caller's pixel buffer; the producer copies it into the slot
/// (or skips the copy when the buffer already aliases the destination).
#[derive(Debug, Clone, Copy)]
pub struct FrameRecord<'a> {
    /// Producer-assigned identifier.
    pub frame_id: u64,
    /// Capture timestamp, UNIX-epoch nanoseconds.
    pub timestamp_ns: u64,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per pixel.
    pub bytes_per_pixel: u32,
    /// Pixel format.
    pub format: PixelFormat,
    /// Annotation flags carried into the header.
    pub flags: FrameFlags,
    /// Raw pixel bytes.
    pub data: &'a [u8],
}

impl<'a> FrameRecord<'a> {
    /// Descriptor for a plain captured frame with no annotations.
    pub fn new(
        frame_id: u64,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        format: PixelFormat,
        timestamp_ns: u64,
        data: &'a [u8],
    ) -> Self {
        Self {
            frame_id,
            timestamp_ns,
            width,
            height,
            bytes_per_pixel,
            format,
            flags: FrameFlags::empty(),
            data,
        }
    }

    /// Attach annotation flags.
    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A reader's view of one published frame.
///
/// The pixel slice aliases the mapped segment; it stays valid only while the
/// producer has not written `sequence_number + slot_count`. Consume it
/// promptly and do not retain it across reads.
#[derive(Debug)]
pub struct FrameView<'a> {
    header: FrameHeader,
    data: &'a [u8],
}

impl<'a> FrameView<'a> {
    pub(crate) fn new(header: FrameHeader, data: &'a [u8]) -> Self {
        Self { header, data }
    }

    /// Copy of the binary header this view was constructed from.
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Producer-assigned frame identifier.
    pub fn frame_id(&self) -> u64 {
        self.header.frame_id
    }

    /// Capture timestamp, UNIX-epoch nanoseconds.
    pub fn timestamp_ns(&self) -> u64 {
        self.header.timestamp_ns
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.header.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.header.height
    }

    /// Bytes per pixel.
    pub fn bytes_per_pixel(&self) -> u32 {
        self.header.bytes_per_pixel
    }

    /// Pixel format decoded from the header code.
    pub fn format(&self) -> PixelFormat {
        PixelFormat::from_code(self.header.format_code)
    }

    /// Flag bits (unknown bits are dropped).
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.header.flags)
    }

    /// Absolute ring counter of the write that produced this frame.
    pub fn sequence_number(&self) -> u64 {
        self.header.sequence_number
    }

    /// Pixel bytes, aliasing the segment.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Payload length in bytes.
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Copy the pixel bytes out of the segment.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_code_roundtrip() {
        let formats = [
            PixelFormat::Yuv422,
            PixelFormat::Bgra,
            PixelFormat::Yuv10,
            PixelFormat::Rgb10,
            PixelFormat::Unknown,
        ];
        for &format in &formats {
            assert_eq!(PixelFormat::from_code(format.code()), format);
        }
    }

    #[test]
    fn format_codes_match_wire_values() {
        assert_eq!(PixelFormat::Yuv422.code(), 0x01);
        assert_eq!(PixelFormat::Bgra.code(), 0x02);
        assert_eq!(PixelFormat::Yuv10.code(), 0x03);
        assert_eq!(PixelFormat::Rgb10.code(), 0x04);
        assert_eq!(PixelFormat::Unknown.code(), 0xFF);
    }

    #[test]
    fn unrecognized_code_is_unknown() {
        assert_eq!(PixelFormat::from_code(0), PixelFormat::Unknown);
        assert_eq!(PixelFormat::from_code(0x7F), PixelFormat::Unknown);
    }

    #[test]
    fn format_names_and_aliases() {
        assert_eq!(PixelFormat::from_name("YUV"), PixelFormat::Yuv422);
        assert_eq!(PixelFormat::from_name("YUV422"), PixelFormat::Yuv422);
        assert_eq!(PixelFormat::from_name("RGB"), PixelFormat::Bgra);
        assert_eq!(PixelFormat::from_name("BGRA"), PixelFormat::Bgra);
        assert_eq!(PixelFormat::from_name("YUV422_10"), PixelFormat::Yuv10);
        assert_eq!(PixelFormat::from_name("RGB10"), PixelFormat::Rgb10);
        assert_eq!(PixelFormat::from_name("v210"), PixelFormat::Unknown);

        assert_eq!(PixelFormat::Yuv422.name(), "YUV");
        assert_eq!(PixelFormat::Unknown.name(), "Unknown");
    }

    #[test]
    fn flag_bits_are_stable() {
        assert_eq!(FrameFlags::IN_SEGMENT.bits(), 1);
        assert_eq!(FrameFlags::SEGMENTATION.bits(), 2);
        assert_eq!(FrameFlags::CALIBRATION.bits(), 4);
        assert_eq!(FrameFlags::PROCESSED.bits(), 8);
    }

    #[test]
    fn record_constructor() {
        let data = [0u8; 16];
        let record = FrameRecord::new(7, 4, 2, 2, PixelFormat::Yuv422, 123, &data)
            .with_flags(FrameFlags::SEGMENTATION);
        assert_eq!(record.frame_id, 7);
        assert_eq!(record.timestamp_ns, 123);
        assert_eq!(record.flags, FrameFlags::SEGMENTATION);
        assert_eq!(record.data.len(), 16);
    }

    #[test]
    fn view_accessors() {
        let mut header = crate::layout::FrameHeader::zeroed();
        header.frame_id = 42;
        header.width = 1920;
        header.height = 1080;
        header.bytes_per_pixel = 2;
        header.format_code = 0x01;
        header.flags = FrameFlags::IN_SEGMENT.bits() | 0x8000_0000;
        header.sequence_number = 9;
        header.data_size = 4;

        let pixels = [0xAB_u8; 4];
        let view = FrameView::new(header, &pixels);
        assert_eq!(view.frame_id(), 42);
        assert_eq!(view.width(), 1920);
        assert_eq!(view.format(), PixelFormat::Yuv422);
        // reserved bits are dropped
        assert_eq!(view.flags(), FrameFlags::IN_SEGMENT);
        assert_eq!(view.sequence_number(), 9);
        assert_eq!(view.data_size(), 4);
        assert_eq!(view.to_vec(), vec![0xAB; 4]);
    }
}
