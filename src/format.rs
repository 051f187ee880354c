//! Image format descriptions.
//!
//! The format set is closed: every buffer flowing through a pipeline carries
//! one of these tags, and the raw formats have an exact payload size derived
//! from the frame geometry. Compressed and unknown formats are unconstrained.

/// Pixel/container format of an [`ImageBuffer`](crate::buffer::ImageBuffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// Planar YUV 4:2:0 (I420): full-res Y plane, quarter-res U and V planes.
    Yuv420Planar,
    /// Planar YUV 4:2:2: full-res Y plane, half-res U and V planes.
    Yuv422Planar,
    /// Packed 24-bit RGB, 3 bytes per pixel.
    Rgb24,
    /// 8-bit grayscale, 1 byte per pixel.
    Gray8,
    /// JPEG-compressed image. Payload size is unconstrained.
    Jpeg,
    /// PNG-compressed image. Payload size is unconstrained.
    Png,
    /// Unknown format. Payload size is unconstrained.
    Unknown,
}

impl ImageFormat {
    /// Check whether this format describes raw (uncompressed) pixels.
    pub fn is_raw(&self) -> bool {
        matches!(
            self,
            Self::Yuv420Planar | Self::Yuv422Planar | Self::Rgb24 | Self::Gray8
        )
    }

    /// Exact payload size in bytes for a raw frame of `width` x `height`.
    ///
    /// Returns `None` for compressed/unknown formats, whose payload size
    /// carries no geometric constraint.
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            Self::Yuv420Planar => Some(pixels + 2 * ((width as usize / 2) * (height as usize / 2))),
            Self::Yuv422Planar => Some(pixels * 2),
            Self::Rgb24 => Some(pixels * 3),
            Self::Gray8 => Some(pixels),
            Self::Jpeg | Self::Png | Self::Unknown => None,
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Yuv420Planar => "yuv420p",
            Self::Yuv422Planar => "yuv422p",
            Self::Rgb24 => "rgb24",
            Self::Gray8 => "gray8",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}
