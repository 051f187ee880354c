//! Image buffer type.

use crate::error::{Error, Result};
use crate::format::ImageFormat;
use std::os::fd::RawFd;

/// An image payload flowing through a pipeline.
///
/// Buffers are immutable once constructed; a stage that rewrites an image
/// replaces the buffer in the owning request's image list rather than
/// mutating it in place. For raw formats the payload size must exactly match
/// the frame geometry, and construction fails otherwise.
///
/// # Example
///
/// ```rust
/// use prism::buffer::ImageBuffer;
/// use prism::format::ImageFormat;
///
/// let data = vec![0u8; ImageFormat::Gray8.frame_size(64, 64).unwrap()];
/// let buffer = ImageBuffer::new(ImageFormat::Gray8, 64, 64, data).unwrap();
/// assert_eq!(buffer.len(), 64 * 64);
/// ```
#[derive(Debug)]
pub struct ImageBuffer {
    format: ImageFormat,
    width: u32,
    height: u32,
    data: Vec<u8>,
    /// Optional external file-descriptor handle (e.g. a dmabuf exported by a
    /// camera driver). Prism never reads through it; it is carried for stages
    /// that do.
    fd: Option<RawFd>,
}

impl ImageBuffer {
    /// Create a new buffer, validating the payload size against the format.
    ///
    /// For raw formats the payload must be exactly
    /// `format.frame_size(width, height)` bytes; compressed and unknown
    /// formats accept any size.
    pub fn new(format: ImageFormat, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        if let Some(expected) = format.frame_size(width, height) {
            if data.len() != expected {
                return Err(Error::InvalidBufferSize {
                    expected,
                    actual: data.len(),
                });
            }
        }
        Ok(Self {
            format,
            width,
            height,
            data,
            fd: None,
        })
    }

    /// Attach an external file-descriptor handle.
    pub fn with_fd(mut self, fd: RawFd) -> Self {
        self.fd = Some(fd);
        self
    }

    /// Get the format tag.
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Get the frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Get the frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Get the payload as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the external file-descriptor handle, if any.
    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    /// Deconstruct into format, dimensions, and payload.
    pub fn into_parts(self) -> (ImageFormat, u32, u32, Vec<u8>) {
        (self.format, self.width, self.height, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv420_exact_size_succeeds() {
        let size = ImageFormat::Yuv420Planar.frame_size(320, 240).unwrap();
        let buffer = ImageBuffer::new(ImageFormat::Yuv420Planar, 320, 240, vec![0; size]);
        assert!(buffer.is_ok());
    }

    #[test]
    fn test_yuv420_wrong_size_fails() {
        let size = ImageFormat::Yuv420Planar.frame_size(320, 240).unwrap();
        for wrong in [size - 1, size + 1, 0] {
            let result = ImageBuffer::new(ImageFormat::Yuv420Planar, 320, 240, vec![0; wrong]);
            assert!(matches!(result, Err(Error::InvalidBufferSize { .. })));
        }
    }

    #[test]
    fn test_jpeg_any_size() {
        let buffer = ImageBuffer::new(ImageFormat::Jpeg, 1920, 1080, vec![0xff, 0xd8]);
        assert!(buffer.is_ok());
    }

    #[test]
    fn test_fd_handle() {
        let buffer = ImageBuffer::new(ImageFormat::Unknown, 0, 0, vec![])
            .unwrap()
            .with_fd(7);
        assert_eq!(buffer.fd(), Some(7));
    }
}
