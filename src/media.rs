//! The media ingestion seam: the only surface through which a frame from
//! outside the engine (an image, a video element, a canvas) enters a
//! pipeline. The core depends only on [`Media`]'s upload method; it ships no
//! browser/DOM adapters, only an in-memory implementation treating `image`
//! as the host-side pixel source of truth.

use crate::device::DeviceContext;
use crate::error::{EngineError, ResourceError};
use crate::texture::Texture;
use crate::value::Size;

/// A source of frames the engine can upload into a GPU texture.
///
/// Implementations wrap images, video elements, and canvases; the engine
/// never inspects anything beyond this trait, so a caller can supply a
/// browser or video-capture adapter without this crate knowing about it.
pub trait Media {
    fn size(&self) -> Size;

    /// Upload the current frame into `texture`, which the caller has already
    /// allocated with a matching size. Implementations issue the upload via
    /// `context.queue()`.
    fn upload_into(&self, context: &DeviceContext, texture: &Texture) -> Result<(), EngineError>;
}

/// An in-memory [`Media`] backed by a decoded [`image::DynamicImage`], always
/// upload as tightly packed RGBA8.
pub struct ImageMedia {
    image: image::RgbaImage,
}

impl ImageMedia {
    pub fn new(image: image::DynamicImage) -> Self {
        ImageMedia {
            image: image.to_rgba8(),
        }
    }

    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, EngineError> {
        let image = image::RgbaImage::from_raw(width, height, pixels).ok_or_else(|| {
            EngineError::Resource(ResourceError::Allocation(
                "pixel buffer length does not match width*height*4".to_string(),
            ))
        })?;
        Ok(ImageMedia { image })
    }
}

impl Media for ImageMedia {
    fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }

    fn upload_into(&self, context: &DeviceContext, texture: &Texture) -> Result<(), EngineError> {
        let size = texture.size();
        if size != self.size() {
            return Err(EngineError::Resource(ResourceError::Allocation(format!(
                "media size {:?} does not match destination texture size {:?}",
                self.size(),
                size
            ))));
        }

        context.write_texture(texture, self.image.as_raw());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgba8_rejects_mismatched_buffer_length() {
        let err = ImageMedia::from_rgba8(4, 4, vec![0u8; 10]);
        assert!(matches!(err, Err(EngineError::Resource(ResourceError::Allocation(_)))));
    }

    #[test]
    fn from_rgba8_reports_its_own_size() {
        let media = ImageMedia::from_rgba8(4, 4, vec![0u8; 4 * 4 * 4]).unwrap();
        assert_eq!(media.size(), Size::new(4, 4));
    }
}
