use image::{ColorType, DynamicImage, ImageFormat};

/// Decoded image reduced to what the rating heuristic reads.
#[derive(Debug, Clone)]
pub struct ImageSample {
    pub width: u32,
    pub height: u32,
    pub format: Option<ImageFormat>,
    /// Decoded as RGBA. Grey-with-alpha sources are scored like opaque images.
    pub is_rgba: bool,
    /// Row-major 8-bit luma samples.
    pub luma: Vec<u8>,
}

impl ImageSample {
    pub fn from_image(image: &DynamicImage, format: Option<ImageFormat>) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            format,
            is_rgba: matches!(
                image.color(),
                ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F
            ),
            luma: image.to_luma8().into_raw(),
        }
    }

    pub fn format_name(&self) -> &'static str {
        self.format
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("unknown")
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Reads the header only, so oversized images can be refused before a full decode.
pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32), image::ImageError> {
    image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()?
        .into_dimensions()
}

pub fn decode(bytes: &[u8]) -> Result<ImageSample, image::ImageError> {
    let format = image::guess_format(bytes).ok();
    let image = image::load_from_memory(bytes)?;
    Ok(ImageSample::from_image(&image, format))
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn decodes_png() {
        let sample = decode(&png_rgb(300, 200, [255, 255, 255])).unwrap();
        assert_eq!((sample.width, sample.height), (300, 200));
        assert_eq!(sample.format, Some(ImageFormat::Png));
        assert_eq!(sample.format_name(), "png");
        assert!(!sample.is_rgba);
        assert_eq!(sample.luma.len(), 60_000);
        assert!(sample.luma.iter().all(|&l| l == 255));
    }

    #[test]
    fn flags_rgba_only() {
        let sample = decode(&png_rgba(120, 120, [10, 20, 30, 128])).unwrap();
        assert!(sample.is_rgba);

        let sample = decode(&png_luma_alpha(120, 120, [90, 128])).unwrap();
        assert!(!sample.is_rgba);
        assert!(sample.luma.iter().all(|&l| l == 90));
    }

    #[test]
    fn reads_dimensions_without_decoding() {
        assert_eq!(dimensions(&png_rgb(150, 110, [0, 0, 0])).unwrap(), (150, 110));
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode(b"definitely not an image").is_err());
        assert!(dimensions(b"nope").is_err());
    }
}
