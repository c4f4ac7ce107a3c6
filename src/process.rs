use std::fmt;
use std::io::Cursor;

use anyhow::{bail, Error};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, ImageEncoder};
use serde::{Deserialize, Serialize};

use crate::validate::{ImageAsset, ImageType};
use crate::{FieldError, MEGABYTE};

/// Qualities tried in order when re-encoding a JPEG
const JPEG_QUALITY_STEPS: [u8; 7] = [90, 80, 70, 60, 50, 40, 30];
/// Compression gives up once the longer side reaches this size
const MIN_DIMENSION: u32 = 16;

/// Ceilings for compressed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionOptions {
    pub max_bytes: u64,
    pub max_dimension: u32,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            max_bytes: MEGABYTE,
            max_dimension: 600,
        }
    }
}

/// Something an `<img>` can render directly: either a `data:` URI built
/// from local bytes or the address of an already uploaded avatar.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Preview(String);

impl Preview {
    pub fn data_uri(mime: &str, bytes: &[u8]) -> Self {
        Self(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
    }

    pub fn url<S: Into<String>>(url: S) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with("data:")
    }
}

impl fmt::Display for Preview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The image that will actually be uploaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedAsset {
    pub name: String,
    pub image_type: ImageType,
    pub bytes: Vec<u8>,
    /// Pixel size; unknown when an uncompressed file has an unreadable
    /// header
    pub dimensions: Option<(u32, u32)>,
    pub original_size: u64,
    pub compressed: bool,
    pub preview: Preview,
}

impl ProcessedAsset {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn mime(&self) -> &'static str {
        self.image_type.as_mime()
    }
}

/// Turns accepted files into upload-ready assets off the interactive task.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageProcessor {
    options: CompressionOptions,
}

impl ImageProcessor {
    pub fn new(options: CompressionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> CompressionOptions {
        self.options
    }

    /// Preview shown while processing is still running
    pub fn optimistic_preview(asset: &ImageAsset) -> Preview {
        Preview::data_uri(&asset.mime, &asset.bytes)
    }

    /// Compress (or pass through) an accepted file on the blocking pool.
    pub async fn process(
        &self,
        asset: &ImageAsset,
        image_type: ImageType,
        compress: bool,
    ) -> Result<ProcessedAsset, FieldError> {
        let name = asset.name.clone();
        let bytes = asset.bytes.clone();
        let options = self.options;

        let worker = tokio::task::spawn_blocking(move || {
            let original_size = bytes.len() as u64;
            let (bytes, dimensions) = if compress {
                let (bytes, dimensions) =
                    compress_image(&bytes, image_type, options)?;
                (bytes, Some(dimensions))
            } else {
                let dimensions = read_dimensions(&bytes);
                (bytes, dimensions)
            };
            let preview = Preview::data_uri(image_type.as_mime(), &bytes);

            Ok::<_, Error>(ProcessedAsset {
                name,
                image_type,
                bytes,
                dimensions,
                original_size,
                compressed: compress,
                preview,
            })
        });

        match worker.await {
            Ok(Ok(processed)) => {
                log::info!(
                    "processed {}: {} -> {} bytes",
                    processed.name,
                    processed.original_size,
                    processed.len()
                );
                Ok(processed)
            }
            Ok(Err(e)) => {
                log::warn!("compression of {} failed: {}", asset.name, e);
                Err(FieldError::CompressionFailed(e.to_string()))
            }
            Err(e) => {
                log::warn!("image worker for {} failed: {}", asset.name, e);
                if compress {
                    Err(FieldError::CompressionFailed(e.to_string()))
                } else {
                    Err(FieldError::ProcessingFailed(e.to_string()))
                }
            }
        }
    }
}

/// Re-encode `data` so that it fits both ceilings of `options` and is no
/// larger than `data` itself.
///
/// The image is decoded from its content, so a mislabelled file still
/// decodes; the output is always encoded as `image_type`.
pub fn compress_image(
    data: &[u8],
    image_type: ImageType,
    options: CompressionOptions,
) -> Result<(Vec<u8>, (u32, u32)), Error> {
    let decoded = image::load_from_memory(data)?;
    let original_dimensions = decoded.dimensions();
    let within_bounds = fits(original_dimensions, options.max_dimension);
    let budget = options.max_bytes.min(data.len() as u64);

    let mut image = if within_bounds {
        decoded
    } else {
        decoded.resize(
            options.max_dimension,
            options.max_dimension,
            FilterType::Lanczos3,
        )
    };

    loop {
        let dimensions = image.dimensions();
        if let Some(encoded) = encode_within(&image, image_type, budget)? {
            log::trace!(
                "encoded {}x{} into {} bytes",
                dimensions.0,
                dimensions.1,
                encoded.len()
            );
            return Ok((encoded, dimensions));
        }

        if within_bounds && data.len() as u64 <= options.max_bytes {
            log::debug!("re-encoding does not beat the original, keeping it");
            return Ok((data.to_vec(), original_dimensions));
        }

        let longest = dimensions.0.max(dimensions.1);
        if longest <= MIN_DIMENSION {
            bail!("cannot fit image into {} bytes", budget);
        }
        let next = (longest * 3 / 4).max(MIN_DIMENSION);
        image = image.resize(next, next, FilterType::Triangle);
    }
}

fn fits((width, height): (u32, u32), max_dimension: u32) -> bool {
    width <= max_dimension && height <= max_dimension
}

/// Smallest-effort encoding of `image` that fits `budget`, if any
fn encode_within(
    image: &DynamicImage,
    image_type: ImageType,
    budget: u64,
) -> Result<Option<Vec<u8>>, Error> {
    let (width, height) = image.dimensions();
    match image_type {
        ImageType::Jpeg => {
            let rgb = image.to_rgb8();
            for quality in JPEG_QUALITY_STEPS {
                let mut buf = Vec::new();
                JpegEncoder::new_with_quality(&mut buf, quality).encode(
                    &rgb,
                    width,
                    height,
                    ColorType::Rgb8,
                )?;
                if buf.len() as u64 <= budget {
                    return Ok(Some(buf));
                }
            }
            Ok(None)
        }
        ImageType::Png => {
            let mut buf = Vec::new();
            let encoder = PngEncoder::new_with_quality(
                &mut buf,
                CompressionType::Best,
                PngFilter::Adaptive,
            );
            if image.color().has_alpha() {
                let rgba = image.to_rgba8();
                encoder.write_image(&rgba, width, height, ColorType::Rgba8)?;
            } else {
                let rgb = image.to_rgb8();
                encoder.write_image(&rgb, width, height, ColorType::Rgb8)?;
            }
            if buf.len() as u64 <= budget {
                Ok(Some(buf))
            } else {
                Ok(None)
            }
        }
    }
}

fn read_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    image::io::Reader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::validate::ImageOrigin;
    use image::{ImageBuffer, ImageOutputFormat, Rgb};
    use rstest::rstest;

    /// Noisy test picture; noise keeps encoders from collapsing it
    pub(crate) fn sample_image(
        width: u32,
        height: u32,
        format: ImageOutputFormat,
    ) -> Vec<u8> {
        let mut rng = fastrand::Rng::with_seed(7);
        let buffer = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([
                (x % 256) as u8 ^ rng.u8(..32),
                (y % 256) as u8 ^ rng.u8(..32),
                ((x + y) % 256) as u8,
            ])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(buffer)
            .write_to(&mut Cursor::new(&mut bytes), format)
            .unwrap();
        bytes
    }

    fn asset(name: &str, mime: &str, bytes: Vec<u8>) -> ImageAsset {
        ImageAsset::new(name, mime, bytes, ImageOrigin::Selected)
    }

    #[rstest]
    #[case(1600, 1200, ImageType::Jpeg)]
    #[case(700, 2000, ImageType::Jpeg)]
    #[case(900, 900, ImageType::Png)]
    #[tokio::test]
    async fn compressed_output_respects_ceilings(
        #[case] width: u32,
        #[case] height: u32,
        #[case] image_type: ImageType,
    ) {
        let format = match image_type {
            ImageType::Jpeg => ImageOutputFormat::Jpeg(95),
            ImageType::Png => ImageOutputFormat::Png,
        };
        let bytes = sample_image(width, height, format);
        let input = asset("pic", image_type.as_mime(), bytes);

        let processed = ImageProcessor::default()
            .process(&input, image_type, true)
            .await
            .unwrap();

        let (w, h) = processed.dimensions.unwrap();
        assert!(w <= 600 && h <= 600, "{}x{}", w, h);
        assert!(processed.len() <= input.len());
        assert!(processed.len() <= MEGABYTE);
        assert_eq!(processed.original_size, input.len());
        assert!(processed.compressed);
    }

    #[tokio::test]
    async fn aspect_ratio_is_kept() {
        let bytes = sample_image(1200, 600, ImageOutputFormat::Jpeg(95));
        let input = asset("wide.jpg", "image/jpeg", bytes);

        let processed = ImageProcessor::default()
            .process(&input, ImageType::Jpeg, true)
            .await
            .unwrap();

        assert_eq!(processed.dimensions, Some((600, 300)));
    }

    #[tokio::test]
    async fn disabled_compression_passes_bytes_through() {
        let bytes = sample_image(800, 800, ImageOutputFormat::Png);
        let input = asset("big.png", "image/png", bytes.clone());

        let processed = ImageProcessor::default()
            .process(&input, ImageType::Png, false)
            .await
            .unwrap();

        assert_eq!(processed.bytes, bytes);
        assert_eq!(processed.dimensions, Some((800, 800)));
        assert!(!processed.compressed);
    }

    #[tokio::test]
    async fn undecodable_bytes_pass_through_when_disabled() {
        let input = asset("junk.png", "image/png", vec![1, 2, 3, 4]);

        let processed = ImageProcessor::default()
            .process(&input, ImageType::Png, false)
            .await
            .unwrap();

        assert_eq!(processed.bytes, vec![1, 2, 3, 4]);
        assert_eq!(processed.dimensions, None);
    }

    #[tokio::test]
    async fn undecodable_bytes_fail_compression() {
        let input = asset("junk.png", "image/png", vec![1, 2, 3, 4]);

        let result = ImageProcessor::default()
            .process(&input, ImageType::Png, true)
            .await;

        assert!(matches!(result, Err(FieldError::CompressionFailed(_))));
    }

    #[tokio::test]
    async fn mislabelled_png_is_decoded_from_content() {
        let bytes = sample_image(1000, 750, ImageOutputFormat::Png);
        let input = asset("me photo.png", "image/jpeg", bytes);

        let processed = ImageProcessor::default()
            .process(&input, ImageType::Jpeg, true)
            .await
            .unwrap();

        assert_eq!(processed.mime(), "image/jpeg");
        assert_eq!(processed.dimensions, Some((600, 450)));
        assert!(processed.preview.as_str().starts_with("data:image/jpeg;"));
    }

    #[test]
    fn small_image_is_never_enlarged() {
        let bytes = sample_image(120, 80, ImageOutputFormat::Jpeg(60));
        let (out, dimensions) = compress_image(
            &bytes,
            ImageType::Jpeg,
            CompressionOptions::default(),
        )
        .unwrap();

        assert_eq!(dimensions, (120, 80));
        assert!(out.len() <= bytes.len());
    }

    #[test]
    fn tight_budget_shrinks_dimensions() {
        let bytes = sample_image(600, 600, ImageOutputFormat::Jpeg(95));
        let options = CompressionOptions {
            max_bytes: 8 * 1024,
            max_dimension: 600,
        };
        let (out, (w, h)) =
            compress_image(&bytes, ImageType::Jpeg, options).unwrap();

        assert!(out.len() <= 8 * 1024);
        assert!(w < 600 && h < 600);
    }

    #[test]
    fn optimistic_preview_uses_original_bytes() {
        let input = asset("a.png", "image/png", vec![0x89, b'P', b'N', b'G']);
        let preview = ImageProcessor::optimistic_preview(&input);
        assert_eq!(preview.as_str(), "data:image/png;base64,iVBORw==");
        assert!(preview.is_local());
    }
}
