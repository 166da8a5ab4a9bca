use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat as CodecFormat};
use shears_contracts::conversation::{ImageFormat, ImagePayload};
use shears_contracts::errors::{GenerationError, GenerationResult};
use tracing::debug;

/// Turns inline bytes from the endpoint into a payload, checking that they
/// decode as an image. The format is read from the bytes; the declared mime
/// type is only used when the bytes carry no recognizable signature.
///
/// With `max_dim` set, images larger than the bound on either side are
/// downscaled to fit it (aspect ratio kept, Lanczos3) and re-encoded in their
/// own format.
pub fn decode_inline_image(
    mime_type: &str,
    data: Vec<u8>,
    max_dim: Option<u32>,
) -> GenerationResult<ImagePayload> {
    let sniffed = image::guess_format(&data)
        .ok()
        .and_then(format_from_codec);
    let format = sniffed
        .or_else(|| ImageFormat::from_mime(mime_type))
        .ok_or_else(|| {
            GenerationError::malformed(format!("inline data has unsupported type {mime_type}"))
        })?;
    let decoded = decode(&data, format)?;
    let payload = ImagePayload::new(data, format);
    match max_dim {
        Some(max_dim) => fit_decoded(payload, &decoded, max_dim),
        None => Ok(payload),
    }
}

fn fit_decoded(
    payload: ImagePayload,
    decoded: &DynamicImage,
    max_dim: u32,
) -> GenerationResult<ImagePayload> {
    let (width, height) = (decoded.width(), decoded.height());
    if width <= max_dim && height <= max_dim {
        return Ok(payload);
    }

    let format = payload.format();
    let resized = decoded.resize(max_dim, max_dim, FilterType::Lanczos3);
    debug!(
        from_width = width,
        from_height = height,
        to_width = resized.width(),
        to_height = resized.height(),
        "downscaled generated image"
    );
    Ok(ImagePayload::new(encode(&resized, format)?, format))
}

fn decode(bytes: &[u8], format: ImageFormat) -> GenerationResult<DynamicImage> {
    image::load_from_memory_with_format(bytes, codec_format(format)).map_err(|err| {
        GenerationError::malformed(format!(
            "{} image does not decode: {err}",
            format.extension()
        ))
    })
}

fn encode(image: &DynamicImage, format: ImageFormat) -> GenerationResult<Vec<u8>> {
    // JPEG has no alpha channel; the GIF encoder only takes RGBA.
    let image = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        ImageFormat::Gif => DynamicImage::ImageRgba8(image.to_rgba8()),
        _ => image.clone(),
    };
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, codec_format(format))
        .map_err(|err| {
            GenerationError::malformed(format!("failed to re-encode {}: {err}", format.extension()))
        })?;
    Ok(out.into_inner())
}

fn codec_format(format: ImageFormat) -> CodecFormat {
    match format {
        ImageFormat::Png => CodecFormat::Png,
        ImageFormat::Jpeg => CodecFormat::Jpeg,
        ImageFormat::Webp => CodecFormat::WebP,
        ImageFormat::Gif => CodecFormat::Gif,
    }
}

fn format_from_codec(format: CodecFormat) -> Option<ImageFormat> {
    match format {
        CodecFormat::Png => Some(ImageFormat::Png),
        CodecFormat::Jpeg => Some(ImageFormat::Jpeg),
        CodecFormat::WebP => Some(ImageFormat::Webp),
        CodecFormat::Gif => Some(ImageFormat::Gif),
        _ => None,
    }
}
