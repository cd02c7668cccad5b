//! Image decoding with EXIF orientation applied.

use crate::types::DecodedImage;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::io::{BufRead, Cursor, Seek};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to read image file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to guess image format: {0}")]
    Format(#[source] std::io::Error),
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("decoded image has zero dimensions")]
    Empty,
}

/// Decode an image file into upright RGB pixels.
pub fn decode_image_from_path(path: &str) -> Result<DecodedImage, DecodeError> {
    let reader = ImageReader::open(path).map_err(|source| DecodeError::Read {
        path: path.to_string(),
        source,
    })?;
    let decoded = decode_reader(reader)?;
    tracing::debug!(
        path,
        width = decoded.dimensions.width,
        height = decoded.dimensions.height,
        "decoded image"
    );
    Ok(decoded)
}

/// Decode an in-memory encoded image into upright RGB pixels.
pub fn decode_image_from_bytes(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
    decode_reader(ImageReader::new(Cursor::new(bytes)))
}

fn decode_reader<R: BufRead + Seek>(reader: ImageReader<R>) -> Result<DecodedImage, DecodeError> {
    let reader = reader.with_guessed_format().map_err(DecodeError::Format)?;
    let mut decoder = reader.into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);

    let rgb = image.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(DecodeError::Empty);
    }
    Ok(DecodedImage::new(rgb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};

    #[test]
    fn test_decode_png_bytes() {
        let source = RgbImage::from_pixel(7, 3, Rgb([10, 20, 30]));
        let mut encoded = Vec::new();
        source
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
            .unwrap();

        let decoded = decode_image_from_bytes(&encoded).unwrap();
        assert_eq!(decoded.dimensions.width, 7);
        assert_eq!(decoded.dimensions.height, 3);
        assert_eq!(decoded.rgb.get_pixel(3, 1), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_decode_missing_file() {
        let err = decode_image_from_path("/nonexistent/photo.jpg").unwrap_err();
        assert!(matches!(err, DecodeError::Read { .. }));
    }

    #[test]
    fn test_decode_garbage_bytes() {
        assert!(decode_image_from_bytes(b"not an image").is_err());
    }
}
