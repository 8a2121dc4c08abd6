//! Image payload decoding: base64 transport strings and encoded photos.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::RgbImage;

use crate::extractor::ExtractionError;

/// Decode a base64 image payload, with or without a `data:image/...;base64,` prefix.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, ExtractionError> {
    let body = match payload.split_once(',') {
        Some((_, data)) => data,
        None => payload,
    };
    let body = body.trim();
    if body.is_empty() {
        return Err(ExtractionError::Decode("empty image payload".into()));
    }
    STANDARD
        .decode(body)
        .map_err(|e| ExtractionError::Decode(format!("base64: {e}")))
}

/// Encode raw image bytes for transport over JSON.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode an encoded photo (JPEG, PNG, ...) into packed RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, ExtractionError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| ExtractionError::Decode(format!("image: {e}")))?;
    Ok(img.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_payload() {
        let encoded = encode_payload(b"\x89PNG-bytes");
        assert_eq!(decode_payload(&encoded).unwrap(), b"\x89PNG-bytes");
    }

    #[test]
    fn test_decode_data_uri_payload() {
        let encoded = format!("data:image/jpeg;base64,{}", encode_payload(b"jpeg"));
        assert_eq!(decode_payload(&encoded).unwrap(), b"jpeg");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_payload("not base64!!"), Err(ExtractionError::Decode(_))));
        assert!(matches!(decode_payload("data:image/png;base64,"), Err(ExtractionError::Decode(_))));
    }

    #[test]
    fn test_decode_rgb_rejects_non_image() {
        assert!(matches!(decode_rgb(b"plain text"), Err(ExtractionError::Decode(_))));
    }

    #[test]
    fn test_decode_rgb_png() {
        let img = RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30]));
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let decoded = decode_rgb(&png).unwrap();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.get_pixel(0, 0).0, [10, 20, 30]);
    }
}
