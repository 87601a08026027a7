//! Multimodal message construction helpers.
//!
//! Bytes-first: images arrive from the object store or the generator as raw
//! bytes and are embedded as `data:` URLs, or referenced by public URL.

use atelier_kernel::error::{EngineError, EngineResult};
use atelier_kernel::llm::{ChatMessage, ContentPart, ImageUrl};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Encode raw image bytes as a `data:<mime>;base64,<data>` URL.
pub fn encode_data_url(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}

/// Sniff the MIME type of raw image bytes.
pub fn detect_mime_type(bytes: &[u8]) -> EngineResult<String> {
    infer::get(bytes)
        .map(|info| info.mime_type().to_string())
        .ok_or_else(|| EngineError::validation("unrecognized image format"))
}

/// Base64-encode image bytes for an edit-source payload.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 payload back into bytes.
pub fn decode_base64(data: &str) -> EngineResult<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| EngineError::Serialization(format!("invalid base64 image payload: {e}")))
}

/// Build a user message embedding image bytes directly as a data URL, for
/// backends that cannot reach the public image URL.
pub fn build_inline_image_message(
    text: impl Into<String>,
    bytes: &[u8],
) -> EngineResult<ChatMessage> {
    let mime = detect_mime_type(bytes)?;
    Ok(ChatMessage::user_with_parts(vec![
        ContentPart::Text { text: text.into() },
        ContentPart::Image {
            image_url: ImageUrl {
                url: encode_data_url(bytes, &mime),
                detail: None,
            },
        },
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Smallest valid PNG header bytes; enough for MIME sniffing.
    const PNG_MAGIC: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D,
    ];

    #[test]
    fn data_url_has_expected_shape() {
        let url = encode_data_url(b"abc", "image/png");
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn base64_round_trip() {
        let bytes = vec![0u8, 1, 2, 250, 255];
        let encoded = encode_base64(&bytes);
        assert_eq!(decode_base64(&encoded).unwrap(), bytes);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_base64("not base64 at all!!!").is_err());
    }

    #[test]
    fn detects_png_from_magic_bytes() {
        assert_eq!(detect_mime_type(PNG_MAGIC).unwrap(), "image/png");
    }

    #[test]
    fn unknown_bytes_fail_detection() {
        assert!(detect_mime_type(&[0x00, 0x01, 0x02]).is_err());
    }

    #[test]
    fn inline_image_message_carries_data_url() {
        let msg = build_inline_image_message("look", PNG_MAGIC).unwrap();
        assert!(msg.has_image());
        assert_eq!(msg.text_content(), Some("look"));
    }
}
