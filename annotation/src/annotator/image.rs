//! Image payload encoding for vision requests

use std::path::Path;

use base64::Engine as _;

use super::{AnnotatorError, AnnotatorResult};

/// Upper bound accepted by the hosted vision APIs
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// Base64 image ready to embed in a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub media_type: &'static str,
    pub data: String,
}

impl EncodedImage {
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

/// Media type from the file extension; unknown extensions are sent as JPEG.
pub fn media_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

/// Read and base64-encode an image, rejecting files above `max_bytes`.
pub async fn encode_image(path: &Path, max_bytes: u64) -> AnnotatorResult<EncodedImage> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AnnotatorError::ImageNotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    if meta.len() > max_bytes {
        return Err(AnnotatorError::ImageTooLarge {
            path: path.to_path_buf(),
            size: meta.len(),
            limit: max_bytes,
        });
    }

    let bytes = tokio::fs::read(path).await?;
    Ok(EncodedImage {
        media_type: media_type_for(path),
        data: base64::engine::general_purpose::STANDARD.encode(bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_media_types() {
        assert_eq!(media_type_for(Path::new("a.PNG")), "image/png");
        assert_eq!(media_type_for(Path::new("a.webp")), "image/webp");
        assert_eq!(media_type_for(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(media_type_for(Path::new("noext")), "image/jpeg");
    }

    #[tokio::test]
    async fn test_encode_small_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.png");
        std::fs::write(&path, b"abc").unwrap();

        let encoded = encode_image(&path, DEFAULT_MAX_IMAGE_BYTES).await.unwrap();
        assert_eq!(encoded.data, "YWJj");
        assert_eq!(encoded.data_uri(), "data:image/png;base64,YWJj");
    }

    #[tokio::test]
    async fn test_encode_rejects_large_image() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.jpg");
        std::fs::write(&path, vec![0u8; 16]).unwrap();

        let err = encode_image(&path, 8).await.unwrap_err();
        assert!(matches!(err, AnnotatorError::ImageTooLarge { size: 16, .. }));
    }

    #[tokio::test]
    async fn test_encode_missing_image() {
        let err = encode_image(Path::new("/nonexistent/x.jpg"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, AnnotatorError::ImageNotFound(_)));
    }
}
