//! Image sources: live camera frames and uploaded files, unified into one
//! canonical encoded image. Downstream (state machine, OCR) never cares
//! which source an image came from.

pub mod camera;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use image::ImageEncoder;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ScanError;

/// A frame grabbed from a live stream. Raw RGBA8, row-major, no padding.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    /// Intrinsic width at grab time (the negotiated resolution, not the requested one).
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Camera,
    Upload,
}

struct ImageData {
    bytes: Vec<u8>,
    mime: String,
    width: u32,
    height: u32,
    digest: blake3::Hash,
    source: ImageSource,
}

/// Immutable encoded image. Clones share the same buffer; a new capture or
/// upload produces a new value instead of mutating this one.
#[derive(Clone)]
pub struct CanonicalImage {
    inner: Arc<ImageData>,
}

impl CanonicalImage {
    fn new(bytes: Vec<u8>, mime: String, width: u32, height: u32, source: ImageSource) -> Self {
        let digest = blake3::hash(&bytes);
        Self {
            inner: Arc::new(ImageData {
                bytes,
                mime,
                width,
                height,
                digest,
                source,
            }),
        }
    }

    /// Encoded bytes (PNG for camera frames, the file's own encoding for uploads).
    pub fn bytes(&self) -> &[u8] {
        &self.inner.bytes
    }

    pub fn len(&self) -> usize {
        self.inner.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bytes.is_empty()
    }

    pub fn mime(&self) -> &str {
        &self.inner.mime
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.inner.width, self.inner.height)
    }

    pub fn source(&self) -> ImageSource {
        self.inner.source
    }

    /// Short content id (first 16 hex chars of the blake3 digest).
    pub fn id(&self) -> String {
        self.inner.digest.to_hex().as_str()[..16].to_string()
    }

    /// `data:<mime>;base64,...` form, suitable for a preview element.
    pub fn to_data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.inner.mime,
            base64::engine::general_purpose::STANDARD.encode(&self.inner.bytes)
        )
    }

    /// True when both values refer to the same capture or upload event.
    pub fn same_event(&self, other: &CanonicalImage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for CanonicalImage {
    fn eq(&self, other: &Self) -> bool {
        self.inner.digest == other.inner.digest && self.inner.mime == other.inner.mime
    }
}

impl std::fmt::Debug for CanonicalImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanonicalImage")
            .field("id", &self.id())
            .field("mime", &self.inner.mime)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("len", &self.inner.bytes.len())
            .field("source", &self.inner.source)
            .finish()
    }
}

/// Rasterize a live frame into PNG at its native size. No scaling, no cropping.
pub fn from_captured_frame(frame: &VideoFrame) -> Result<CanonicalImage, ScanError> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Err(ScanError::InvalidInput(format!(
            "frame has no pixels ({width}x{height})"
        )));
    }
    let expected = width as usize * height as usize * 4;
    if frame.data.len() != expected {
        return Err(ScanError::InvalidInput(format!(
            "frame buffer is {} bytes, expected {expected} for {width}x{height} RGBA",
            frame.data.len()
        )));
    }

    let mut png = Vec::new();
    image::codecs::png::PngEncoder::new(&mut png).write_image(
        &frame.data,
        width,
        height,
        image::ExtendedColorType::Rgba8,
    )?;

    debug!(width, height, size = png.len(), "frame_rasterized");
    Ok(CanonicalImage::new(
        png,
        "image/png".to_string(),
        width,
        height,
        ImageSource::Camera,
    ))
}

/// Validate and decode an uploaded file. The declared MIME type must be an
/// image type; the content must decode. Decoding runs on the blocking pool.
pub async fn from_uploaded_file(
    bytes: Vec<u8>,
    declared_mime: &str,
) -> Result<CanonicalImage, ScanError> {
    let mime = normalize_image_mime(declared_mime)?;
    if bytes.is_empty() {
        return Err(ScanError::InvalidInput("uploaded file is empty".into()));
    }

    let decoded = tokio::task::spawn_blocking(move || {
        let img = image::load_from_memory(&bytes)?;
        Ok::<_, image::ImageError>((bytes, img.width(), img.height()))
    })
    .await
    .map_err(|e| ScanError::InvalidInput(format!("decode task failed: {e}")))?;

    let (bytes, width, height) = decoded.map_err(|e| {
        warn!(error = %e, mime = %mime, "upload decode failed");
        ScanError::InvalidInput(format!("cannot decode {mime}: {e}"))
    })?;

    debug!(width, height, size = bytes.len(), mime = %mime, "upload_decoded");
    Ok(CanonicalImage::new(bytes, mime, width, height, ImageSource::Upload))
}

/// Read a file from disk and treat it as an upload. The MIME type is taken
/// from the extension.
pub async fn from_path(path: &Path) -> Result<CanonicalImage, ScanError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        ScanError::InvalidInput(format!("cannot read {}: {e}", path.display()))
    })?;
    let mime = image::ImageFormat::from_path(path)
        .map(|f| f.to_mime_type())
        .unwrap_or("application/octet-stream");
    from_uploaded_file(bytes, mime).await
}

/// `image/png; charset=x` → `image/png`. Anything outside `image/*` is rejected.
fn normalize_image_mime(declared: &str) -> Result<String, ScanError> {
    let essence = declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.strip_prefix("image/") {
        Some(subtype) if !subtype.is_empty() => Ok(essence),
        _ => Err(ScanError::InvalidInput(format!(
            "unsupported upload type: {declared:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32) -> VideoFrame {
        VideoFrame::new(vec![200u8; (width * height * 4) as usize], width, height)
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(width, height, image::Rgba([255, 255, 255, 255]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_frame_keeps_native_resolution() {
        // Negotiated 640x480 even though the request asked for portrait.
        let image = from_captured_frame(&solid_frame(640, 480)).unwrap();
        assert_eq!(image.dimensions(), (640, 480));
        assert_eq!(image.mime(), "image/png");
        assert_eq!(image.source(), ImageSource::Camera);

        let decoded = image::load_from_memory(image.bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 480));
    }

    #[test]
    fn test_frame_with_short_buffer_is_rejected() {
        let mut frame = solid_frame(4, 4);
        frame.data.truncate(10);
        let err = from_captured_frame(&frame).unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(_)));
    }

    #[test]
    fn test_empty_frame_is_rejected() {
        let frame = VideoFrame::new(Vec::new(), 0, 0);
        assert!(matches!(
            from_captured_frame(&frame),
            Err(ScanError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_upload_rejects_non_image_mime() {
        let err = from_uploaded_file(png_bytes(2, 2), "application/pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(_)));

        let err = from_uploaded_file(png_bytes(2, 2), "image/").await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_upload_rejects_undecodable_content() {
        let err = from_uploaded_file(b"definitely not a png".to_vec(), "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_upload_keeps_original_bytes() {
        let bytes = png_bytes(100, 100);
        let image = from_uploaded_file(bytes.clone(), "IMAGE/PNG; name=scan.png")
            .await
            .unwrap();
        assert_eq!(image.bytes(), bytes.as_slice());
        assert_eq!(image.len(), bytes.len());
        assert_eq!(image.mime(), "image/png");
        assert_eq!(image.dimensions(), (100, 100));
        assert_eq!(image.source(), ImageSource::Upload);
        assert!(image.to_data_url().starts_with("data:image/png;base64,iVBOR"));
    }

    #[tokio::test]
    async fn test_same_content_is_equal_but_distinct_event() {
        let a = from_uploaded_file(png_bytes(3, 3), "image/png").await.unwrap();
        let b = from_uploaded_file(png_bytes(3, 3), "image/png").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert!(!a.same_event(&b));
        assert!(a.same_event(&a.clone()));
    }

    #[tokio::test]
    async fn test_from_path_reports_unreadable_file() {
        let err = from_path(Path::new("/definitely/missing/scan.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(msg) if msg.contains("cannot read")));
    }

    #[tokio::test]
    async fn test_from_path_infers_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt.png");
        std::fs::write(&path, png_bytes(5, 7)).unwrap();
        let image = from_path(&path).await.unwrap();
        assert_eq!(image.mime(), "image/png");
        assert_eq!(image.dimensions(), (5, 7));
    }
}
