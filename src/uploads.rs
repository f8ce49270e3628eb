//! Image attachments for posts.
//!
//! Uploads are checked for type before their body is read, size-capped while
//! streaming, and written under a generated name into a flat directory that
//! is also served at [`PUBLIC_PREFIX`].

use std::path::{Path, PathBuf};

use axum::extract::multipart::{Field, MultipartError};
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::io::AsyncWriteExt;

use crate::error::AppError;

/// URL prefix under which stored images are served.
pub const PUBLIC_PREFIX: &str = "/uploads";

/// Multipart field name reserved for the post image.
pub const IMAGE_FIELD: &str = "image";

const REJECTED_TYPE: &str = "Only JPEG, JPG, and PNG images are allowed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageKind {
    Jpeg,
    Png,
}

impl ImageKind {
    fn from_mime(essence: &str) -> Option<Self> {
        match essence {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(ImageKind::Jpeg),
            "image/png" => Some(ImageKind::Png),
            _ => None,
        }
    }
}

/// An accepted image held in memory, not yet on disk.
#[derive(Debug, Clone)]
pub struct PendingImage {
    /// Lowercased original extension, one of `jpg`, `jpeg`, `png`.
    pub extension: String,
    pub data: Bytes,
}

fn rejected_type() -> AppError {
    AppError::UnsupportedMediaType(REJECTED_TYPE.to_string())
}

fn too_large(max_bytes: usize) -> AppError {
    AppError::PayloadTooLarge(format!("Image must be {} bytes or smaller", max_bytes))
}

/// Decide whether an upload is an allowed image from its file name and its
/// declared content type. Both must agree. Returns the lowercased extension.
pub fn classify(file_name: Option<&str>, content_type: Option<&str>) -> Result<String, AppError> {
    let reject = rejected_type;

    let extension = file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .ok_or_else(reject)?;
    if !matches!(extension.as_str(), "jpg" | "jpeg" | "png") {
        return Err(reject());
    }

    let by_extension = mime_guess::from_ext(&extension)
        .first()
        .and_then(|mime| ImageKind::from_mime(mime.essence_str()))
        .ok_or_else(reject)?;

    let declared = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .and_then(|essence| ImageKind::from_mime(&essence))
        .ok_or_else(reject)?;

    if declared != by_extension {
        return Err(reject());
    }

    Ok(extension)
}

/// Collision-resistant stored file name: millisecond timestamp plus a random
/// component, keeping the (already validated) extension.
pub fn generate_file_name(extension: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
    format!("{}-{:09}.{}", millis, suffix, extension)
}

/// Translate a multipart parse failure into the error taxonomy.
pub fn multipart_error(err: MultipartError, max_bytes: usize) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        too_large(max_bytes)
    } else {
        AppError::Validation(err.body_text())
    }
}

/// Read one multipart field, refusing it once it grows past `max_bytes`.
pub async fn read_limited(field: &mut Field<'_>, max_bytes: usize) -> Result<Bytes, AppError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| multipart_error(e, max_bytes))?
    {
        if buf.len() + chunk.len() > max_bytes {
            return Err(too_large(max_bytes));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Validate and buffer the image field of a post-creation form.
///
/// `None` only for an empty file input: no file name and no bytes. A nameless
/// part that carries data is rejected like any other disallowed type.
pub async fn accept_image(
    field: &mut Field<'_>,
    max_bytes: usize,
) -> Result<Option<PendingImage>, AppError> {
    if field.file_name().map_or(true, str::is_empty) {
        let data = read_limited(field, max_bytes).await?;
        if data.is_empty() {
            return Ok(None);
        }
        return Err(rejected_type());
    }

    let extension = classify(field.file_name(), field.content_type())?;
    let data = read_limited(field, max_bytes).await?;
    Ok(Some(PendingImage { extension, data }))
}

/// Remove a partially written file when its write failed.
async fn discard_on_error(path: &Path, written: std::io::Result<()>) -> std::io::Result<()> {
    if written.is_err() {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), "Failed to discard partial upload: {}", e);
        }
    }
    written
}

/// The upload directory. Read-only configuration after startup.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl UploadStore {
    pub fn new(dir: PathBuf, max_bytes: usize) -> Self {
        Self { dir, max_bytes }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }

    /// Write an accepted image and return its mount-relative path.
    pub async fn store(&self, image: &PendingImage) -> Result<String, AppError> {
        let name = generate_file_name(&image.extension);
        let path = self.dir.join(&name);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        let written = async {
            file.write_all(&image.data).await?;
            file.flush().await
        }
        .await;
        drop(file);
        discard_on_error(&path, written).await?;

        tracing::debug!(file = %name, bytes = image.data.len(), "Stored upload");
        Ok(format!("{}/{}", PUBLIC_PREFIX, name))
    }

    /// Remove a previously stored image by its public path. Best effort.
    pub async fn remove(&self, public_path: &str) {
        let Some(name) = public_path
            .strip_prefix(PUBLIC_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty() && !name.contains(['/', '\\']) && !name.starts_with('.'))
        else {
            tracing::warn!(path = %public_path, "Refusing to remove unexpected upload path");
            return;
        };

        if let Err(e) = tokio::fs::remove_file(self.dir.join(name)).await {
            tracing::warn!(path = %public_path, "Failed to remove upload: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_jpeg_and_png() {
        assert_eq!(classify(Some("cat.JPG"), Some("image/jpeg")).unwrap(), "jpg");
        assert_eq!(classify(Some("cat.jpeg"), Some("image/jpeg")).unwrap(), "jpeg");
        assert_eq!(
            classify(Some("dog.png"), Some("image/png; charset=binary")).unwrap(),
            "png"
        );
    }

    #[test]
    fn rejects_disallowed_extension() {
        assert!(matches!(
            classify(Some("anim.gif"), Some("image/gif")),
            Err(AppError::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn rejects_spoofed_extension_or_mime() {
        // Allowed extension, disallowed declared type
        assert!(classify(Some("shell.png"), Some("text/html")).is_err());
        // Allowed declared type, disallowed extension
        assert!(classify(Some("shell.php"), Some("image/png")).is_err());
        // Both allowed but disagreeing
        assert!(classify(Some("photo.png"), Some("image/jpeg")).is_err());
    }

    #[test]
    fn rejects_missing_name_or_type() {
        assert!(classify(None, Some("image/png")).is_err());
        assert!(classify(Some("noext"), Some("image/png")).is_err());
        assert!(classify(Some("a.png"), None).is_err());
    }

    #[test]
    fn generated_names_keep_extension_and_differ() {
        let a = generate_file_name("png");
        let b = generate_file_name("png");
        assert!(a.ends_with(".png"));
        assert!(!a.contains('/'));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn store_writes_file_under_public_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let uploads = UploadStore::new(tmp.path().join("uploads"), 1024);
        uploads.ensure_dir().unwrap();

        let image = PendingImage {
            extension: "png".into(),
            data: Bytes::from_static(b"\x89PNG fake"),
        };
        let path = uploads.store(&image).await.unwrap();
        assert!(path.starts_with("/uploads/"));
        assert!(path.ends_with(".png"));

        let on_disk = uploads.dir().join(path.trim_start_matches("/uploads/"));
        assert_eq!(std::fs::read(&on_disk).unwrap(), b"\x89PNG fake");

        uploads.remove(&path).await;
        assert!(!on_disk.exists());
    }

    #[tokio::test]
    async fn failed_write_leaves_no_file_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("partial.png");
        std::fs::write(&path, b"half").unwrap();

        let failed = Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "disk full"));
        assert!(discard_on_error(&path, failed).await.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn successful_write_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("whole.png");
        std::fs::write(&path, b"png").unwrap();

        discard_on_error(&path, Ok(())).await.unwrap();
        assert!(path.exists());
    }

    #[test]
    fn size_rejection_names_configured_cap() {
        match too_large(1024) {
            AppError::PayloadTooLarge(message) => assert!(message.contains("1024")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn remove_ignores_paths_outside_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tmp.path().join("keep.txt");
        std::fs::write(&outside, "x").unwrap();

        let uploads = UploadStore::new(tmp.path().join("uploads"), 1024);
        uploads.ensure_dir().unwrap();
        uploads.remove("/uploads/../keep.txt").await;
        uploads.remove("/etc/passwd").await;
        assert!(outside.exists());
    }
}
