//! Resume image upload for chat image messages.
//!
//! The platform deduplicates uploads by MD5: the quick endpoint returns the
//! stored image when the hash is known, otherwise the file goes up as a
//! multipart form.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use jobpilot_core::models::ImageRef;
use jobpilot_core::traits::ImageSource;
use jobpilot_core::{AppError, CredentialStore};
use md5::{Digest, Md5};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;

use crate::platform::{PlatformConfig, data_of, send_json};

const QUICK_UPLOAD_PATH: &str = "/wapi/zpupload/quicklyUpload";
const FULL_UPLOAD_PATH: &str = "/wapi/zpupload/image/uploadSingle";
const UPLOAD_SOURCE: &str = "chat_file";

#[derive(Clone)]
pub struct ResumeImageUploader {
    credentials: Arc<CredentialStore>,
    config: PlatformConfig,
    path: PathBuf,
    file_name: String,
    mime: &'static str,
    bytes: Arc<Vec<u8>>,
    md5: String,
}

impl std::fmt::Debug for ResumeImageUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeImageUploader")
            .field("path", &self.path)
            .field("md5", &self.md5)
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl ResumeImageUploader {
    /// Load the image once; every later upload reuses the bytes and hash.
    pub async fn load(
        credentials: Arc<CredentialStore>,
        config: PlatformConfig,
        path: impl Into<PathBuf>,
    ) -> Result<Self, AppError> {
        let path = path.into();
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            AppError::ConfigError(format!("Cannot read resume image {}: {e}", path.display()))
        })?;
        if bytes.is_empty() {
            return Err(AppError::ConfigError(format!(
                "Resume image {} is empty",
                path.display()
            )));
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("resume.png")
            .to_string();

        Ok(Self {
            credentials,
            config,
            mime: mime_for(&path),
            md5: md5_hex(&bytes),
            file_name,
            path,
            bytes: Arc::new(bytes),
        })
    }

    pub fn md5(&self) -> &str {
        &self.md5
    }

    async fn quick_upload(&self, security_token: &str) -> Result<Option<ImageRef>, AppError> {
        let url = self.config.endpoint(QUICK_UPLOAD_PATH)?;
        let client = self.credentials.cooperative_client().await?;
        let form = [
            ("fileMd5", self.md5.as_str()),
            ("fileSize", "0"),
            ("source", UPLOAD_SOURCE),
            ("securityId", security_token),
        ];
        let request = client
            .post(url)
            .form(&form)
            .timeout(self.config.request_timeout);
        let body = send_json(request, self.config.request_timeout).await?;
        parse_upload("quick_upload", &body)
    }

    async fn full_upload(&self, security_token: &str) -> Result<ImageRef, AppError> {
        let url = self.config.endpoint(FULL_UPLOAD_PATH)?;
        let client = self.credentials.cooperative_client().await?;
        let part = Part::bytes(self.bytes.as_ref().clone())
            .file_name(self.file_name.clone())
            .mime_str(self.mime)
            .map_err(|e| AppError::HttpError(format!("Invalid MIME type: {e}")))?;
        let form = Form::new()
            .text("securityId", security_token.to_string())
            .text("source", UPLOAD_SOURCE)
            .part("file", part);
        let request = client
            .post(url)
            .multipart(form)
            .timeout(self.config.request_timeout);
        let body = send_json(request, self.config.request_timeout).await?;
        parse_upload("full_upload", &body)?
            .ok_or_else(|| AppError::MissingField("full_upload: zpData.url".into()))
    }
}

impl ImageSource for ResumeImageUploader {
    async fn resolve(&self, security_token: &str) -> Result<ImageRef, AppError> {
        let retry = &self.config.retry;
        match retry
            .run("quick_upload", || self.quick_upload(security_token))
            .await
        {
            Ok(Some(image)) => {
                tracing::debug!(md5 = %self.md5, "Resume image already on the platform");
                return Ok(image);
            }
            Ok(None) => {}
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => tracing::debug!(error = %e, "Quick upload refused, sending the file"),
        }
        let image = retry
            .run("full_upload", || self.full_upload(security_token))
            .await?;
        tracing::info!(url = %image.url, size = self.bytes.len(), "Uploaded resume image");
        Ok(image)
    }
}

#[derive(Deserialize)]
struct UploadData {
    #[serde(default)]
    url: String,
    metadata: Option<ImageMetadata>,
}

#[derive(Deserialize)]
struct ImageMetadata {
    width: u32,
    height: u32,
}

/// `None` when the platform does not know the file yet.
fn parse_upload(op: &str, body: &Value) -> Result<Option<ImageRef>, AppError> {
    let data = data_of::<UploadData>(op, body)?;
    if data.url.is_empty() {
        return Ok(None);
    }
    let metadata = data
        .metadata
        .ok_or_else(|| AppError::MissingField(format!("{op}: zpData.metadata")))?;
    Ok(Some(ImageRef {
        url: data.url,
        width: metadata.width,
        height: metadata.height,
    }))
}

fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use jobpilot_core::RetryPolicy;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn store() -> Arc<CredentialStore> {
        Arc::new(CredentialStore::new(Default::default()))
    }

    fn image_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".png").tempfile().unwrap();
        file.write_all(b"hello").unwrap();
        file
    }

    fn fast_config(server: &MockServer) -> PlatformConfig {
        PlatformConfig::default()
            .with_base_url(&server.uri())
            .unwrap()
            .with_retry(
                RetryPolicy::http()
                    .with_base_delay(Duration::from_millis(10))
                    .with_jitter(Duration::ZERO),
            )
    }

    fn known_image_body() -> serde_json::Value {
        json!({
            "code": 0,
            "zpData": {
                "url": "https://img.example/r.png",
                "metadata": {"width": 1240, "height": 1754}
            }
        })
    }

    #[tokio::test]
    async fn quick_upload_is_retried_on_throttling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(QUICK_UPLOAD_PATH))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(QUICK_UPLOAD_PATH))
            .and(body_string_contains("fileMd5=5d41402abc4b2a76b9719d911017c592"))
            .respond_with(ResponseTemplate::new(200).set_body_json(known_image_body()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(FULL_UPLOAD_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(known_image_body()))
            .expect(0)
            .mount(&server)
            .await;

        let file = image_file();
        let uploader = ResumeImageUploader::load(store(), fast_config(&server), file.path())
            .await
            .unwrap();
        let image = uploader.resolve("sec-1").await.unwrap();

        assert_eq!(
            image,
            ImageRef {
                url: "https://img.example/r.png".into(),
                width: 1240,
                height: 1754,
            }
        );
    }

    #[tokio::test]
    async fn unknown_image_falls_back_to_full_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(QUICK_UPLOAD_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "zpData": {}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(FULL_UPLOAD_PATH))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(FULL_UPLOAD_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(known_image_body()))
            .expect(1)
            .mount(&server)
            .await;

        let file = image_file();
        let uploader = ResumeImageUploader::load(store(), fast_config(&server), file.path())
            .await
            .unwrap();
        let image = uploader.resolve("sec-1").await.unwrap();
        assert_eq!(image.width, 1240);
    }

    #[tokio::test]
    async fn load_hashes_file() {
        let mut file = tempfile::Builder::new().suffix(".PNG").tempfile().unwrap();
        file.write_all(b"hello").unwrap();

        let uploader = ResumeImageUploader::load(store(), PlatformConfig::default(), file.path())
            .await
            .unwrap();
        assert_eq!(uploader.md5(), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(uploader.mime, "image/png");
    }

    #[tokio::test]
    async fn missing_or_empty_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ResumeImageUploader::load(
            store(),
            PlatformConfig::default(),
            dir.path().join("absent.png"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));

        let empty = tempfile::NamedTempFile::new().unwrap();
        let err = ResumeImageUploader::load(store(), PlatformConfig::default(), empty.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn known_file_yields_image_ref() {
        let body = json!({
            "code": 0,
            "zpData": {
                "url": "https://img.example/r.png",
                "tinyUrl": "https://img.example/r_tiny.png",
                "metadata": {"width": 1240, "height": 1754}
            }
        });
        assert_eq!(
            parse_upload("quick_upload", &body).unwrap(),
            Some(ImageRef {
                url: "https://img.example/r.png".into(),
                width: 1240,
                height: 1754,
            })
        );
    }

    #[test]
    fn unknown_file_yields_none() {
        let body = json!({"code": 0, "zpData": {}});
        assert_eq!(parse_upload("quick_upload", &body).unwrap(), None);
    }

    #[test]
    fn url_without_metadata_is_structural() {
        let body = json!({"code": 0, "zpData": {"url": "https://img.example/r.png"}});
        assert!(matches!(
            parse_upload("full_upload", &body),
            Err(AppError::MissingField(_))
        ));
    }

    #[test]
    fn mime_by_extension() {
        assert_eq!(mime_for(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a")), "application/octet-stream");
    }
}
