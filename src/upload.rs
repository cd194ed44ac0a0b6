use log::info;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::Upload;
use crate::objectstore::Storage;
use crate::Error;

pub const APK_CONTENT_TYPE: &str = "application/vnd.android.package-archive";

/// A single package upload, resolved from config and command line overrides
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub file_path: PathBuf,
    pub bucket: String,
    pub object_key: String,
    pub content_type: String,
}

impl UploadJob {
    pub fn resolve(
        upload: &Upload,
        file: Option<&str>,
        bucket: Option<&str>,
        key: Option<&str>,
    ) -> Result<Self, Error> {
        let file_path = PathBuf::from(file.unwrap_or(&upload.file_path));

        let object_key = match key.or(upload.object_key.as_deref()) {
            Some(key) => key.to_string(),
            None => file_path
                .file_name()
                .ok_or("Failed to get file name")?
                .to_string_lossy()
                .to_string(),
        };

        Ok(Self {
            file_path,
            bucket: bucket.unwrap_or(&upload.bucket).to_string(),
            object_key,
            content_type: upload.content_type.clone(),
        })
    }
}

/// Upload failure carrying the steps to finish the upload by hand
#[derive(Debug)]
pub struct UploadFailed {
    pub source: Error,
    pub instructions: String,
}

impl fmt::Display for UploadFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for UploadFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

pub fn format_size(bytes: u64) -> String {
    format!("{:.2} MB ({} bytes)", bytes as f64 / 1024.0 / 1024.0, bytes)
}

pub fn fallback_instructions(dashboard_url: Option<&str>, job: &UploadJob) -> String {
    let location = match dashboard_url {
        Some(url) => format!(
            "Go to: {}/storage/buckets/{}",
            url.trim_end_matches('/'),
            job.bucket
        ),
        None => format!("Open the storage dashboard of bucket `{}`", job.bucket),
    };

    format!(
        "Please upload manually via the storage dashboard:\n   1. {}\n   2. Upload: {}",
        location,
        job.file_path.display()
    )
}

/// Wraps a failed upload with the instructions to finish it by hand
pub fn with_fallback(
    res: Result<String, Error>,
    dashboard_url: Option<&str>,
    job: &UploadJob,
) -> Result<String, Error> {
    res.map_err(|source| {
        UploadFailed {
            source,
            instructions: fallback_instructions(dashboard_url, job),
        }
        .into()
    })
}

async fn file_size(path: &Path) -> Result<u64, Error> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("Failed to stat {}: {}", path.display(), e))?;

    Ok(metadata.len())
}

/// Reads the package, uploads it with overwrite enabled and returns its public URL
pub async fn upload_apk(storage: &dyn Storage, job: &UploadJob) -> Result<String, Error> {
    let size = file_size(&job.file_path).await?;
    info!("File size: {}", format_size(size));

    info!("Uploading {} (this may take 1-2 minutes)...", job.file_path.display());
    let data = tokio::fs::read(&job.file_path)
        .await
        .map_err(|e| format!("Failed to read {}: {}", job.file_path.display(), e))?;

    storage
        .upload_file(&job.bucket, &job.object_key, data, &job.content_type, true)
        .await?;

    info!("Upload successful");

    storage.public_url(&job.bucket, &job.object_key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectstore::MockStorage;
    use mockall::Sequence;
    use std::io::Write;

    fn job_for(file: &tempfile::NamedTempFile) -> UploadJob {
        UploadJob {
            file_path: file.path().to_path_buf(),
            bucket: "apps".to_string(),
            object_key: "vendor-app-1.2.0.apk".to_string(),
            content_type: APK_CONTENT_TYPE.to_string(),
        }
    }

    fn apk_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"PK\x03\x04apk-bytes").unwrap();
        file
    }

    #[test]
    fn formats_size_in_megabytes() {
        assert_eq!(format_size(10_485_760), "10.00 MB (10485760 bytes)");
        assert_eq!(format_size(0), "0.00 MB (0 bytes)");
        assert_eq!(format_size(1_572_864), "1.50 MB (1572864 bytes)");
    }

    #[test]
    fn resolve_prefers_overrides_and_defaults_key_to_file_name() {
        let upload = Upload {
            file_path: "/tmp/vendor-app-1.2.0.apk".to_string(),
            bucket: "apps".to_string(),
            object_key: None,
            content_type: APK_CONTENT_TYPE.to_string(),
            dashboard_url: None,
            download_page: None,
        };

        let job = UploadJob::resolve(&upload, None, None, None).unwrap();
        assert_eq!(job.object_key, "vendor-app-1.2.0.apk");
        assert_eq!(job.bucket, "apps");

        let job = UploadJob::resolve(
            &upload,
            Some("/builds/app-release.apk"),
            Some("beta"),
            Some("vendor-app-1.3.0.apk"),
        )
        .unwrap();
        assert_eq!(job.file_path, PathBuf::from("/builds/app-release.apk"));
        assert_eq!(job.bucket, "beta");
        assert_eq!(job.object_key, "vendor-app-1.3.0.apk");
    }

    #[tokio::test]
    async fn uploads_then_fetches_url_for_same_key() {
        let file = apk_file();
        let job = job_for(&file);

        let mut storage = MockStorage::new();
        let mut seq = Sequence::new();

        storage
            .expect_upload_file()
            .withf(|bucket, key, data, content_type, upsert| {
                bucket == "apps"
                    && key == "vendor-app-1.2.0.apk"
                    && data.as_slice() == b"PK\x03\x04apk-bytes"
                    && content_type == APK_CONTENT_TYPE
                    && *upsert
            })
            .once()
            .in_sequence(&mut seq)
            .returning(|_, _, _, _, _| Ok(()));

        storage
            .expect_public_url()
            .withf(|bucket, key| bucket == "apps" && key == "vendor-app-1.2.0.apk")
            .once()
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok("https://cdn.example.com/storage/v1/object/public/apps/vendor-app-1.2.0.apk"
                    .to_string())
            });

        let url = upload_apk(&storage, &job).await.unwrap();
        assert!(url.ends_with("/apps/vendor-app-1.2.0.apk"));
    }

    #[tokio::test]
    async fn upload_failure_skips_url_lookup() {
        let file = apk_file();
        let job = job_for(&file);

        let mut storage = MockStorage::new();
        storage
            .expect_upload_file()
            .once()
            .returning(|_, _, _, _, _| Err("connection reset".into()));
        storage.expect_public_url().never();

        let err = upload_apk(&storage, &job).await.unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
    }

    #[tokio::test]
    async fn missing_file_fails_before_upload() {
        let job = UploadJob {
            file_path: PathBuf::from("/nonexistent/vendor-app.apk"),
            bucket: "apps".to_string(),
            object_key: "vendor-app.apk".to_string(),
            content_type: APK_CONTENT_TYPE.to_string(),
        };

        let mut storage = MockStorage::new();
        storage.expect_upload_file().never();
        storage.expect_public_url().never();

        assert!(upload_apk(&storage, &job).await.is_err());
    }

    #[test]
    fn fallback_names_bucket_dashboard_and_local_file() {
        let job = UploadJob {
            file_path: PathBuf::from("/tmp/vendor-app-1.2.0.apk"),
            bucket: "apps".to_string(),
            object_key: "vendor-app-1.2.0.apk".to_string(),
            content_type: APK_CONTENT_TYPE.to_string(),
        };

        let text = fallback_instructions(
            Some("https://supabase.com/dashboard/project/abc/"),
            &job,
        );
        assert!(text.contains("https://supabase.com/dashboard/project/abc/storage/buckets/apps"));
        assert!(text.contains("Upload: /tmp/vendor-app-1.2.0.apk"));

        let text = fallback_instructions(None, &job);
        assert!(text.contains("bucket `apps`"));
    }
}
