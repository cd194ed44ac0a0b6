use std::path::Path;
use std::time::Duration;

use crate::Error;

/// Simple abstraction around object storages
pub enum ObjectStore {
    Supabase {
        client: reqwest::Client,
        url: String,
        service_key: String,
    },
    S3 {
        client: aws_sdk_s3::Client,
        public_url: String,
    },
    Local {
        dir: String,
    },
}

impl ObjectStore {
    pub fn new_supabase(
        url: String,
        service_key: String,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()?;

        Ok(ObjectStore::Supabase {
            client,
            url: url.trim_end_matches('/').to_string(),
            service_key,
        })
    }

    pub fn new_s3(
        app_name: String,
        endpoint: String,
        public_url: String,
        region: String,
        key: String,
        secret: String,
    ) -> Result<Self, Error> {
        let client = aws_sdk_s3::Client::from_conf(
            aws_sdk_s3::Config::builder()
                .credentials_provider(aws_sdk_s3::config::Credentials::new(
                    key, secret, None, None, "s3",
                ))
                .app_name(aws_sdk_s3::config::AppName::new(app_name)?)
                .region(aws_sdk_s3::config::Region::new(region))
                .endpoint_url(endpoint)
                .force_path_style(true)
                .behavior_version_latest()
                .build(),
        );

        Ok(ObjectStore::S3 {
            client,
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn new_local(dir: String) -> Self {
        ObjectStore::Local { dir }
    }
}

/// Returns the key unchanged if it is safe to use as an object key
///
/// Errors if the key is invalid (contains "../")
pub fn validate_key(key: &str) -> Result<&str, Error> {
    for segment in key.split('/') {
        match segment {
            ".." => return Err("Invalid key: potential path traversal attempt".into()),
            "." => return Err("Invalid key: current directory reference".into()),
            "" => return Err("Invalid key: empty path segment".into()),
            _ => {}
        }
    }
    Ok(key)
}

/// Returns the bucket unchanged if it is a single safe path segment
pub fn validate_bucket(bucket: &str) -> Result<&str, Error> {
    match bucket {
        "" => Err("Invalid bucket: empty name".into()),
        "." | ".." => Err("Invalid bucket: potential path traversal attempt".into()),
        b if b.contains('/') || b.contains('\\') => {
            Err("Invalid bucket: must be a single path segment".into())
        }
        b => Ok(b),
    }
}

/// Appends `segments` and then each segment of `key` to `base`, percent-encoding each one
fn object_url(base: &str, segments: &[&str], key: &str) -> Result<reqwest::Url, Error> {
    let mut url = reqwest::Url::parse(base)?;

    url.path_segments_mut()
        .map_err(|_| format!("Invalid storage url: {}", base))?
        .pop_if_empty()
        .extend(segments)
        .extend(key.split('/'));

    Ok(url)
}

/// Returns if an object exists in an S3-like bucket
async fn s3_object_exists(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
) -> Result<bool, Error> {
    let action = client.head_object().bucket(bucket).key(key);

    match action.send().await {
        Ok(_) => Ok(true),
        Err(e) => {
            let Some(e) = e.as_service_error() else {
                return Err(format!("Failed to check object: {}", e).into());
            };

            if e.is_not_found() {
                Ok(false)
            } else {
                Err(format!("Failed to check object: {}", e).into())
            }
        }
    }
}

/// The operations the uploader needs from an object store
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Uploads `data` to `bucket/key`, replacing an existing object when `upsert` is set
    async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<(), Error>;

    /// Returns the URL the object is publicly served from
    async fn public_url(&self, bucket: &str, key: &str) -> Result<String, Error>;
}

#[async_trait::async_trait]
impl Storage for ObjectStore {
    async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<(), Error> {
        let bucket = validate_bucket(bucket)?;
        let key = validate_key(key)?;

        match self {
            ObjectStore::Supabase {
                client,
                url,
                service_key,
            } => {
                let resp = client
                    .post(object_url(url, &["storage", "v1", "object", bucket], key)?)
                    .bearer_auth(service_key)
                    .header("apikey", service_key)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .header("x-upsert", if upsert { "true" } else { "false" })
                    .body(data)
                    .send()
                    .await?;

                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(format!("Failed to upload object: {} {}", status, body).into());
                }

                Ok(())
            }
            ObjectStore::S3 { client, .. } => {
                // put_object always overwrites
                if !upsert && s3_object_exists(client, bucket, key).await? {
                    return Err(format!("Object {}/{} already exists", bucket, key).into());
                }

                client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .content_type(content_type)
                    .body(aws_smithy_types::byte_stream::ByteStream::from(data))
                    .send()
                    .await?;

                Ok(())
            }
            ObjectStore::Local { dir } => {
                let path = Path::new(dir).join(bucket).join(key);

                if !upsert && path.exists() {
                    return Err(format!("Object {}/{} already exists", bucket, key).into());
                }

                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| format!("Failed to create directory: {}", e))?;
                }

                std::fs::write(path, data).map_err(|e| format!("Failed to write object: {}", e))?;

                Ok(())
            }
        }
    }

    async fn public_url(&self, bucket: &str, key: &str) -> Result<String, Error> {
        let bucket = validate_bucket(bucket)?;
        let key = validate_key(key)?;

        let url = match self {
            ObjectStore::Supabase { url, .. } => {
                object_url(url, &["storage", "v1", "object", "public", bucket], key)?
            }
            // The public domain of an S3-like bucket is bound to that bucket
            ObjectStore::S3 { public_url, .. } => object_url(public_url, &[], key)?,
            ObjectStore::Local { dir } => {
                let path = std::path::absolute(Path::new(dir).join(bucket).join(key))?;
                reqwest::Url::from_file_path(&path)
                    .map_err(|_| format!("Invalid object path: {}", path.display()))?
            }
        };

        Ok(url.to_string())
    }
}
