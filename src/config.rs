use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use std::fs::File;
use std::sync::LazyLock;
use std::time::Duration;

use crate::objectstore::ObjectStore;
use crate::Error;

/// Prefix marking a config value that should be read from the environment
const ENV_PREFIX: &str = "$ENV:";

/// Command line arguments
#[derive(Parser, Debug, Clone)]
#[clap(version, about = "One-shot administrative procedures for the marketplace")]
pub struct CmdArgs {
    /// Path to the YAML config file
    #[clap(long, global = true, default_value = "config.yaml")]
    pub config: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Runs the registered SQL migrations against the database
    Migrate {
        /// Only run the migration with this id [default is to run all of them in order]
        #[clap(long)]
        id: Option<String>,

        /// Print the registered migrations and exit without connecting
        #[clap(long)]
        list: bool,
    },
    /// Uploads the vendor app package to object storage and prints its public URL
    UploadApk {
        /// Local path of the package. Overrides `upload.file_path`
        #[clap(long)]
        file: Option<String>,

        /// Bucket to upload into. Overrides `upload.bucket`
        #[clap(long)]
        bucket: Option<String>,

        /// Object key. Overrides `upload.object_key`
        #[clap(long)]
        key: Option<String>,
    },
    /// Assigns promo codes to existing vendors that have none
    BackfillPromoCodes {
        /// Generate and print codes without writing them
        #[clap(long)]
        dry_run: bool,
    },
}

/// Global internal config object
pub static CMD_ARGS: LazyLock<CmdArgs> = LazyLock::new(CmdArgs::parse);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Prefer,
    #[default]
    Require,
    VerifyCa,
    VerifyFull,
}

impl From<SslMode> for PgSslMode {
    fn from(mode: SslMode) -> Self {
        match mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

fn default_port() -> u16 {
    5432
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Database {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub sslmode: SslMode,
}

impl Database {
    pub fn connect_options(&self) -> PgConnectOptions {
        // Transaction-mode poolers (pgbouncer, supavisor) do not keep named statements
        // alive across transactions
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
            .ssl_mode(self.sslmode.into())
            .statement_cache_capacity(0)
    }

    /// Opens a pool holding a single connection
    pub async fn connect(&self) -> Result<sqlx::PgPool, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(self.connect_options())
            .await?;

        Ok(pool)
    }
}

// Object storage code
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStorageType {
    #[serde(rename = "supabase")]
    Supabase,
    #[serde(rename = "s3-like")]
    S3Like,
    #[serde(rename = "local")]
    Local,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ObjectStorage {
    #[serde(rename = "type")]
    pub object_storage_type: ObjectStorageType,
    pub path: Option<String>,
    pub endpoint: Option<String>,
    pub secure: Option<bool>,
    /// Base URL objects are publicly served from (s3-like only)
    pub public_url: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub service_key: Option<String>,
    /// Request timeout for uploads, in seconds
    pub timeout_secs: Option<u64>,
}

impl ObjectStorage {
    fn endpoint_url(&self) -> Result<String, Error> {
        let endpoint = self.endpoint.as_ref().ok_or("Missing endpoint")?;

        Ok(format!(
            "{}://{}",
            if self.secure.unwrap_or(true) {
                "https"
            } else {
                "http"
            },
            endpoint
        ))
    }

    pub fn build(&self) -> Result<ObjectStore, Error> {
        match self.object_storage_type {
            ObjectStorageType::Supabase => {
                let service_key = self.service_key.as_ref().ok_or("Missing service key")?;

                ObjectStore::new_supabase(
                    self.endpoint_url()?,
                    service_key.to_string(),
                    Duration::from_secs(self.timeout_secs.unwrap_or(300)),
                )
            }
            ObjectStorageType::S3Like => {
                let access_key = self.access_key.as_ref().ok_or("Missing access key")?;
                let secret_key = self.secret_key.as_ref().ok_or("Missing secret key")?;
                let public_url = self.public_url.as_ref().ok_or("Missing public url")?;

                ObjectStore::new_s3(
                    "marketplace-ops".to_string(),
                    self.endpoint_url()?,
                    public_url.to_string(),
                    self.region.clone().unwrap_or_else(|| "auto".to_string()),
                    access_key.to_string(),
                    secret_key.to_string(),
                )
            }
            ObjectStorageType::Local => {
                let path = self.path.as_ref().ok_or("Missing path")?;
                Ok(ObjectStore::new_local(path.clone()))
            }
        }
    }
}

fn default_content_type() -> String {
    crate::upload::APK_CONTENT_TYPE.to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Upload {
    pub file_path: String,
    pub bucket: String,
    /// Defaults to the file name of `file_path`
    pub object_key: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Storage dashboard of the project, used in the manual upload instructions
    pub dashboard_url: Option<String>,
    /// Page users download the app from
    pub download_page: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    pub database: Option<Database>,
    pub object_storage: Option<ObjectStorage>,
    pub upload: Option<Upload>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let file =
            File::open(path).map_err(|e| format!("{} could not be loaded: {}", path, e))?;

        let value: serde_yaml::Value = serde_yaml::from_reader(file)?;
        Self::from_value(value, &|name| std::env::var(name).ok())
    }

    /// Resolves `$ENV:` references through `lookup`, then parses and validates
    fn from_value(
        mut value: serde_yaml::Value,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, Error> {
        resolve_env_refs(&mut value, lookup)?;

        let cfg: Config = serde_yaml::from_value(value)?;
        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if let Some(ref db) = self.database {
            if db.host.is_empty() {
                return Err("database.host must not be empty".into());
            }
            if db.user.is_empty() {
                return Err("database.user must not be empty".into());
            }
        }

        if let Some(ref upload) = self.upload {
            if upload.bucket.is_empty() {
                return Err("upload.bucket must not be empty".into());
            }
        }

        Ok(())
    }

    pub fn database(&self) -> Result<&Database, Error> {
        self.database
            .as_ref()
            .ok_or_else(|| "config has no `database` section".into())
    }

    pub fn object_storage(&self) -> Result<&ObjectStorage, Error> {
        self.object_storage
            .as_ref()
            .ok_or_else(|| "config has no `object_storage` section".into())
    }

    pub fn upload(&self) -> Result<&Upload, Error> {
        self.upload
            .as_ref()
            .ok_or_else(|| "config has no `upload` section".into())
    }
}

/// Replaces every `$ENV:NAME` string in the document with the value of `NAME`
fn resolve_env_refs(
    value: &mut serde_yaml::Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(), Error> {
    match value {
        serde_yaml::Value::String(s) => {
            if let Some(name) = s.strip_prefix(ENV_PREFIX) {
                let resolved = lookup(name)
                    .ok_or_else(|| format!("environment variable {} is not set", name))?;
                *s = resolved;
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq.iter_mut() {
                resolve_env_refs(item, lookup)?;
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                resolve_env_refs(item, lookup)?;
            }
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
database:
  host: aws-0-eu-central-1.pooler.supabase.com
  port: 6543
  database: postgres
  user: postgres.project
  password: $ENV:TEST_DB_PASSWORD
object_storage:
  type: supabase
  endpoint: project.supabase.co
  service_key: $ENV:TEST_SERVICE_KEY
upload:
  file_path: /tmp/vendor-app-1.2.0.apk
  bucket: apps
"#;

    fn parse(src: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Config, Error> {
        Config::from_value(serde_yaml::from_str(src)?, lookup)
    }

    fn fake_env(name: &str) -> Option<String> {
        match name {
            "TEST_DB_PASSWORD" => Some("hunter2".to_string()),
            "TEST_SERVICE_KEY" => Some("service-key".to_string()),
            _ => None,
        }
    }

    #[test]
    fn parses_sections_and_resolves_env() {
        let cfg = parse(SAMPLE, &fake_env).unwrap();

        let db = cfg.database().unwrap();
        assert_eq!(db.port, 6543);
        assert_eq!(db.password, "hunter2");
        assert_eq!(db.sslmode, SslMode::Require);

        let storage = cfg.object_storage().unwrap();
        assert_eq!(storage.object_storage_type, ObjectStorageType::Supabase);
        assert_eq!(storage.service_key.as_deref(), Some("service-key"));

        let upload = cfg.upload().unwrap();
        assert_eq!(upload.content_type, crate::upload::APK_CONTENT_TYPE);
        assert!(upload.object_key.is_none());
    }

    #[test]
    fn missing_env_var_is_named() {
        let err = parse(SAMPLE, &|_| None).unwrap_err();
        assert!(err.to_string().contains("TEST_DB_PASSWORD"));
    }

    #[test]
    fn missing_section_is_reported() {
        let cfg = parse("upload:\n  file_path: a.apk\n  bucket: apps\n", &fake_env).unwrap();
        let err = cfg.database().unwrap_err();
        assert!(err.to_string().contains("database"));
    }

    #[test]
    fn empty_bucket_is_rejected() {
        assert!(parse("upload:\n  file_path: a.apk\n  bucket: \"\"\n", &fake_env).is_err());
    }

    #[test]
    fn s3_storage_requires_credentials() {
        let storage: ObjectStorage =
            serde_yaml::from_str("type: s3-like\nendpoint: r2.example.com\n").unwrap();
        let err = storage.build().err().unwrap();
        assert!(err.to_string().contains("access key"));
    }
}
