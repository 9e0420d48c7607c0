//! S3-compatible project archive store
//!
//! Hibernated projects live as single zip objects at
//! `{prefix}/{user-id}/{project-id}/latest.zip`; soft-deleted backups move
//! under `deleted/`. Works against AWS S3 (no endpoint configured) or any
//! S3-compatible store (DigitalOcean Spaces, MinIO). Credentials may be
//! explicit or come from the SDK's ambient chain (IRSA on EKS).
//!
//! All object-store I/O flows through this process; credentials are never
//! materialized into user namespaces.

use std::path::{Path, PathBuf};
use std::time::Duration;

use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};
use uuid::Uuid;

use crate::archive;
use crate::config::S3Settings;
use crate::error::StorageError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ATTEMPTS: u32 = 3;

/// Prefix for soft-deleted project backups; retains independently of the
/// active prefix.
const DELETED_PREFIX: &str = "deleted";

type Result<T> = std::result::Result<T, StorageError>;

/// Client for project archives in S3-compatible object storage.
pub struct ProjectArchiveStore {
    client: Client,
    bucket: String,
    projects_prefix: String,
}

impl ProjectArchiveStore {
    /// Build the client and verify the bucket is reachable. A missing
    /// bucket or denied access is a permanent error surfaced immediately.
    pub async fn connect(settings: &S3Settings) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .retry_config(RetryConfig::adaptive().with_max_attempts(MAX_ATTEMPTS))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .read_timeout(READ_TIMEOUT)
                    .build(),
            );

        if let (Some(access_key), Some(secret_key)) =
            (&settings.access_key_id, &settings.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "tesslate-settings",
            ));
            info!("object store auth: explicit credentials");
        } else {
            info!("object store auth: ambient chain (IRSA/IAM role)");
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
            info!("object store endpoint: {}", endpoint);
        }
        let client = Client::from_conf(builder.build());

        let store = Self {
            client,
            bucket: settings.bucket.clone(),
            projects_prefix: settings.projects_prefix.clone(),
        };
        store.verify_bucket().await?;
        Ok(store)
    }

    async fn verify_bucket(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!("object store bucket '{}' is accessible", self.bucket);
                Ok(())
            }
            Err(err) => {
                let service_err = err.as_service_error();
                if service_err.map(|e| e.is_not_found()).unwrap_or(false) {
                    return Err(StorageError::BucketMissing {
                        bucket: self.bucket.clone(),
                    });
                }
                let raw_status = err
                    .raw_response()
                    .map(|r| r.status().as_u16())
                    .unwrap_or(0);
                if raw_status == 403 {
                    return Err(StorageError::AccessDenied {
                        bucket: self.bucket.clone(),
                    });
                }
                Err(StorageError::Request(err.to_string()))
            }
        }
    }

    /// Object key for a project's active archive.
    pub fn project_key(&self, user_id: Uuid, project_id: Uuid) -> String {
        format!(
            "{}/{}/{}/latest.zip",
            self.projects_prefix, user_id, project_id
        )
    }

    fn deleted_key(user_id: Uuid, project_id: Uuid) -> String {
        format!("{}/{}/{}/latest.zip", DELETED_PREFIX, user_id, project_id)
    }

    /// Whether a project archive exists.
    pub async fn exists(&self, user_id: Uuid, project_id: Uuid) -> Result<bool> {
        let key = self.project_key(user_id, project_id);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => {
                Ok(false)
            }
            Err(err) => Err(StorageError::Request(err.to_string())),
        }
    }

    /// Compress a project directory and upload it (dehydration).
    pub async fn upload(
        &self,
        user_id: Uuid,
        project_id: Uuid,
        source_dir: &Path,
        exclude_node_modules: bool,
    ) -> Result<()> {
        if !source_dir.exists() {
            return Err(StorageError::UploadFailed {
                key: self.project_key(user_id, project_id),
                message: format!("source path does not exist: {}", source_dir.display()),
            });
        }

        let spool = tempfile::Builder::new()
            .prefix("tesslate-project-")
            .suffix(".zip")
            .tempfile()
            .map_err(|e| StorageError::Request(e.to_string()))?;
        let spool_path = spool.path().to_path_buf();

        archive::compress_dir(source_dir.to_path_buf(), spool_path.clone(), exclude_node_modules)
            .await
            .map_err(|e| StorageError::UploadFailed {
                key: self.project_key(user_id, project_id),
                message: e.to_string(),
            })?;

        self.upload_archive(user_id, project_id, &spool_path).await
    }

    /// Upload an already-built zip archive.
    pub async fn upload_archive(
        &self,
        user_id: Uuid,
        project_id: Uuid,
        archive_path: &Path,
    ) -> Result<()> {
        let key = self.project_key(user_id, project_id);
        let size_mb = std::fs::metadata(archive_path)
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);

        let body = ByteStream::from_path(archive_path)
            .await
            .map_err(|e| StorageError::UploadFailed {
                key: key.clone(),
                message: e.to_string(),
            })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .content_type("application/zip")
            .metadata("user_id", user_id.to_string())
            .metadata("project_id", project_id.to_string())
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed {
                key: key.clone(),
                message: e.to_string(),
            })?;

        info!("uploaded project archive {} ({:.2} MB)", key, size_mb);
        Ok(())
    }

    /// Download a project archive and extract it into `dest_dir`
    /// (hydration).
    pub async fn download(
        &self,
        user_id: Uuid,
        project_id: Uuid,
        dest_dir: &Path,
    ) -> Result<()> {
        let spool = tempfile::Builder::new()
            .prefix("tesslate-project-")
            .suffix(".zip")
            .tempfile()
            .map_err(|e| StorageError::Request(e.to_string()))?;
        let spool_path = spool.path().to_path_buf();

        self.download_archive(user_id, project_id, &spool_path).await?;

        archive::extract_zip(spool_path, dest_dir.to_path_buf())
            .await
            .map_err(|e| StorageError::DownloadFailed {
                key: self.project_key(user_id, project_id),
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Download the raw zip archive to a local path.
    pub async fn download_archive(
        &self,
        user_id: Uuid,
        project_id: Uuid,
        dest_path: &Path,
    ) -> Result<()> {
        let key = self.project_key(user_id, project_id);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| {
                let not_found = err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false);
                if not_found {
                    StorageError::ArchiveNotFound { key: key.clone() }
                } else {
                    StorageError::DownloadFailed {
                        key: key.clone(),
                        message: err.to_string(),
                    }
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::DownloadFailed {
                key: key.clone(),
                message: e.to_string(),
            })?
            .into_bytes();

        tokio::fs::write(dest_path, &bytes)
            .await
            .map_err(|e| StorageError::DownloadFailed {
                key: key.clone(),
                message: e.to_string(),
            })?;

        info!(
            "downloaded project archive {} ({:.2} MB)",
            key,
            bytes.len() as f64 / (1024.0 * 1024.0)
        );
        Ok(())
    }

    /// Delete a project's active archive. Missing archives are fine.
    pub async fn delete(&self, user_id: Uuid, project_id: Uuid) -> Result<()> {
        let key = self.project_key(user_id, project_id);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;
        info!("deleted project archive {}", key);
        Ok(())
    }

    /// Server-side copy of the active archive under the `deleted/` prefix,
    /// preserving metadata. A missing source is not an error: the deletion
    /// flow proceeds whether or not a backup existed.
    pub async fn copy_to_deleted(&self, user_id: Uuid, project_id: Uuid) -> Result<bool> {
        if !self.exists(user_id, project_id).await? {
            debug!("no archive to back up for project {}", project_id);
            return Ok(false);
        }

        let source_key = self.project_key(user_id, project_id);
        let dest_key = Self::deleted_key(user_id, project_id);

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, source_key))
            .key(&dest_key)
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        info!("backed up project archive to {}", dest_key);
        Ok(true)
    }

    /// Presigned download URL for direct archive access.
    pub async fn presigned_url(
        &self,
        user_id: Uuid,
        project_id: Uuid,
        ttl: Duration,
    ) -> Result<String> {
        let key = self.project_key(user_id, project_id);
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Request(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(config)
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    /// Size of the stored archive in bytes, None when absent.
    pub async fn size(&self, user_id: Uuid, project_id: Uuid) -> Result<Option<i64>> {
        let key = self.project_key(user_id, project_id);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(response) => Ok(response.content_length()),
            Err(err) if err.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) => {
                Ok(None)
            }
            Err(err) => Err(StorageError::Request(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let user = Uuid::new_v4();
        let project = Uuid::new_v4();

        let key = format!("projects/{}/{}/latest.zip", user, project);
        assert_eq!(key.matches('/').count(), 3);

        let deleted = ProjectArchiveStore::deleted_key(user, project);
        assert!(deleted.starts_with("deleted/"));
        assert!(deleted.ends_with("/latest.zip"));
    }
}
