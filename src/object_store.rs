//! Put/get/delete/list adapter for normalized rasters, keyed by the
//! canonical filename convention. Two backends share one trait, selected
//! by config rather than compile-time feature, matching the shape the
//! teacher reserves (but never wires up) in `config.rs`'s `StorageConfig`.

use crate::config::StorageConfig;
use crate::error::{GlamError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, local_path: &Path) -> Result<()>;
    async fn get(&self, key: &str, dest: &Path) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub fn build(config: &StorageConfig) -> std::sync::Arc<dyn ObjectStore> {
    match &config.s3 {
        Some(s3) => std::sync::Arc::new(S3Store::new(s3.clone())),
        None => std::sync::Arc::new(LocalFsStore::new(&config.local_root)),
    }
}

/// Filesystem-backed store used for tests and single-node deployments.
pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn put(&self, key: &str, local_path: &Path) -> Result<()> {
        let dest = self.path_for(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GlamError::PublishFailure {
                    acq: crate::error::AcquisitionRef {
                        product: key.to_string(),
                        date: chrono::Utc::now().date_naive(),
                        collection: None,
                    },
                    source: e.into(),
                })?;
        }
        tokio::fs::copy(local_path, &dest)
            .await
            .map_err(|e| GlamError::PublishFailure {
                acq: crate::error::AcquisitionRef {
                    product: key.to_string(),
                    date: chrono::Utc::now().date_naive(),
                    collection: None,
                },
                source: e.into(),
            })?;
        Ok(())
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<()> {
        let src = self.path_for(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(anyhow::Error::from)?;
        }
        tokio::fs::copy(&src, dest).await.map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::from(e).into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(anyhow::Error::from(e).into()),
        };
        while let Some(entry) = entries.next_entry().await.map_err(anyhow::Error::from)? {
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(out)
    }
}

/// S3-compatible store via presigned-style PUT/GET over the shared
/// `reqwest::Client`, reusing the endpoint/bucket/credential shape the
/// teacher defines in `config.rs::S3Config` but never consumes.
pub struct S3Store {
    config: crate::config::S3Config,
    http: reqwest::Client,
}

impl S3Store {
    pub fn new(config: crate::config::S3Config) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket,
            key
        )
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, local_path: &Path) -> Result<()> {
        let body = tokio::fs::read(local_path).await.map_err(anyhow::Error::from)?;
        let resp = self
            .http
            .put(self.object_url(key))
            .body(body)
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        if !resp.status().is_success() {
            return Err(GlamError::PublishFailure {
                acq: crate::error::AcquisitionRef {
                    product: key.to_string(),
                    date: chrono::Utc::now().date_naive(),
                    collection: None,
                },
                source: anyhow::anyhow!("PUT {} returned {}", key, resp.status()),
            });
        }
        Ok(())
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<()> {
        let resp = self
            .http
            .get(self.object_url(key))
            .send()
            .await
            .map_err(anyhow::Error::from)?
            .error_for_status()
            .map_err(anyhow::Error::from)?;
        let bytes = resp.bytes().await.map_err(anyhow::Error::from)?;
        tokio::fs::write(dest, &bytes).await.map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.object_url(key))
            .send()
            .await
            .map_err(anyhow::Error::from)?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow::anyhow!("DELETE {} returned {}", key, resp.status()).into());
        }
        Ok(())
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        // Listing requires the bucket's list-objects API (provider-specific XML/JSON);
        // left for the concrete provider integration to implement.
        Err(GlamError::BadInput("S3Store::list is not implemented for this provider".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_put_get_roundtrip() {
        let dir = tempdir();
        let store = LocalFsStore::new(dir.path());
        let src = dir.path().join("source.tif");
        tokio::fs::write(&src, b"raster bytes").await.unwrap();

        store.put("rasters/chirps.2019-12-01.tif", &src).await.unwrap();

        let dest = dir.path().join("dest.tif");
        store.get("rasters/chirps.2019-12-01.tif", &dest).await.unwrap();
        let contents = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(contents, b"raster bytes");
    }

    #[tokio::test]
    async fn local_store_delete_is_idempotent() {
        let dir = tempdir();
        let store = LocalFsStore::new(dir.path());
        store.delete("rasters/does-not-exist.tif").await.unwrap();
    }

    fn tempdir() -> TempDirGuard {
        TempDirGuard::new()
    }

    struct TempDirGuard(PathBuf);
    impl TempDirGuard {
        fn new() -> Self {
            let p = std::env::temp_dir().join(format!("glam-test-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&p).unwrap();
            Self(p)
        }
        fn path(&self) -> &Path {
            &self.0
        }
    }
    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
}
