/*
 * Meeting Companion Server - Capture Object Store
 * Copyright (c) 2024 Meeting Companion Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

/// Storage seam for captured frames. The bundled backend is the local
/// filesystem; a remote store implements the same two operations.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under a key and return the stored key.
    async fn put_object(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String>;

    /// Produce a URL a client can GET for the given key.
    async fn presign_get(&self, key: &str, ttl_secs: u64) -> Result<String>;
}

/// Writes captures under the upload directory; keys become `/files/...`
/// URIs served by the HTTP router.
pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn put_object(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create capture directory")?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write capture {}", path.display()))?;
        Ok(key.to_string())
    }

    async fn presign_get(&self, key: &str, _ttl_secs: u64) -> Result<String> {
        Ok(format!("/files/{}", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new(dir.path().to_path_buf());

        let key = store
            .put_object("realtime_captures/s1/f1.webp", b"frame-bytes", "image/webp")
            .await
            .unwrap();
        assert_eq!(key, "realtime_captures/s1/f1.webp");

        let uri = store.presign_get(&key, 86_400).await.unwrap();
        assert_eq!(uri, "/files/realtime_captures/s1/f1.webp");

        let written = std::fs::read(dir.path().join("realtime_captures/s1/f1.webp")).unwrap();
        assert_eq!(written, b"frame-bytes");
    }
}
