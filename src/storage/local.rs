//! Local filesystem object store

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};

use super::traits::ObjectStore;
use super::types::{ByteStream, ObjectMetadata};

/// Read buffer size for streamed responses (64 KiB)
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key below the root, rejecting anything that could escape it
    fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        for component in Path::new(key).components() {
            if !matches!(component, Component::Normal(_)) {
                return Err(StorageError::InvalidKey(format!(
                    "unsafe path component in {}",
                    key
                )));
            }
        }

        Ok(self.root.join(key))
    }

    fn temp_path(path: &Path) -> PathBuf {
        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or(temp_name),
        )
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMetadata> {
        let path = self.key_path(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| StorageError::from_io(e, key))?;

        if !metadata.is_file() {
            return Err(StorageError::ObjectNotFound(key.to_string()));
        }

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(Into::into),
            content_type: None,
            etag: None,
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| StorageError::from_io(e, key))?;
        Ok(Bytes::from(data))
    }

    async fn get_range_stream(&self, key: &str, offset: u64, len: u64) -> StorageResult<ByteStream> {
        let path = self.key_path(key)?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| StorageError::from_io(e, key))?;

        file.seek(SeekFrom::Start(offset)).await?;
        let reader = ReaderStream::with_capacity(file.take(len), STREAM_CHUNK_SIZE);

        Ok(Box::pin(reader.map(|chunk| chunk.map_err(StorageError::Io))))
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a uniquely named sibling, fsync, then rename into place
        let temp_path = Self::temp_path(&path);
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }

        // Persist the rename itself
        if let Some(parent) = path.parent() {
            if let Ok(dir) = fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| StorageError::from_io(e, key))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base = self.key_path(prefix)?;

        match fs::metadata(&base).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => return Ok(vec![prefix.to_string()]),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut keys = Vec::new();
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }

                // In-progress writes are not objects yet
                if entry.file_name().to_string_lossy().contains(".tmp.") {
                    continue;
                }

                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }

        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let base = self.key_path(prefix)?;

        let metadata = match fs::symlink_metadata(&base).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::Io(e)),
        };

        if metadata.is_file() {
            fs::remove_file(&base).await?;
            return Ok(1);
        }

        let mut count = 0;
        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else {
                    count += 1;
                }
            }
        }

        fs::remove_dir_all(&base).await?;
        Ok(count)
    }
}
