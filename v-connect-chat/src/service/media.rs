use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::MediaConfig;
use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Message,
    Avatar,
}

/// 媒体引用 / Stored media reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub id: String,
    pub url: String,
    pub mime_type: String,
    pub size: usize,
    pub original_name: Option<String>,
    pub owner_id: String,
    pub kind: MediaKind,
}

/// 二进制存储边界 / Binary storage boundary
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn save(
        &self,
        bytes: &[u8],
        mime_type: &str,
        original_name: Option<&str>,
        owner_id: &str,
        kind: MediaKind,
    ) -> ChatResult<MediaRef>;

    async fn metadata(&self, id: &str) -> ChatResult<Option<MediaRef>>;

    async fn read(&self, id: &str) -> ChatResult<Option<(MediaRef, Vec<u8>)>>;
}

/// 本地磁盘、按内容寻址 / Content-addressed store on local disk
pub struct LocalMediaStore {
    dir: PathBuf,
    max_file_bytes: usize,
    allowed_mime_types: Vec<String>,
    public_base_url: String,
    index: DashMap<String, MediaRef>,
}

impl LocalMediaStore {
    pub fn new(cfg: &MediaConfig) -> Self {
        Self {
            dir: PathBuf::from(&cfg.dir),
            max_file_bytes: cfg.max_file_bytes,
            allowed_mime_types: cfg.allowed_mime_types.clone(),
            public_base_url: cfg.public_base_url.trim_end_matches('/').to_string(),
            index: DashMap::new(),
        }
    }

    pub fn is_allowed(&self, mime_type: &str) -> bool {
        self.allowed_mime_types.iter().any(|m| m == mime_type)
    }

    pub fn max_file_bytes(&self) -> usize {
        self.max_file_bytes
    }

    pub fn validate(&self, bytes: &[u8], mime_type: &str) -> ChatResult<()> {
        if bytes.is_empty() {
            return Err(ChatError::validation("File is empty"));
        }
        if !self.is_allowed(mime_type) {
            return Err(ChatError::validation(format!(
                "Unsupported file type: {}",
                mime_type
            )));
        }
        if bytes.len() > self.max_file_bytes {
            return Err(ChatError::validation(format!(
                "File exceeds {} bytes",
                self.max_file_bytes
            )));
        }
        Ok(())
    }

    fn content_id(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn io_error(e: std::io::Error) -> ChatError {
        ChatError::Infrastructure(format!("media storage: {}", e))
    }
}

fn is_content_id(id: &str) -> bool {
    id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn save(
        &self,
        bytes: &[u8],
        mime_type: &str,
        original_name: Option<&str>,
        owner_id: &str,
        kind: MediaKind,
    ) -> ChatResult<MediaRef> {
        self.validate(bytes, mime_type)?;
        let id = Self::content_id(bytes);
        if let Some(existing) = self.metadata(&id).await? {
            debug!("media {} deduplicated", id);
            return Ok(existing);
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(Self::io_error)?;
        tokio::fs::write(self.blob_path(&id), bytes)
            .await
            .map_err(Self::io_error)?;
        let media = MediaRef {
            url: format!("{}/media/{}", self.public_base_url, id),
            id: id.clone(),
            mime_type: mime_type.to_string(),
            size: bytes.len(),
            original_name: original_name.map(str::to_string),
            owner_id: owner_id.to_string(),
            kind,
        };
        let meta = serde_json::to_vec(&media)
            .map_err(|e| ChatError::Infrastructure(e.to_string()))?;
        tokio::fs::write(self.meta_path(&id), meta)
            .await
            .map_err(Self::io_error)?;
        self.index.insert(id, media.clone());
        Ok(media)
    }

    async fn metadata(&self, id: &str) -> ChatResult<Option<MediaRef>> {
        if !is_content_id(id) {
            return Ok(None);
        }
        if let Some(found) = self.index.get(id) {
            return Ok(Some(found.clone()));
        }
        match tokio::fs::read(self.meta_path(id)).await {
            Ok(raw) => {
                let media: MediaRef = serde_json::from_slice(&raw)
                    .map_err(|e| ChatError::Infrastructure(e.to_string()))?;
                self.index.insert(id.to_string(), media.clone());
                Ok(Some(media))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(e)),
        }
    }

    async fn read(&self, id: &str) -> ChatResult<Option<(MediaRef, Vec<u8>)>> {
        let Some(media) = self.metadata(id).await? else {
            return Ok(None);
        };
        match tokio::fs::read(self.blob_path(id)).await {
            Ok(bytes) => Ok(Some((media, bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(e)),
        }
    }
}
