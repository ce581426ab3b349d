//! 待传输条目
//!
//! 载荷在发送前才加载，加载失败会中止当前批次。

use crate::error::TransferError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// 已加载的载荷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedItem {
    pub data: Vec<u8>,
    pub filename: Option<String>,
}

/// 可加载的传输条目
#[async_trait]
pub trait TransferItem: Send + Sync {
    /// 用于日志和界面显示的名称
    fn display_name(&self) -> String;

    async fn load(&self) -> Result<LoadedItem, TransferError>;
}

/// 本地文件
#[derive(Debug, Clone)]
pub struct PathItem {
    path: PathBuf,
}

impl PathItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    }
}

#[async_trait]
impl TransferItem for PathItem {
    fn display_name(&self) -> String {
        self.file_name()
            .unwrap_or_else(|| self.path.display().to_string())
    }

    async fn load(&self) -> Result<LoadedItem, TransferError> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|e| TransferError::UnreadableSource {
                name: self.display_name(),
                reason: e.to_string(),
            })?;

        Ok(LoadedItem {
            data,
            filename: self.file_name(),
        })
    }
}

/// 内存中的载荷
#[derive(Debug, Clone)]
pub struct MemoryItem {
    data: Vec<u8>,
    filename: Option<String>,
}

impl MemoryItem {
    pub fn new(data: impl Into<Vec<u8>>, filename: Option<String>) -> Self {
        Self {
            data: data.into(),
            filename,
        }
    }

    pub fn named(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(data, Some(name.into()))
    }
}

#[async_trait]
impl TransferItem for MemoryItem {
    fn display_name(&self) -> String {
        self.filename
            .clone()
            .unwrap_or_else(|| format!("<{} bytes>", self.data.len()))
    }

    async fn load(&self) -> Result<LoadedItem, TransferError> {
        Ok(LoadedItem {
            data: self.data.clone(),
            filename: self.filename.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_path_item_loads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let item = PathItem::new(&path);
        assert_eq!(item.display_name(), "note.txt");

        let loaded = item.load().await.unwrap();
        assert_eq!(loaded.data, b"hello");
        assert_eq!(loaded.filename.as_deref(), Some("note.txt"));
    }

    #[tokio::test]
    async fn test_missing_path_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let item = PathItem::new(dir.path().join("missing.bin"));

        let err = item.load().await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::UnreadableSource { ref name, .. } if name == "missing.bin"
        ));
    }

    #[tokio::test]
    async fn test_memory_item() {
        let item = MemoryItem::new(vec![1, 2, 3], None);
        assert_eq!(item.display_name(), "<3 bytes>");
        assert_eq!(item.load().await.unwrap().data, vec![1, 2, 3]);
    }
}
