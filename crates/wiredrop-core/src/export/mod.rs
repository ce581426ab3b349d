//! 接收文件导出
//!
//! 单文件传输完成后调用 `export_single`，批量传输成功后一次性调用 `export_batch`，
//! 失败的批量传输不会导出。

use crate::error::TransferError;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// 缺少文件名时使用的名称前缀
const FALLBACK_NAME: &str = "WireDrop";

/// 收到的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub data: Vec<u8>,
    pub filename: Option<String>,
}

/// 导出目标
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export_single(&self, file: ReceivedFile) -> Result<(), TransferError>;

    async fn export_batch(&self, files: Vec<ReceivedFile>) -> Result<(), TransferError>;
}

/// 导出到目录，从不覆盖已有文件
#[derive(Debug, Clone)]
pub struct DirectoryExporter {
    dir: PathBuf,
}

impl DirectoryExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 写入单个文件，返回实际写入的路径
    pub async fn write_file(&self, file: &ReceivedFile) -> Result<PathBuf, TransferError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TransferError::Export(format!("{}: {}", self.dir.display(), e)))?;

        let name = match file.filename.as_deref().and_then(sanitize_name) {
            Some(name) => name,
            None => format!("{} ({})", FALLBACK_NAME, unique_suffix()),
        };

        let path = self.dir.join(&name);
        match create_new(&path, &file.data).await {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("{} exists, picking a unique name", path.display());
            }
            Err(e) => return Err(TransferError::Export(format!("{}: {}", path.display(), e))),
        }

        let path = self.dir.join(with_suffix(&name, &unique_suffix()));
        create_new(&path, &file.data)
            .await
            .map_err(|e| TransferError::Export(format!("{}: {}", path.display(), e)))?;
        Ok(path)
    }
}

#[async_trait]
impl Exporter for DirectoryExporter {
    async fn export_single(&self, file: ReceivedFile) -> Result<(), TransferError> {
        let path = self.write_file(&file).await?;
        info!("Saved {} ({} bytes)", path.display(), file.data.len());
        Ok(())
    }

    async fn export_batch(&self, files: Vec<ReceivedFile>) -> Result<(), TransferError> {
        let mut first_error = None;
        let count = files.len();

        for file in &files {
            match self.write_file(file).await {
                Ok(path) => info!("Saved {} ({} bytes)", path.display(), file.data.len()),
                Err(e) => {
                    warn!("Failed to save file: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Saved batch of {} files to {}", count, self.dir.display());
                Ok(())
            }
        }
    }
}

async fn create_new(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// 只保留最后一个路径分量
fn sanitize_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?.trim();
    if last.is_empty() || last == "." || last == ".." {
        return None;
    }
    Some(last.to_string())
}

/// 12 位十六进制后缀
fn unique_suffix() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple[simple.len() - 12..].to_string()
}

/// `name.ext` → `name (suffix).ext`
fn with_suffix(name: &str, suffix: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, suffix, ext),
        _ => format!("{} ({})", name, suffix),
    }
}
