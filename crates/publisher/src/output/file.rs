//! 파일 출력 -- NDJSON append
//!
//! 파일은 첫 전송 시 열리며, 쓰기에 실패하면 핸들을 버리고 다음 전송에서 다시 엽니다.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ironbeat_core::error::{IronbeatError, OutputError};
use ironbeat_core::event::Event;
use ironbeat_core::pipeline::Output;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{encode_ndjson, invalid_config};

/// 파일에 이벤트를 추가하는 출력
pub struct FileOutput {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileOutput {
    pub const NAME: &'static str = "file";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn from_config(config: &toml::Table) -> Result<Self, IronbeatError> {
        match config.get("path") {
            Some(toml::Value::String(p)) if !p.is_empty() => Ok(Self::new(p)),
            Some(toml::Value::String(_)) | None => Err(invalid_config("path", "is required")),
            Some(_) => Err(invalid_config("path", "must be a string")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> Result<File, OutputError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error("create directory", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error("open", e))?;
        tracing::debug!(path = %self.path.display(), "file output opened");
        Ok(file)
    }

    fn io_error(&self, op: &str, err: std::io::Error) -> OutputError {
        OutputError::Transient(format!("{op} {} failed: {err}", self.path.display()))
    }
}

impl Output for FileOutput {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn send(&self, batch: &[Arc<Event>]) -> Result<usize, OutputError> {
        let buf = encode_ndjson(batch, false)?;
        let mut guard = self.file.lock().await;
        let mut file = match guard.take() {
            Some(file) => file,
            None => self.open().await?,
        };

        if let Err(e) = file.write_all(&buf).await {
            return Err(self.io_error("write", e));
        }
        if let Err(e) = file.flush().await {
            return Err(self.io_error("flush", e));
        }
        *guard = Some(file);
        Ok(batch.len())
    }

    async fn close(&self) -> Result<(), OutputError> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await.map_err(|e| self.io_error("flush", e))?;
            file.sync_all().await.map_err(|e| self.io_error("sync", e))?;
        }
        Ok(())
    }
}
