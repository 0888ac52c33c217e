//! 콘솔 출력 -- 표준 출력으로 NDJSON 기록

use std::sync::Arc;

use ironbeat_core::error::{IronbeatError, OutputError};
use ironbeat_core::event::Event;
use ironbeat_core::pipeline::Output;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{encode_ndjson, invalid_config};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// 표준 출력(또는 지정한 writer)으로 이벤트를 쓰는 출력
pub struct ConsoleOutput {
    pretty: bool,
    writer: Mutex<Writer>,
}

impl ConsoleOutput {
    pub const NAME: &'static str = "console";

    pub fn new(pretty: bool) -> Self {
        Self::with_writer(pretty, Box::new(tokio::io::stdout()))
    }

    /// 임의의 writer로 출력합니다.
    pub fn with_writer(pretty: bool, writer: Writer) -> Self {
        Self {
            pretty,
            writer: Mutex::new(writer),
        }
    }

    pub fn from_config(config: &toml::Table) -> Result<Self, IronbeatError> {
        let pretty = match config.get("pretty") {
            None => false,
            Some(toml::Value::Boolean(b)) => *b,
            Some(_) => return Err(invalid_config("pretty", "must be a boolean")),
        };
        Ok(Self::new(pretty))
    }
}

impl Output for ConsoleOutput {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn send(&self, batch: &[Arc<Event>]) -> Result<usize, OutputError> {
        let buf = encode_ndjson(batch, self.pretty)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&buf)
            .await
            .map_err(|e| OutputError::Transient(format!("console write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| OutputError::Transient(format!("console flush failed: {e}")))?;
        Ok(batch.len())
    }

    async fn close(&self) -> Result<(), OutputError> {
        self.writer
            .lock()
            .await
            .flush()
            .await
            .map_err(|e| OutputError::Transient(format!("console flush failed: {e}")))
    }
}
