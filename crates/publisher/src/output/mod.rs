//! 출력 -- 배치를 싱크로 전송
//!
//! 출력은 `[output] type = "..."` 이름으로 [`registry`]에서 생성됩니다.
//! 재시도와 백오프는 디스패처가 담당하므로 출력은 한 번의 전송 시도만 책임집니다.
//!
//! # 내장 출력
//! - `console`: 표준 출력에 NDJSON (`pretty = true`이면 들여쓰기)
//! - `file`: 파일에 NDJSON append (`path` 필수)

pub mod console;
pub mod file;

use std::sync::{Arc, OnceLock};

use bytes::{BufMut, BytesMut};
use ironbeat_core::config::OutputConfig;
use ironbeat_core::error::{IronbeatError, OutputError};
use ironbeat_core::event::Event;
use ironbeat_core::pipeline::DynOutput;
use ironbeat_core::registry::ConstructorRegistry;

use crate::error::PublisherError;

pub use console::ConsoleOutput;
pub use file::FileOutput;

/// 워커들이 공유하는 출력
pub type SharedOutput = Arc<dyn DynOutput>;

type BuiltinConstructor = fn(&toml::Table) -> Result<SharedOutput, IronbeatError>;

static REGISTRY: OnceLock<ConstructorRegistry<SharedOutput>> = OnceLock::new();

/// 출력 생성자 레지스트리 (첫 사용 시 내장 출력 등록)
pub fn registry() -> &'static ConstructorRegistry<SharedOutput> {
    REGISTRY.get_or_init(|| {
        let registry = ConstructorRegistry::new("output");
        let builtins: [(&str, BuiltinConstructor); 2] = [
            (ConsoleOutput::NAME, |c| Ok(Arc::new(ConsoleOutput::from_config(c)?))),
            (FileOutput::NAME, |c| Ok(Arc::new(FileOutput::from_config(c)?))),
        ];
        for (name, constructor) in builtins {
            if let Err(e) = registry.register(name, constructor) {
                tracing::error!(output = name, error = %e, "failed to register builtin output");
            }
        }
        registry
    })
}

/// `[output]` 설정으로 출력을 생성합니다.
pub fn build_output(config: &OutputConfig) -> Result<SharedOutput, PublisherError> {
    Ok(registry().build(&config.output_type, &config.settings)?)
}

/// 배치를 NDJSON으로 인코딩합니다.
pub(crate) fn encode_ndjson(batch: &[Arc<Event>], pretty: bool) -> Result<BytesMut, OutputError> {
    let mut buf = BytesMut::with_capacity(batch.len() * 256);
    for event in batch {
        let doc = event.to_json();
        let mut writer = (&mut buf).writer();
        let result = if pretty {
            serde_json::to_writer_pretty(&mut writer, &doc)
        } else {
            serde_json::to_writer(&mut writer, &doc)
        };
        result.map_err(|e| OutputError::Permanent(format!("failed to encode event: {e}")))?;
        buf.put_u8(b'\n');
    }
    Ok(buf)
}

pub(crate) fn invalid_config(output: &str, reason: impl Into<String>) -> IronbeatError {
    ironbeat_core::error::ConfigError::InvalidValue {
        field: format!("output.{output}"),
        reason: reason.into(),
    }
    .into()
}
