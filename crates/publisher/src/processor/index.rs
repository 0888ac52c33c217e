//! 인덱스 포맷 프로세서 -- `@metadata.raw_index` 설정
//!
//! 두 가지 모드가 있습니다.
//! - 타임스탬프 모드: 클라이언트 연결 시 `index` 설정으로 생성됩니다.
//!   필드 참조는 에이전트 정적 필드로 미리 해석되고 실행 시에는 이벤트 시각만 씁니다.
//! - 이벤트 모드: 프로세서 설정(`type = "add_formatted_index"`)으로 생성됩니다.
//!   이벤트 필드를 매번 참조합니다.

use std::fmt;

use ironbeat_core::error::{IronbeatError, ProcessorError};
use ironbeat_core::event::{Event, Fields, META_RAW_INDEX};
use ironbeat_core::pipeline::Processor;

use super::fmtstr::{EventFormatString, FormatError, TimestampFormatString};
use super::settings;

/// 레지스트리 이름
pub const NAME: &str = "add_formatted_index";

#[derive(Debug, Clone)]
enum IndexFormat {
    Timestamp(TimestampFormatString),
    Event(EventFormatString),
}

/// 이벤트 메타데이터에 포맷된 인덱스 이름을 기록하는 프로세서
#[derive(Debug, Clone)]
pub struct FormattedIndex {
    format: IndexFormat,
}

impl FormattedIndex {
    /// 타임스탬프 모드로 생성합니다.
    pub fn timestamp_mode(pattern: &str, static_fields: &Fields) -> Result<Self, ProcessorError> {
        let format = TimestampFormatString::parse(pattern, static_fields).map_err(invalid_config)?;
        Ok(Self {
            format: IndexFormat::Timestamp(format),
        })
    }

    /// 이벤트 모드로 생성합니다.
    pub fn event_mode(pattern: &str) -> Result<Self, ProcessorError> {
        let format = EventFormatString::parse(pattern).map_err(invalid_config)?;
        Ok(Self {
            format: IndexFormat::Event(format),
        })
    }

    /// 레지스트리 설정(`index = "..."`)으로 생성합니다.
    pub fn from_config(config: &toml::Table) -> Result<Self, IronbeatError> {
        let pattern = settings::required_str(NAME, config, "index")?;
        Ok(Self::event_mode(pattern)?)
    }
}

impl Processor for FormattedIndex {
    fn name(&self) -> &str {
        NAME
    }

    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorError> {
        let index = match &self.format {
            IndexFormat::Timestamp(f) => f.run(event.timestamp),
            IndexFormat::Event(f) => f.run(&event).map_err(|e| ProcessorError::Format {
                processor: NAME.to_owned(),
                reason: e.to_string(),
            })?,
        };
        event.meta.put(META_RAW_INDEX, index);
        Ok(Some(event))
    }
}

impl fmt::Display for FormattedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.format {
            IndexFormat::Timestamp(t) => write!(f, "{NAME}={t}"),
            IndexFormat::Event(e) => write!(f, "{NAME}={e}"),
        }
    }
}

fn invalid_config(err: FormatError) -> ProcessorError {
    ProcessorError::InvalidConfig {
        processor: NAME.to_owned(),
        reason: err.to_string(),
    }
}
