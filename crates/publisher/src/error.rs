//! 퍼블리셔 에러 타입
//!
//! [`QueueError`]는 이벤트 큐 연산의 실패를, [`PublisherError`]는 프로듀서가
//! `publish`/`close`/`connect_with`에서 동기적으로 받는 에러를 표현합니다.
//! `From<PublisherError> for IronbeatError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.

use ironbeat_core::error::{
    ConfigError, IronbeatError, PipelineError, ProcessorError, RegistryError,
};

/// 이벤트 큐 에러
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// 종료가 시작되어 더 이상 적재할 수 없음
    #[error("queue is closed")]
    Closed,

    /// 큐가 가득 참 (non-blocking 적재)
    #[error("queue is full")]
    Full,

    /// 재시도 소진으로 입력이 중단됨 (non-blocking 적재)
    #[error("queue intake is halted")]
    Halted,

    /// 알 수 없는 배치 ID
    #[error("unknown batch id {batch_id}")]
    UnknownBatch {
        /// 배치 ID
        batch_id: u64,
    },

    /// 남은 엔트리보다 많은 수를 ACK함
    #[error("invalid ack for batch {batch_id}: count {count} exceeds remaining {remaining}")]
    InvalidAck {
        /// 배치 ID
        batch_id: u64,
        /// 요청한 ACK 수
        count: usize,
        /// 아직 ACK되지 않은 엔트리 수
        remaining: usize,
    },

    /// 이벤트 직렬화 실패
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    /// 디스크 큐 파일 손상
    #[error("corrupt queue file {path}: {reason}")]
    Corrupt {
        /// 파일 경로
        path: String,
        /// 손상 사유
        reason: String,
    },

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 퍼블리셔 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    /// 큐 에러 (종료 중 적재 등)
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// `fail` 정책에서 반환되는 프로세서 에러
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// 이미 닫힌 클라이언트
    #[error("client is closed")]
    ClientClosed,

    /// 파이프라인이 종료 중이라 새 클라이언트를 만들 수 없음
    #[error("pipeline is closing")]
    PipelineClosing,

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 레지스트리로 프로세서/출력을 생성하다 실패함
    #[error("build failed: {0}")]
    Build(#[source] Box<IronbeatError>),

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),
}

impl PublisherError {
    /// 큐 종료로 인한 에러인지 확인합니다.
    ///
    /// 해당 클라이언트에 대해 영구적인 에러이므로 수집기는 읽기를 멈춰야 합니다.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::Queue(QueueError::Closed) | Self::ClientClosed | Self::PipelineClosing
        )
    }
}

impl From<IronbeatError> for PublisherError {
    fn from(err: IronbeatError) -> Self {
        Self::Build(Box::new(err))
    }
}

impl From<RegistryError> for PublisherError {
    fn from(err: RegistryError) -> Self {
        Self::Build(Box::new(err.into()))
    }
}

impl From<PublisherError> for IronbeatError {
    fn from(err: PublisherError) -> Self {
        match err {
            PublisherError::Processor(e) => IronbeatError::Processor(e),
            PublisherError::Build(e) => *e,
            PublisherError::Config { field, reason } => {
                IronbeatError::Config(ConfigError::InvalidValue { field, reason })
            }
            PublisherError::PipelineClosing => IronbeatError::Pipeline(PipelineError::Closing),
            PublisherError::Queue(QueueError::Io(e)) => IronbeatError::Io(e),
            PublisherError::Channel(msg) => IronbeatError::Pipeline(PipelineError::ChannelSend(msg)),
            other => IronbeatError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_ack_display() {
        let err = QueueError::InvalidAck {
            batch_id: 7,
            count: 5,
            remaining: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("batch 7"));
        assert!(msg.contains("5"));
        assert!(msg.contains("3"));
    }

    #[test]
    fn closed_errors_are_detected() {
        assert!(PublisherError::from(QueueError::Closed).is_closed());
        assert!(PublisherError::ClientClosed.is_closed());
        assert!(PublisherError::PipelineClosing.is_closed());
        assert!(!PublisherError::from(QueueError::Full).is_closed());
    }

    #[test]
    fn config_error_converts_to_ironbeat_config_error() {
        let err = PublisherError::Config {
            field: "batch.max_events".to_owned(),
            reason: "must be greater than 0".to_owned(),
        };
        let ironbeat_err: IronbeatError = err.into();
        assert!(matches!(ironbeat_err, IronbeatError::Config(_)));
    }

    #[test]
    fn build_error_unwraps_original() {
        let registry_err = RegistryError::NotFound {
            kind: "processor".to_owned(),
            name: "nope".to_owned(),
        };
        let err: PublisherError = registry_err.into();
        let ironbeat_err: IronbeatError = err.into();
        assert!(matches!(ironbeat_err, IronbeatError::Registry(_)));
    }

    #[test]
    fn processor_error_is_transparent() {
        let err: PublisherError = ProcessorError::Format {
            processor: "add_formatted_index".to_owned(),
            reason: "field 'x' missing".to_owned(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "add_formatted_index: format failed: field 'x' missing"
        );
    }
}
