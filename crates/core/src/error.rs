//! 에러 타입 -- 도메인별 에러 정의
//!
//! 프로듀서가 동기적으로 받는 에러(설정, 연결, 큐 종료)와
//! 파이프라인 내부에서만 처리되는 에러(프로세서, 출력)를 구분합니다.

/// Ironbeat 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum IronbeatError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 파이프라인 생명주기 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// 생성자 레지스트리 에러
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// 이벤트 처리 에러
    #[error("processor error: {0}")]
    Processor(#[from] ProcessorError),

    /// 출력 전송 에러
    #[error("output error: {0}")]
    Output(#[from] OutputError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 파이프라인 생명주기 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 이미 실행 중
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// 실행 중이 아님
    #[error("pipeline is not running")]
    NotRunning,

    /// 종료가 시작되어 새 연결을 받을 수 없음
    #[error("pipeline is closing")]
    Closing,

    /// 채널 전송 실패
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// 파이프라인 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),
}

/// 이름 기반 생성자 레지스트리 에러
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// 같은 이름이 이미 등록됨
    #[error("{kind} '{name}' is already registered")]
    AlreadyRegistered { kind: String, name: String },

    /// 알 수 없는 타입 이름
    #[error("unknown {kind} type '{name}'")]
    NotFound { kind: String, name: String },

    /// 빈 이름
    #[error("{kind} name is required")]
    EmptyName { kind: String },
}

/// 프로세서 에러
///
/// 단일 이벤트 처리 실패를 나타냅니다. 배치나 파이프라인을 중단시키지 않습니다.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// 포맷 문자열 해석 실패 (필드 누락 등)
    #[error("{processor}: format failed: {reason}")]
    Format { processor: String, reason: String },

    /// 프로세서 설정 오류 (연결 시점에 보고됨)
    #[error("{processor}: invalid config: {reason}")]
    InvalidConfig { processor: String, reason: String },

    /// 그 밖의 처리 실패
    #[error("{processor}: {reason}")]
    Failed { processor: String, reason: String },
}

/// 출력 전송 에러
///
/// 배치 단위 재시도 여부는 [`OutputError::is_retryable`]로 판단합니다.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutputError {
    /// 네트워크 오류 등 일시적 실패
    #[error("transient failure: {0}")]
    Transient(String),

    /// 싱크가 요청을 제한함
    #[error("throttled: {0}")]
    Throttled(String),

    /// 전송 타임아웃
    #[error("send timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// 재시도해도 성공할 수 없는 실패
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl OutputError {
    /// 배치 재시도 대상인지 확인합니다.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}
