//! 퍼블리셔 설정
//!
//! [`PublisherConfig`]는 core의 [`PublisherSection`](ironbeat_core::config::PublisherSection)을
//! 타입이 있는 값(열거형, `Duration`, 경로)으로 변환한 설정입니다.
//!
//! # 사용 예시
//! ```ignore
//! use ironbeat_core::config::IronbeatConfig;
//! use ironbeat_publisher::config::PublisherConfig;
//!
//! let core_config = IronbeatConfig::default();
//! let config = PublisherConfig::from_core(&core_config)?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use ironbeat_core::config::IronbeatConfig;

use crate::error::PublisherError;

/// 큐 저장 방식
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QueueMode {
    /// 인메모리 (재시작 시 미확인 이벤트 유실)
    #[default]
    Memory,
    /// 디스크 로그 + ACK 커서 (재시작 시 미확인 이벤트 재생)
    Disk {
        /// 큐 파일 디렉토리
        path: PathBuf,
    },
}

/// 프로세서 에러 정책
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// 해당 이벤트만 드롭하고 로그/카운트 후 계속 (기본값)
    #[default]
    Drop,
    /// `publish`가 에러를 반환하고 이벤트는 적재하지 않음
    Fail,
}

impl ErrorPolicy {
    /// 설정 문자열을 파싱합니다.
    pub fn parse(value: &str) -> Result<Self, PublisherError> {
        match value {
            "drop" => Ok(Self::Drop),
            "fail" => Ok(Self::Fail),
            other => Err(PublisherError::Config {
                field: "processor_error_policy".to_owned(),
                reason: format!("unknown policy '{other}', expected drop or fail"),
            }),
        }
    }
}

/// 재시도 소진 시 정책
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// 배치를 버리고 로그/메트릭 기록 (리스너에는 보고하지 않음)
    #[default]
    DropBatch,
    /// 큐 입력을 중단하고 종료 시까지 최대 백오프로 재시도
    HaltIntake,
}

impl ExhaustionPolicy {
    /// 설정 문자열을 파싱합니다.
    pub fn parse(value: &str) -> Result<Self, PublisherError> {
        match value {
            "drop_batch" => Ok(Self::DropBatch),
            "halt_intake" => Ok(Self::HaltIntake),
            other => Err(PublisherError::Config {
                field: "retry.on_exhausted".to_owned(),
                reason: format!("unknown policy '{other}', expected drop_batch or halt_intake"),
            }),
        }
    }
}

/// 퍼블리셔 파이프라인 설정
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// 목적지 인덱스 포맷 문자열 (빈 문자열이면 인덱스 프로세서 없음)
    pub index: String,
    /// 클라이언트 기본 프로세서 에러 정책
    pub processor_error_policy: ErrorPolicy,

    /// 큐 저장 방식
    pub queue_mode: QueueMode,
    /// 큐 최대 이벤트 수
    pub queue_max_events: usize,
    /// 큐 최대 바이트
    pub queue_max_bytes: usize,

    /// 배치 최대 이벤트 수
    pub batch_max_events: usize,
    /// 배치 최대 바이트
    pub batch_max_bytes: usize,
    /// 배치가 찰 때까지 기다리는 최대 시간
    pub flush_timeout: Duration,
    /// 출력 워커 수
    pub workers: usize,

    /// 전송 1회 타임아웃
    pub send_timeout: Duration,
    /// 첫 재시도 대기 시간
    pub backoff_init: Duration,
    /// 최대 재시도 대기 시간
    pub backoff_max: Duration,
    /// 최대 재시도 횟수 (0이면 무제한)
    pub max_retries: u32,
    /// 배치당 최대 재시도 기간 (`Duration::ZERO`면 무제한)
    pub max_retry_duration: Duration,
    /// 재시도 소진 시 정책
    pub on_exhausted: ExhaustionPolicy,

    /// 종료 전체에 허용하는 시간 (배치 전송, ACK 정리, 클라이언트와 출력 종료)
    pub drain_timeout: Duration,
    /// 워커 → ACK 트래커 채널 용량
    pub ack_channel_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            index: String::new(),
            processor_error_policy: ErrorPolicy::Drop,
            queue_mode: QueueMode::Memory,
            queue_max_events: 4096,
            queue_max_bytes: 64 * 1024 * 1024,
            batch_max_events: 512,
            batch_max_bytes: 5 * 1024 * 1024,
            flush_timeout: Duration::from_millis(1000),
            workers: 1,
            send_timeout: Duration::from_secs(30),
            backoff_init: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_retries: 3,
            max_retry_duration: Duration::from_secs(300),
            on_exhausted: ExhaustionPolicy::DropBatch,
            drain_timeout: Duration::from_secs(5),
            ack_channel_capacity: 1024,
        }
    }
}

impl PublisherConfig {
    /// core 설정에서 퍼블리셔 설정을 생성합니다.
    ///
    /// 디스크 큐 경로가 비어 있으면 `{general.data_dir}/queue`를 사용합니다.
    pub fn from_core(core: &IronbeatConfig) -> Result<Self, PublisherError> {
        let section = &core.publisher;
        let queue_mode = match section.queue.mode.as_str() {
            "memory" => QueueMode::Memory,
            "disk" => {
                let path = if section.queue.path.is_empty() {
                    Path::new(&core.general.data_dir).join("queue")
                } else {
                    PathBuf::from(&section.queue.path)
                };
                QueueMode::Disk { path }
            }
            other => {
                return Err(PublisherError::Config {
                    field: "queue.mode".to_owned(),
                    reason: format!("unknown mode '{other}', expected memory or disk"),
                });
            }
        };

        let config = Self {
            index: section.index.clone(),
            processor_error_policy: ErrorPolicy::parse(&section.processor_error_policy)?,
            queue_mode,
            queue_max_events: section.queue.max_events,
            queue_max_bytes: section.queue.max_bytes,
            batch_max_events: section.batch.max_events,
            batch_max_bytes: section.batch.max_bytes,
            flush_timeout: Duration::from_millis(section.batch.flush_timeout_ms),
            workers: section.batch.workers,
            send_timeout: Duration::from_millis(section.retry.send_timeout_ms),
            backoff_init: Duration::from_millis(section.retry.backoff_init_ms),
            backoff_max: Duration::from_millis(section.retry.backoff_max_ms),
            max_retries: section.retry.max_retries,
            max_retry_duration: Duration::from_secs(section.retry.max_retry_duration_secs),
            on_exhausted: ExhaustionPolicy::parse(&section.retry.on_exhausted)?,
            drain_timeout: Duration::from_secs(section.shutdown.drain_timeout_secs),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), PublisherError> {
        const MAX_WORKERS: usize = 64;
        const MAX_BATCH_EVENTS: usize = 100_000;
        const MAX_QUEUE_EVENTS: usize = 10_000_000;

        if self.queue_max_events == 0 || self.queue_max_events > MAX_QUEUE_EVENTS {
            return Err(config_error(
                "queue.max_events",
                format!("must be 1-{MAX_QUEUE_EVENTS}"),
            ));
        }
        if self.queue_max_bytes == 0 {
            return Err(config_error("queue.max_bytes", "must be greater than 0"));
        }
        if self.batch_max_events == 0 || self.batch_max_events > MAX_BATCH_EVENTS {
            return Err(config_error(
                "batch.max_events",
                format!("must be 1-{MAX_BATCH_EVENTS}"),
            ));
        }
        if self.batch_max_bytes == 0 {
            return Err(config_error("batch.max_bytes", "must be greater than 0"));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(config_error("batch.workers", format!("must be 1-{MAX_WORKERS}")));
        }
        if self.send_timeout.is_zero() {
            return Err(config_error("retry.send_timeout", "must be greater than 0"));
        }
        if self.backoff_init.is_zero() {
            return Err(config_error("retry.backoff_init", "must be greater than 0"));
        }
        if self.backoff_max < self.backoff_init {
            return Err(config_error(
                "retry.backoff_max",
                "must be greater than or equal to backoff_init",
            ));
        }
        if self.ack_channel_capacity == 0 {
            return Err(config_error("ack_channel_capacity", "must be greater than 0"));
        }
        if let QueueMode::Disk { path } = &self.queue_mode
            && path.as_os_str().is_empty()
        {
            return Err(config_error("queue.path", "must not be empty in disk mode"));
        }
        Ok(())
    }

    /// `attempt`번째 재시도(0부터) 전의 대기 시간을 계산합니다.
    ///
    /// `backoff_init * 2^attempt`, 최대 `backoff_max`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(31));
        self.backoff_init
            .checked_mul(factor)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }
}

fn config_error(field: &str, reason: impl Into<String>) -> PublisherError {
    PublisherError::Config {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

/// 퍼블리셔 설정 빌더
#[derive(Default)]
pub struct PublisherConfigBuilder {
    config: PublisherConfig,
}

impl PublisherConfigBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 인덱스 포맷 문자열을 설정합니다.
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.config.index = index.into();
        self
    }

    /// 기본 프로세서 에러 정책을 설정합니다.
    pub fn processor_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.config.processor_error_policy = policy;
        self
    }

    /// 큐 저장 방식을 설정합니다.
    pub fn queue_mode(mut self, mode: QueueMode) -> Self {
        self.config.queue_mode = mode;
        self
    }

    /// 큐 용량을 설정합니다.
    pub fn queue_limits(mut self, max_events: usize, max_bytes: usize) -> Self {
        self.config.queue_max_events = max_events;
        self.config.queue_max_bytes = max_bytes;
        self
    }

    /// 배치 크기 제한을 설정합니다.
    pub fn batch_limits(mut self, max_events: usize, max_bytes: usize) -> Self {
        self.config.batch_max_events = max_events;
        self.config.batch_max_bytes = max_bytes;
        self
    }

    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.config.flush_timeout = timeout;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    /// 재시도 백오프 범위를 설정합니다.
    pub fn backoff(mut self, init: Duration, max: Duration) -> Self {
        self.config.backoff_init = init;
        self.config.backoff_max = max;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn max_retry_duration(mut self, duration: Duration) -> Self {
        self.config.max_retry_duration = duration;
        self
    }

    pub fn on_exhausted(mut self, policy: ExhaustionPolicy) -> Self {
        self.config.on_exhausted = policy;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// 설정을 검증하고 `PublisherConfig`를 생성합니다.
    pub fn build(self) -> Result<PublisherConfig, PublisherError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
