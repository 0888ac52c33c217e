//! 설정 관리 -- ironbeat.toml 파싱 및 런타임 설정
//!
//! [`IronbeatConfig`]는 데몬 전체의 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`IRONBEAT_PUBLISHER_QUEUE_MODE=disk` 형식)
//! 3. 설정 파일 (`ironbeat.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), ironbeat_core::error::IronbeatError> {
//! use ironbeat_core::config::IronbeatConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = IronbeatConfig::load("ironbeat.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = IronbeatConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, IronbeatError};

/// Ironbeat 통합 설정
///
/// `ironbeat.toml` 파일의 최상위 구조를 나타냅니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IronbeatConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 퍼블리셔 파이프라인 설정
    #[serde(default)]
    pub publisher: PublisherSection,
    /// 출력 설정
    #[serde(default)]
    pub output: OutputConfig,
    /// 메트릭 엔드포인트 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// 입력(수집기) 목록
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
}

impl IronbeatConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    ///
    /// 설정 로딩 순서:
    /// 1. TOML 파일 파싱
    /// 2. 환경변수 오버라이드 적용
    /// 3. 유효성 검증
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, IronbeatError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, IronbeatError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IronbeatError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                IronbeatError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, IronbeatError> {
        toml::from_str(toml_str).map_err(|e| {
            IronbeatError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `IRONBEAT_{SECTION}_{FIELD}`
    /// 예: `IRONBEAT_PUBLISHER_BATCH_MAX_EVENTS=1024`
    ///
    /// `[[inputs]]`는 목록이므로 환경변수로 오버라이드하지 않습니다.
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "IRONBEAT_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "IRONBEAT_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.data_dir, "IRONBEAT_GENERAL_DATA_DIR");
        override_string(&mut self.general.name, "IRONBEAT_GENERAL_NAME");

        // Publisher
        let publisher = &mut self.publisher;
        override_string(&mut publisher.index, "IRONBEAT_PUBLISHER_INDEX");
        override_string(
            &mut publisher.processor_error_policy,
            "IRONBEAT_PUBLISHER_PROCESSOR_ERROR_POLICY",
        );
        override_string(&mut publisher.queue.mode, "IRONBEAT_PUBLISHER_QUEUE_MODE");
        override_string(&mut publisher.queue.path, "IRONBEAT_PUBLISHER_QUEUE_PATH");
        override_usize(
            &mut publisher.queue.max_events,
            "IRONBEAT_PUBLISHER_QUEUE_MAX_EVENTS",
        );
        override_usize(
            &mut publisher.queue.max_bytes,
            "IRONBEAT_PUBLISHER_QUEUE_MAX_BYTES",
        );
        override_usize(
            &mut publisher.batch.max_events,
            "IRONBEAT_PUBLISHER_BATCH_MAX_EVENTS",
        );
        override_usize(
            &mut publisher.batch.max_bytes,
            "IRONBEAT_PUBLISHER_BATCH_MAX_BYTES",
        );
        override_u64(
            &mut publisher.batch.flush_timeout_ms,
            "IRONBEAT_PUBLISHER_BATCH_FLUSH_TIMEOUT_MS",
        );
        override_usize(&mut publisher.batch.workers, "IRONBEAT_PUBLISHER_BATCH_WORKERS");
        override_u64(
            &mut publisher.retry.send_timeout_ms,
            "IRONBEAT_PUBLISHER_RETRY_SEND_TIMEOUT_MS",
        );
        override_u64(
            &mut publisher.retry.backoff_init_ms,
            "IRONBEAT_PUBLISHER_RETRY_BACKOFF_INIT_MS",
        );
        override_u64(
            &mut publisher.retry.backoff_max_ms,
            "IRONBEAT_PUBLISHER_RETRY_BACKOFF_MAX_MS",
        );
        override_u32(
            &mut publisher.retry.max_retries,
            "IRONBEAT_PUBLISHER_RETRY_MAX_RETRIES",
        );
        override_u64(
            &mut publisher.retry.max_retry_duration_secs,
            "IRONBEAT_PUBLISHER_RETRY_MAX_RETRY_DURATION_SECS",
        );
        override_string(
            &mut publisher.retry.on_exhausted,
            "IRONBEAT_PUBLISHER_RETRY_ON_EXHAUSTED",
        );
        override_u64(
            &mut publisher.shutdown.drain_timeout_secs,
            "IRONBEAT_PUBLISHER_SHUTDOWN_DRAIN_TIMEOUT_SECS",
        );

        // Output
        override_string(&mut self.output.output_type, "IRONBEAT_OUTPUT_TYPE");

        // Metrics
        override_bool(&mut self.metrics.enabled, "IRONBEAT_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "IRONBEAT_METRICS_LISTEN_ADDR");
        override_u16(&mut self.metrics.port, "IRONBEAT_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), IronbeatError> {
        check_one_of(
            "general.log_level",
            &self.general.log_level,
            &["trace", "debug", "info", "warn", "error"],
        )?;
        check_one_of(
            "general.log_format",
            &self.general.log_format,
            &["json", "pretty"],
        )?;

        let publisher = &self.publisher;
        check_one_of(
            "publisher.processor_error_policy",
            &publisher.processor_error_policy,
            ERROR_POLICIES,
        )?;
        check_one_of("publisher.queue.mode", &publisher.queue.mode, &["memory", "disk"])?;
        check_positive("publisher.queue.max_events", publisher.queue.max_events)?;
        check_positive("publisher.queue.max_bytes", publisher.queue.max_bytes)?;
        check_positive("publisher.batch.max_events", publisher.batch.max_events)?;
        check_positive("publisher.batch.max_bytes", publisher.batch.max_bytes)?;
        check_positive("publisher.batch.workers", publisher.batch.workers)?;
        check_positive("publisher.retry.send_timeout_ms", publisher.retry.send_timeout_ms)?;
        check_positive("publisher.retry.backoff_init_ms", publisher.retry.backoff_init_ms)?;
        if publisher.retry.backoff_max_ms < publisher.retry.backoff_init_ms {
            return Err(invalid(
                "publisher.retry.backoff_max_ms",
                "must be greater than or equal to backoff_init_ms",
            ));
        }
        check_one_of(
            "publisher.retry.on_exhausted",
            &publisher.retry.on_exhausted,
            &["drop_batch", "halt_intake"],
        )?;

        if self.output.output_type.is_empty() {
            return Err(invalid("output.type", "must not be empty"));
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(invalid("metrics.port", "must be greater than 0"));
        }

        for (idx, input) in self.inputs.iter().enumerate() {
            input.validate(idx)?;
        }

        Ok(())
    }
}

/// 프로세서 에러 정책 값
const ERROR_POLICIES: &[&str] = &["drop", "fail"];

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// 데이터 디렉토리 (디스크 큐, 체크포인트)
    pub data_dir: String,
    /// 에이전트 이름 (`agent.name` 정적 필드)
    pub name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            data_dir: "/var/lib/ironbeat".to_owned(),
            name: "ironbeat".to_owned(),
        }
    }
}

/// 퍼블리셔 파이프라인 설정 (`[publisher]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSection {
    /// 목적지 인덱스 포맷 문자열 (빈 문자열이면 인덱스 프로세서 비활성화)
    pub index: String,
    /// 클라이언트 기본 프로세서 에러 정책 (drop, fail)
    pub processor_error_policy: String,
    /// 큐 설정
    pub queue: QueueSection,
    /// 배치 설정
    pub batch: BatchSection,
    /// 재시도 설정
    pub retry: RetrySection,
    /// 종료 설정
    pub shutdown: ShutdownSection,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            index: "ironbeat-%{+yyyy.MM.dd}".to_owned(),
            processor_error_policy: "drop".to_owned(),
            queue: QueueSection::default(),
            batch: BatchSection::default(),
            retry: RetrySection::default(),
            shutdown: ShutdownSection::default(),
        }
    }
}

/// 큐 설정 (`[publisher.queue]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// 큐 모드 (memory, disk)
    pub mode: String,
    /// 디스크 큐 디렉토리 (빈 문자열이면 `{data_dir}/queue`)
    pub path: String,
    /// 최대 이벤트 수
    pub max_events: usize,
    /// 최대 바이트 (이벤트 JSON 직렬화 크기 합)
    pub max_bytes: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            mode: "memory".to_owned(),
            path: String::new(),
            max_events: 4096,
            max_bytes: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// 배치 설정 (`[publisher.batch]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    /// 배치당 최대 이벤트 수
    pub max_events: usize,
    /// 배치당 최대 바이트
    pub max_bytes: usize,
    /// 배치가 찰 때까지 기다리는 최대 시간 (밀리초)
    pub flush_timeout_ms: u64,
    /// 출력 워커 수
    pub workers: usize,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_events: 512,
            max_bytes: 5 * 1024 * 1024, // 5MB
            flush_timeout_ms: 1000,
            workers: 1,
        }
    }
}

/// 재시도 설정 (`[publisher.retry]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// 전송 1회 타임아웃 (밀리초)
    pub send_timeout_ms: u64,
    /// 첫 재시도 대기 시간 (밀리초)
    pub backoff_init_ms: u64,
    /// 최대 재시도 대기 시간 (밀리초)
    pub backoff_max_ms: u64,
    /// 최대 재시도 횟수 (0이면 무제한)
    pub max_retries: u32,
    /// 배치당 최대 재시도 기간 (초, 0이면 무제한)
    pub max_retry_duration_secs: u64,
    /// 재시도 소진 시 정책 (drop_batch, halt_intake)
    pub on_exhausted: String,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            send_timeout_ms: 30_000,
            backoff_init_ms: 1_000,
            backoff_max_ms: 60_000,
            max_retries: 3,
            max_retry_duration_secs: 300,
            on_exhausted: "drop_batch".to_owned(),
        }
    }
}

/// 종료 설정 (`[publisher.shutdown]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    /// 진행 중인 배치를 기다리는 최대 시간 (초)
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 5,
        }
    }
}

/// 출력 설정 (`[output]`)
///
/// `type` 외의 키는 출력 생성자에 그대로 전달됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// 출력 타입 이름 (console, file)
    #[serde(rename = "type", default = "default_output_type")]
    pub output_type: String,
    /// 출력별 설정
    #[serde(flatten)]
    pub settings: toml::Table,
}

fn default_output_type() -> String {
    "console".to_owned()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_type: default_output_type(),
            settings: toml::Table::new(),
        }
    }
}

/// 메트릭 엔드포인트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 수신 주소
    pub listen_addr: String,
    /// 수신 포트
    pub port: u16,
    /// 스크레이프 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

/// 프로세서 설정 (`processors = [{ type = "...", ... }]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// 프로세서 타입 이름
    #[serde(rename = "type")]
    pub processor_type: String,
    /// 프로세서별 설정
    #[serde(flatten)]
    pub settings: toml::Table,
}

/// 입력(수집기) 설정 (`[[inputs]]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// 입력 타입 (file)
    #[serde(rename = "type")]
    pub input_type: String,
    /// 체크포인트 키로 쓰이는 입력 식별자 (빈 문자열이면 경로 사용)
    pub id: String,
    /// 읽을 파일 경로
    pub paths: Vec<String>,
    /// 이벤트에 추가할 필드
    pub fields: toml::Table,
    /// `fields`를 최상위에 둘지 여부 (false면 `fields.*` 아래)
    pub fields_under_root: bool,
    /// 이벤트에 추가할 태그
    pub tags: Vec<String>,
    /// null 값 필드 유지 여부
    pub keep_null: bool,
    /// 전송 모드 (guaranteed, best_effort)
    pub publish_mode: String,
    /// 프로세서 에러 정책 (빈 문자열이면 `publisher.processor_error_policy`)
    pub processor_error_policy: String,
    /// 종료 시 ACK 대기 시간 (초, 0이면 대기하지 않음)
    pub wait_close_secs: u64,
    /// 인덱스 포맷 문자열 (빈 문자열이면 `publisher.index`)
    pub index: String,
    /// 사용자 프로세서 (인덱스 프로세서 뒤에 실행)
    pub processors: Vec<ProcessorConfig>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            input_type: "file".to_owned(),
            id: String::new(),
            paths: Vec::new(),
            fields: toml::Table::new(),
            fields_under_root: false,
            tags: Vec::new(),
            keep_null: false,
            publish_mode: "guaranteed".to_owned(),
            processor_error_policy: String::new(),
            wait_close_secs: 0,
            index: String::new(),
            processors: Vec::new(),
        }
    }
}

impl InputConfig {
    fn validate(&self, idx: usize) -> Result<(), IronbeatError> {
        if self.input_type.is_empty() {
            return Err(invalid(&format!("inputs[{idx}].type"), "must not be empty"));
        }
        if self.paths.is_empty() {
            return Err(invalid(
                &format!("inputs[{idx}].paths"),
                "at least one path is required",
            ));
        }
        check_one_of(
            &format!("inputs[{idx}].publish_mode"),
            &self.publish_mode,
            &["guaranteed", "best_effort"],
        )?;
        if !self.processor_error_policy.is_empty() {
            check_one_of(
                &format!("inputs[{idx}].processor_error_policy"),
                &self.processor_error_policy,
                ERROR_POLICIES,
            )?;
        }
        for (p_idx, processor) in self.processors.iter().enumerate() {
            if processor.processor_type.is_empty() {
                return Err(invalid(
                    &format!("inputs[{idx}].processors[{p_idx}].type"),
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }
}

// --- 검증 헬퍼 ---

fn invalid(field: &str, reason: &str) -> IronbeatError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
    .into()
}

fn check_one_of(field: &str, value: &str, allowed: &[&str]) -> Result<(), IronbeatError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, &format!("must be one of: {}", allowed.join(", "))))
    }
}

fn check_positive<T: PartialEq + Default>(field: &str, value: T) -> Result<(), IronbeatError> {
    if value == T::default() {
        Err(invalid(field, "must be greater than 0"))
    } else {
        Ok(())
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_parsed<T: std::str::FromStr>(target: &mut T, env_key: &str, type_name: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = type_name,
                "failed to parse env var, ignoring"
            ),
        }
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    override_parsed(target, env_key, "bool");
}

fn override_usize(target: &mut usize, env_key: &str) {
    override_parsed(target, env_key, "usize");
}

fn override_u16(target: &mut u16, env_key: &str) {
    override_parsed(target, env_key, "u16");
}

fn override_u32(target: &mut u32, env_key: &str) {
    override_parsed(target, env_key, "u32");
}

fn override_u64(target: &mut u64, env_key: &str) {
    override_parsed(target, env_key, "u64");
}
