//! Ironbeat 이벤트 퍼블리싱 파이프라인
//!
//! 수집기가 만든 이벤트를 클라이언트별 프로세서 체인으로 다듬어 큐에 적재하고,
//! 출력 워커가 배치로 묶어 전송한 뒤 발행 순서대로 ACK를 돌려줍니다.
//!
//! # 모듈 구성
//!
//! - [`pipeline`]: 큐, 디스패처, ACK 트래커 조립과 생명주기 (Pipeline trait 구현)
//! - [`client`]: 수집기 하나의 발행 핸들 (보장/best-effort 모드)
//! - [`processor`]: 적재 전 이벤트 변환/필터 (인덱스 포맷, 필드, 조건부 드롭)
//! - [`queue`]: 용량 제한 이벤트 큐 (메모리 또는 디스크 로그)
//! - [`dispatcher`]: 배치 전송, 재시도, 백오프, 부분 ACK
//! - [`ack`]: 클라이언트별 순서 보장 ACK 통지
//! - [`output`]: 내장 출력 (console, file)과 출력 레지스트리
//! - [`config`]: 퍼블리셔 설정 (core 설정을 타입이 있는 값으로 변환)
//! - [`error`]: 도메인 에러 타입
//!
//! # 아키텍처
//!
//! ```text
//! Input -> Client -> ProcessorChain -> EventQueue -> Dispatcher workers -> Output
//!            ^                                             |
//!            +------------- AckTracker (순서대로) <---------+
//! ```

pub mod ack;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod processor;
pub mod queue;

// --- 주요 타입 re-export ---

// 파이프라인
pub use pipeline::{PipelineBuilder, PipelineState, PublisherPipeline};

// 클라이언트
pub use client::{Client, ClientConfig, PublishMode};

// ACK
pub use ack::{AckListener, SharedListener};

// 설정
pub use config::{
    ErrorPolicy, ExhaustionPolicy, PublisherConfig, PublisherConfigBuilder, QueueMode,
};

// 에러
pub use error::{PublisherError, QueueError};

// 큐
pub use queue::{EventQueue, QueueLimits, QueueStats};

// 출력
pub use output::{ConsoleOutput, FileOutput, SharedOutput};

// 프로세서
pub use processor::{ChainOutcome, FormattedIndex, ProcessorChain};
