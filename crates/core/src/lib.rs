//! Ironbeat 공통 기반 크레이트
//!
//! 이벤트 모델, 설정, 에러 타입, 확장 trait(프로세서/출력), 생성자 레지스트리,
//! 메트릭 이름을 정의합니다. 퍼블리셔와 데몬은 이 크레이트에만 의존하여
//! 서로의 내부 구현을 알 필요가 없습니다.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pipeline;
pub mod registry;

// --- 주요 타입 re-export ---
// 각 모듈의 핵심 타입을 크레이트 루트에서 바로 사용할 수 있도록 합니다.

// 에러
pub use error::{
    ConfigError, IronbeatError, OutputError, PipelineError, ProcessorError, RegistryError,
};

// 설정
pub use config::{InputConfig, IronbeatConfig, ProcessorConfig};

// 이벤트
pub use agent::AgentInfo;
pub use event::{Event, Fields, Private, Value};

// 파이프라인 trait
pub use pipeline::{BoxFuture, DynOutput, DynPipeline, HealthStatus, Output, Pipeline, Processor};

// 레지스트리
pub use registry::ConstructorRegistry;
