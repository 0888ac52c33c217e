//! 파이프라인 trait -- 생명주기와 확장 포인트 정의
//!
//! - [`Pipeline`]: 시작/정지/상태 확인 생명주기
//! - [`Processor`]: 큐 적재 전에 이벤트를 변환하거나 걸러내는 단계
//! - [`Output`]: 배치를 원격 싱크로 전송하는 출력
//!
//! `Pipeline`과 `Output`은 RPITIT를 사용하므로 trait 객체로 쓰려면
//! [`DynPipeline`] / [`DynOutput`]을 사용합니다.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{IronbeatError, OutputError, ProcessorError};
use crate::event::Event;

/// Send 가능한 boxed future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ─── HealthStatus ────────────────────────────────────────────────────

/// 컴포넌트 건강 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum HealthStatus {
    /// 정상
    Healthy,
    /// 동작하지만 성능 저하 (사유 포함)
    Degraded(String),
    /// 동작 불가 (사유 포함)
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

// ─── Pipeline ────────────────────────────────────────────────────────

/// 데몬이 관리하는 모든 장기 실행 컴포넌트가 구현하는 생명주기 trait
pub trait Pipeline: Send + Sync {
    /// 컴포넌트를 시작합니다. 이미 실행 중이면 에러를 반환합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), IronbeatError>> + Send;

    /// 컴포넌트를 정지합니다. 진행 중인 작업은 정책에 따라 드레인합니다.
    fn stop(&mut self) -> impl Future<Output = Result<(), IronbeatError>> + Send;

    /// 현재 건강 상태를 반환합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

/// dyn-compatible 생명주기 trait
pub trait DynPipeline: Send + Sync {
    fn start(&mut self) -> BoxFuture<'_, Result<(), IronbeatError>>;
    fn stop(&mut self) -> BoxFuture<'_, Result<(), IronbeatError>>;
    fn health_check(&self) -> BoxFuture<'_, HealthStatus>;
}

impl<T: Pipeline> DynPipeline for T {
    fn start(&mut self) -> BoxFuture<'_, Result<(), IronbeatError>> {
        Box::pin(Pipeline::start(self))
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), IronbeatError>> {
        Box::pin(Pipeline::stop(self))
    }

    fn health_check(&self) -> BoxFuture<'_, HealthStatus> {
        Box::pin(Pipeline::health_check(self))
    }
}

// ─── Processor ───────────────────────────────────────────────────────

/// 이벤트 변환/필터 단계
///
/// 이벤트를 값으로 받아 대체 이벤트를 반환합니다.
/// - `Ok(Some(event))`: 다음 단계로 전달
/// - `Ok(None)`: 이벤트 드롭 (에러 아님)
/// - `Err(_)`: 이 이벤트 하나의 처리 실패
pub trait Processor: Send + Sync {
    /// 로그와 메트릭에 쓰이는 프로세서 이름
    fn name(&self) -> &str;

    /// 이벤트 하나를 처리합니다.
    fn run(&self, event: Event) -> Result<Option<Event>, ProcessorError>;
}

// ─── Output ──────────────────────────────────────────────────────────

/// 배치를 싱크로 전송하는 출력
///
/// 연결 관리는 출력이 책임지며, 배치 재시도는 디스패처가 담당합니다.
/// `send`는 앞에서부터 수락된 이벤트 수를 반환합니다. 배치 길이보다 작으면
/// 나머지 suffix가 재시도됩니다.
pub trait Output: Send + Sync {
    /// 출력 이름
    fn name(&self) -> &str;

    /// 배치를 전송하고 수락된 prefix 길이를 반환합니다.
    fn send(&self, batch: &[Arc<Event>]) -> impl Future<Output = Result<usize, OutputError>> + Send;

    /// 버퍼를 비우고 연결을 닫습니다.
    fn close(&self) -> impl Future<Output = Result<(), OutputError>> + Send {
        async { Ok(()) }
    }
}

/// dyn-compatible 출력 trait
///
/// 출력 레지스트리와 디스패처 워커는 `Arc<dyn DynOutput>`으로 출력을 공유합니다.
pub trait DynOutput: Send + Sync {
    fn name(&self) -> &str;
    fn send<'a>(&'a self, batch: &'a [Arc<Event>]) -> BoxFuture<'a, Result<usize, OutputError>>;
    fn close(&self) -> BoxFuture<'_, Result<(), OutputError>>;
}

impl<T: Output> DynOutput for T {
    fn name(&self) -> &str {
        Output::name(self)
    }

    fn send<'a>(&'a self, batch: &'a [Arc<Event>]) -> BoxFuture<'a, Result<usize, OutputError>> {
        Box::pin(Output::send(self, batch))
    }

    fn close(&self) -> BoxFuture<'_, Result<(), OutputError>> {
        Box::pin(Output::close(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Fields;

    struct Upper;

    impl Processor for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorError> {
            let message = event
                .fields
                .get("message")
                .and_then(|v| v.as_str())
                .map(str::to_uppercase);
            match message {
                Some(m) => {
                    event.fields.put("message", m);
                    Ok(Some(event))
                }
                None => Ok(None),
            }
        }
    }

    struct HalfOutput;

    impl Output for HalfOutput {
        fn name(&self) -> &str {
            "half"
        }

        async fn send(&self, batch: &[Arc<Event>]) -> Result<usize, OutputError> {
            Ok(batch.len() / 2)
        }
    }

    #[test]
    fn health_status_predicates() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Degraded("queue 95% full".into()).is_healthy());
        assert!(!HealthStatus::Degraded("queue 95% full".into()).is_unhealthy());
        assert!(HealthStatus::Unhealthy("halted".into()).is_unhealthy());
        assert_eq!(
            HealthStatus::Unhealthy("halted".into()).to_string(),
            "unhealthy: halted"
        );
    }

    #[test]
    fn processor_transforms_or_drops() {
        let mut fields = Fields::new();
        fields.put("message", "hi");
        let out = Upper.run(Event::new(fields)).unwrap().unwrap();
        assert_eq!(out.fields.get("message").and_then(|v| v.as_str()), Some("HI"));

        assert!(Upper.run(Event::new(Fields::new())).unwrap().is_none());
    }

    #[tokio::test]
    async fn dyn_output_delegates() {
        let output: Arc<dyn DynOutput> = Arc::new(HalfOutput);
        let batch: Vec<Arc<Event>> = (0..4).map(|_| Arc::new(Event::new(Fields::new()))).collect();
        assert_eq!(output.name(), "half");
        assert_eq!(output.send(&batch).await.unwrap(), 2);
        output.close().await.unwrap();
    }
}
