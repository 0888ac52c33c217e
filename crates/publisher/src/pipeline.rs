//! 퍼블리셔 파이프라인 -- 큐, 디스패처, ACK 트래커 조립과 생명주기
//!
//! [`PublisherPipeline`]은 공유 핸들입니다. 수집기마다 `clone`해서
//! [`connect_with`](PublisherPipeline::connect_with)로 클라이언트를 만들고,
//! 데몬은 [`Pipeline`] trait으로 시작/정지/상태 확인을 합니다.
//!
//! # 상태 전이
//! ```text
//! Starting --start--> Running --close--> Draining --> Closed
//!     \_______________close______________/
//! ```
//!
//! # 종료 순서
//! 1. 큐 입력 종료 (막혀 있던 `publish`는 즉시 에러 반환)
//! 2. 워커가 남은 배치를 전송하도록 대기, 기한 초과 시 취소
//! 3. ACK 트래커 flush 후 살아 있는 클라이언트를 동시에 종료
//! 4. 큐 마무리 (디스크 모드 동기화) 후 출력 종료
//!
//! 모든 단계는 `close` 시작 시점의 `drain_timeout` 기한 하나를 나눠 씁니다.
//! 기한을 넘긴 작업은 짧은 유예 후 중단되므로 전체 종료 시간은
//! `drain_timeout`에 작은 상수를 더한 값을 넘지 않습니다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use ironbeat_core::agent::AgentInfo;
use ironbeat_core::config::OutputConfig;
use ironbeat_core::error::{IronbeatError, PipelineError};
use ironbeat_core::event::Fields;
use ironbeat_core::pipeline::{HealthStatus, Pipeline};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ack::{AckHandle, AckTracker, SharedListener};
use crate::client::{Client, ClientConfig, ClientContext};
use crate::config::PublisherConfig;
use crate::dispatcher::Dispatcher;
use crate::error::PublisherError;
use crate::output::{self, ConsoleOutput, SharedOutput};
use crate::queue::{EventQueue, QueueLimits, QueueStats};

/// 기한을 넘겨 취소된 작업이 스스로 끝나기를 기다리는 시간
const ABORT_GRACE: Duration = Duration::from_millis(100);

/// 기한이 지난 뒤에도 출력 종료에 허용하는 최소 시간
const OUTPUT_CLOSE_GRACE: Duration = Duration::from_millis(100);

/// 큐 사용률이 이 값을 넘으면 Degraded
const DEGRADED_UTILIZATION: f64 = 0.9;

/// 파이프라인 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// 생성됨, 워커 미시작 (클라이언트 연결은 가능)
    Starting,
    /// 워커 실행 중
    Running,
    /// 종료 진행 중
    Draining,
    /// 종료 완료
    Closed,
}

impl PipelineState {
    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }

    fn accepts_clients(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// 실행 중에만 존재하는 태스크 핸들
#[derive(Default)]
struct Tasks {
    tracker: Option<AckTracker>,
    tracker_task: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

struct Inner {
    config: Arc<PublisherConfig>,
    queue: Arc<EventQueue>,
    output: SharedOutput,
    acks: AckHandle,
    dispatcher: Arc<Dispatcher>,
    static_fields: Fields,
    global_listener: Option<SharedListener>,
    state: Mutex<PipelineState>,
    tasks: tokio::sync::Mutex<Tasks>,
    clients: Mutex<Vec<Weak<Client>>>,
    next_client_id: AtomicU64,
    cancel: CancellationToken,
}

/// 이벤트 퍼블리싱 파이프라인
///
/// 복제해도 같은 파이프라인을 가리킵니다.
#[derive(Clone)]
pub struct PublisherPipeline {
    inner: Arc<Inner>,
}

impl PublisherPipeline {
    /// 현재 상태를 반환합니다.
    pub fn state(&self) -> PipelineState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 파이프라인 설정
    pub fn config(&self) -> &PublisherConfig {
        &self.inner.config
    }

    /// 출력 이름
    pub fn output_name(&self) -> &str {
        self.inner.output.name()
    }

    /// 큐 상태 스냅샷
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// 아직 살아 있는 클라이언트 수
    pub fn client_count(&self) -> usize {
        let mut clients = self
            .inner
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        clients.retain(|c| c.strong_count() > 0);
        clients.len()
    }

    /// 새 클라이언트를 연결합니다.
    ///
    /// 프로세서 설정이 잘못되었거나 종료가 시작된 경우 에러를 반환합니다.
    pub async fn connect_with(&self, config: ClientConfig) -> Result<Arc<Client>, PublisherError> {
        if !self.state().accepts_clients() {
            return Err(PublisherError::PipelineClosing);
        }

        let id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        let ctx = ClientContext {
            queue: Arc::clone(&self.inner.queue),
            acks: self.inner.acks.clone(),
            default_policy: self.inner.config.processor_error_policy,
            default_index: self.inner.config.index.clone(),
            static_fields: self.inner.static_fields.clone(),
            global_listener: self.inner.global_listener.clone(),
        };
        let client = Arc::new(Client::connect(id, config, &ctx).await?);

        // 연결 중에 종료가 시작되었으면 바로 닫음
        if !self.state().accepts_clients() {
            client.close().await;
            return Err(PublisherError::PipelineClosing);
        }

        self.inner
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&client));
        tracing::debug!(client_id = id, client = client.name(), "client connected");
        Ok(client)
    }

    /// 기본 설정으로 클라이언트를 연결합니다.
    pub async fn connect(&self, name: impl Into<String>) -> Result<Arc<Client>, PublisherError> {
        self.connect_with(ClientConfig::new(name)).await
    }

    /// ACK 트래커와 출력 워커를 시작합니다.
    pub async fn start_workers(&self) -> Result<(), PipelineError> {
        let mut tasks = self.inner.tasks.lock().await;
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match *state {
                PipelineState::Starting => *state = PipelineState::Running,
                PipelineState::Running => return Err(PipelineError::AlreadyRunning),
                PipelineState::Draining | PipelineState::Closed => {
                    return Err(PipelineError::Closing);
                }
            }
        }

        if let Some(tracker) = tasks.tracker.take() {
            tasks.tracker_task = Some(tracker.start());
        }
        tasks.workers = self.inner.dispatcher.spawn(&self.inner.cancel);

        tracing::info!(
            output = self.inner.output.name(),
            workers = tasks.workers.len(),
            durable = self.inner.queue.is_durable(),
            "publisher pipeline started"
        );
        Ok(())
    }

    /// 파이프라인을 종료합니다. 여러 번 호출해도 안전합니다.
    ///
    /// 동시에 호출되면 나중 호출은 먼저 시작된 종료가 끝날 때까지 기다립니다.
    pub async fn close(&self) {
        {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if state.accepts_clients() {
                *state = PipelineState::Draining;
            }
        }
        let mut tasks = self.inner.tasks.lock().await;
        if self.state() == PipelineState::Closed {
            return;
        }
        tracing::info!("publisher pipeline draining");
        let deadline = Instant::now() + self.inner.config.drain_timeout;

        self.inner.queue.close();
        self.drain_workers(&mut tasks, deadline).await;

        // 시작 전에 닫히는 경우에도 등록된 클라이언트가 정리되도록 트래커를 띄움
        if let Some(tracker) = tasks.tracker.take() {
            tasks.tracker_task = Some(tracker.start());
        }
        if tokio::time::timeout_at(deadline, self.inner.acks.flush())
            .await
            .is_err()
        {
            tracing::warn!("ack tracker flush timed out");
        }

        let clients: Vec<Arc<Client>> = self
            .inner
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        let mut closing = JoinSet::new();
        for client in clients {
            closing.spawn(async move { client.close_until(deadline).await });
        }
        let join_deadline = deadline.max(Instant::now()) + ABORT_GRACE;
        if tokio::time::timeout_at(join_deadline, async {
            while closing.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            tracing::warn!(pending = closing.len(), "clients did not close before drain deadline");
            closing.abort_all();
        }

        let remaining = self.inner.queue.finalize();
        if remaining > 0 {
            tracing::warn!(remaining, "events left unacknowledged at shutdown");
        }

        let output_deadline = deadline.max(Instant::now() + OUTPUT_CLOSE_GRACE);
        match tokio::time::timeout_at(output_deadline, self.inner.output.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "output close failed"),
            Err(_) => tracing::warn!("output close timed out"),
        }

        self.inner.cancel.cancel();
        if let Some(task) = tasks.tracker_task.take() {
            task.abort();
        }

        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = PipelineState::Closed;
        tracing::info!("publisher pipeline closed");
    }

    /// `deadline`까지 워커 종료를 기다리고, 초과하면 취소합니다.
    async fn drain_workers(&self, tasks: &mut Tasks, deadline: Instant) {
        let mut workers = std::mem::take(&mut tasks.workers);
        for handle in workers.iter_mut() {
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                break;
            }
        }

        if workers.iter().all(JoinHandle::is_finished) {
            return;
        }
        tracing::warn!(
            drain_timeout_ms = self.inner.config.drain_timeout.as_millis() as u64,
            "drain timeout exceeded, cancelling in-flight batches"
        );
        self.inner.cancel.cancel();
        let grace = Instant::now() + ABORT_GRACE;
        for handle in workers.iter_mut().filter(|h| !h.is_finished()) {
            if tokio::time::timeout_at(grace, &mut *handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

impl Pipeline for PublisherPipeline {
    async fn start(&mut self) -> Result<(), IronbeatError> {
        Ok(self.start_workers().await?)
    }

    async fn stop(&mut self) -> Result<(), IronbeatError> {
        if self.state() == PipelineState::Closed {
            return Err(PipelineError::NotRunning.into());
        }
        self.close().await;
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state() {
            PipelineState::Running => {}
            other => return HealthStatus::Unhealthy(format!("pipeline {}", other.state_name())),
        }
        let stats = self.inner.queue.stats();
        if stats.halted {
            return HealthStatus::Unhealthy("output intake halted after retry exhaustion".to_owned());
        }
        let utilization = stats.utilization();
        if utilization > DEGRADED_UTILIZATION {
            return HealthStatus::Degraded(format!("queue {:.0}% full", utilization * 100.0));
        }
        HealthStatus::Healthy
    }
}

impl std::fmt::Debug for PublisherPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherPipeline")
            .field("state", &self.state())
            .field("output", &self.inner.output.name())
            .field("queue", &self.inner.queue.stats())
            .finish()
    }
}

// ─── Builder ─────────────────────────────────────────────────────────

/// 퍼블리셔 파이프라인 빌더
///
/// # 사용 예시
/// ```ignore
/// let mut pipeline = PipelineBuilder::new()
///     .config(PublisherConfig::from_core(&core)?)
///     .output_config(core.output.clone())
///     .agent(AgentInfo::new(&core.general.name))
///     .build()?;
/// pipeline.start().await?;
/// let client = pipeline.connect("syslog").await?;
/// ```
#[derive(Default)]
pub struct PipelineBuilder {
    config: PublisherConfig,
    output: Option<SharedOutput>,
    output_config: Option<OutputConfig>,
    agent: Option<AgentInfo>,
    ack_listener: Option<SharedListener>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    /// 이미 생성된 출력을 사용합니다. `output_config`보다 우선합니다.
    pub fn output(mut self, output: SharedOutput) -> Self {
        self.output = Some(output);
        self
    }

    /// `[output]` 설정으로 레지스트리에서 출력을 생성합니다.
    pub fn output_config(mut self, config: OutputConfig) -> Self {
        self.output_config = Some(config);
        self
    }

    /// 정적 필드와 인덱스 포맷에 쓰이는 에이전트 정보
    pub fn agent(mut self, agent: AgentInfo) -> Self {
        self.agent = Some(agent);
        self
    }

    /// 모든 보장 모드 클라이언트에 추가로 붙는 ACK 리스너
    pub fn ack_listener(mut self, listener: SharedListener) -> Self {
        self.ack_listener = Some(listener);
        self
    }

    /// 큐를 열고 파이프라인을 생성합니다. 워커는 `start`에서 시작됩니다.
    ///
    /// 디스크 큐는 이 시점에 미확인 이벤트를 복구합니다.
    pub fn build(self) -> Result<PublisherPipeline, PublisherError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let output = match (self.output, self.output_config) {
            (Some(output), _) => output,
            (None, Some(output_config)) => output::build_output(&output_config)?,
            (None, None) => Arc::new(ConsoleOutput::new(false)),
        };

        let limits = QueueLimits {
            max_events: config.queue_max_events,
            max_bytes: config.queue_max_bytes,
        };
        let queue = Arc::new(EventQueue::open(&config.queue_mode, limits)?);
        let (tracker, acks) = AckTracker::new(config.ack_channel_capacity);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&output),
            acks.clone(),
            Arc::clone(&config),
        ));
        let static_fields = self.agent.unwrap_or_default().static_fields();

        tracing::debug!(
            output = output.name(),
            queue_max_events = limits.max_events,
            workers = config.workers,
            "publisher pipeline built"
        );

        Ok(PublisherPipeline {
            inner: Arc::new(Inner {
                config,
                queue,
                output,
                acks,
                dispatcher,
                static_fields,
                global_listener: self.ack_listener,
                state: Mutex::new(PipelineState::Starting),
                tasks: tokio::sync::Mutex::new(Tasks {
                    tracker: Some(tracker),
                    ..Tasks::default()
                }),
                clients: Mutex::new(Vec::new()),
                next_client_id: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        })
    }
}
