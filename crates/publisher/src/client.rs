//! 퍼블리셔 클라이언트 -- 수집기가 이벤트를 발행하는 창구
//!
//! 수집기는 [`crate::pipeline::PublisherPipeline::connect_with`]로 클라이언트를 얻어
//! [`Client::publish`]로 이벤트를 보냅니다.
//!
//! # 처리 순서
//! 1. 포맷 인덱스 프로세서 (`@metadata.raw_index`)
//! 2. 클라이언트 기본값 적용 (`fields`, `tags`, `meta`)
//! 3. 사용자 프로세서
//! 4. `keep_null = false`이면 null 필드 제거
//! 5. 큐 적재 (guaranteed: 공간이 날 때까지 대기, best-effort: 가득 차면 드롭)
//!
//! # 전송 모드
//! - **guaranteed**: 출력이 수락한 이벤트를 발행 순서대로 리스너에 통지
//! - **best_effort**: ACK를 추적하지 않고, 큐가 가득 차면 이벤트를 버림

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ironbeat_core::config::{InputConfig, ProcessorConfig};
use ironbeat_core::error::ProcessorError;
use ironbeat_core::event::{Event, FIELD_TAGS, Fields, Private, Value};
use ironbeat_core::metrics as m;
use ironbeat_core::pipeline::Processor;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ack::{self, AckHandle, AckMessage, Outstanding, SharedListener};
use crate::config::ErrorPolicy;
use crate::error::{PublisherError, QueueError};
use crate::processor::{self, BoxProcessor, ChainOutcome, FormattedIndex, ProcessorChain};
use crate::queue::{ClientRef, EventQueue};

/// 리스너 정리와 트래커 해제에 허용하는 최대 시간
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// 전송 모드
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishMode {
    /// ACK 추적, 큐가 가득 차면 대기
    #[default]
    Guaranteed,
    /// ACK 없음, 큐가 가득 차면 드롭
    BestEffort,
}

impl PublishMode {
    /// 설정 문자열을 파싱합니다.
    pub fn parse(value: &str) -> Result<Self, PublisherError> {
        match value {
            "guaranteed" => Ok(Self::Guaranteed),
            "best_effort" => Ok(Self::BestEffort),
            other => Err(PublisherError::Config {
                field: "publish_mode".to_owned(),
                reason: format!("unknown mode '{other}', expected guaranteed or best_effort"),
            }),
        }
    }
}

/// 클라이언트 연결 설정
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// 로그에 쓰이는 이름
    pub name: String,
    pub mode: PublishMode,
    /// 이벤트에 추가할 필드
    pub fields: Fields,
    /// `fields`를 최상위에 둘지 여부 (false면 `fields.*` 아래)
    pub fields_under_root: bool,
    /// 이벤트에 추가할 태그
    pub tags: Vec<String>,
    /// 기본 메타데이터
    pub meta: Fields,
    /// null 필드 유지 여부
    pub keep_null: bool,
    /// 인덱스 포맷 (`None`이면 파이프라인 기본값, 빈 문자열이면 사용 안 함)
    pub index: Option<String>,
    /// 사용자 프로세서
    pub processors: Vec<ProcessorConfig>,
    /// 프로세서 에러 정책 (`None`이면 파이프라인 기본값)
    pub error_policy: Option<ErrorPolicy>,
    /// 종료 시 미확인 이벤트를 기다리는 시간
    pub wait_close: Duration,
    /// ACK 리스너 (guaranteed 모드에서만 사용)
    pub listener: Option<SharedListener>,
}

impl ClientConfig {
    /// 이름만 지정한 기본 설정
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// 입력 설정에서 클라이언트 설정을 만듭니다.
    pub fn from_input(name: impl Into<String>, input: &InputConfig) -> Result<Self, PublisherError> {
        let fields = match Value::from_toml(toml::Value::Table(input.fields.clone())) {
            Value::Object(fields) => fields,
            _ => Fields::new(),
        };
        let error_policy = if input.processor_error_policy.is_empty() {
            None
        } else {
            Some(ErrorPolicy::parse(&input.processor_error_policy)?)
        };
        Ok(Self {
            name: name.into(),
            mode: PublishMode::parse(&input.publish_mode)?,
            fields,
            fields_under_root: input.fields_under_root,
            tags: input.tags.clone(),
            meta: Fields::new(),
            keep_null: input.keep_null,
            index: (!input.index.is_empty()).then(|| input.index.clone()),
            processors: input.processors.clone(),
            error_policy,
            wait_close: Duration::from_secs(input.wait_close_secs),
            listener: None,
        })
    }

    pub fn with_mode(mut self, mode: PublishMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_listener(mut self, listener: SharedListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_processors(mut self, processors: Vec<ProcessorConfig>) -> Self {
        self.processors = processors;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn with_wait_close(mut self, wait_close: Duration) -> Self {
        self.wait_close = wait_close;
        self
    }
}

/// 파이프라인이 클라이언트에 넘겨주는 공유 자원
pub(crate) struct ClientContext {
    pub queue: Arc<EventQueue>,
    pub acks: AckHandle,
    pub default_policy: ErrorPolicy,
    pub default_index: String,
    pub static_fields: Fields,
    pub global_listener: Option<SharedListener>,
}

// ─── 클라이언트 기본값 ───────────────────────────────────────────────

/// 체인 맨 앞에서 클라이언트 기본 필드/태그/메타데이터를 적용
struct ClientDefaults {
    fields: Fields,
    fields_under_root: bool,
    tags: Vec<String>,
    meta: Fields,
}

impl ClientDefaults {
    const NAME: &'static str = "client_defaults";

    fn from_config(config: &ClientConfig) -> Option<Self> {
        if config.fields.is_empty() && config.tags.is_empty() && config.meta.is_empty() {
            return None;
        }
        Some(Self {
            fields: config.fields.clone(),
            fields_under_root: config.fields_under_root,
            tags: config.tags.clone(),
            meta: config.meta.clone(),
        })
    }
}

impl Processor for ClientDefaults {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorError> {
        if !self.fields.is_empty() {
            if self.fields_under_root {
                event.fields.deep_update(&self.fields);
            } else {
                let mut merged = match event.fields.get("fields") {
                    Some(Value::Object(existing)) => existing.clone(),
                    _ => Fields::new(),
                };
                merged.deep_update(&self.fields);
                event.fields.put("fields", merged);
            }
        }
        if !self.tags.is_empty() {
            processor::fields::append_tags(&mut event.fields, FIELD_TAGS, &self.tags).map_err(
                |reason| ProcessorError::Failed {
                    processor: Self::NAME.to_owned(),
                    reason,
                },
            )?;
        }
        if !self.meta.is_empty() {
            event.meta.deep_update(&self.meta);
        }
        Ok(Some(event))
    }
}

// ─── Client ──────────────────────────────────────────────────────────

struct AckState {
    handle: AckHandle,
    outstanding: Arc<Outstanding>,
    gate: Arc<Mutex<bool>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

/// 이벤트 발행 클라이언트
///
/// 여러 태스크에서 공유할 수 있으며, 같은 클라이언트의 `publish` 호출은
/// 직렬화되어 발행 순서가 곧 큐 순서가 됩니다.
pub struct Client {
    id: u64,
    name: String,
    mode: PublishMode,
    chain: ProcessorChain,
    keep_null: bool,
    queue: Arc<EventQueue>,
    acks: Option<AckState>,
    /// 다음 발행 순번 (publish 직렬화 락을 겸함)
    next_seq: tokio::sync::Mutex<u64>,
    cancel: CancellationToken,
    closed: AtomicBool,
    dropped: AtomicU64,
    wait_close: Duration,
}

impl Client {
    /// 프로세서를 생성하고 ACK 트래커에 등록합니다.
    pub(crate) async fn connect(
        id: u64,
        config: ClientConfig,
        ctx: &ClientContext,
    ) -> Result<Self, PublisherError> {
        let policy = config.error_policy.unwrap_or(ctx.default_policy);
        let index_pattern = config.index.as_deref().unwrap_or(&ctx.default_index);
        let index = if index_pattern.is_empty() {
            None
        } else {
            Some(
                FormattedIndex::timestamp_mode(index_pattern, &ctx.static_fields).map_err(|e| {
                    PublisherError::Config {
                        field: "index".to_owned(),
                        reason: e.to_string(),
                    }
                })?,
            )
        };
        let mut processors: Vec<BoxProcessor> = Vec::new();
        if let Some(defaults) = ClientDefaults::from_config(&config) {
            processors.push(Box::new(defaults));
        }
        processors.extend(processor::build_processors(&config.processors)?);
        let chain = ProcessorChain::with_index(index, processors, policy);

        let acks = match config.mode {
            PublishMode::Guaranteed => {
                let listeners: Vec<SharedListener> = config
                    .listener
                    .iter()
                    .chain(ctx.global_listener.iter())
                    .cloned()
                    .collect();
                let listener = if listeners.is_empty() {
                    ack::counting(|_| {})
                } else {
                    ack::combine(listeners)
                };

                let (tx, rx) = mpsc::unbounded_channel();
                if !ctx
                    .acks
                    .send(AckMessage::Register {
                        client_id: id,
                        sender: tx,
                    })
                    .await
                {
                    return Err(PublisherError::Channel("ack tracker is not running".to_owned()));
                }

                let outstanding = Arc::new(Outstanding::default());
                let gate = Arc::new(Mutex::new(false));
                let task = ack::spawn_listener(
                    id,
                    listener,
                    rx,
                    Arc::clone(&gate),
                    Arc::clone(&outstanding),
                );
                Some(AckState {
                    handle: ctx.acks.clone(),
                    outstanding,
                    gate,
                    listener_task: Mutex::new(Some(task)),
                })
            }
            PublishMode::BestEffort => {
                if config.listener.is_some() {
                    tracing::warn!(
                        client = %config.name,
                        "ack listener ignored for best_effort client"
                    );
                }
                None
            }
        };

        metrics::gauge!(m::PUBLISHER_CLIENTS_ACTIVE).increment(1.0);
        tracing::info!(
            client = %config.name,
            client_id = id,
            mode = ?config.mode,
            processors = ?chain.names(),
            policy = ?policy,
            "client connected"
        );

        Ok(Self {
            id,
            name: config.name,
            mode: config.mode,
            chain,
            keep_null: config.keep_null,
            queue: Arc::clone(&ctx.queue),
            acks,
            next_seq: tokio::sync::Mutex::new(0),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            wait_close: config.wait_close,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    /// 큐가 가득 차 버려진 이벤트 수 (best-effort)
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 아직 확정되지 않은 이벤트 수 (guaranteed)
    pub fn outstanding(&self) -> u64 {
        self.acks.as_ref().map_or(0, |a| a.outstanding.get())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 이벤트를 처리하고 큐에 적재합니다.
    ///
    /// guaranteed 모드에서는 큐에 공간이 날 때까지 대기합니다. 대기 중에
    /// 클라이언트가 닫히면 `ClientClosed`, 파이프라인이 종료되면 `Queue(Closed)`를
    /// 반환합니다. 프로세서가 걸러낸 이벤트는 에러 없이 성공으로 처리됩니다.
    pub async fn publish(&self, mut event: Event) -> Result<(), PublisherError> {
        if self.is_closed() {
            return Err(PublisherError::ClientClosed);
        }
        let mut next_seq = tokio::select! {
            guard = self.next_seq.lock() => guard,
            _ = self.cancel.cancelled() => return Err(PublisherError::ClientClosed),
        };
        if self.is_closed() {
            return Err(PublisherError::ClientClosed);
        }

        let private = event.private.take();
        let event = match self.chain.apply(event)? {
            ChainOutcome::Publish(mut event) => {
                if !self.keep_null {
                    event.fields.remove_nulls();
                }
                event.private = private;
                event
            }
            ChainOutcome::Filtered | ChainOutcome::Dropped => {
                if let Some(acks) = &self.acks {
                    self.report_skipped(acks, &mut next_seq, private).await;
                }
                return Ok(());
            }
        };

        match &self.acks {
            Some(acks) => {
                let client = ClientRef {
                    client_id: self.id,
                    seq: *next_seq,
                };
                acks.outstanding.add(1);
                if let Err(e) = self.queue.enqueue(event, Some(client), &self.cancel).await {
                    acks.outstanding.settle(1);
                    return Err(self.enqueue_error(e));
                }
                *next_seq += 1;
            }
            None => match self.queue.try_enqueue(event, None) {
                Ok(_) => {}
                Err(QueueError::Full | QueueError::Halted) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(m::PUBLISHER_EVENTS_DROPPED_TOTAL, m::LABEL_REASON => "queue_full")
                        .increment(1);
                    tracing::debug!(client = %self.name, "queue full, dropping best-effort event");
                    return Ok(());
                }
                Err(e) => return Err(self.enqueue_error(e)),
            },
        }

        metrics::counter!(m::PUBLISHER_EVENTS_PUBLISHED_TOTAL).increment(1);
        Ok(())
    }

    /// 걸러진 이벤트에 순번을 부여해 트래커에 보고합니다.
    async fn report_skipped(&self, acks: &AckState, next_seq: &mut u64, private: Option<Private>) {
        let client = ClientRef {
            client_id: self.id,
            seq: *next_seq,
        };
        acks.outstanding.add(1);
        if acks
            .handle
            .send(AckMessage::Skipped { client, private })
            .await
        {
            *next_seq += 1;
        } else {
            acks.outstanding.settle(1);
            tracing::debug!(client = %self.name, "ack tracker gone, skipped event not reported");
        }
    }

    fn enqueue_error(&self, err: QueueError) -> PublisherError {
        match err {
            QueueError::Closed if self.cancel.is_cancelled() => PublisherError::ClientClosed,
            other => other.into(),
        }
    }

    /// 클라이언트를 닫습니다.
    ///
    /// 여러 번 호출해도 안전합니다. 대기 중인 `publish`를 깨우고, `wait_close`가
    /// 설정되어 있으면 미확인 이벤트를 그 시간만큼 기다립니다. 파이프라인이 이미
    /// 종료 중이면 기다리지 않습니다. 반환된 뒤에는 리스너 호출이 새로 시작되지 않습니다.
    pub async fn close(&self) {
        self.close_until(Instant::now() + self.wait_close + CLOSE_TIMEOUT * 2)
            .await;
    }

    /// `deadline`까지 클라이언트를 닫습니다. 기한을 넘기면 리스너 태스크를 중단합니다.
    pub(crate) async fn close_until(&self, deadline: Instant) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        // 진행 중인 publish가 취소되어 락을 놓을 때까지 대기
        if tokio::time::timeout_at(deadline, self.next_seq.lock())
            .await
            .is_err()
        {
            tracing::warn!(client = %self.name, "publish did not stop before close deadline");
        }

        if let Some(acks) = &self.acks {
            let wait = if self.queue.is_closed() {
                Duration::ZERO
            } else {
                self.wait_close
                    .min(deadline.saturating_duration_since(Instant::now()))
            };
            if !wait.is_zero()
                && acks.outstanding.get() > 0
                && !acks.outstanding.wait_zero(wait).await
            {
                tracing::warn!(
                    client = %self.name,
                    outstanding = acks.outstanding.get(),
                    "closing client with unacknowledged events"
                );
            }

            let budget = CLOSE_TIMEOUT.min(deadline.saturating_duration_since(Instant::now()));
            acks.handle
                .send_timeout(AckMessage::Unregister { client_id: self.id }, budget)
                .await;

            // 트래커가 sender를 놓으면 리스너 태스크는 남은 통지를 전달하고 끝남
            let task = acks
                .listener_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(mut task) = task {
                let budget =
                    CLOSE_TIMEOUT.min(deadline.saturating_duration_since(Instant::now()));
                if tokio::time::timeout(budget, &mut task).await.is_err() {
                    tracing::warn!(client = %self.name, "ack listener did not stop in time");
                    task.abort();
                }
            }
            *acks.gate.lock().unwrap_or_else(PoisonError::into_inner) = true;
        }

        tracing::info!(
            client = %self.name,
            client_id = self.id,
            dropped = self.dropped(),
            "client closed"
        );
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        metrics::gauge!(m::PUBLISHER_CLIENTS_ACTIVE).decrement(1.0);
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(acks) = &self.acks {
            *acks.gate.lock().unwrap_or_else(PoisonError::into_inner) = true;
            if !acks.handle.try_send(AckMessage::Unregister { client_id: self.id }) {
                tracing::debug!(client_id = self.id, "could not unregister dropped client");
            }
            if let Some(task) = acks
                .listener_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}
