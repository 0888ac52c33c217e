//! 배치 디스패처 -- 큐에서 배치를 꺼내 출력으로 전송
//!
//! 워커 N개가 `consume → send → acknowledge`를 반복합니다.
//!
//! # 재시도
//! - 출력이 앞의 k개만 수락하면 그 k개를 ACK하고 나머지 suffix를 즉시 다시 보냅니다.
//! - 일시적 에러는 `backoff_init * 2^attempt` (최대 `backoff_max`) 대기 후 재시도합니다.
//! - `max_retries` 또는 `max_retry_duration`을 넘기거나 영구 에러를 받으면 소진 정책을 적용합니다.
//!   - `drop_batch`: 남은 엔트리를 버리고 (리스너에는 보고하지 않음) 에러 로그와 메트릭을 남김
//!   - `halt_intake`: 큐 입력을 중단하고 성공하거나 종료될 때까지 `backoff_max` 간격으로 재시도
//!
//! # 종료
//! 큐가 닫히면 새 배치를 꺼내지 않고 진행 중인 배치만 마무리합니다.
//! `cancel`이 취소되면 진행 중인 전송도 즉시 중단하고, 남은 엔트리는 ACK하지 않습니다.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ironbeat_core::error::OutputError;
use ironbeat_core::event::Private;
use ironbeat_core::metrics as m;
use ironbeat_core::pipeline::DynOutput;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ack::{AckHandle, AckMessage};
use crate::config::{ExhaustionPolicy, PublisherConfig};
use crate::output::SharedOutput;
use crate::queue::{Batch, ClientRef, EventQueue, QueueEntry};

/// 출력 워커 풀
pub struct Dispatcher {
    queue: Arc<EventQueue>,
    output: SharedOutput,
    acks: AckHandle,
    config: Arc<PublisherConfig>,
    /// 입력 중단 상태로 재시도 중인 워커 수
    halted_workers: AtomicUsize,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<EventQueue>,
        output: SharedOutput,
        acks: AckHandle,
        config: Arc<PublisherConfig>,
    ) -> Self {
        Self {
            queue,
            output,
            acks,
            config,
            halted_workers: AtomicUsize::new(0),
        }
    }

    /// 설정된 수만큼 워커를 시작합니다.
    pub fn spawn(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let dispatcher = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { dispatcher.run_worker(worker, cancel).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, cancel: CancellationToken) {
        tracing::debug!(worker, output = self.output.name(), "dispatcher worker started");
        while let Some(batch) = self
            .queue
            .consume(
                self.config.batch_max_events,
                self.config.batch_max_bytes,
                self.config.flush_timeout,
                &cancel,
            )
            .await
        {
            self.deliver(worker, batch, &cancel).await;
        }
        tracing::debug!(worker, "dispatcher worker stopped");
    }

    /// 배치 하나를 ACK되거나 버려지거나 취소될 때까지 처리합니다.
    async fn deliver(&self, worker: usize, batch: Batch, cancel: &CancellationToken) {
        let batch_id = batch.id();
        let events = batch.events();
        let entries = batch.entries();
        let started = Instant::now();
        let mut offset = 0;
        let mut attempt: u32 = 0;
        let mut halted = false;

        while offset < events.len() {
            let remaining = &events[offset..];
            let send_started = Instant::now();
            let result = tokio::select! {
                r = tokio::time::timeout(self.config.send_timeout, self.output.send(remaining)) => {
                    r.unwrap_or_else(|_| Err(OutputError::Timeout {
                        timeout_ms: self.config.send_timeout.as_millis() as u64,
                    }))
                }
                _ = cancel.cancelled() => {
                    tracing::warn!(
                        worker,
                        batch_id,
                        unacked = remaining.len(),
                        "aborting in-flight batch on shutdown"
                    );
                    self.leave_halt(&mut halted);
                    return;
                }
            };
            metrics::histogram!(m::OUTPUT_SEND_DURATION_SECONDS, m::LABEL_OUTPUT => self.output.name().to_owned())
                .record(send_started.elapsed().as_secs_f64());

            let err = match result {
                Ok(accepted) if accepted > 0 => {
                    let accepted = accepted.min(remaining.len());
                    self.acknowledge(batch_id, &entries[offset..offset + accepted])
                        .await;
                    offset += accepted;
                    attempt = 0;
                    self.leave_halt(&mut halted);
                    if offset < events.len() {
                        tracing::debug!(
                            worker,
                            batch_id,
                            accepted,
                            remaining = events.len() - offset,
                            "partial acknowledgment, resending remainder"
                        );
                    }
                    continue;
                }
                Ok(_) => OutputError::Transient("output accepted no events".to_owned()),
                Err(e) => e,
            };

            metrics::counter!(
                m::OUTPUT_SEND_ERRORS_TOTAL,
                m::LABEL_OUTPUT => self.output.name().to_owned(),
                m::LABEL_ERROR_KIND => error_kind(&err)
            )
            .increment(1);

            let wait = if halted {
                self.config.backoff_max
            } else if self.retry_allowed(&err, attempt, started) {
                let wait = self.config.backoff_for(attempt);
                attempt = attempt.saturating_add(1);
                metrics::counter!(m::OUTPUT_BATCHES_RETRIED_TOTAL).increment(1);
                tracing::warn!(
                    worker,
                    batch_id,
                    attempt,
                    backoff_ms = wait.as_millis() as u64,
                    error = %err,
                    "send failed, retrying batch"
                );
                wait
            } else {
                match self.config.on_exhausted {
                    ExhaustionPolicy::DropBatch => {
                        self.drop_remaining(worker, batch_id, &entries[offset..], &err)
                            .await;
                        return;
                    }
                    ExhaustionPolicy::HaltIntake => {
                        self.enter_halt(&mut halted, batch_id, &err);
                        self.config.backoff_max
                    }
                }
            };

            if !sleep_or_cancel(wait, cancel).await {
                tracing::warn!(
                    worker,
                    batch_id,
                    unacked = events.len() - offset,
                    "aborting batch retry on shutdown"
                );
                self.leave_halt(&mut halted);
                return;
            }
        }
    }

    fn retry_allowed(&self, err: &OutputError, attempt: u32, started: Instant) -> bool {
        if !err.is_retryable() {
            return false;
        }
        if self.config.max_retries > 0 && attempt >= self.config.max_retries {
            return false;
        }
        let limit = self.config.max_retry_duration;
        limit.is_zero() || started.elapsed() < limit
    }

    /// 배치 앞부분을 큐와 트래커에 ACK합니다.
    async fn acknowledge(&self, batch_id: u64, acked: &[QueueEntry]) {
        if let Err(e) = self.queue.acknowledge(batch_id, acked.len()) {
            tracing::error!(batch_id, error = %e, "failed to acknowledge queue entries");
        }
        metrics::counter!(m::OUTPUT_BATCHES_SENT_TOTAL).increment(1);
        metrics::counter!(m::OUTPUT_EVENTS_ACKED_TOTAL).increment(acked.len() as u64);

        let resolved: Vec<(ClientRef, Option<Private>)> = acked
            .iter()
            .filter_map(|e| e.client.map(|c| (c, e.event.private.clone())))
            .collect();
        if !resolved.is_empty() && !self.acks.send(AckMessage::Acked(resolved)).await {
            tracing::debug!(batch_id, "ack tracker gone, acknowledgments not delivered");
        }
    }

    /// 소진된 배치의 남은 엔트리를 버립니다. 리스너에는 보고하지 않습니다.
    async fn drop_remaining(
        &self,
        worker: usize,
        batch_id: u64,
        dropped: &[QueueEntry],
        err: &OutputError,
    ) {
        tracing::error!(
            worker,
            batch_id,
            events = dropped.len(),
            output = self.output.name(),
            error = %err,
            "retries exhausted, dropping batch"
        );
        metrics::counter!(m::OUTPUT_BATCHES_DROPPED_TOTAL).increment(1);
        metrics::counter!(m::PUBLISHER_EVENTS_DROPPED_TOTAL, m::LABEL_REASON => "retry_exhausted")
            .increment(dropped.len() as u64);

        if let Err(e) = self.queue.acknowledge(batch_id, dropped.len()) {
            tracing::error!(batch_id, error = %e, "failed to release dropped queue entries");
        }
        let clients: Vec<ClientRef> = dropped.iter().filter_map(|e| e.client).collect();
        if !clients.is_empty() && !self.acks.send(AckMessage::Dropped(clients)).await {
            tracing::debug!(batch_id, "ack tracker gone, dropped entries not reported");
        }
    }

    fn enter_halt(&self, halted: &mut bool, batch_id: u64, err: &OutputError) {
        if *halted {
            return;
        }
        *halted = true;
        if self.halted_workers.fetch_add(1, Ordering::AcqRel) == 0 {
            self.queue.halt();
        }
        tracing::error!(
            batch_id,
            output = self.output.name(),
            error = %err,
            "retries exhausted, halting intake until the output recovers"
        );
    }

    fn leave_halt(&self, halted: &mut bool) {
        if !*halted {
            return;
        }
        *halted = false;
        if self.halted_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.queue.resume();
        }
    }
}

fn error_kind(err: &OutputError) -> &'static str {
    match err {
        OutputError::Transient(_) => "transient",
        OutputError::Throttled(_) => "throttled",
        OutputError::Timeout { .. } => "timeout",
        OutputError::Permanent(_) => "permanent",
    }
}

/// `duration`만큼 대기합니다. 취소되면 false
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
