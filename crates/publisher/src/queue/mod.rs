//! 이벤트 큐 -- 용량 제한, 순서 보장, 배치 단위 ACK
//!
//! [`EventQueue`]는 여러 프로듀서와 고정된 수의 소비자(디스패처 워커)가 공유하는
//! 유일한 가변 구조입니다.
//!
//! - 이벤트 수와 바이트 합으로 용량을 제한하며, 가득 차면 `enqueue`가 대기합니다.
//! - 용량은 엔트리가 배치로 소비되는 순간 반환됩니다.
//! - ACK는 배치 단위 prefix로만 이루어집니다 (`acknowledge(batch, n)` = 앞의 n개).
//! - 종료(`close`) 후에는 대기 중인 프로듀서를 포함해 모든 적재가 `Closed`로 실패합니다.
//!
//! # 디스크 모드
//! 이벤트는 로그에 기록된 뒤에 큐에 들어가며, 연속으로 확인된 시퀀스 커서가
//! 원자적으로 저장됩니다. 재시작 시 미확인 엔트리가 새 엔트리보다 먼저 재생됩니다.
//! 파일 형식은 [`disk`] 모듈 문서를 참고하세요.
//!
//! 로그 쓰기와 커서 저장은 큐 락을 잡은 채 동기적으로 수행되며, 멀티 스레드
//! 런타임에서는 `block_in_place` 구간으로 실행됩니다.

mod disk;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ironbeat_core::event::Event;
use ironbeat_core::metrics as m;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::QueueMode;
use crate::error::QueueError;

use disk::DiskStore;

/// 큐 용량 제한
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// 최대 대기 이벤트 수
    pub max_events: usize,
    /// 최대 대기 바이트
    pub max_bytes: usize,
}

/// 엔트리를 발행한 클라이언트와 클라이언트 내 순번
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientRef {
    /// 클라이언트 식별자
    pub client_id: u64,
    /// 클라이언트 내 발행 순번 (0부터)
    pub seq: u64,
}

/// 큐 엔트리
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// 큐 시퀀스 번호 (1부터, 디스크 모드에서는 재시작 후에도 이어짐)
    pub seq: u64,
    /// 공유되는 불변 이벤트
    pub event: Arc<Event>,
    /// 발행 클라이언트 (재생된 엔트리와 best-effort 엔트리는 `None`)
    pub client: Option<ClientRef>,
    /// 계산된 바이트 크기 (이벤트 JSON 직렬화 길이)
    pub size: usize,
}

/// 한 번의 `consume`으로 꺼낸 연속 엔트리 묶음
#[derive(Debug)]
pub struct Batch {
    id: u64,
    entries: Vec<QueueEntry>,
}

impl Batch {
    /// 배치 ID
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 배치의 총 바이트
    pub fn bytes(&self) -> usize {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// 출력에 전달할 이벤트 목록
    pub fn events(&self) -> Vec<Arc<Event>> {
        self.entries.iter().map(|e| Arc::clone(&e.event)).collect()
    }
}

/// 큐 상태 스냅샷
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// 소비 대기 중인 이벤트 수
    pub pending_events: usize,
    /// 소비 대기 중인 바이트
    pub pending_bytes: usize,
    /// 소비되었지만 아직 ACK되지 않은 이벤트 수
    pub in_flight_events: usize,
    /// 용량 제한
    pub limits: QueueLimits,
    /// 종료 여부
    pub closed: bool,
    /// 입력 중단 여부
    pub halted: bool,
}

impl QueueStats {
    /// 이벤트 수와 바이트 중 높은 쪽의 사용률 (0.0~1.0)
    pub fn utilization(&self) -> f64 {
        let ratio = |used: usize, max: usize| {
            if max == 0 {
                return 0.0;
            }
            (used as f64 / max as f64).min(1.0)
        };
        ratio(self.pending_events, self.limits.max_events)
            .max(ratio(self.pending_bytes, self.limits.max_bytes))
    }
}

struct QueueState {
    pending: VecDeque<QueueEntry>,
    pending_bytes: usize,
    next_seq: u64,
    next_batch_id: u64,
    /// 배치 ID → 아직 ACK되지 않은 시퀀스 (순서 유지)
    in_flight: HashMap<u64, VecDeque<u64>>,
    /// 커서보다 앞서 ACK된 시퀀스
    acked_ahead: BTreeSet<u64>,
    /// 이 값 이하의 시퀀스는 모두 ACK됨
    ack_cursor: u64,
    closed: bool,
    halted: bool,
    store: Option<DiskStore>,
}

impl QueueState {
    fn new(ack_cursor: u64, store: Option<DiskStore>) -> Self {
        let next_seq = store.as_ref().map_or(ack_cursor + 1, DiskStore::next_seq);
        Self {
            pending: VecDeque::new(),
            pending_bytes: 0,
            next_seq,
            next_batch_id: 1,
            in_flight: HashMap::new(),
            acked_ahead: BTreeSet::new(),
            ack_cursor,
            closed: false,
            halted: false,
            store,
        }
    }

    fn has_room(&self, size: usize, limits: &QueueLimits) -> bool {
        if self.pending.len() >= limits.max_events {
            return false;
        }
        // 용량보다 큰 단일 이벤트도 큐가 비어 있으면 받아들임
        self.pending.is_empty() || self.pending_bytes + size <= limits.max_bytes
    }

    fn push(
        &mut self,
        event: Arc<Event>,
        encoded: &[u8],
        client: Option<ClientRef>,
    ) -> Result<u64, QueueError> {
        let seq = self.next_seq;
        if let Some(store) = self.store.as_mut() {
            disk::blocking_io(|| store.append(seq, encoded))?;
        }
        self.next_seq += 1;
        self.pending_bytes += encoded.len();
        self.pending.push_back(QueueEntry {
            seq,
            event,
            client,
            size: encoded.len(),
        });
        self.record_gauges();
        Ok(seq)
    }

    fn take_batch(&mut self, max_events: usize, max_bytes: usize) -> Batch {
        let mut entries = Vec::with_capacity(max_events.min(self.pending.len()));
        let mut bytes = 0_usize;
        while entries.len() < max_events {
            let Some(front) = self.pending.front() else {
                break;
            };
            if !entries.is_empty() && bytes + front.size > max_bytes {
                break;
            }
            let Some(entry) = self.pending.pop_front() else {
                break;
            };
            bytes += entry.size;
            self.pending_bytes -= entry.size;
            entries.push(entry);
        }

        let id = self.next_batch_id;
        self.next_batch_id += 1;
        self.in_flight
            .insert(id, entries.iter().map(|e| e.seq).collect());
        self.record_gauges();
        Batch { id, entries }
    }

    fn in_flight_events(&self) -> usize {
        self.in_flight.values().map(VecDeque::len).sum()
    }

    fn record_gauges(&self) {
        metrics::gauge!(m::QUEUE_EVENTS).set(self.pending.len() as f64);
        metrics::gauge!(m::QUEUE_BYTES).set(self.pending_bytes as f64);
    }
}

/// 메모리/디스크 겸용 이벤트 큐
pub struct EventQueue {
    state: Mutex<QueueState>,
    limits: QueueLimits,
    not_full: Notify,
    not_empty: Notify,
    durable: bool,
}

impl EventQueue {
    /// 인메모리 큐를 생성합니다.
    pub fn memory(limits: QueueLimits) -> Self {
        Self {
            state: Mutex::new(QueueState::new(0, None)),
            limits,
            not_full: Notify::new(),
            not_empty: Notify::new(),
            durable: false,
        }
    }

    /// 디스크 큐를 열고 미확인 엔트리를 재생 대기열에 올립니다.
    ///
    /// 재생된 엔트리는 용량 제한과 무관하게 모두 올라가며, 새 엔트리보다 먼저 소비됩니다.
    pub fn open_disk(dir: &Path, limits: QueueLimits) -> Result<Self, QueueError> {
        let (store, recovered) = DiskStore::open(dir)?;
        let mut state = QueueState::new(recovered.acked_seq, Some(store));

        let replayed = recovered.entries.len();
        for (seq, event, size) in recovered.entries {
            state.pending_bytes += size;
            state.pending.push_back(QueueEntry {
                seq,
                event: Arc::new(event),
                client: None,
                size,
            });
        }
        state.record_gauges();

        if replayed > 0 {
            metrics::counter!(m::QUEUE_REPLAYED_TOTAL).increment(replayed as u64);
            tracing::info!(
                dir = %dir.display(),
                replayed,
                "replaying unacknowledged events from disk queue"
            );
        }

        Ok(Self {
            state: Mutex::new(state),
            limits,
            not_full: Notify::new(),
            not_empty: Notify::new(),
            durable: true,
        })
    }

    /// 설정된 모드로 큐를 엽니다.
    pub fn open(mode: &QueueMode, limits: QueueLimits) -> Result<Self, QueueError> {
        match mode {
            QueueMode::Memory => Ok(Self::memory(limits)),
            QueueMode::Disk { path } => Self::open_disk(path, limits),
        }
    }

    /// 디스크 모드 여부
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 이벤트를 적재하고 큐 시퀀스 번호를 반환합니다.
    ///
    /// 큐가 가득 차거나 입력이 중단된 동안 대기합니다. 큐가 닫히거나
    /// `cancel`이 취소되면 `Closed`를 반환합니다.
    pub async fn enqueue(
        &self,
        event: Event,
        client: Option<ClientRef>,
        cancel: &CancellationToken,
    ) -> Result<u64, QueueError> {
        let encoded = serde_json::to_vec(&event)?;
        let event = Arc::new(event);

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if !state.halted && state.has_room(encoded.len(), &self.limits) {
                    let seq = state.push(Arc::clone(&event), &encoded, client)?;
                    drop(state);
                    self.not_empty.notify_waiters();
                    return Ok(seq);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(QueueError::Closed),
            }
        }
    }

    /// 대기하지 않고 적재를 시도합니다.
    ///
    /// 가득 차면 `Full`, 입력이 중단되었으면 `Halted`를 반환합니다.
    pub fn try_enqueue(&self, event: Event, client: Option<ClientRef>) -> Result<u64, QueueError> {
        let encoded = serde_json::to_vec(&event)?;
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.halted {
            return Err(QueueError::Halted);
        }
        if !state.has_room(encoded.len(), &self.limits) {
            return Err(QueueError::Full);
        }
        let seq = state.push(Arc::new(event), &encoded, client)?;
        drop(state);
        self.not_empty.notify_waiters();
        Ok(seq)
    }

    /// 배치를 꺼냅니다.
    ///
    /// 비어 있으면 대기합니다. `max_events`보다 적게 쌓여 있으면 첫 엔트리를 본 시점부터
    /// `flush_timeout`까지 더 기다립니다. 배치는 최소 1개 엔트리를 담으며,
    /// 그 이후로는 `max_bytes`를 넘지 않습니다.
    ///
    /// 큐가 닫히거나 `cancel`이 취소되면 `None`을 반환합니다.
    pub async fn consume(
        &self,
        max_events: usize,
        max_bytes: usize,
        flush_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<Batch> {
        let max_events = max_events.max(1);
        let mut deadline: Option<Instant> = None;

        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if !state.pending.is_empty() {
                    let full = state.pending.len() >= max_events || state.pending_bytes >= max_bytes;
                    let expired = flush_timeout.is_zero()
                        || deadline.is_some_and(|d| Instant::now() >= d);
                    if full || expired {
                        let batch = state.take_batch(max_events, max_bytes);
                        drop(state);
                        self.not_full.notify_waiters();
                        return Some(batch);
                    }
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + flush_timeout);
                    }
                }
            }

            match deadline {
                Some(at) => tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(at) => {}
                    _ = cancel.cancelled() => return None,
                },
                None => tokio::select! {
                    _ = &mut notified => {}
                    _ = cancel.cancelled() => return None,
                },
            }
        }
    }

    /// 배치의 앞 `count`개 엔트리를 ACK합니다.
    ///
    /// 디스크 모드에서는 연속으로 ACK된 커서가 전진하면 영속화합니다.
    pub fn acknowledge(&self, batch_id: u64, count: usize) -> Result<(), QueueError> {
        let mut state = self.lock();
        let remaining = state
            .in_flight
            .get_mut(&batch_id)
            .ok_or(QueueError::UnknownBatch { batch_id })?;
        if count > remaining.len() {
            return Err(QueueError::InvalidAck {
                batch_id,
                count,
                remaining: remaining.len(),
            });
        }

        let acked: Vec<u64> = remaining.drain(..count).collect();
        if remaining.is_empty() {
            state.in_flight.remove(&batch_id);
        }

        state.acked_ahead.extend(acked);
        let before = state.ack_cursor;
        loop {
            let next = state.ack_cursor + 1;
            if !state.acked_ahead.remove(&next) {
                break;
            }
            state.ack_cursor = next;
        }

        if state.ack_cursor != before {
            let cursor = state.ack_cursor;
            if let Some(store) = state.store.as_mut() {
                disk::blocking_io(|| store.persist_ack(cursor))?;
            }
        }
        Ok(())
    }

    /// 새 적재를 막고 대기 중인 프로듀서와 소비자를 깨웁니다.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
        tracing::debug!("event queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// 입력을 중단합니다. 프로듀서는 큐가 가득 찬 것처럼 대기합니다.
    pub fn halt(&self) {
        let mut state = self.lock();
        if !state.halted {
            state.halted = true;
            metrics::gauge!(m::OUTPUT_INTAKE_HALTED).set(1.0);
            tracing::warn!("event queue intake halted");
        }
    }

    /// 중단된 입력을 재개합니다.
    pub fn resume(&self) {
        let mut state = self.lock();
        if state.halted {
            state.halted = false;
            drop(state);
            metrics::gauge!(m::OUTPUT_INTAKE_HALTED).set(0.0);
            self.not_full.notify_waiters();
            tracing::info!("event queue intake resumed");
        }
    }

    pub fn is_halted(&self) -> bool {
        self.lock().halted
    }

    /// 현재 상태 스냅샷
    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pending_events: state.pending.len(),
            pending_bytes: state.pending_bytes,
            in_flight_events: state.in_flight_events(),
            limits: self.limits,
            closed: state.closed,
            halted: state.halted,
        }
    }

    /// 종료 후 남은 미확인 엔트리를 정리하고 그 수를 반환합니다.
    ///
    /// 디스크 모드에서는 엔트리가 디스크에 남아 다음 시작 시 재생되고,
    /// 메모리 모드에서는 버려집니다.
    pub fn finalize(&self) -> usize {
        let mut state = self.lock();
        let unacked = state.pending.len() + state.in_flight_events();

        if let Some(store) = state.store.as_ref() {
            if let Err(e) = disk::blocking_io(|| store.sync()) {
                tracing::error!(error = %e, "failed to sync disk queue");
            }
            if unacked > 0 {
                tracing::info!(
                    unacked,
                    "unacknowledged events retained in disk queue for next start"
                );
            }
        } else if unacked > 0 {
            tracing::warn!(unacked, "discarding unacknowledged events from memory queue");
            metrics::counter!(m::PUBLISHER_EVENTS_DROPPED_TOTAL, m::LABEL_REASON => "shutdown")
                .increment(unacked as u64);
        }

        state.pending.clear();
        state.pending_bytes = 0;
        state.in_flight.clear();
        state.record_gauges();
        unacked
    }
}
