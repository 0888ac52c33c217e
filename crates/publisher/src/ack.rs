//! ACK 추적 -- 출력 확인을 클라이언트별 리스너로 전달
//!
//! 워커는 배치 결과를 [`AckHandle`]로 트래커 태스크에 보냅니다. 트래커만이
//! 클라이언트별 ACK 상태를 변경하며, 발행 순번이 연속된 구간이 확정될 때마다
//! 해당 클라이언트의 리스너 태스크로 전달합니다.
//!
//! ```text
//! worker ──Acked/Dropped──▶ tracker ──ListenerBatch──▶ listener task ──▶ AckListener
//! client ──Skipped────────▶    │                         (클라이언트마다 하나, 순차 실행)
//! ```
//!
//! - 리스너는 클라이언트별 발행 순서대로 호출되며, 그 클라이언트의 private 값만 받습니다.
//! - 재시도 소진으로 버려진 이벤트는 순서만 전진시키고 리스너에는 보고되지 않습니다.
//! - 프로세서가 걸러낸 이벤트는 private 값과 함께 보고되어 체크포인트가 전진합니다.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ironbeat_core::event::Private;
use ironbeat_core::metrics as m;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::queue::ClientRef;

// ─── AckListener ─────────────────────────────────────────────────────

/// 확인된 이벤트를 통지받는 리스너
///
/// `privates.len() == count`이며, 순서는 발행 순서와 같습니다.
/// 한 클라이언트에 대한 호출은 겹치지 않습니다.
pub trait AckListener: Send + Sync + 'static {
    fn on_acked(&self, count: usize, privates: Vec<Option<Private>>);
}

impl<F> AckListener for F
where
    F: Fn(usize, Vec<Option<Private>>) + Send + Sync + 'static,
{
    fn on_acked(&self, count: usize, privates: Vec<Option<Private>>) {
        self(count, privates)
    }
}

/// 공유 리스너
pub type SharedListener = Arc<dyn AckListener>;

/// 확인된 이벤트 수만 전달하는 리스너를 만듭니다.
pub fn counting<F>(f: F) -> SharedListener
where
    F: Fn(usize) + Send + Sync + 'static,
{
    Arc::new(move |count: usize, _privates: Vec<Option<Private>>| f(count))
}

/// private 값이 있는 이벤트만 골라 전달하는 리스너를 만듭니다.
pub fn private_reporter<F>(f: F) -> SharedListener
where
    F: Fn(Vec<Private>) + Send + Sync + 'static,
{
    Arc::new(move |_count: usize, privates: Vec<Option<Private>>| {
        let values: Vec<Private> = privates.into_iter().flatten().collect();
        if !values.is_empty() {
            f(values);
        }
    })
}

/// 여러 리스너를 순서대로 호출하는 리스너를 만듭니다.
pub fn combine(listeners: Vec<SharedListener>) -> SharedListener {
    if listeners.len() == 1
        && let Some(only) = listeners.first()
    {
        return Arc::clone(only);
    }
    Arc::new(Combined(listeners))
}

struct Combined(Vec<SharedListener>);

impl AckListener for Combined {
    fn on_acked(&self, count: usize, privates: Vec<Option<Private>>) {
        if let Some((last, rest)) = self.0.split_last() {
            for listener in rest {
                listener.on_acked(count, privates.clone());
            }
            last.on_acked(count, privates);
        }
    }
}

// ─── 트래커 메시지 ───────────────────────────────────────────────────

/// 트래커가 리스너 태스크로 보내는 확정 구간
#[derive(Debug)]
pub(crate) struct ListenerBatch {
    /// 보고 대상 이벤트의 private 값 (발행 순)
    pub privates: Vec<Option<Private>>,
    /// 보고 여부와 무관하게 확정된 이벤트 수
    pub settled: u64,
}

pub(crate) enum AckMessage {
    Register {
        client_id: u64,
        sender: mpsc::UnboundedSender<ListenerBatch>,
    },
    Unregister {
        client_id: u64,
    },
    /// 출력이 수락한 엔트리
    Acked(Vec<(ClientRef, Option<Private>)>),
    /// 재시도 소진으로 버려진 엔트리 (보고하지 않음)
    Dropped(Vec<ClientRef>),
    /// 적재되지 않고 걸러진 이벤트 (보고함)
    Skipped {
        client: ClientRef,
        private: Option<Private>,
    },
    Flush(oneshot::Sender<()>),
}

/// 트래커 태스크로 메시지를 보내는 핸들
#[derive(Clone)]
pub struct AckHandle {
    tx: mpsc::Sender<AckMessage>,
}

impl AckHandle {
    pub(crate) async fn send(&self, msg: AckMessage) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    /// 대기하지 않고 보냅니다. 채널이 가득 찼거나 트래커가 종료되었으면 false
    pub(crate) fn try_send(&self, msg: AckMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// 보낼 수 없으면 (트래커 종료) false
    pub(crate) async fn send_timeout(&self, msg: AckMessage, timeout: Duration) -> bool {
        matches!(self.tx.send_timeout(msg, timeout).await, Ok(()))
    }

    /// 지금까지 보낸 메시지가 모두 처리될 때까지 기다립니다.
    ///
    /// 트래커가 이미 종료되었으면 바로 반환합니다.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AckMessage::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

// ─── AckTracker ──────────────────────────────────────────────────────

struct ClientAckState {
    next_seq: u64,
    /// 순번 → 보고할 private 값 (`None`이면 보고하지 않음)
    resolved: BTreeMap<u64, Option<Option<Private>>>,
    sender: mpsc::UnboundedSender<ListenerBatch>,
}

/// 클라이언트별 ACK 순서를 맞추는 트래커 태스크
pub struct AckTracker {
    clients: HashMap<u64, ClientAckState>,
    rx: mpsc::Receiver<AckMessage>,
}

impl AckTracker {
    /// 트래커와 핸들을 생성합니다. 태스크는 [`start`](Self::start)로 시작합니다.
    ///
    /// 시작 전에 보낸 메시지는 채널 용량만큼 버퍼링됩니다.
    pub fn new(capacity: usize) -> (Self, AckHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let tracker = Self {
            clients: HashMap::new(),
            rx,
        };
        (tracker, AckHandle { tx })
    }

    /// 트래커 태스크를 시작합니다.
    ///
    /// 모든 [`AckHandle`]이 drop되면 태스크가 종료됩니다.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// 생성과 시작을 한 번에 합니다.
    pub fn spawn(capacity: usize) -> (AckHandle, JoinHandle<()>) {
        let (tracker, handle) = Self::new(capacity);
        (handle, tracker.start())
    }

    async fn run(mut self) {
        tracing::debug!("ack tracker started");
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg);
        }
        tracing::debug!(clients = self.clients.len(), "ack tracker stopped");
    }

    fn handle(&mut self, msg: AckMessage) {
        match msg {
            AckMessage::Register { client_id, sender } => {
                self.clients.insert(
                    client_id,
                    ClientAckState {
                        next_seq: 0,
                        resolved: BTreeMap::new(),
                        sender,
                    },
                );
            }
            AckMessage::Unregister { client_id } => {
                if let Some(state) = self.clients.remove(&client_id)
                    && !state.resolved.is_empty()
                {
                    tracing::debug!(
                        client_id,
                        unreleased = state.resolved.len(),
                        "client unregistered with out-of-order acknowledgments"
                    );
                }
            }
            AckMessage::Acked(entries) => {
                let mut touched = Vec::new();
                for (client, private) in entries {
                    self.resolve(client, Some(private));
                    touched.push(client.client_id);
                }
                touched.dedup();
                for client_id in touched {
                    self.release(client_id);
                }
            }
            AckMessage::Dropped(clients) => {
                let mut touched = Vec::new();
                for client in clients {
                    self.resolve(client, None);
                    touched.push(client.client_id);
                }
                touched.dedup();
                for client_id in touched {
                    self.release(client_id);
                }
            }
            AckMessage::Skipped { client, private } => {
                self.resolve(client, Some(private));
                self.release(client.client_id);
            }
            AckMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn resolve(&mut self, client: ClientRef, report: Option<Option<Private>>) {
        match self.clients.get_mut(&client.client_id) {
            Some(state) if client.seq >= state.next_seq => {
                state.resolved.insert(client.seq, report);
            }
            Some(_) => {
                tracing::debug!(
                    client_id = client.client_id,
                    seq = client.seq,
                    "ignoring duplicate acknowledgment"
                );
            }
            None => {}
        }
    }

    /// 연속으로 확정된 구간을 리스너 태스크로 보냅니다.
    fn release(&mut self, client_id: u64) {
        let Some(state) = self.clients.get_mut(&client_id) else {
            return;
        };

        let mut privates = Vec::new();
        let mut settled = 0_u64;
        while let Some(report) = state.resolved.remove(&state.next_seq) {
            state.next_seq += 1;
            settled += 1;
            if let Some(private) = report {
                privates.push(private);
            }
        }
        if settled == 0 {
            return;
        }

        metrics::counter!(m::ACK_EVENTS_DELIVERED_TOTAL).increment(privates.len() as u64);
        if state.sender.send(ListenerBatch { privates, settled }).is_err() {
            tracing::debug!(client_id, "listener task gone, dropping acknowledgments");
        }
    }
}

// ─── 리스너 태스크 ───────────────────────────────────────────────────

/// 아직 확정되지 않은 이벤트 수
///
/// 클라이언트가 적재(또는 걸러냄)할 때 증가하고 리스너 태스크가 확정 시 감소합니다.
#[derive(Debug, Default)]
pub(crate) struct Outstanding {
    count: AtomicU64,
    zero: Notify,
}

impl Outstanding {
    pub fn add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    pub fn settle(&self, n: u64) {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(n)))
            .unwrap_or_else(|c| c);
        if prev <= n {
            self.zero.notify_waiters();
        }
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// 0이 될 때까지 최대 `timeout` 동안 기다립니다. 0에 도달했으면 true
    pub async fn wait_zero(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.zero.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.get() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// 클라이언트 리스너 태스크를 시작합니다.
///
/// `gate`가 true로 바뀐 뒤에는 리스너를 더 이상 호출하지 않습니다.
/// 호출 중에는 `gate` 락을 잡고 있으므로, 닫는 쪽이 락을 얻으면 진행 중인 호출도 끝난 것입니다.
pub(crate) fn spawn_listener(
    client_id: u64,
    listener: SharedListener,
    mut rx: mpsc::UnboundedReceiver<ListenerBatch>,
    gate: Arc<Mutex<bool>>,
    outstanding: Arc<Outstanding>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            if !batch.privates.is_empty() {
                let closed = gate.lock().unwrap_or_else(PoisonError::into_inner);
                if *closed {
                    break;
                }
                listener.on_acked(batch.privates.len(), batch.privates);
            }
            outstanding.settle(batch.settled);
        }
        tracing::debug!(client_id, "ack listener task stopped");
    })
}
