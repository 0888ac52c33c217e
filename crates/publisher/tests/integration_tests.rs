//! 통합 테스트 -- 클라이언트부터 출력, ACK까지 전체 흐름 검증
//!
//! 발행 순서 보장, 디스크 큐 재생, 백프레셔, 부분 ACK, 프로세서 순서,
//! 실패 이벤트 격리, 종료 시간 제한을 파이프라인 단위로 확인합니다.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use ironbeat_core::agent::AgentInfo;
use ironbeat_core::config::ProcessorConfig;
use ironbeat_core::error::{OutputError, ProcessorError};
use ironbeat_core::event::{Event, Fields, Private, Value};
use ironbeat_core::pipeline::{HealthStatus, Output, Pipeline, Processor};
use ironbeat_publisher::ack;
use ironbeat_publisher::processor::{self, BoxProcessor};
use ironbeat_publisher::{
    ClientConfig, PipelineBuilder, PublisherConfig, PublisherConfigBuilder, PublisherPipeline,
    QueueMode, SharedListener, SharedOutput,
};
use proptest::prelude::*;

// ─── 테스트용 출력 ───────────────────────────────────────────────────

fn message(event: &Event) -> String {
    match event.get_value("message") {
        Some(Value::String(m)) => m,
        _ => String::new(),
    }
}

/// 모든 이벤트를 수락하고 기록
#[derive(Default)]
struct CollectOutput {
    events: Mutex<Vec<Arc<Event>>>,
}

impl CollectOutput {
    fn messages(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|e| message(e)).collect()
    }
}

impl Output for CollectOutput {
    fn name(&self) -> &str {
        "collect"
    }

    async fn send(&self, batch: &[Arc<Event>]) -> Result<usize, OutputError> {
        self.events.lock().unwrap().extend(batch.iter().cloned());
        Ok(batch.len())
    }
}

/// 첫 전송에서 `first`개만 수락하고, `open` 전까지는 실패
struct GateOutput {
    first: usize,
    calls: AtomicUsize,
    open: AtomicBool,
    sends: Mutex<Vec<Vec<String>>>,
}

impl GateOutput {
    fn new(first: usize) -> Self {
        Self {
            first,
            calls: AtomicUsize::new(0),
            open: AtomicBool::new(false),
            sends: Mutex::new(Vec::new()),
        }
    }
}

impl Output for GateOutput {
    fn name(&self) -> &str {
        "gate"
    }

    async fn send(&self, batch: &[Arc<Event>]) -> Result<usize, OutputError> {
        self.sends
            .lock()
            .unwrap()
            .push(batch.iter().map(|e| message(e)).collect());
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(self.first.min(batch.len()));
        }
        if self.open.load(Ordering::SeqCst) {
            Ok(batch.len())
        } else {
            Err(OutputError::Transient("gate closed".to_owned()))
        }
    }
}

/// 전체 `budget`개까지만 수락하고 이후로는 계속 실패
struct BudgetOutput {
    remaining: Mutex<usize>,
    accepted: Mutex<Vec<String>>,
}

impl BudgetOutput {
    fn new(budget: usize) -> Self {
        Self {
            remaining: Mutex::new(budget),
            accepted: Mutex::new(Vec::new()),
        }
    }
}

impl Output for BudgetOutput {
    fn name(&self) -> &str {
        "budget"
    }

    async fn send(&self, batch: &[Arc<Event>]) -> Result<usize, OutputError> {
        let mut remaining = self.remaining.lock().unwrap();
        if *remaining == 0 {
            return Err(OutputError::Transient("budget exhausted".to_owned()));
        }
        let n = (*remaining).min(batch.len());
        *remaining -= n;
        self.accepted
            .lock()
            .unwrap()
            .extend(batch[..n].iter().map(|e| message(e)));
        Ok(n)
    }
}

/// 응답하지 않는 출력
#[derive(Default)]
struct HangingOutput {
    entered: AtomicBool,
    hang_on_close: bool,
}

impl Output for HangingOutput {
    fn name(&self) -> &str {
        "hanging"
    }

    async fn send(&self, _batch: &[Arc<Event>]) -> Result<usize, OutputError> {
        self.entered.store(true, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn close(&self) -> Result<(), OutputError> {
        if self.hang_on_close {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// 전송마다 정해진 개수를 순환하며 수락
struct CyclingOutput {
    accepts: Vec<usize>,
    calls: AtomicUsize,
}

impl Output for CyclingOutput {
    fn name(&self) -> &str {
        "cycling"
    }

    async fn send(&self, batch: &[Arc<Event>]) -> Result<usize, OutputError> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.accepts[i % self.accepts.len()].min(batch.len()))
    }
}

// ─── 헬퍼 ────────────────────────────────────────────────────────────

fn event(message: &str, private: u64) -> Event {
    let mut fields = Fields::new();
    fields.put("message", message);
    Event::new(fields).with_private(private)
}

/// ACK된 private 값(u64)을 순서대로 기록하는 리스너
fn recorder() -> (SharedListener, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener = ack::private_reporter(move |privates: Vec<Private>| {
        let mut sink = sink.lock().unwrap();
        sink.extend(privates.iter().filter_map(|p| p.downcast_ref::<u64>().copied()));
    });
    (listener, seen)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..600 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn fast_config() -> PublisherConfigBuilder {
    PublisherConfigBuilder::new()
        .flush_timeout(Duration::from_millis(10))
        .backoff(Duration::from_millis(5), Duration::from_millis(20))
        .drain_timeout(Duration::from_millis(200))
}

async fn started(config: PublisherConfig, output: SharedOutput) -> PublisherPipeline {
    let mut pipeline = PipelineBuilder::new()
        .config(config)
        .output(output)
        .agent(AgentInfo::new("edge01"))
        .build()
        .expect("failed to build pipeline");
    pipeline.start().await.expect("failed to start pipeline");
    pipeline
}

// ─── 순서 보장 ───────────────────────────────────────────────────────

/// 여러 워커와 작은 배치에서도 ACK는 발행 순서대로 전달되어야 함
#[tokio::test(flavor = "multi_thread")]
async fn test_acks_follow_publish_order_across_batches() {
    let config = fast_config()
        .batch_limits(3, 1024 * 1024)
        .workers(4)
        .build()
        .unwrap();
    let output = Arc::new(CollectOutput::default());
    let pipeline = started(config, output.clone()).await;

    let (listener, seen) = recorder();
    let client = pipeline
        .connect_with(ClientConfig::new("ordered").with_listener(listener))
        .await
        .unwrap();

    for i in 0..50 {
        client.publish(event(&format!("m{i}"), i)).await.unwrap();
    }
    wait_until(|| seen.lock().unwrap().len() == 50).await;

    assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<u64>>());
    assert_eq!(output.messages().len(), 50);
    pipeline.close().await;
}

/// 클라이언트마다 순서가 독립적으로 유지되어야 함
#[tokio::test(flavor = "multi_thread")]
async fn test_clients_are_ordered_independently() {
    let config = fast_config().batch_limits(4, 1024 * 1024).workers(2).build().unwrap();
    let pipeline = started(config, Arc::new(CollectOutput::default())).await;

    let (la, seen_a) = recorder();
    let (lb, seen_b) = recorder();
    let a = pipeline
        .connect_with(ClientConfig::new("a").with_listener(la))
        .await
        .unwrap();
    let b = pipeline
        .connect_with(ClientConfig::new("b").with_listener(lb))
        .await
        .unwrap();

    for i in 0..20 {
        a.publish(event("a", i)).await.unwrap();
        b.publish(event("b", 100 + i)).await.unwrap();
    }
    wait_until(|| seen_a.lock().unwrap().len() == 20 && seen_b.lock().unwrap().len() == 20).await;

    assert_eq!(*seen_a.lock().unwrap(), (0..20).collect::<Vec<u64>>());
    assert_eq!(*seen_b.lock().unwrap(), (100..120).collect::<Vec<u64>>());
    pipeline.close().await;
}

// ─── 디스크 큐 재생 ──────────────────────────────────────────────────

/// 확인된 이벤트는 재생되지 않고, 미확인 이벤트는 새 이벤트보다 먼저 재생되어야 함
#[tokio::test(flavor = "multi_thread")]
async fn test_disk_queue_replays_unacked_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let disk = QueueMode::Disk {
        path: dir.path().join("queue"),
    };

    // 1. 첫 실행: 5개 중 3개만 전송 성공
    let config = fast_config()
        .queue_mode(disk.clone())
        .batch_limits(10, 1024 * 1024)
        .max_retries(0)
        .max_retry_duration(Duration::ZERO)
        .build()
        .unwrap();
    let output = Arc::new(BudgetOutput::new(3));
    let pipeline = started(config, output.clone()).await;
    let client = pipeline.connect("first").await.unwrap();
    for i in 0..5 {
        client.publish(event(&format!("a{i}"), i)).await.unwrap();
    }
    wait_until(|| output.accepted.lock().unwrap().len() == 3).await;
    pipeline.close().await;
    drop(client);
    drop(pipeline);
    assert_eq!(*output.accepted.lock().unwrap(), vec!["a0", "a1", "a2"]);

    // 2. 재시작: a3, a4가 새 이벤트보다 먼저 전송
    let config = fast_config()
        .queue_mode(disk)
        .batch_limits(10, 1024 * 1024)
        .build()
        .unwrap();
    let output = Arc::new(CollectOutput::default());
    let pipeline = started(config, output.clone()).await;
    let client = pipeline.connect("second").await.unwrap();
    client.publish(event("new", 0)).await.unwrap();
    wait_until(|| output.messages().len() == 3).await;

    assert_eq!(output.messages(), vec!["a3", "a4", "new"]);
    pipeline.close().await;
}

// ─── 백프레셔 ────────────────────────────────────────────────────────

/// 소비자가 없으면 용량+1번째 publish는 대기하고, 워커가 시작되면 진행되어야 함
#[tokio::test(flavor = "multi_thread")]
async fn test_full_queue_blocks_until_consumed() {
    let config = fast_config().queue_limits(2, 1024 * 1024).build().unwrap();
    let output = Arc::new(CollectOutput::default());
    let pipeline = PipelineBuilder::new()
        .config(config)
        .output(output.clone())
        .build()
        .unwrap();
    let client = pipeline.connect("producer").await.unwrap();

    client.publish(event("m0", 0)).await.unwrap();
    client.publish(event("m1", 1)).await.unwrap();

    let blocked = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.publish(event("m2", 2)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished(), "publish should block on a full queue");

    pipeline.start_workers().await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), blocked)
        .await
        .expect("blocked publish did not resume")
        .unwrap()
        .unwrap();
    wait_until(|| output.messages().len() == 3).await;
    assert_eq!(output.messages(), vec!["m0", "m1", "m2"]);
    pipeline.close().await;
}

/// 대기 중인 publish는 종료가 시작되면 닫힘 에러로 반환되어야 함
#[tokio::test(flavor = "multi_thread")]
async fn test_blocked_publish_fails_on_shutdown() {
    let config = fast_config().queue_limits(1, 1024 * 1024).build().unwrap();
    let pipeline = PipelineBuilder::new()
        .config(config)
        .output(Arc::new(CollectOutput::default()))
        .build()
        .unwrap();
    let client = pipeline.connect("producer").await.unwrap();
    client.publish(event("m0", 0)).await.unwrap();

    let blocked = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.publish(event("m1", 1)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    pipeline.close().await;
    let err = tokio::time::timeout(Duration::from_secs(3), blocked)
        .await
        .expect("blocked publish was not released")
        .unwrap()
        .unwrap_err();
    assert!(err.is_closed(), "unexpected error: {err}");
}

// ─── 부분 ACK ────────────────────────────────────────────────────────

/// 출력이 앞 k개만 수락하면 정확히 k개만 ACK되고 나머지는 순서대로 재시도되어야 함
#[tokio::test(flavor = "multi_thread")]
async fn test_partial_ack_releases_exact_prefix() {
    let config = fast_config()
        .batch_limits(5, 1024 * 1024)
        .flush_timeout(Duration::from_millis(500))
        .max_retries(0)
        .max_retry_duration(Duration::ZERO)
        .build()
        .unwrap();
    let output = Arc::new(GateOutput::new(2));
    let pipeline = started(config, output.clone()).await;

    let (listener, seen) = recorder();
    let client = pipeline
        .connect_with(ClientConfig::new("partial").with_listener(listener))
        .await
        .unwrap();
    for i in 0..5 {
        client.publish(event(&format!("m{i}"), i)).await.unwrap();
    }

    wait_until(|| seen.lock().unwrap().len() == 2).await;
    wait_until(|| output.sends.lock().unwrap().len() >= 3).await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1]);

    output.open.store(true, Ordering::SeqCst);
    wait_until(|| seen.lock().unwrap().len() == 5).await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    let sends = output.sends.lock().unwrap().clone();
    assert_eq!(sends[0], vec!["m0", "m1", "m2", "m3", "m4"]);
    for retry in &sends[1..] {
        assert_eq!(*retry, vec!["m2", "m3", "m4"]);
    }
    pipeline.close().await;
}

// ─── 프로세서 순서 ───────────────────────────────────────────────────

/// `@metadata.raw_index`를 `seen_index` 필드로 복사
struct CaptureRawIndex;

impl Processor for CaptureRawIndex {
    fn name(&self) -> &str {
        "capture_raw_index"
    }

    fn run(&self, mut event: Event) -> Result<Option<Event>, ProcessorError> {
        if let Some(index) = event.get_value("@metadata.raw_index") {
            event.put_value("seen_index", index);
        }
        Ok(Some(event))
    }
}

/// 사용자 프로세서는 이미 해석된 인덱스를 볼 수 있어야 함
#[tokio::test(flavor = "multi_thread")]
async fn test_user_processor_observes_resolved_index() {
    let _ = processor::registry().register("capture_raw_index", |_| {
        Ok(Box::new(CaptureRawIndex) as BoxProcessor)
    });

    let config = fast_config()
        .index("%{[agent.name]}-%{+yyyy.MM.dd}")
        .build()
        .unwrap();
    let output = Arc::new(CollectOutput::default());
    let pipeline = started(config, output.clone()).await;

    let client = pipeline
        .connect_with(ClientConfig::new("indexed").with_processors(vec![ProcessorConfig {
            processor_type: "capture_raw_index".to_owned(),
            settings: toml::Table::new(),
        }]))
        .await
        .unwrap();

    let ts = Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap();
    let mut fields = Fields::new();
    fields.put("message", "hello");
    client.publish(Event::with_timestamp(ts, fields)).await.unwrap();
    wait_until(|| output.messages().len() == 1).await;

    let events = output.events.lock().unwrap().clone();
    assert_eq!(
        events[0].get_value("seen_index"),
        Some(Value::String("edge01-2024.03.05".to_owned()))
    );
    assert_eq!(
        events[0].get_value("@metadata.raw_index"),
        Some(Value::String("edge01-2024.03.05".to_owned()))
    );
    pipeline.close().await;
}

// ─── 실패 이벤트 격리 ────────────────────────────────────────────────

/// 프로세서가 실패한 이벤트만 드롭되고 나머지는 그대로 전송되어야 함
#[tokio::test(flavor = "multi_thread")]
async fn test_failing_event_does_not_poison_others() {
    let config = fast_config().build().unwrap();
    let output = Arc::new(CollectOutput::default());
    let pipeline = started(config, output.clone()).await;

    let settings: toml::Table = toml::from_str(r#"fields = ["debug"]"#).unwrap();
    let (listener, seen) = recorder();
    let client = pipeline
        .connect_with(
            ClientConfig::new("strict")
                .with_listener(listener)
                .with_processors(vec![ProcessorConfig {
                    processor_type: "drop_fields".to_owned(),
                    settings,
                }]),
        )
        .await
        .unwrap();

    let mut with_debug = event("m0", 0);
    with_debug.put_value("debug", true);
    client.publish(with_debug).await.unwrap();
    // debug 필드가 없어 drop_fields가 실패
    client.publish(event("m1", 1)).await.unwrap();
    let mut with_debug = event("m2", 2);
    with_debug.put_value("debug", true);
    client.publish(with_debug).await.unwrap();

    wait_until(|| seen.lock().unwrap().len() == 3).await;
    assert_eq!(output.messages(), vec!["m0", "m2"]);
    assert!(
        output
            .events
            .lock()
            .unwrap()
            .iter()
            .all(|e| e.get_value("debug").is_none())
    );
    // 드롭된 이벤트도 순서대로 보고되어 커서가 전진
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    pipeline.close().await;
}

// ─── 종료 시간 제한 ──────────────────────────────────────────────────

/// 출력이 응답하지 않아도 close는 drain_timeout 근처에서 반환되어야 함
#[tokio::test(flavor = "multi_thread")]
async fn test_close_returns_with_unreachable_output() {
    let drain_timeout = Duration::from_millis(200);
    let config = fast_config()
        .send_timeout(Duration::from_secs(60))
        .drain_timeout(drain_timeout)
        .build()
        .unwrap();
    let output = Arc::new(HangingOutput::default());
    let mut pipeline = started(config, output.clone()).await;

    let client = pipeline.connect("stuck").await.unwrap();
    client.publish(event("m0", 0)).await.unwrap();
    wait_until(|| output.entered.load(Ordering::SeqCst)).await;

    let started_at = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(5), pipeline.stop())
        .await
        .expect("close did not return in time")
        .unwrap();
    assert!(
        started_at.elapsed() < drain_timeout + Duration::from_millis(500),
        "close took {:?}",
        started_at.elapsed()
    );
    assert!(matches!(
        pipeline.health_check().await,
        HealthStatus::Unhealthy(_)
    ));
}

/// 전송과 종료가 모두 멈춘 출력, wait_close가 긴 클라이언트 여럿이 있어도
/// 종료 시간은 drain_timeout에 묶여야 함
#[tokio::test(flavor = "multi_thread")]
async fn test_close_bounded_with_waiting_clients_and_stuck_output_close() {
    let drain_timeout = Duration::from_millis(200);
    let config = fast_config()
        .send_timeout(Duration::from_secs(60))
        .drain_timeout(drain_timeout)
        .build()
        .unwrap();
    let output = Arc::new(HangingOutput {
        hang_on_close: true,
        ..HangingOutput::default()
    });
    let mut pipeline = started(config, output.clone()).await;

    let mut clients = Vec::new();
    for i in 0..3 {
        let client = pipeline
            .connect_with(
                ClientConfig::new(format!("waiting-{i}")).with_wait_close(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        client.publish(event(&format!("m{i}"), i)).await.unwrap();
        clients.push(client);
    }
    wait_until(|| output.entered.load(Ordering::SeqCst)).await;

    let started_at = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(5), pipeline.stop())
        .await
        .expect("close did not return in time")
        .unwrap();
    let elapsed = started_at.elapsed();
    assert!(
        elapsed < drain_timeout + Duration::from_millis(500),
        "close took {elapsed:?}"
    );
    // 미확인 이벤트가 남아 있어도 파이프라인이 클라이언트를 닫음
    assert!(clients.iter().all(|c| c.is_closed()));
}

// ─── 속성 테스트 ─────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// 배치 크기, 워커 수, 부분 수락 패턴과 무관하게 ACK 순서가 유지되어야 함
    #[test]
    fn prop_ack_order_is_publish_order(
        n in 1u64..40,
        batch in 1usize..6,
        workers in 1usize..4,
        accepts in proptest::collection::vec(1usize..4, 1..6),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let seen = runtime.block_on(async move {
            let config = fast_config()
                .batch_limits(batch, 1024 * 1024)
                .workers(workers)
                .build()
                .unwrap();
            let output = Arc::new(CyclingOutput { accepts, calls: AtomicUsize::new(0) });
            let pipeline = started(config, output).await;
            let (listener, seen) = recorder();
            let client = pipeline
                .connect_with(ClientConfig::new("prop").with_listener(listener))
                .await
                .unwrap();
            for i in 0..n {
                client.publish(event("p", i)).await.unwrap();
            }
            wait_until(|| seen.lock().unwrap().len() as u64 == n).await;
            pipeline.close().await;
            let result = seen.lock().unwrap().clone();
            result
        });
        prop_assert_eq!(seen, (0..n).collect::<Vec<u64>>());
    }
}
