//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 각 모듈은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `ironbeat_`
//! - 컴포넌트명: `publisher_`, `queue_`, `output_`, `ack_`, `daemon_`, `input_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(ironbeat_core::metrics::PUBLISHER_EVENTS_PUBLISHED_TOTAL).increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 프로세서 이름 레이블 키
pub const LABEL_PROCESSOR: &str = "processor";

/// 출력 이름 레이블 키 (console, file)
pub const LABEL_OUTPUT: &str = "output";

/// 드롭/실패 사유 레이블 키 (queue_full, processor_error, retry_exhausted, ...)
pub const LABEL_REASON: &str = "reason";

/// 에러 종류 레이블 키 (transient, throttled, timeout, permanent)
pub const LABEL_ERROR_KIND: &str = "kind";

/// 입력 식별자 레이블 키
pub const LABEL_INPUT: &str = "input";

// ─── Publisher 메트릭 ───────────────────────────────────────────────

/// Publisher: 큐에 적재된 이벤트 수 (counter)
pub const PUBLISHER_EVENTS_PUBLISHED_TOTAL: &str = "ironbeat_publisher_events_published_total";

/// Publisher: 프로세서가 걸러낸 이벤트 수 (counter)
pub const PUBLISHER_EVENTS_FILTERED_TOTAL: &str = "ironbeat_publisher_events_filtered_total";

/// Publisher: 드롭된 이벤트 수 (counter, label: reason)
pub const PUBLISHER_EVENTS_DROPPED_TOTAL: &str = "ironbeat_publisher_events_dropped_total";

/// Publisher: 프로세서 에러 수 (counter, label: processor)
pub const PUBLISHER_PROCESSOR_ERRORS_TOTAL: &str = "ironbeat_publisher_processor_errors_total";

/// Publisher: 열린 클라이언트 수 (gauge)
pub const PUBLISHER_CLIENTS_ACTIVE: &str = "ironbeat_publisher_clients_active";

// ─── Queue 메트릭 ──────────────────────────────────────────────────

/// Queue: 대기 중인 이벤트 수 (gauge)
pub const QUEUE_EVENTS: &str = "ironbeat_queue_events";

/// Queue: 대기 중인 이벤트 바이트 (gauge)
pub const QUEUE_BYTES: &str = "ironbeat_queue_bytes";

/// Queue: 재시작 시 재생된 이벤트 수 (counter)
pub const QUEUE_REPLAYED_TOTAL: &str = "ironbeat_queue_replayed_total";

// ─── Output 메트릭 ─────────────────────────────────────────────────

/// Output: 전송 시도한 배치 수 (counter, label: output)
pub const OUTPUT_BATCHES_SENT_TOTAL: &str = "ironbeat_output_batches_sent_total";

/// Output: 출력이 수락한 이벤트 수 (counter, label: output)
pub const OUTPUT_EVENTS_ACKED_TOTAL: &str = "ironbeat_output_events_acked_total";

/// Output: 전송 실패 수 (counter, labels: output, kind)
pub const OUTPUT_SEND_ERRORS_TOTAL: &str = "ironbeat_output_send_errors_total";

/// Output: 재시도된 배치 수 (counter, label: output)
pub const OUTPUT_BATCHES_RETRIED_TOTAL: &str = "ironbeat_output_batches_retried_total";

/// Output: 재시도 소진으로 버려진 배치 수 (counter, label: output)
pub const OUTPUT_BATCHES_DROPPED_TOTAL: &str = "ironbeat_output_batches_dropped_total";

/// Output: 배치 전송 지연 시간 (histogram, 초)
pub const OUTPUT_SEND_DURATION_SECONDS: &str = "ironbeat_output_send_duration_seconds";

/// Output: 큐 입력 중단 상태 (gauge, 0 또는 1)
pub const OUTPUT_INTAKE_HALTED: &str = "ironbeat_output_intake_halted";

// ─── Ack 메트릭 ────────────────────────────────────────────────────

/// Ack: 리스너에 전달된 이벤트 수 (counter)
pub const ACK_EVENTS_DELIVERED_TOTAL: &str = "ironbeat_ack_events_delivered_total";

// ─── Daemon / Input 메트릭 ─────────────────────────────────────────

/// Daemon: 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "ironbeat_daemon_uptime_seconds";

/// Daemon: 실행 중인 입력 수 (gauge)
pub const DAEMON_INPUTS_RUNNING: &str = "ironbeat_daemon_inputs_running";

/// Daemon: 빌드 정보 (gauge, 항상 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "ironbeat_daemon_build_info";

/// Input: 읽은 줄 수 (counter)
pub const INPUT_LINES_READ_TOTAL: &str = "ironbeat_input_lines_read_total";

// ─── 히스토그램 버킷 정의 ────────────────────────────────────────────

/// 배치 전송 지연 시간 히스토그램 버킷 (초)
///
/// 1ms ~ 60s 범위 (원격 싱크 왕복 포함)
pub const SEND_DURATION_BUCKETS: [f64; 10] =
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0];

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 이 함수는 전역 레코더 설치 후 한 번만 호출해야 합니다.
/// 일반적으로 `ironbeat-daemon`의 시작 시점에서 호출합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Publisher
    describe_counter!(
        PUBLISHER_EVENTS_PUBLISHED_TOTAL,
        "Total number of events accepted into the queue"
    );
    describe_counter!(
        PUBLISHER_EVENTS_FILTERED_TOTAL,
        "Total number of events dropped by a processor"
    );
    describe_counter!(
        PUBLISHER_EVENTS_DROPPED_TOTAL,
        "Total number of events dropped, by reason"
    );
    describe_counter!(
        PUBLISHER_PROCESSOR_ERRORS_TOTAL,
        "Total number of per-event processor failures"
    );
    describe_gauge!(PUBLISHER_CLIENTS_ACTIVE, "Number of open publisher clients");

    // Queue
    describe_gauge!(QUEUE_EVENTS, "Number of events waiting in the queue");
    describe_gauge!(QUEUE_BYTES, "Serialized bytes waiting in the queue");
    describe_counter!(
        QUEUE_REPLAYED_TOTAL,
        "Unacknowledged events replayed from disk on startup"
    );

    // Output
    describe_counter!(OUTPUT_BATCHES_SENT_TOTAL, "Batch send attempts");
    describe_counter!(
        OUTPUT_EVENTS_ACKED_TOTAL,
        "Events acknowledged by the output"
    );
    describe_counter!(OUTPUT_SEND_ERRORS_TOTAL, "Failed batch sends, by error kind");
    describe_counter!(OUTPUT_BATCHES_RETRIED_TOTAL, "Batch retries");
    describe_counter!(
        OUTPUT_BATCHES_DROPPED_TOTAL,
        "Batches dropped after retries were exhausted"
    );
    describe_histogram!(
        OUTPUT_SEND_DURATION_SECONDS,
        "Batch send latency in seconds"
    );
    describe_gauge!(
        OUTPUT_INTAKE_HALTED,
        "1 when queue intake is halted after retry exhaustion"
    );

    // Ack
    describe_counter!(
        ACK_EVENTS_DELIVERED_TOTAL,
        "Events reported to client acknowledgment listeners"
    );

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Daemon uptime in seconds");
    describe_gauge!(DAEMON_INPUTS_RUNNING, "Number of running inputs");
    describe_gauge!(DAEMON_BUILD_INFO, "Build information (always 1)");
    describe_counter!(INPUT_LINES_READ_TOTAL, "Lines read by file inputs");
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METRIC_NAMES: &[&str] = &[
        PUBLISHER_EVENTS_PUBLISHED_TOTAL,
        PUBLISHER_EVENTS_FILTERED_TOTAL,
        PUBLISHER_EVENTS_DROPPED_TOTAL,
        PUBLISHER_PROCESSOR_ERRORS_TOTAL,
        PUBLISHER_CLIENTS_ACTIVE,
        QUEUE_EVENTS,
        QUEUE_BYTES,
        QUEUE_REPLAYED_TOTAL,
        OUTPUT_BATCHES_SENT_TOTAL,
        OUTPUT_EVENTS_ACKED_TOTAL,
        OUTPUT_SEND_ERRORS_TOTAL,
        OUTPUT_BATCHES_RETRIED_TOTAL,
        OUTPUT_BATCHES_DROPPED_TOTAL,
        OUTPUT_SEND_DURATION_SECONDS,
        OUTPUT_INTAKE_HALTED,
        ACK_EVENTS_DELIVERED_TOTAL,
        DAEMON_UPTIME_SECONDS,
        DAEMON_INPUTS_RUNNING,
        DAEMON_BUILD_INFO,
        INPUT_LINES_READ_TOTAL,
    ];

    #[test]
    fn all_metrics_start_with_ironbeat_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(
                name.starts_with("ironbeat_"),
                "Metric '{}' does not start with 'ironbeat_' prefix",
                name
            );
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names = ALL_METRIC_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL_METRIC_NAMES.len());
    }

    #[test]
    fn describe_all_does_not_panic() {
        // 레코더 없이 호출해도 패닉하지 않아야 함
        describe_all();
    }

    #[test]
    fn label_keys_are_lowercase() {
        for label in [LABEL_PROCESSOR, LABEL_OUTPUT, LABEL_REASON, LABEL_ERROR_KIND] {
            assert_eq!(label.to_lowercase(), label);
        }
    }

    #[test]
    fn send_duration_buckets_are_sorted() {
        let buckets = SEND_DURATION_BUCKETS;
        for i in 1..buckets.len() {
            assert!(
                buckets[i] > buckets[i - 1],
                "Bucket values must be in ascending order"
            );
        }
    }
}
