//! 이벤트 모델 벤치마크
//!
//! 필드 경로 조작, 직렬화, 복제 성능을 측정합니다.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use ironbeat_core::event::{Event, Fields, Value};

fn create_fields() -> Fields {
    let mut fields = Fields::new();
    fields.put("message", "GET /api/v1/users HTTP/1.1 200 OK");
    fields.put("host.name", "web-server-01");
    fields.put("process.name", "nginx");
    fields.put("http.response.status_code", 200_i64);
    fields.put("event.duration", 125_000_i64);
    fields.put("log.file.path", "/var/log/nginx/access.log");
    fields.put("tags", Value::Array(vec!["web".into(), "access".into()]));
    fields
}

fn bench_field_paths(c: &mut Criterion) {
    let fields = create_fields();

    let mut group = c.benchmark_group("field_paths");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_nested", |b| {
        b.iter(|| fields.get(black_box("http.response.status_code")))
    });

    group.bench_function("put_nested", |b| {
        b.iter(|| {
            let mut f = fields.clone();
            f.put(black_box("agent.name"), "ironbeat");
            f
        })
    });

    group.bench_function("deep_update", |b| {
        let mut extra = Fields::new();
        extra.put("host.role", "web");
        extra.put("env", "prod");
        b.iter(|| {
            let mut f = fields.clone();
            f.deep_update(black_box(&extra));
            f
        })
    });

    group.finish();
}

fn bench_event_serialization(c: &mut Criterion) {
    let mut event = Event::new(create_fields());
    event.meta.put("raw_index", "ironbeat-2024.01.15");

    let mut group = c.benchmark_group("event_serialization");
    group.throughput(Throughput::Elements(1));

    group.bench_function("serde_json_to_vec", |b| {
        b.iter(|| serde_json::to_vec(black_box(&event)).unwrap())
    });

    group.bench_function("output_document", |b| b.iter(|| black_box(&event).to_json()));

    group.bench_function("event_clone", |b| b.iter(|| black_box(&event).clone()));

    group.finish();
}

criterion_group!(benches, bench_field_paths, bench_event_serialization);
criterion_main!(benches);
