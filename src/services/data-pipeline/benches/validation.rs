use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use data_pipeline_service::{
    broker::InMemoryBroker,
    config::{Config, StreamConfig},
    events::EventBus,
    metrics::MetricsCollector,
    resilience::ErrorHandler,
    stream::{ProcessingRule, StreamProcessor, StreamProcessorConfig, StreamValidation},
    types::{Condition, ComparisonOp, Record, StreamMessage},
    validation::{CleansingRule, ValidationEngine, ValidationRule, ValueKind},
};
use serde_json::json;
use tokio::runtime::Runtime;

fn create_record(id: usize) -> Record {
    let value = json!({
        "id": id,
        "email": if id % 10 == 0 { "broken-address".to_string() } else { format!("user{}@Example.COM", id) },
        "phone": format!("+1 (555) {:03}-{:04}", id % 1000, id % 10000),
        "amount": format!("${}.{:02}", id % 5000, id % 100),
        "status": ["active", "pending", "closed"][id % 3],
        "created_date": "2024-03-15",
    });
    value.as_object().cloned().unwrap_or_default()
}

fn rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule::required("id"),
        ValidationRule::of_type("id", ValueKind::Integer),
        ValidationRule::of_type("email", ValueKind::Email),
        ValidationRule::pattern("status", "^[a-z]+$"),
        ValidationRule::one_of(
            "status",
            vec![json!("active"), json!("pending"), json!("closed")],
        ),
        ValidationRule::length("phone", Some(7), Some(32)),
    ]
}

fn bench_validate_dataset(c: &mut Criterion) {
    let engine = ValidationEngine::default();
    let rules = rules();

    let mut group = c.benchmark_group("validate_dataset");
    for size in [100usize, 1_000, 10_000] {
        let records: Vec<Record> = (0..size).map(create_record).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &records, |b, records| {
            b.iter(|| engine.validate_dataset(black_box(records), black_box(&rules)))
        });
    }
    group.finish();
}

fn bench_cleanse_and_anomalies(c: &mut Criterion) {
    let engine = ValidationEngine::default();
    let records: Vec<Record> = (0..1_000).map(create_record).collect();
    let cleansing = [
        CleansingRule::Email,
        CleansingRule::Phone,
        CleansingRule::Currency,
        CleansingRule::Date,
    ];

    c.bench_function("cleanse_data_1000", |b| {
        b.iter(|| engine.cleanse_data(black_box(&records), black_box(&cleansing)))
    });

    let numeric: Vec<Record> = (0..1_000)
        .map(|i| {
            json!({"latency_ms": if i % 97 == 0 { 5_000.0 } else { (i % 50) as f64 }})
                .as_object()
                .cloned()
                .unwrap_or_default()
        })
        .collect();
    c.bench_function("detect_anomalies_1000", |b| {
        b.iter(|| engine.detect_anomalies(black_box(&numeric), "latency_ms"))
    });
}

fn bench_stream_gate(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let config = Config::default();
    let events = EventBus::new();
    let metrics = Arc::new(MetricsCollector::new(&config).unwrap());
    let handler = Arc::new(ErrorHandler::new(events.clone(), Arc::clone(&metrics)));

    let mut processor_config = StreamProcessorConfig::new("bench", "bench.in", "bench-cg");
    processor_config.validation = Some(StreamValidation {
        rules: rules(),
        on_failure: Default::default(),
    });
    processor_config.rules = vec![ProcessingRule::Filter {
        conditions: vec![Condition::new("id", ComparisonOp::GreaterThanOrEqual, json!(0))],
    }];
    let processor = StreamProcessor::new(
        processor_config,
        StreamConfig::default(),
        Arc::new(InMemoryBroker::default()),
        handler,
        events,
        metrics,
    )
    .unwrap();

    let message = StreamMessage::new(Some("k".to_string()), json!(create_record(7)));
    c.bench_function("stream_process_message", |b| {
        b.to_async(&rt)
            .iter(|| async { processor.process_message(black_box(message.clone())).await })
    });
}

criterion_group!(
    benches,
    bench_validate_dataset,
    bench_cleanse_and_anomalies,
    bench_stream_gate
);
criterion_main!(benches);
