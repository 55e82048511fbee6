//! Integration tests for the data pipeline
//!
//! These tests drive the public API end to end: definitions loaded from
//! files, ETL jobs loading into the in-memory store, and stream processors
//! running against the in-memory broker with quality monitoring attached.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use data_pipeline_service::{
    broker::{InMemoryBroker, MessageBroker},
    connector::{RelationalSource, SourceKind},
    etl::{JobDestination, JobSource, WriteMode},
    events::drain,
    store::InMemoryStore,
    stream::{StreamFailurePolicy, StreamValidation},
    Config, DataPipeline, DataSourceConfig, EtlJobConfig, PipelineDefinition, Record,
    StreamMessage, StreamProcessorConfig, ValidationRule,
};

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap_or_default()
}

fn pipeline(store: &InMemoryStore) -> DataPipeline {
    DataPipeline::new(Config::default(), Arc::new(store.clone())).unwrap()
}

/// CSV file source through a definition, with invalid rows quarantined
#[tokio::test]
async fn test_csv_job_quarantines_invalid_rows() {
    let dir = TempDir::new().unwrap();
    let csv_path = dir.path().join("payments.csv");
    std::fs::write(
        &csv_path,
        "id,email,amount\n1,ana@example.com,10.5\n2,not-an-email,3\n3,cy@example.com,abc\n",
    )
    .unwrap();

    let definition_path = dir.path().join("pipeline.yaml");
    std::fs::write(
        &definition_path,
        format!(
            r#"
sources:
  - id: payments-file
    name: Payments export
    type: file
    path: {}
    format: csv
jobs:
  - id: payments
    name: Load payments
    source:
      source_id: payments-file
    transformations:
      - type: map
        mappings:
          - target: payment_id
            source: id
          - target: origin
            default: csv
    validation:
      rules:
        - field: email
          rule: type
          expected: email
        - field: amount
          rule: type
          expected: number
      on_failure: quarantine
    destination:
      table: payments
"#,
            csv_path.display()
        ),
    )
    .unwrap();

    let store = InMemoryStore::new();
    let pipeline = pipeline(&store);
    let definition = PipelineDefinition::from_file(&definition_path).unwrap();
    assert_ok!(pipeline.apply_definition(definition).await);
    assert_err!(pipeline.etl().execute_job("missing").await);

    let result = pipeline.etl().execute_job("payments").await.unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.records_extracted, 3);
    assert_eq!(result.records_inserted, 1);
    assert_eq!(result.records_failed, 2);

    let loaded = store.rows("payments");
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0]["payment_id"], json!("1"));
    assert_eq!(loaded[0]["origin"], json!("csv"));
    assert_eq!(loaded[0]["amount"], json!(10.5));

    let quarantined = store.rows("payments_quarantine");
    assert_eq!(quarantined.len(), 2);
    assert!(quarantined
        .iter()
        .all(|row| row.contains_key("_errors") && row["_job_id"] == json!("payments")));

    let history = pipeline.etl().get_job_history("payments", None);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].execution_id, result.execution_id);
}

/// Relational source over the same store, re-run in upsert mode
#[tokio::test]
async fn test_relational_upsert_is_idempotent() {
    let store = InMemoryStore::new();
    store.seed(
        "orders",
        vec![
            record(json!({"id": 1, "total": 20})),
            record(json!({"id": 2, "total": 35})),
        ],
    );

    let pipeline = pipeline(&store);
    let mut events = pipeline.events().subscribe();
    pipeline
        .connector()
        .attach_relational_source(
            DataSourceConfig::new(
                "db",
                "Orders database",
                SourceKind::Relational(RelationalSource {
                    url: "postgres://localhost/orders".to_string(),
                    max_connections: None,
                }),
            ),
            Arc::new(store.clone()),
        )
        .await
        .unwrap();

    pipeline
        .etl()
        .register_job(EtlJobConfig {
            id: "orders-mirror".to_string(),
            name: "Mirror orders".to_string(),
            source: JobSource {
                source_id: "db".to_string(),
                query: "orders".to_string(),
                filter: Record::new(),
                batch_size: Some(1),
            },
            transformations: Vec::new(),
            destination: JobDestination {
                table: "orders_mirror".to_string(),
                mode: WriteMode::Upsert,
                key_columns: vec!["id".to_string()],
                quarantine_table: None,
                retry: None,
                circuit_breaker: None,
            },
            validation: None,
        })
        .unwrap();

    let first = pipeline.etl().execute_job("orders-mirror").await.unwrap();
    assert_eq!(first.records_extracted, 2);
    assert_eq!(first.records_inserted, 2);

    let second = pipeline.etl().execute_job("orders-mirror").await.unwrap();
    assert_eq!(second.records_inserted, 0);
    assert_eq!(second.records_updated, 2);
    assert_eq!(store.rows("orders_mirror").len(), 2);

    let names: Vec<&str> = drain(&mut events).iter().map(|e| e.name()).collect();
    assert_eq!(
        names.iter().filter(|n| **n == "job_completed").count(),
        2
    );
    assert!(pipeline
        .metrics()
        .export()
        .contains("etl_jobs_total"));
}

/// Processor bound to the pipeline's quality monitor and dead-letter topic
#[tokio::test]
async fn test_stream_processor_feeds_quality_report() {
    let store = InMemoryStore::new();
    let pipeline = pipeline(&store);
    let broker = InMemoryBroker::default();

    let mut config = StreamProcessorConfig::new("signups", "signups.raw", "signups-cg");
    config.output_topic = Some("signups.clean".to_string());
    config.dead_letter_topic = Some("signups.dlq".to_string());
    config.validation = Some(StreamValidation {
        rules: vec![ValidationRule::required("email")],
        on_failure: StreamFailurePolicy::DeadLetter,
    });

    let processor = pipeline
        .stream_processor(config, Arc::new(broker.clone()))
        .unwrap();
    assert_ok!(processor.start().await);

    let payloads = [
        json!({"email": "ana@example.com", "plan": "pro"}),
        json!({"plan": "free"}),
        json!({"email": "cy@example.com", "plan": "free"}),
    ];
    for (index, payload) in payloads.into_iter().enumerate() {
        broker
            .produce(
                "signups.raw",
                &StreamMessage::new(Some(format!("user-{}", index)), payload),
            )
            .await
            .unwrap();
    }
    assert_ok!(processor.stop().await);

    assert_eq!(broker.messages("signups.clean").len(), 2);
    let dead = broker.messages("signups.dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].key.as_deref(), Some("user-1"));

    let stats = processor.get_stats().await;
    assert_eq!(stats.messages_processed, 3);
    assert_eq!(stats.messages_failed, 1);
    assert_eq!(stats.messages_dead_lettered, 1);

    pipeline.quality().evaluate_now();
    let report = pipeline.quality().generate_report();
    assert_eq!(report.sample_size, 3);
    assert!(report.overall_score < 100.0);
}
