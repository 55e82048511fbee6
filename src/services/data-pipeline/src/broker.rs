//! Message broker transport for stream processors
//!
//! Processors only need four primitives: idempotent topic creation, a consumer
//! group subscription delivered over an mpsc channel, unsubscribe, and produce.
//! [`InMemoryBroker`] implements them in-process; `KafkaBroker` (feature
//! `kafka`) implements them on rdkafka.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    error::{PipelineError, Result},
    types::StreamMessage,
};

#[cfg(feature = "kafka")]
pub use self::kafka::KafkaBroker;

/// Pub/sub transport
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Create a topic; an existing topic is left untouched
    async fn create_topic(&self, name: &str, partitions: i32, replication: i32) -> Result<()>;

    /// Join `group_id` on `topic` and receive its messages
    async fn subscribe(&self, topic: &str, group_id: &str)
        -> Result<mpsc::Receiver<StreamMessage>>;

    /// Leave the group; the receiver drains and then closes
    async fn unsubscribe(&self, topic: &str, group_id: &str) -> Result<()>;

    /// Publish one message
    async fn produce(&self, topic: &str, message: &StreamMessage) -> Result<()>;
}

#[derive(Debug, Default)]
struct TopicState {
    partitions: i32,
    log: Vec<StreamMessage>,
    groups: HashMap<String, mpsc::Sender<StreamMessage>>,
}

/// In-process broker
///
/// Every produced message is appended to the topic log and delivered to each
/// subscribed group. Subscriptions only see messages produced after they join.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<HashMap<String, TopicState>>>,
    failing_topics: Arc<Mutex<HashSet<String>>>,
    channel_capacity: usize,
}

impl InMemoryBroker {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            failing_topics: Arc::new(Mutex::new(HashSet::new())),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Messages produced to a topic, in order
    pub fn messages(&self, topic: &str) -> Vec<StreamMessage> {
        self.topics
            .lock()
            .get(topic)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }

    /// Names of existing topics
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Partition count of a topic
    pub fn partitions(&self, topic: &str) -> Option<i32> {
        self.topics.lock().get(topic).map(|t| t.partitions)
    }

    /// Make produce calls to `topic` fail until cleared
    pub fn fail_produce_to(&self, topic: &str) {
        self.failing_topics.lock().insert(topic.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_topics.lock().clear();
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn create_topic(&self, name: &str, partitions: i32, _replication: i32) -> Result<()> {
        let mut topics = self.topics.lock();
        if topics.contains_key(name) {
            debug!(topic = name, "Topic already exists");
            return Ok(());
        }
        topics.insert(
            name.to_string(),
            TopicState {
                partitions: partitions.max(1),
                ..TopicState::default()
            },
        );
        info!(topic = name, partitions, "Topic created");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<mpsc::Receiver<StreamMessage>> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let mut topics = self.topics.lock();
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| PipelineError::broker(format!("Unknown topic: {}", topic)))?;
        state.groups.insert(group_id.to_string(), tx);
        info!(topic, group_id, "Subscribed");
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str, group_id: &str) -> Result<()> {
        if let Some(state) = self.topics.lock().get_mut(topic) {
            state.groups.remove(group_id);
        }
        info!(topic, group_id, "Unsubscribed");
        Ok(())
    }

    async fn produce(&self, topic: &str, message: &StreamMessage) -> Result<()> {
        if self.failing_topics.lock().contains(topic) {
            return Err(PipelineError::publish(topic, "broker unavailable"));
        }

        let (delivered, subscribers) = {
            let mut topics = self.topics.lock();
            let state = topics.entry(topic.to_string()).or_insert_with(|| TopicState {
                partitions: 1,
                ..TopicState::default()
            });

            let mut delivered = message.clone();
            delivered.partition = Some(partition_for(message.key.as_deref(), state.partitions));
            delivered.offset = Some(state.log.len() as i64);
            state.log.push(delivered.clone());

            let subscribers: Vec<mpsc::Sender<StreamMessage>> =
                state.groups.values().cloned().collect();
            (delivered, subscribers)
        };

        for subscriber in subscribers {
            if subscriber.send(delivered.clone()).await.is_err() {
                warn!(topic, "Subscriber dropped before delivery");
            }
        }
        Ok(())
    }
}

fn partition_for(key: Option<&str>, partitions: i32) -> i32 {
    use std::hash::{BuildHasher, Hash, Hasher};

    match key {
        Some(key) if partitions > 1 => {
            let mut hasher = ahash::RandomState::with_seeds(1, 2, 3, 4).build_hasher();
            key.hash(&mut hasher);
            (hasher.finish() % partitions as u64) as i32
        }
        _ => 0,
    }
}

#[cfg(feature = "kafka")]
mod kafka {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use rdkafka::{
        admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
        client::DefaultClientContext,
        config::{ClientConfig, RDKafkaLogLevel},
        consumer::{Consumer, StreamConsumer},
        message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders},
        producer::{FutureProducer, FutureRecord},
        types::RDKafkaErrorCode,
    };
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tracing::{debug, error, info, warn};

    use super::MessageBroker;
    use crate::{
        config::KafkaConfig,
        error::{PipelineError, Result},
        types::StreamMessage,
    };

    /// rdkafka-backed broker
    pub struct KafkaBroker {
        config: KafkaConfig,
        channel_capacity: usize,
        producer: FutureProducer,
        admin_client: AdminClient<DefaultClientContext>,
        consumers: Mutex<HashMap<(String, String), JoinHandle<()>>>,
    }

    impl KafkaBroker {
        pub fn new(config: &KafkaConfig, channel_capacity: usize) -> Result<Self> {
            info!(
                "Initializing Kafka broker with servers: {}",
                config.bootstrap_servers
            );

            let producer: FutureProducer = Self::client_config(config)
                .set("client.id", format!("{}-producer", config.client_id))
                .set("compression.type", &config.compression_type)
                .set("acks", "all")
                .set("enable.idempotence", "true")
                .set("message.timeout.ms", config.produce_timeout_ms.to_string())
                .create()
                .map_err(|e| {
                    PipelineError::broker(format!("Failed to create producer: {}", e))
                })?;

            let admin_client: AdminClient<DefaultClientContext> = Self::client_config(config)
                .set("client.id", format!("{}-admin", config.client_id))
                .create()
                .map_err(|e| {
                    PipelineError::broker(format!("Failed to create admin client: {}", e))
                })?;

            Ok(Self {
                config: config.clone(),
                channel_capacity: channel_capacity.max(1),
                producer,
                admin_client,
                consumers: Mutex::new(HashMap::new()),
            })
        }

        fn client_config(config: &KafkaConfig) -> ClientConfig {
            let mut client_config = ClientConfig::new();
            client_config.set("bootstrap.servers", &config.bootstrap_servers);

            if let Some(sasl) = &config.sasl {
                client_config
                    .set("security.protocol", "SASL_SSL")
                    .set("sasl.mechanism", &sasl.mechanism)
                    .set("sasl.username", &sasl.username)
                    .set("sasl.password", &sasl.password);
            }

            client_config.set_log_level(RDKafkaLogLevel::Info);
            client_config
        }

        fn convert(message: &BorrowedMessage<'_>) -> StreamMessage {
            let value = match message.payload() {
                Some(bytes) => serde_json::from_slice(bytes)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
                None => Value::Null,
            };

            let mut headers = HashMap::new();
            if let Some(borrowed) = message.headers() {
                for header in borrowed.iter() {
                    if let Some(value) = header.value {
                        headers.insert(
                            header.key.to_string(),
                            String::from_utf8_lossy(value).into_owned(),
                        );
                    }
                }
            }

            let timestamp = message
                .timestamp()
                .to_millis()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_else(Utc::now);

            StreamMessage {
                key: message
                    .key()
                    .map(|k| String::from_utf8_lossy(k).into_owned()),
                value,
                headers,
                timestamp,
                partition: Some(message.partition()),
                offset: Some(message.offset()),
            }
        }
    }

    #[async_trait]
    impl MessageBroker for KafkaBroker {
        async fn create_topic(&self, name: &str, partitions: i32, replication: i32) -> Result<()> {
            let topics = [NewTopic::new(
                name,
                partitions,
                TopicReplication::Fixed(replication),
            )];
            let options = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));

            let results = self
                .admin_client
                .create_topics(&topics, &options)
                .await
                .map_err(|e| PipelineError::broker(format!("Failed to create topic: {}", e)))?;

            for result in results {
                match result {
                    Ok(topic) => info!("Topic created: {}", topic),
                    Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        debug!("Topic {} already exists", topic)
                    }
                    Err((topic, code)) => {
                        error!("Failed to create topic {}: {}", topic, code);
                        return Err(PipelineError::broker(format!(
                            "Failed to create topic {}: {}",
                            topic, code
                        )));
                    }
                }
            }
            Ok(())
        }

        async fn subscribe(
            &self,
            topic: &str,
            group_id: &str,
        ) -> Result<mpsc::Receiver<StreamMessage>> {
            let consumer: StreamConsumer = Self::client_config(&self.config)
                .set("group.id", group_id)
                .set("client.id", format!("{}-{}", self.config.client_id, group_id))
                .set("auto.offset.reset", &self.config.auto_offset_reset)
                .set("enable.auto.commit", self.config.enable_auto_commit.to_string())
                .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| {
                    PipelineError::broker(format!("Failed to create consumer: {}", e))
                })?;

            consumer
                .subscribe(&[topic])
                .map_err(|e| PipelineError::broker(format!("Failed to subscribe: {}", e)))?;

            info!(topic, group_id, "Subscribed to Kafka topic");

            let (tx, rx) = mpsc::channel(self.channel_capacity);
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        received = consumer.recv() => match received {
                            Ok(message) => {
                                let converted = Self::convert(&message);
                                if tx.send(converted).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Error receiving message: {}", e);
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
                debug!("Kafka consumer loop finished");
            });

            if let Some(previous) = self
                .consumers
                .lock()
                .insert((topic.to_string(), group_id.to_string()), handle)
            {
                previous.abort();
            }
            Ok(rx)
        }

        async fn unsubscribe(&self, topic: &str, group_id: &str) -> Result<()> {
            if let Some(handle) = self
                .consumers
                .lock()
                .remove(&(topic.to_string(), group_id.to_string()))
            {
                handle.abort();
            }
            info!(topic, group_id, "Unsubscribed from Kafka topic");
            Ok(())
        }

        async fn produce(&self, topic: &str, message: &StreamMessage) -> Result<()> {
            let payload = serde_json::to_vec(&message.value)?;

            let mut headers = OwnedHeaders::new();
            for (key, value) in &message.headers {
                headers = headers.insert(Header {
                    key,
                    value: Some(value),
                });
            }

            let mut record = FutureRecord::to(topic)
                .payload(&payload)
                .headers(headers)
                .timestamp(message.timestamp.timestamp_millis());
            if let Some(key) = &message.key {
                record = record.key(key);
            }

            self.producer
                .send(
                    record,
                    Duration::from_millis(self.config.produce_timeout_ms),
                )
                .await
                .map_err(|(e, _)| PipelineError::publish(topic, e.to_string()))?;
            Ok(())
        }
    }
}
