use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::metadata::MetadataTopic;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use rdkafka::Message;

use lens_api::{
    ClusterError, CursorEnd, Delivery, LogCluster, LogRecord, PartitionCursor, PartitionLayout, TopicLayout,
};

// ═══════════════════════════════════════════════════════════════
//  KafkaConfig
// ═══════════════════════════════════════════════════════════════

fn default_client_id() -> String {
    "topic-lens".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

/// librdkafka client settings (`[kafka]` section of the server config).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Timeout of metadata and watermark requests.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How long a publish may wait in the producer queue.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Extra librdkafka properties, passed through as-is.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            request_timeout_ms: default_request_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            properties: BTreeMap::new(),
        }
    }
}

impl KafkaConfig {
    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn client_config(&self, brokers: &str) -> ClientConfig {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", brokers)
            .set("client.id", &self.client_id)
            .set("socket.timeout.ms", self.request_timeout_ms.to_string());
        for (key, value) in &self.properties {
            cfg.set(key, value);
        }
        cfg
    }

    /// Cursor consumers never commit. Offsets outside the retained range
    /// reset to the oldest record, and `Stop` cursors get an EOF event
    /// at the end of the partition.
    fn reader_config(&self, brokers: &str, end: CursorEnd) -> ClientConfig {
        let mut cfg = self.client_config(brokers);
        cfg.set("group.id", format!("{}-reader", self.client_id))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", (end == CursorEnd::Stop).to_string());
        cfg
    }
}

// ═══════════════════════════════════════════════════════════════
//  KafkaCluster
// ═══════════════════════════════════════════════════════════════

struct Inner {
    brokers: String,
    config: KafkaConfig,
    /// Metadata and watermark queries only; never assigned.
    metadata: BaseConsumer,
    producer: FutureProducer,
}

/// `LogCluster` backed by librdkafka.
///
/// Metadata and watermark calls are blocking in librdkafka and run on
/// the blocking pool. Each cursor owns a dedicated `StreamConsumer`
/// with a manual partition assignment and no offset commits.
#[derive(Clone)]
pub struct KafkaCluster {
    inner: Arc<Inner>,
}

impl KafkaCluster {
    /// Create the clients and probe the brokers with a metadata request.
    pub async fn connect(brokers: &str, config: KafkaConfig) -> Result<Self, ClusterError> {
        let metadata: BaseConsumer = config
            .client_config(brokers)
            .set("group.id", format!("{}-metadata", config.client_id))
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| ClusterError::connection(format!("metadata client for {brokers}: {e}")))?;

        let producer: FutureProducer = config
            .client_config(brokers)
            .set("message.timeout.ms", config.publish_timeout_ms.to_string())
            .create()
            .map_err(|e| ClusterError::connection(format!("producer for {brokers}: {e}")))?;

        let inner = Arc::new(Inner {
            brokers: brokers.to_string(),
            config,
            metadata,
            producer,
        });

        let probe = inner.clone();
        let broker_count = tokio::task::spawn_blocking(move || {
            probe
                .metadata
                .fetch_metadata(None, probe.config.request_timeout())
                .map(|md| md.brokers().len())
        })
        .await
        .map_err(|e| ClusterError::connection(format!("metadata probe task: {e}")))?
        .map_err(|e| ClusterError::connection(format!("{brokers}: {e}")))?;

        tracing::info!(brokers = %brokers, broker_count, "connected to kafka");
        Ok(Self { inner })
    }

    /// `(low, high)` watermarks of one partition, on the blocking pool.
    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64), ClusterError> {
        let inner = self.inner.clone();
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || {
            inner
                .metadata
                .fetch_watermarks(&topic, partition, inner.config.request_timeout())
                .map_err(|e| ClusterError::connection(format!("watermarks {topic}/{partition}: {e}")))
        })
        .await
        .map_err(|e| ClusterError::connection(format!("watermark task: {e}")))?
    }
}

impl Inner {
    fn fetch_layouts(&self, names: &[String]) -> Result<Vec<TopicLayout>, ClusterError> {
        let timeout = self.config.request_timeout();
        if names.is_empty() {
            let md = self
                .metadata
                .fetch_metadata(None, timeout)
                .map_err(|e| ClusterError::connection(format!("metadata: {e}")))?;
            let mut layouts: Vec<TopicLayout> = md.topics().iter().map(layout_of).collect();
            layouts.sort_by(|a, b| a.name.cmp(&b.name));
            return Ok(layouts);
        }

        names
            .iter()
            .map(|name| {
                let md = self
                    .metadata
                    .fetch_metadata(Some(name.as_str()), timeout)
                    .map_err(|e| ClusterError::connection(format!("metadata '{name}': {e}")))?;
                Ok(md
                    .topics()
                    .iter()
                    .find(|t| t.name() == name)
                    .map(layout_of)
                    .unwrap_or_else(|| TopicLayout {
                        name: name.clone(),
                        partitions: Vec::new(),
                    }))
            })
            .collect()
    }

    fn reader(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        end: CursorEnd,
    ) -> Result<StreamConsumer, ClusterError> {
        let consumer: StreamConsumer = self
            .config
            .reader_config(&self.brokers, end)
            .create()
            .map_err(|e| ClusterError::connection(format!("reader client: {e}")))?;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset))
            .map_err(|e| ClusterError::lookup(format!("{topic}/{partition}: {e}")))?;
        consumer
            .assign(&tpl)
            .map_err(|e| ClusterError::lookup(format!("assign {topic}/{partition}: {e}")))?;
        Ok(consumer)
    }
}

/// Topics the broker reports with an error (unknown topic) get no partitions.
fn layout_of(topic: &MetadataTopic) -> TopicLayout {
    let partitions = if topic.error().is_some() {
        Vec::new()
    } else {
        topic
            .partitions()
            .iter()
            .map(|p| PartitionLayout {
                id: p.id(),
                replicas: p.replicas().len(),
            })
            .collect()
    };
    TopicLayout {
        name: topic.name().to_string(),
        partitions,
    }
}

impl LogCluster for KafkaCluster {
    fn topics(
        &self,
        topics: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<TopicLayout>, ClusterError>> + Send + '_>> {
        let inner = self.inner.clone();
        let names = topics.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || inner.fetch_layouts(&names))
                .await
                .map_err(|e| ClusterError::connection(format!("metadata task: {e}")))?
        })
    }

    fn high_water(
        &self,
        topic: &str,
        partition: i32,
    ) -> Pin<Box<dyn Future<Output = Result<i64, ClusterError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let (_low, high) = self.watermarks(&topic, partition).await?;
            Ok(high)
        })
    }

    fn low_water(
        &self,
        topic: &str,
        partition: i32,
    ) -> Pin<Box<dyn Future<Output = Result<i64, ClusterError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let (low, _high) = self.watermarks(&topic, partition).await?;
            Ok(low)
        })
    }

    fn open_cursor(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        end: CursorEnd,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn PartitionCursor>, ClusterError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let consumer = self.inner.reader(&topic, partition, offset, end)?;
            tracing::debug!(topic = %topic, partition, offset, ?end, "opened kafka cursor");
            Ok(Box::new(KafkaCursor {
                consumer,
                topic,
                partition,
                end,
            }) as Box<dyn PartitionCursor>)
        })
    }

    fn publish(
        &self,
        topic: &str,
        key: Option<Vec<u8>>,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, ClusterError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let record = FutureRecord::<Vec<u8>, Vec<u8>>::to(&topic).payload(&payload);
            let record = match key.as_ref() {
                Some(key) => record.key(key),
                None => record,
            };
            let queue_timeout = Timeout::After(Duration::from_millis(self.inner.config.publish_timeout_ms));
            match self.inner.producer.send(record, queue_timeout).await {
                Ok((partition, offset)) => Ok(Delivery { partition, offset }),
                Err((e, _message)) => Err(ClusterError::publish(format!("{topic}: {e}"))),
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), ClusterError>> + Send + '_>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || inner.producer.flush(inner.config.request_timeout()))
                .await
                .map_err(|e| ClusterError::connection(format!("flush task: {e}")))?
                .map_err(|e| ClusterError::publish(format!("flush: {e}")))?;
            tracing::info!("kafka producer flushed");
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  KafkaCursor
// ═══════════════════════════════════════════════════════════════

struct KafkaCursor {
    consumer: StreamConsumer,
    topic: String,
    partition: i32,
    end: CursorEnd,
}

impl PartitionCursor for KafkaCursor {
    fn next(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<LogRecord, ClusterError>>> + Send + '_>> {
        Box::pin(async move {
            match self.consumer.recv().await {
                Ok(msg) => Some(Ok(LogRecord::new(msg.offset(), msg.payload().unwrap_or_default()))),
                Err(KafkaError::PartitionEOF(_)) if self.end == CursorEnd::Stop => None,
                Err(e) => Some(Err(ClusterError::read(format!(
                    "{}/{}: {e}",
                    self.topic, self.partition
                )))),
            }
        })
    }
}
