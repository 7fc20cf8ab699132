use std::collections::BTreeMap;
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::watch;

use lens_api::{
    ClusterError, CursorEnd, Delivery, LogCluster, LogRecord, PartitionCursor, PartitionLayout, TopicLayout,
};

// ═══════════════════════════════════════════════════════════════
//  MemoryClusterConfig
// ═══════════════════════════════════════════════════════════════

fn default_auto_create() -> bool {
    true
}

fn default_partitions() -> usize {
    1
}

fn default_replication() -> usize {
    1
}

/// Behaviour of publishes to topics that do not exist yet.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MemoryClusterConfig {
    #[serde(default = "default_auto_create")]
    pub auto_create: bool,
    #[serde(default = "default_partitions")]
    pub default_partitions: usize,
    #[serde(default = "default_replication")]
    pub default_replication: usize,
}

impl Default for MemoryClusterConfig {
    fn default() -> Self {
        Self {
            auto_create: default_auto_create(),
            default_partitions: default_partitions(),
            default_replication: default_replication(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Partition log
// ═══════════════════════════════════════════════════════════════

const NO_FAULT: i64 = -1;

struct MemoryPartition {
    records: RwLock<Vec<Vec<u8>>>,
    /// Wakes tailing cursors on every append and on close.
    high_water: watch::Sender<i64>,
    /// Offset at which cursors start failing, `NO_FAULT` if none.
    fail_at: AtomicI64,
    /// Cursors never deliver anything while set.
    stalled: AtomicBool,
    /// Oldest retained offset. Records below it are gone.
    log_start: AtomicI64,
}

impl MemoryPartition {
    fn new() -> Self {
        let (high_water, _) = watch::channel(0);
        Self {
            records: RwLock::new(Vec::new()),
            high_water,
            fail_at: AtomicI64::new(NO_FAULT),
            stalled: AtomicBool::new(false),
            log_start: AtomicI64::new(0),
        }
    }

    fn len(&self) -> i64 {
        read_lock(&self.records).len() as i64
    }

    fn log_start(&self) -> i64 {
        self.log_start.load(Ordering::SeqCst)
    }

    fn get(&self, offset: i64) -> Option<Vec<u8>> {
        if offset < self.log_start() {
            return None;
        }
        let idx = usize::try_from(offset).ok()?;
        read_lock(&self.records).get(idx).cloned()
    }

    fn append(&self, payload: Vec<u8>) -> i64 {
        let offset = {
            let mut records = write_lock(&self.records);
            records.push(payload);
            records.len() as i64 - 1
        };
        self.high_water.send_replace(offset + 1);
        offset
    }
}

struct MemoryTopic {
    replication: usize,
    partitions: Vec<Arc<MemoryPartition>>,
    next_partition: AtomicUsize,
}

impl MemoryTopic {
    fn new(partitions: usize, replication: usize) -> Self {
        Self {
            replication,
            partitions: (0..partitions).map(|_| Arc::new(MemoryPartition::new())).collect(),
            next_partition: AtomicUsize::new(0),
        }
    }

    fn layout(&self, name: &str) -> TopicLayout {
        TopicLayout {
            name: name.to_string(),
            partitions: (0..self.partitions.len())
                .map(|id| PartitionLayout {
                    id: id as i32,
                    replicas: self.replication,
                })
                .collect(),
        }
    }

    /// Key hash for keyed messages, round-robin otherwise.
    fn pick_partition(&self, key: Option<&[u8]>) -> usize {
        let n = self.partitions.len().max(1);
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % n as u64) as usize
            }
            None => self.next_partition.fetch_add(1, Ordering::Relaxed) % n,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryCluster
// ═══════════════════════════════════════════════════════════════

/// In-process append-only log cluster.
///
/// Used by the test suites as the collaborator double and by the
/// server's `memory` backend for running without a broker.
pub struct MemoryCluster {
    topics: RwLock<BTreeMap<String, Arc<MemoryTopic>>>,
    config: MemoryClusterConfig,
    closed: Arc<AtomicBool>,
    unreachable: AtomicBool,
    cursors_opened: AtomicUsize,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new(MemoryClusterConfig::default())
    }
}

impl MemoryCluster {
    pub fn new(config: MemoryClusterConfig) -> Self {
        Self {
            topics: RwLock::new(BTreeMap::new()),
            config,
            closed: Arc::new(AtomicBool::new(false)),
            unreachable: AtomicBool::new(false),
            cursors_opened: AtomicUsize::new(0),
        }
    }

    /// Create (or replace) a topic with the given layout.
    pub fn create_topic(&self, name: &str, partitions: usize, replication: usize) {
        write_lock(&self.topics).insert(
            name.to_string(),
            Arc::new(MemoryTopic::new(partitions, replication)),
        );
        tracing::debug!(topic = %name, partitions, replication, "created memory topic");
    }

    /// Append directly to a partition, bypassing partition selection.
    pub fn append(
        &self,
        topic: &str,
        partition: i32,
        payload: impl Into<Vec<u8>>,
    ) -> Result<i64, ClusterError> {
        Ok(self.partition(topic, partition)?.append(payload.into()))
    }

    /// Cursors on this partition fail once they reach `offset`.
    pub fn inject_read_error(&self, topic: &str, partition: i32, offset: i64) -> Result<(), ClusterError> {
        self.partition(topic, partition)?.fail_at.store(offset, Ordering::SeqCst);
        Ok(())
    }

    /// Cursors on this partition block forever without delivering.
    pub fn stall_partition(&self, topic: &str, partition: i32) -> Result<(), ClusterError> {
        self.partition(topic, partition)?.stalled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Drop every record below `before`, as retention would.
    pub fn trim(&self, topic: &str, partition: i32, before: i64) -> Result<(), ClusterError> {
        let log = self.partition(topic, partition)?;
        let before = before.clamp(0, log.len());
        log.log_start.fetch_max(before, Ordering::SeqCst);
        tracing::debug!(topic = %topic, partition, log_start = before, "trimmed memory partition");
        Ok(())
    }

    /// Simulate losing the connection to the cluster.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of cursors opened since creation.
    pub fn cursors_opened(&self) -> usize {
        self.cursors_opened.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), ClusterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClusterError::connection("memory cluster closed"));
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ClusterError::connection("memory cluster unreachable"));
        }
        Ok(())
    }

    fn topic(&self, name: &str) -> Option<Arc<MemoryTopic>> {
        read_lock(&self.topics).get(name).cloned()
    }

    fn partition(&self, topic: &str, partition: i32) -> Result<Arc<MemoryPartition>, ClusterError> {
        let t = self
            .topic(topic)
            .ok_or_else(|| ClusterError::lookup(format!("topic '{topic}' not found")))?;
        usize::try_from(partition)
            .ok()
            .and_then(|idx| t.partitions.get(idx).cloned())
            .ok_or_else(|| {
                ClusterError::lookup(format!("partition {partition} of topic '{topic}' not found"))
            })
    }

    fn topic_for_publish(&self, name: &str) -> Result<Arc<MemoryTopic>, ClusterError> {
        if let Some(t) = self.topic(name) {
            return Ok(t);
        }
        if !self.config.auto_create {
            return Err(ClusterError::publish(format!("topic '{name}' not found")));
        }
        let mut topics = write_lock(&self.topics);
        let t = topics
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(topic = %name, "auto-creating memory topic");
                Arc::new(MemoryTopic::new(
                    self.config.default_partitions.max(1),
                    self.config.default_replication,
                ))
            })
            .clone();
        Ok(t)
    }
}

impl LogCluster for MemoryCluster {
    fn topics(
        &self,
        topics: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<TopicLayout>, ClusterError>> + Send + '_>> {
        let names = topics.to_vec();
        Box::pin(async move {
            self.check_available()?;
            if names.is_empty() {
                let all = read_lock(&self.topics);
                return Ok(all.iter().map(|(name, t)| t.layout(name)).collect());
            }
            Ok(names
                .iter()
                .map(|name| match self.topic(name) {
                    Some(t) => t.layout(name),
                    None => TopicLayout {
                        name: name.clone(),
                        partitions: Vec::new(),
                    },
                })
                .collect())
        })
    }

    fn high_water(
        &self,
        topic: &str,
        partition: i32,
    ) -> Pin<Box<dyn Future<Output = Result<i64, ClusterError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.check_available()?;
            Ok(self.partition(&topic, partition)?.len())
        })
    }

    fn low_water(
        &self,
        topic: &str,
        partition: i32,
    ) -> Pin<Box<dyn Future<Output = Result<i64, ClusterError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            self.check_available()?;
            Ok(self.partition(&topic, partition)?.log_start())
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
            self.check_available()?;
            let log = self.partition(&topic, partition)?;
            let wakeups = log.high_water.subscribe();
            self.cursors_opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MemoryCursor {
                log,
                offset,
                end,
                wakeups,
                closed: self.closed.clone(),
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
            self.check_available()?;
            let t = self.topic_for_publish(&topic)?;
            let idx = t.pick_partition(key.as_deref());
            let log = t
                .partitions
                .get(idx)
                .ok_or_else(|| ClusterError::publish(format!("topic '{topic}' has no partitions")))?;
            let offset = log.append(payload);
            Ok(Delivery {
                partition: idx as i32,
                offset,
            })
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), ClusterError>> + Send + '_>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            // Wake tailing cursors so they observe the close.
            for t in read_lock(&self.topics).values() {
                for p in &t.partitions {
                    p.high_water.send_modify(|_| {});
                }
            }
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryCursor
// ═══════════════════════════════════════════════════════════════

struct MemoryCursor {
    log: Arc<MemoryPartition>,
    offset: i64,
    end: CursorEnd,
    wakeups: watch::Receiver<i64>,
    closed: Arc<AtomicBool>,
}

impl PartitionCursor for MemoryCursor {
    fn next(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<LogRecord, ClusterError>>> + Send + '_>> {
        Box::pin(async move {
            loop {
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
                if self.log.stalled.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
                // Trimmed offsets resume at the oldest retained record.
                self.offset = self.offset.max(self.log.log_start());
                let fail_at = self.log.fail_at.load(Ordering::SeqCst);
                if fail_at != NO_FAULT && self.offset >= fail_at {
                    return Some(Err(ClusterError::read(format!(
                        "injected read failure at offset {}",
                        self.offset
                    ))));
                }
                if let Some(payload) = self.log.get(self.offset) {
                    let record = LogRecord::new(self.offset, payload);
                    self.offset += 1;
                    return Some(Ok(record));
                }
                if self.end == CursorEnd::Stop {
                    return None;
                }
                self.wakeups.borrow_and_update();
                // Re-check after marking the value seen: an append may have
                // landed between `get` and `borrow_and_update`.
                if self.offset < self.log.len() {
                    continue;
                }
                if self.wakeups.changed().await.is_err() {
                    return None;
                }
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  Lock helpers
// ═══════════════════════════════════════════════════════════════

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("memory cluster read lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("memory cluster write lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lens_api::ErrorKind;

    use super::*;

    fn cluster_with(topic: &str, partitions: usize) -> MemoryCluster {
        let cluster = MemoryCluster::default();
        cluster.create_topic(topic, partitions, 3);
        cluster
    }

    #[tokio::test]
    async fn all_topics_sorted_by_name() {
        let cluster = MemoryCluster::default();
        cluster.create_topic("payments", 1, 1);
        cluster.create_topic("audit", 2, 2);

        let layouts = cluster.topics(&[]).await.unwrap();
        let names: Vec<_> = layouts.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["audit", "payments"]);
        assert_eq!(layouts[0].partitions.len(), 2);
        assert_eq!(layouts[0].partitions[1].replicas, 2);
    }

    #[tokio::test]
    async fn unknown_topic_has_no_partitions() {
        let cluster = cluster_with("orders", 2);
        let layouts = cluster
            .topics(&["missing".to_string(), "orders".to_string()])
            .await
            .unwrap();
        assert_eq!(layouts[0].name, "missing");
        assert!(layouts[0].partitions.is_empty());
        assert_eq!(layouts[1].partitions.len(), 2);
    }

    #[tokio::test]
    async fn cursor_reads_from_offset_and_tails() {
        let cluster = Arc::new(cluster_with("orders", 1));
        for i in 0..3 {
            cluster.append("orders", 0, format!("m{i}")).unwrap();
        }

        let mut cursor = cluster.open_cursor("orders", 0, 1, CursorEnd::Follow).await.unwrap();
        assert_eq!(cursor.next().await.unwrap().unwrap(), LogRecord::new(1, "m1"));
        assert_eq!(cursor.next().await.unwrap().unwrap(), LogRecord::new(2, "m2"));

        let writer = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("orders", 0, "late").unwrap();
        });
        let record = tokio::time::timeout(Duration::from_secs(2), cursor.next())
            .await
            .expect("cursor should wake on append")
            .unwrap()
            .unwrap();
        assert_eq!(record, LogRecord::new(3, "late"));
    }

    #[tokio::test]
    async fn injected_fault_surfaces_as_read_error() {
        let cluster = cluster_with("orders", 1);
        cluster.append("orders", 0, "a").unwrap();
        cluster.append("orders", 0, "b").unwrap();
        cluster.inject_read_error("orders", 0, 1).unwrap();

        let mut cursor = cluster.open_cursor("orders", 0, 0, CursorEnd::Follow).await.unwrap();
        assert!(cursor.next().await.unwrap().is_ok());
        let err = cursor.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Read);
    }

    #[tokio::test]
    async fn trimmed_offsets_resume_at_log_start() {
        let cluster = cluster_with("orders", 1);
        for i in 0..5 {
            cluster.append("orders", 0, format!("m{i}")).unwrap();
        }
        cluster.trim("orders", 0, 3).unwrap();
        assert_eq!(cluster.low_water("orders", 0).await.unwrap(), 3);
        assert_eq!(cluster.high_water("orders", 0).await.unwrap(), 5);

        let mut cursor = cluster.open_cursor("orders", 0, 0, CursorEnd::Stop).await.unwrap();
        assert_eq!(cursor.next().await.unwrap().unwrap(), LogRecord::new(3, "m3"));
        assert_eq!(cursor.next().await.unwrap().unwrap(), LogRecord::new(4, "m4"));
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test]
    async fn stop_cursor_ends_at_partition_end() {
        let cluster = cluster_with("orders", 1);
        let mut cursor = cluster.open_cursor("orders", 0, 0, CursorEnd::Stop).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), cursor.next())
            .await
            .expect("stop cursor must not wait for writes");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn publish_round_robins_without_key() {
        let cluster = cluster_with("orders", 2);
        let first = cluster.publish("orders", None, b"x".to_vec()).await.unwrap();
        let second = cluster.publish("orders", None, b"y".to_vec()).await.unwrap();
        assert_ne!(first.partition, second.partition);
        assert_eq!(cluster.high_water("orders", 0).await.unwrap(), 1);
        assert_eq!(cluster.high_water("orders", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn publish_same_key_same_partition() {
        let cluster = cluster_with("orders", 4);
        let a = cluster.publish("orders", Some(b"k".to_vec()), b"1".to_vec()).await.unwrap();
        let b = cluster.publish("orders", Some(b"k".to_vec()), b"2".to_vec()).await.unwrap();
        assert_eq!(a.partition, b.partition);
        assert_eq!(b.offset, a.offset + 1);
    }

    #[tokio::test]
    async fn publish_auto_creates_when_enabled() {
        let cluster = MemoryCluster::default();
        let delivery = cluster.publish("fresh", None, b"hi".to_vec()).await.unwrap();
        assert_eq!(delivery, Delivery { partition: 0, offset: 0 });

        let strict = MemoryCluster::new(MemoryClusterConfig {
            auto_create: false,
            ..Default::default()
        });
        let err = strict.publish("fresh", None, b"hi".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Publish);
    }

    #[tokio::test]
    async fn unreachable_cluster_is_connection_error() {
        let cluster = cluster_with("orders", 1);
        cluster.set_unreachable(true);
        let err = cluster.topics(&[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn close_ends_tailing_cursors() {
        let cluster = Arc::new(cluster_with("orders", 1));
        let mut cursor = cluster.open_cursor("orders", 0, 0, CursorEnd::Follow).await.unwrap();

        let closer = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close().await.unwrap();
        });
        let next = tokio::time::timeout(Duration::from_secs(2), cursor.next())
            .await
            .expect("close should wake the cursor");
        assert!(next.is_none());
    }
}
