use std::sync::Arc;

use regex::bytes::Regex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::{CancellationToken, DropGuard};

use lens_api::{ClusterError, LogCluster, MessageMatch};

use crate::config::{FailurePolicy, SearchConfig};
use crate::metadata::MetadataAccessor;
use crate::reader::{PartitionReader, ReadBound};
use crate::EngineError;

// ═══════════════════════════════════════════════════════════════
//  Keyword matching
// ═══════════════════════════════════════════════════════════════

/// Compiled search keyword.
///
/// The keyword is tried as a regular expression first. Anything that
/// does not compile is matched as a literal substring.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    keyword: String,
    pattern: Regex,
}

impl KeywordMatcher {
    pub fn new(keyword: &str) -> Result<Self, EngineError> {
        let pattern = match Regex::new(keyword) {
            Ok(re) => re,
            Err(e) => {
                tracing::debug!(keyword, error = %e, "keyword is not a valid pattern, matching literally");
                Regex::new(&regex::escape(keyword))?
            }
        };
        Ok(Self {
            keyword: keyword.to_string(),
            pattern,
        })
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn is_match(&self, payload: &[u8]) -> bool {
        self.pattern.is_match(payload)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Reports
// ═══════════════════════════════════════════════════════════════

/// High-water offset of one partition, captured when the search began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionBound {
    pub partition: i32,
    pub high_water: i64,
}

/// How one partition task ended. `matched` counts the matches the task
/// handed to the session before it ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionOutcome {
    /// Every retained record below the bound was examined.
    Completed { partition: i32, scanned: u64, matched: u64 },
    Failed { partition: i32, error: String, matched: u64 },
    /// Stopped by cancellation or because the consumer went away.
    Cancelled { partition: i32, matched: u64 },
}

impl PartitionOutcome {
    pub fn partition(&self) -> i32 {
        match self {
            PartitionOutcome::Completed { partition, .. }
            | PartitionOutcome::Failed { partition, .. }
            | PartitionOutcome::Cancelled { partition, .. } => *partition,
        }
    }

    pub fn matched(&self) -> u64 {
        match self {
            PartitionOutcome::Completed { matched, .. }
            | PartitionOutcome::Failed { matched, .. }
            | PartitionOutcome::Cancelled { matched, .. } => *matched,
        }
    }
}

/// Summary of a finished search session.
#[derive(Debug, Clone, Default)]
pub struct SearchReport {
    pub topic: String,
    pub keyword: String,
    /// Partition tasks spawned, one per partition.
    pub started: usize,
    /// Terminal outcome of each task, in completion order.
    pub outcomes: Vec<PartitionOutcome>,
    /// Tasks that panicked or were aborted before reporting.
    pub lost: usize,
    /// The session token was cancelled before every task ended.
    pub cancelled: bool,
    pub matches: u64,
}

impl SearchReport {
    pub fn finished(&self) -> usize {
        self.outcomes.len() + self.lost
    }

    pub fn failures(&self) -> impl Iterator<Item = (i32, &str)> {
        self.outcomes.iter().filter_map(|o| match o {
            PartitionOutcome::Failed { partition, error, .. } => Some((*partition, error.as_str())),
            _ => None,
        })
    }

    /// Every partition was scanned up to its bound.
    pub fn is_complete(&self) -> bool {
        self.lost == 0
            && self
                .outcomes
                .iter()
                .all(|o| matches!(o, PartitionOutcome::Completed { .. }))
    }

    fn record(&mut self, outcome: PartitionOutcome) {
        self.matches += outcome.matched();
        self.outcomes.push(outcome);
    }
}

// ═══════════════════════════════════════════════════════════════
//  SearchSession
// ═══════════════════════════════════════════════════════════════

/// A running search.
///
/// Matches arrive on `next_match` in per-partition offset order as they
/// are found. Dropping the session cancels every partition task.
pub struct SearchSession {
    topic: String,
    bounds: Vec<PartitionBound>,
    matches: mpsc::Receiver<MessageMatch>,
    completion: JoinHandle<SearchReport>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl SearchSession {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Per-partition bounds fixed at session start.
    pub fn bounds(&self) -> &[PartitionBound] {
        &self.bounds
    }

    /// Next match, `None` once every partition task has ended.
    pub async fn next_match(&mut self) -> Option<MessageMatch> {
        self.matches.recv().await
    }

    /// Stop all partition tasks. Matches already buffered stay readable.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether every partition task has ended and the report is ready.
    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    /// Wait for every partition task to end, discarding unread matches.
    pub async fn finish(mut self) -> SearchReport {
        while self.matches.recv().await.is_some() {}
        self.report().await
    }

    /// Drain all matches, then wait for the report.
    pub async fn collect(mut self) -> (Vec<MessageMatch>, SearchReport) {
        let mut found = Vec::new();
        while let Some(hit) = self.matches.recv().await {
            found.push(hit);
        }
        let report = self.report().await;
        (found, report)
    }

    async fn report(&mut self) -> SearchReport {
        match (&mut self.completion).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(topic = %self.topic, error = %e, "search completion task failed");
                SearchReport {
                    topic: self.topic.clone(),
                    started: self.bounds.len(),
                    lost: self.bounds.len(),
                    ..SearchReport::default()
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  SearchCoordinator
// ═══════════════════════════════════════════════════════════════

/// Runs keyword searches across every partition of a topic.
///
/// Each search spawns one task per partition. A task reads its partition
/// from the oldest retained offset up to the high-water offset captured
/// at session start, so records written while the search runs are never
/// reported. The
/// number of partitions read at once is capped by a semaphore.
pub struct SearchCoordinator {
    cluster: Arc<dyn LogCluster>,
    metadata: MetadataAccessor,
    config: SearchConfig,
}

impl SearchCoordinator {
    pub fn new(cluster: Arc<dyn LogCluster>, config: SearchConfig) -> Self {
        Self {
            metadata: MetadataAccessor::new(cluster.clone()),
            cluster,
            config,
        }
    }

    /// Start a search. Cancelling `cancel` stops the whole session.
    ///
    /// Fails only when the keyword or the topic metadata cannot be
    /// obtained. Unknown topics give a session that ends immediately.
    pub async fn search(
        &self,
        topic: &str,
        keyword: &str,
        cancel: CancellationToken,
    ) -> Result<SearchSession, EngineError> {
        let matcher = Arc::new(KeywordMatcher::new(keyword)?);
        let snapshot = self.metadata.fetch_topic(topic).await?;
        let bounds: Vec<PartitionBound> = snapshot
            .partition_info
            .iter()
            .map(|p| PartitionBound {
                partition: p.id,
                high_water: p.length,
            })
            .collect();

        let session_cancel = cancel.child_token();
        let (sink, matches) = mpsc::channel(self.config.match_buffer.max(1));
        let permits = Arc::new(Semaphore::new(
            self.config.max_concurrent_partitions.clamp(1, bounds.len().max(1)),
        ));
        let topic_name: Arc<str> = Arc::from(topic);

        let mut tasks = JoinSet::new();
        for bound in &bounds {
            tasks.spawn(search_partition(PartitionTask {
                cluster: self.cluster.clone(),
                topic: topic_name.clone(),
                matcher: matcher.clone(),
                bound: *bound,
                sink: sink.clone(),
                cancel: session_cancel.clone(),
                permits: permits.clone(),
                policy: self.config.failure_policy,
            }));
        }
        drop(sink);

        tracing::info!(
            topic = %topic,
            keyword = %keyword,
            partitions = bounds.len(),
            policy = ?self.config.failure_policy,
            "search started"
        );

        let report = SearchReport {
            topic: topic.to_string(),
            keyword: keyword.to_string(),
            started: tasks.len(),
            ..SearchReport::default()
        };
        let completion = tokio::spawn(join_partitions(tasks, report, session_cancel.clone()));

        Ok(SearchSession {
            topic: topic.to_string(),
            bounds,
            matches,
            completion,
            cancel: session_cancel.clone(),
            _guard: session_cancel.drop_guard(),
        })
    }
}

async fn join_partitions(
    mut tasks: JoinSet<PartitionOutcome>,
    mut report: SearchReport,
    cancel: CancellationToken,
) -> SearchReport {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => report.record(outcome),
            Err(e) => {
                tracing::error!(topic = %report.topic, error = %e, "partition task lost");
                report.lost += 1;
            }
        }
    }
    report.cancelled = cancel.is_cancelled();
    tracing::info!(
        topic = %report.topic,
        started = report.started,
        finished = report.finished(),
        matches = report.matches,
        failed = report.failures().count(),
        cancelled = report.cancelled,
        "search finished"
    );
    report
}

// ═══════════════════════════════════════════════════════════════
//  Partition task
// ═══════════════════════════════════════════════════════════════

struct PartitionTask {
    cluster: Arc<dyn LogCluster>,
    topic: Arc<str>,
    matcher: Arc<KeywordMatcher>,
    bound: PartitionBound,
    sink: mpsc::Sender<MessageMatch>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
    policy: FailurePolicy,
}

impl PartitionTask {
    fn fail(&self, error: ClusterError, matched: u64) -> PartitionOutcome {
        tracing::warn!(
            topic = %self.topic,
            partition = self.bound.partition,
            error = %error,
            matched,
            policy = ?self.policy,
            "partition search failed"
        );
        if self.policy == FailurePolicy::Abort {
            self.cancel.cancel();
        }
        PartitionOutcome::Failed {
            partition: self.bound.partition,
            error: error.to_string(),
            matched,
        }
    }
}

async fn search_partition(task: PartitionTask) -> PartitionOutcome {
    let partition = task.bound.partition;
    let cancelled = |matched| PartitionOutcome::Cancelled { partition, matched };

    let _permit = tokio::select! {
        biased;
        _ = task.cancel.cancelled() => return cancelled(0),
        permit = task.permits.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return cancelled(0),
        },
    };

    // Retention may have removed the head of the log.
    let start = match task.cluster.low_water(&task.topic, partition).await {
        Ok(low) => low.max(0),
        Err(e) => return task.fail(e.with_context(format!("{}/{partition}", task.topic)), 0),
    };

    let mut reader = match PartitionReader::open(
        &*task.cluster,
        &task.topic,
        partition,
        start,
        ReadBound::Until(task.bound.high_water),
    )
    .await
    {
        Ok(reader) => reader,
        Err(e) => return task.fail(e, 0),
    };

    let mut scanned = 0u64;
    let mut matched = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = task.cancel.cancelled() => return cancelled(matched),
            next = reader.next() => next,
        };
        let record = match next {
            None => break,
            Some(Ok(record)) => record,
            Some(Err(e)) => return task.fail(e, matched),
        };

        scanned += 1;
        if !task.matcher.is_match(&record.payload) {
            continue;
        }

        let hit = MessageMatch {
            topic: task.topic.to_string(),
            partition,
            offset: record.offset,
            message: record.text().into_owned(),
            keyword: task.matcher.keyword().to_string(),
        };
        tokio::select! {
            biased;
            _ = task.cancel.cancelled() => return cancelled(matched),
            sent = task.sink.send(hit) => {
                if sent.is_err() {
                    tracing::debug!(topic = %task.topic, partition, "match consumer gone");
                    return cancelled(matched);
                }
            }
        }
        matched += 1;
    }

    tracing::debug!(topic = %task.topic, partition, start, scanned, matched, "partition scanned");
    PartitionOutcome::Completed {
        partition,
        scanned,
        matched,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cluster_memory::MemoryCluster;

    use super::*;

    fn coordinator(cluster: &Arc<MemoryCluster>, config: SearchConfig) -> SearchCoordinator {
        SearchCoordinator::new(cluster.clone(), config)
    }

    fn orders() -> Arc<MemoryCluster> {
        let cluster = Arc::new(MemoryCluster::default());
        cluster.create_topic("orders", 2, 1);
        for i in 0..3 {
            cluster.append("orders", 0, format!("INFO: order {i} placed")).unwrap();
        }
        for i in 0..4 {
            cluster.append("orders", 1, format!("INFO: order {i} shipped")).unwrap();
        }
        cluster.append("orders", 1, "ERROR: timeout").unwrap();
        cluster
    }

    #[test]
    fn invalid_pattern_matches_literally() {
        let matcher = KeywordMatcher::new("total(").unwrap();
        assert!(matcher.is_match(b"grand total(3)"));
        assert!(!matcher.is_match(b"total 3"));
    }

    #[test]
    fn valid_pattern_is_a_regex() {
        let matcher = KeywordMatcher::new("ERR(OR)?:").unwrap();
        assert!(matcher.is_match(b"ERROR: disk"));
        assert!(matcher.is_match(b"ERR: disk"));
        assert!(!matcher.is_match(b"error: disk"));
    }

    #[tokio::test]
    async fn finds_single_match_across_partitions() {
        let cluster = orders();
        let session = coordinator(&cluster, SearchConfig::default())
            .search("orders", "ERROR", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            session.bounds(),
            [
                PartitionBound { partition: 0, high_water: 3 },
                PartitionBound { partition: 1, high_water: 5 },
            ]
        );

        let (found, report) = session.collect().await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].partition, 1);
        assert_eq!(found[0].offset, 4);
        assert_eq!(found[0].message, "ERROR: timeout");
        assert_eq!(found[0].keyword, "ERROR");

        assert_eq!(report.started, 2);
        assert_eq!(report.finished(), 2);
        assert_eq!(report.matches, 1);
        assert!(!report.cancelled);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn matches_keep_offset_order_within_partition() {
        let cluster = orders();
        let (found, _) = coordinator(&cluster, SearchConfig::default())
            .search("orders", "order", CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        for p in [0, 1] {
            let offsets: Vec<_> = found.iter().filter(|m| m.partition == p).map(|m| m.offset).collect();
            let mut sorted = offsets.clone();
            sorted.sort();
            assert_eq!(offsets, sorted);
        }
        assert_eq!(found.len(), 7);
    }

    #[tokio::test]
    async fn writes_after_start_are_not_reported() {
        let cluster = orders();
        let config = SearchConfig {
            match_buffer: 1,
            ..SearchConfig::default()
        };
        let mut session = coordinator(&cluster, config)
            .search("orders", "ERROR", CancellationToken::new())
            .await
            .unwrap();
        cluster.append("orders", 0, "ERROR: late").unwrap();
        cluster.append("orders", 1, "ERROR: later").unwrap();

        let mut found = Vec::new();
        while let Some(hit) = session.next_match().await {
            found.push(hit);
        }
        assert_eq!(found.len(), 1);
        for hit in &found {
            let bound = session.bounds().iter().find(|b| b.partition == hit.partition).unwrap();
            assert!(hit.offset < bound.high_water);
        }
        assert!(session.finish().await.is_complete());
    }

    #[tokio::test]
    async fn unknown_topic_ends_immediately() {
        let cluster = orders();
        let (found, report) = coordinator(&cluster, SearchConfig::default())
            .search("ghost", "x", CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert!(found.is_empty());
        assert_eq!(report.started, 0);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn empty_partition_completes_without_cursor() {
        let cluster = Arc::new(MemoryCluster::default());
        cluster.create_topic("quiet", 3, 1);
        let report = coordinator(&cluster, SearchConfig::default())
            .search("quiet", "x", CancellationToken::new())
            .await
            .unwrap()
            .finish()
            .await;
        assert_eq!(report.started, 3);
        assert!(report.is_complete());
        assert_eq!(cluster.cursors_opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_partition_holds_completion_until_cancel() {
        let cluster = orders();
        cluster.stall_partition("orders", 0).unwrap();
        let mut session = coordinator(&cluster, SearchConfig::default())
            .search("orders", "ERROR", CancellationToken::new())
            .await
            .unwrap();

        let hit = session.next_match().await.unwrap();
        assert_eq!((hit.partition, hit.offset), (1, 4));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!session.is_finished());

        session.cancel();
        let report = session.finish().await;
        assert_eq!(report.finished(), 2);
        assert!(report.outcomes.contains(&PartitionOutcome::Cancelled { partition: 0, matched: 0 }));
        assert!(report.outcomes.iter().any(|o| matches!(
            o,
            PartitionOutcome::Completed { partition: 1, matched: 1, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_token_cancels_session() {
        let cluster = orders();
        cluster.stall_partition("orders", 0).unwrap();
        cluster.stall_partition("orders", 1).unwrap();
        let cancel = CancellationToken::new();
        let session = coordinator(&cluster, SearchConfig::default())
            .search("orders", "ERROR", cancel.clone())
            .await
            .unwrap();
        cancel.cancel();
        let report = session.finish().await;
        assert_eq!(report.finished(), 2);
        assert!(report.cancelled);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn isolated_failure_leaves_siblings_running() {
        let cluster = orders();
        cluster.append("orders", 0, "ERROR: disk").unwrap();
        cluster.inject_read_error("orders", 0, 1).unwrap();
        let (found, report) = coordinator(&cluster, SearchConfig::default())
            .search("orders", "ERROR", CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].partition, 1);
        let failures: Vec<_> = report.failures().map(|(p, _)| p).collect();
        assert_eq!(failures, [0]);
        assert_eq!(report.finished(), 2);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn matches_before_a_failure_are_counted() {
        let cluster = orders();
        cluster.append("orders", 0, "ERROR: disk").unwrap();
        cluster.append("orders", 0, "INFO: retry").unwrap();
        cluster.inject_read_error("orders", 0, 4).unwrap();
        let (found, report) = coordinator(&cluster, SearchConfig::default())
            .search("orders", "ERROR", CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(found.len(), 2);
        assert_eq!(report.matches, 2);
        assert!(report.outcomes.iter().any(|o| matches!(
            o,
            PartitionOutcome::Failed { partition: 0, matched: 1, .. }
        )));
    }

    #[tokio::test]
    async fn trimmed_partition_searches_retained_records_only() {
        let cluster = orders();
        cluster.trim("orders", 1, 2).unwrap();
        let (found, report) = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator(&cluster, SearchConfig::default())
                .search("orders", "order", CancellationToken::new())
                .await
                .unwrap()
                .collect(),
        )
        .await
        .expect("search over a trimmed partition must finish");

        let offsets: Vec<_> = found.iter().filter(|m| m.partition == 1).map(|m| m.offset).collect();
        assert_eq!(offsets, [2, 3]);
        assert!(report.is_complete());
        assert!(report.outcomes.iter().any(|o| matches!(
            o,
            PartitionOutcome::Completed { partition: 1, scanned: 3, matched: 2 }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_policy_cancels_siblings() {
        let cluster = orders();
        cluster.inject_read_error("orders", 0, 0).unwrap();
        cluster.stall_partition("orders", 1).unwrap();
        let config = SearchConfig {
            failure_policy: FailurePolicy::Abort,
            ..SearchConfig::default()
        };
        let report = coordinator(&cluster, config)
            .search("orders", "ERROR", CancellationToken::new())
            .await
            .unwrap()
            .finish()
            .await;

        assert_eq!(report.failures().count(), 1);
        assert!(report.outcomes.contains(&PartitionOutcome::Cancelled { partition: 1, matched: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_capped() {
        let cluster = Arc::new(MemoryCluster::default());
        cluster.create_topic("wide", 4, 1);
        for p in 0..4 {
            cluster.append("wide", p, "payload").unwrap();
            cluster.stall_partition("wide", p).unwrap();
        }
        let config = SearchConfig {
            max_concurrent_partitions: 2,
            ..SearchConfig::default()
        };
        let session = coordinator(&cluster, config)
            .search("wide", "payload", CancellationToken::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cluster.cursors_opened(), 2);

        drop(session);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cluster.cursors_opened(), 2);
    }
}
