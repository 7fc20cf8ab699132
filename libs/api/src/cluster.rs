use std::future::Future;
use std::pin::Pin;

use crate::{ClusterError, Delivery, LogRecord, TopicLayout};

// ════════════════════════════════════════════════════════════════
//  Log cluster collaborator
// ════════════════════════════════════════════════════════════════

/// Connection to an append-only log cluster.
///
/// One long-lived instance is owned by the server and shared read-only
/// by every component. Only the owner calls `close`, at shutdown.
///
/// Implementations: `cluster-kafka` (librdkafka), `cluster-memory`.
pub trait LogCluster: Send + Sync {
    /// Partition layout of the named topics, in request order.
    /// Empty `topics` = every topic the cluster knows.
    /// Unknown topics are returned with no partitions.
    fn topics(&self, topics: &[String])
        -> Pin<Box<dyn Future<Output = Result<Vec<TopicLayout>, ClusterError>> + Send + '_>>;

    /// Current high-water offset of one partition.
    fn high_water(&self, topic: &str, partition: i32)
        -> Pin<Box<dyn Future<Output = Result<i64, ClusterError>> + Send + '_>>;

    /// Oldest offset still retained by one partition.
    fn low_water(&self, topic: &str, partition: i32)
        -> Pin<Box<dyn Future<Output = Result<i64, ClusterError>> + Send + '_>>;

    /// Open a sequential cursor positioned at `offset`.
    ///
    /// An offset below the retained range starts at the oldest retained
    /// record.
    #[allow(clippy::type_complexity)]
    fn open_cursor(&self, topic: &str, partition: i32, offset: i64, end: CursorEnd)
        -> Pin<Box<dyn Future<Output = Result<Box<dyn PartitionCursor>, ClusterError>> + Send + '_>>;

    /// Publish one message. The returned future resolves once the
    /// cluster acknowledged (or rejected) this very message.
    fn publish(&self, topic: &str, key: Option<Vec<u8>>, payload: Vec<u8>)
        -> Pin<Box<dyn Future<Output = Result<Delivery, ClusterError>> + Send + '_>>;

    /// Flush and release the connection.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), ClusterError>> + Send + '_>>;
}

/// What a cursor does once it has delivered everything up to the
/// current end of the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorEnd {
    /// Wait for new writes.
    Follow,
    /// End the stream.
    Stop,
}

/// Sequential reader over one partition.
///
/// Dropping the cursor releases it.
pub trait PartitionCursor: Send {
    /// Next record. `None` = the cluster closed the cursor, or the end
    /// of the partition was reached under `CursorEnd::Stop`.
    #[allow(clippy::type_complexity)]
    fn next(&mut self)
        -> Pin<Box<dyn Future<Output = Option<Result<LogRecord, ClusterError>>> + Send + '_>>;
}
