use std::time::Duration;

use lens_api::{ClusterError, CursorEnd, LogCluster, LogRecord, PartitionCursor};

use crate::EngineError;

/// Where a partition read stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBound {
    /// Tail the partition until the reader is dropped.
    Unbounded,
    /// At most this many records.
    Count(u64),
    /// Records with offsets strictly below this one. Also stops at the
    /// current end of the partition if that comes first.
    Until(i64),
}

impl ReadBound {
    fn cursor_end(self) -> CursorEnd {
        match self {
            ReadBound::Until(_) => CursorEnd::Stop,
            ReadBound::Unbounded | ReadBound::Count(_) => CursorEnd::Follow,
        }
    }
}

/// Ordered, forward-only reader over one partition.
///
/// Wraps a cluster cursor and enforces the bound. Once the bound is
/// reached, the cursor errors or the cluster closes it, the reader is
/// exhausted for good and the cursor is released.
pub struct PartitionReader {
    topic: String,
    partition: i32,
    cursor: Option<Box<dyn PartitionCursor>>,
    next_offset: i64,
    remaining: Option<u64>,
    until: Option<i64>,
}

impl PartitionReader {
    /// Open a reader at `start`. Bounds with nothing to read end without
    /// touching the cluster.
    pub async fn open(
        cluster: &dyn LogCluster,
        topic: &str,
        partition: i32,
        start: i64,
        bound: ReadBound,
    ) -> Result<Self, ClusterError> {
        let (remaining, until) = match bound {
            ReadBound::Unbounded => (None, None),
            ReadBound::Count(n) => (Some(n), None),
            ReadBound::Until(end) => (None, Some(end)),
        };
        let empty = remaining == Some(0) || until.is_some_and(|end| end <= start);

        let cursor = if empty {
            None
        } else {
            Some(
                cluster
                    .open_cursor(topic, partition, start, bound.cursor_end())
                    .await
                    .map_err(|e| e.with_context(format!("{topic}/{partition}")))?,
            )
        };

        Ok(Self {
            topic: topic.to_string(),
            partition,
            cursor,
            next_offset: start,
            remaining,
            until,
        })
    }

    /// Offset the next record is expected at.
    pub fn position(&self) -> i64 {
        self.next_offset
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_none()
    }

    /// Next record, `None` once exhausted.
    pub async fn next(&mut self) -> Option<Result<LogRecord, ClusterError>> {
        if self.bound_reached() {
            self.cursor = None;
        }
        let cursor = self.cursor.as_mut()?;

        let record = match cursor.next().await {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                self.cursor = None;
                return Some(Err(e.with_context(format!("{}/{}", self.topic, self.partition))));
            }
            None => {
                self.cursor = None;
                return None;
            }
        };

        if record.offset < self.next_offset {
            self.cursor = None;
            return Some(Err(ClusterError::read(format!(
                "{}/{}: offset went backwards ({} after {})",
                self.topic,
                self.partition,
                record.offset,
                self.next_offset - 1
            ))));
        }
        if self.until.is_some_and(|end| record.offset >= end) {
            self.cursor = None;
            return None;
        }

        self.next_offset = record.offset + 1;
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        Some(Ok(record))
    }

    fn bound_reached(&self) -> bool {
        self.remaining == Some(0) || self.until.is_some_and(|end| self.next_offset >= end)
    }
}

/// Read `count` records starting at `start`, giving up after `timeout`.
///
/// Backs the fetch-range operation. Running out of time before `count`
/// records arrive is an error rather than a short answer.
pub async fn read_range(
    cluster: &dyn LogCluster,
    topic: &str,
    partition: i32,
    start: i64,
    count: u64,
    timeout: Duration,
) -> Result<Vec<LogRecord>, EngineError> {
    let mut reader = PartitionReader::open(cluster, topic, partition, start, ReadBound::Count(count)).await?;
    let mut records = Vec::with_capacity(count.min(1024) as usize);

    let collect = async {
        while let Some(next) = reader.next().await {
            records.push(next?);
        }
        Ok::<_, ClusterError>(())
    };

    let outcome = tokio::time::timeout(timeout, collect).await;
    match outcome {
        Ok(result) => result?,
        Err(_) => {
            return Err(EngineError::ReadTimeout {
                topic: topic.to_string(),
                partition,
                position: start + records.len() as i64,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
    }

    tracing::debug!(topic = %topic, partition, start, count = records.len(), "range read");
    Ok(records)
}
