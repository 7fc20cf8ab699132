use std::borrow::Cow;

use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════
//  Cluster layout (raw collaborator view)
// ════════════════════════════════════════════════════════════════

/// Partition list of one topic as reported by the cluster.
///
/// A topic the cluster does not know comes back with an empty
/// partition list rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    pub name: String,
    pub partitions: Vec<PartitionLayout>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub id: i32,
    /// Number of replicas assigned to this partition.
    pub replicas: usize,
}

// ════════════════════════════════════════════════════════════════
//  Metadata snapshot
// ════════════════════════════════════════════════════════════════

/// Point-in-time metadata of one topic. Built fresh per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: usize,
    /// Replica count of partition 0, used as representative for the topic.
    pub replication: usize,
    pub partition_info: Vec<PartitionInfo>,
}

impl TopicMetadata {
    /// Shape returned for a topic the cluster does not know.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: 0,
            replication: 0,
            partition_info: Vec::new(),
        }
    }
}

/// High-water offset of one partition at fetch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// High-water offset: one past the last written message.
    pub length: i64,
    pub id: i32,
}

/// Metadata response document: `{"result": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub result: Vec<TopicMetadata>,
}

/// One live-poll tick: the serialized metadata document of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSnapshot {
    pub topic: String,
    pub payload: String,
}

// ════════════════════════════════════════════════════════════════
//  Records
// ════════════════════════════════════════════════════════════════

/// Record as delivered by a partition cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: i64,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn new(offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self { offset, payload: payload.into() }
    }

    /// Payload rendered as text; invalid UTF-8 is replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Entry of a fetch-range response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedMessage {
    pub offset: i64,
    pub message: String,
}

impl From<LogRecord> for ConsumedMessage {
    fn from(record: LogRecord) -> Self {
        let message = record.text().into_owned();
        Self { offset: record.offset, message }
    }
}

/// A keyword hit produced by a partition search task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMatch {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub message: String,
    pub keyword: String,
}

/// Acknowledgement of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_wire_shape() {
        let doc = MetadataResponse {
            result: vec![TopicMetadata {
                name: "orders".into(),
                partitions: 2,
                replication: 3,
                partition_info: vec![
                    PartitionInfo { length: 3, id: 0 },
                    PartitionInfo { length: 5, id: 1 },
                ],
            }],
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "result": [{
                    "name": "orders",
                    "partitions": 2,
                    "replication": 3,
                    "partition_info": [
                        {"length": 3, "id": 0},
                        {"length": 5, "id": 1}
                    ]
                }]
            })
        );
    }

    #[test]
    fn lossy_payload_text() {
        let record = LogRecord::new(7, vec![b'o', b'k', 0xff]);
        assert_eq!(record.text(), "ok\u{fffd}");
        let consumed = ConsumedMessage::from(record);
        assert_eq!(consumed.offset, 7);
    }
}
