//! Shared data model and the log-cluster collaborator contract.
//!
//! The engine, the gateway and the cluster backends depend only on
//! this crate; none of them knows which backend is plugged in.

mod cluster;
mod error;
mod model;

pub use cluster::{CursorEnd, LogCluster, PartitionCursor};
pub use error::{ClusterError, ErrorKind};
pub use model::{
    ConsumedMessage, Delivery, LogRecord, MessageMatch, MetadataResponse, PartitionInfo,
    PartitionLayout, PollSnapshot, TopicLayout, TopicMetadata,
};
