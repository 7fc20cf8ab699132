//! Topic inspection engine.
//!
//! Everything here talks to the cluster through `lens_api::LogCluster`.

mod config;
mod error;
mod metadata;
mod poll;
mod reader;
mod search;

pub use config::{EngineConfig, FailurePolicy, PollConfig, RangeConfig, SearchConfig};
pub use error::EngineError;
pub use metadata::MetadataAccessor;
pub use poll::{PollSubscription, PollSupervisor};
pub use reader::{read_range, PartitionReader, ReadBound};
pub use search::{
    KeywordMatcher, PartitionBound, PartitionOutcome, SearchCoordinator, SearchReport,
    SearchSession,
};
