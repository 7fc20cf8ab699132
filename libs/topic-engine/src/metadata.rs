use std::sync::Arc;

use lens_api::{LogCluster, MetadataResponse, PartitionInfo, PollSnapshot, TopicMetadata};

use crate::EngineError;

/// Builds `TopicMetadata` snapshots from the cluster.
#[derive(Clone)]
pub struct MetadataAccessor {
    cluster: Arc<dyn LogCluster>,
}

impl MetadataAccessor {
    pub fn new(cluster: Arc<dyn LogCluster>) -> Self {
        Self { cluster }
    }

    /// Metadata of the named topics, in request order. Empty = all topics.
    ///
    /// High-water offsets are fetched per partition. Replication is the
    /// replica count of partition 0, taken as representative for the
    /// whole topic. Unknown topics yield `TopicMetadata::empty`.
    pub async fn fetch(&self, topics: &[String]) -> Result<Vec<TopicMetadata>, EngineError> {
        let layouts = self.cluster.topics(topics).await?;

        let mut result = Vec::with_capacity(layouts.len());
        for layout in layouts {
            if layout.partitions.is_empty() {
                tracing::debug!(topic = %layout.name, "topic has no partitions");
                result.push(TopicMetadata::empty(layout.name));
                continue;
            }

            let replication = layout
                .partitions
                .iter()
                .find(|p| p.id == 0)
                .map(|p| p.replicas)
                .unwrap_or(0);

            let mut partition_info = Vec::with_capacity(layout.partitions.len());
            for p in &layout.partitions {
                let length = self
                    .cluster
                    .high_water(&layout.name, p.id)
                    .await
                    .map_err(|e| e.with_context(format!("{}/{}", layout.name, p.id)))?;
                partition_info.push(PartitionInfo { length, id: p.id });
            }

            result.push(TopicMetadata {
                partitions: partition_info.len(),
                name: layout.name,
                replication,
                partition_info,
            });
        }
        Ok(result)
    }

    /// Metadata of a single topic.
    pub async fn fetch_topic(&self, topic: &str) -> Result<TopicMetadata, EngineError> {
        let mut all = self.fetch(&[topic.to_string()]).await?;
        Ok(all.pop().unwrap_or_else(|| TopicMetadata::empty(topic)))
    }

    /// `{"result": [...]}` document for the named topics.
    pub async fn response(&self, topics: &[String]) -> Result<MetadataResponse, EngineError> {
        Ok(MetadataResponse {
            result: self.fetch(topics).await?,
        })
    }

    /// One serialized metadata document for the live poll.
    pub async fn snapshot(&self, topic: &str) -> Result<PollSnapshot, EngineError> {
        let doc = MetadataResponse {
            result: vec![self.fetch_topic(topic).await?],
        };
        Ok(PollSnapshot {
            topic: topic.to_string(),
            payload: serde_json::to_string(&doc)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use cluster_memory::MemoryCluster;
    use lens_api::ErrorKind;

    use super::*;

    fn accessor() -> (Arc<MemoryCluster>, MetadataAccessor) {
        let cluster = Arc::new(MemoryCluster::default());
        cluster.create_topic("orders", 2, 3);
        cluster.create_topic("audit", 1, 1);
        for _ in 0..3 {
            cluster.append("orders", 0, "x").unwrap();
        }
        for _ in 0..5 {
            cluster.append("orders", 1, "y").unwrap();
        }
        let accessor = MetadataAccessor::new(cluster.clone());
        (cluster, accessor)
    }

    #[tokio::test]
    async fn empty_request_lists_every_topic() {
        let (_cluster, accessor) = accessor();
        let all = accessor.fetch(&[]).await.unwrap();
        let names: Vec<_> = all.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["audit", "orders"]);
    }

    #[tokio::test]
    async fn high_water_and_replication_per_topic() {
        let (_cluster, accessor) = accessor();
        let orders = accessor.fetch_topic("orders").await.unwrap();
        assert_eq!(orders.partitions, 2);
        assert_eq!(orders.replication, 3);
        assert_eq!(
            orders.partition_info,
            vec![PartitionInfo { length: 3, id: 0 }, PartitionInfo { length: 5, id: 1 }]
        );
    }

    #[tokio::test]
    async fn unknown_topic_yields_empty_shape() {
        let (_cluster, accessor) = accessor();
        let result = accessor.fetch(&["ghost".to_string()]).await.unwrap();
        assert_eq!(result, vec![TopicMetadata::empty("ghost")]);
    }

    #[tokio::test]
    async fn named_topics_keep_request_order() {
        let (_cluster, accessor) = accessor();
        let result = accessor
            .fetch(&["orders".to_string(), "audit".to_string()])
            .await
            .unwrap();
        assert_eq!(result[0].name, "orders");
        assert_eq!(result[1].name, "audit");
    }

    #[tokio::test]
    async fn unreachable_cluster_is_connection_error() {
        let (cluster, accessor) = accessor();
        cluster.set_unreachable(true);
        let err = accessor.fetch(&[]).await.unwrap_err();
        assert_eq!(err.cluster_kind(), Some(ErrorKind::Connection));
    }

    #[tokio::test]
    async fn snapshot_is_metadata_document() {
        let (_cluster, accessor) = accessor();
        let snapshot = accessor.snapshot("audit").await.unwrap();
        let doc: MetadataResponse = serde_json::from_str(&snapshot.payload).unwrap();
        assert_eq!(doc.result.len(), 1);
        assert_eq!(doc.result[0].name, "audit");
        assert_eq!(doc.result[0].partition_info[0].length, 0);
    }
}
