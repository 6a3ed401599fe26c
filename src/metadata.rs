//! Cluster metadata & leadership cache.
//!
//! The cache is a [`MetadataSnapshot`] held behind an [`ArcSwap`]. A
//! refresh builds a complete new snapshot from the old one plus a Metadata
//! response and swaps it in with a single store, so a reader holding a
//! snapshot always sees either the old or the new view of the cluster.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use arc_swap::ArcSwap;
use bytes::Bytes;

use crate::{
    error::{Error, KafkaCode, Result},
    network::BrokerAddress,
    protocol::metadata::response::{MetadataResponse, Partition, Topic},
};

/// What the cluster last told us about one partition.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionMetadata {
    /// The partition error, or `None` if there was no error.
    pub error_code: KafkaCode,
    /// The leading broker. Absent when the broker reported an error for
    /// this partition or has no leader for it.
    pub leader: Option<i32>,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TopicMetadata {
    /// The topic error. Topics with an error carry no partitions.
    pub error_code: KafkaCode,
    pub partitions: BTreeMap<i32, PartitionMetadata>,
}

/// An immutable view of the cluster.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetadataSnapshot {
    /// Broker registry, broker id to address.
    pub brokers: HashMap<i32, BrokerAddress>,
    pub topics: HashMap<String, TopicMetadata>,
}

impl MetadataSnapshot {
    pub fn get_broker_by_id(&self, id: i32) -> Option<&BrokerAddress> {
        self.brokers.get(&id)
    }

    pub fn get_topic_partition_by_id(
        &self,
        topic_name: &str,
        partition_id: i32,
    ) -> Option<&PartitionMetadata> {
        self.topics.get(topic_name)?.partitions.get(&partition_id)
    }

    /// The leader of a partition, if it is known and reachable.
    pub fn get_leader_for_topic_partition(&self, topic_name: &str, partition_id: i32) -> Option<i32> {
        let leader = self
            .get_topic_partition_by_id(topic_name, partition_id)?
            .leader?;
        // a leader we have no address for is as good as no leader
        self.brokers.contains_key(&leader).then_some(leader)
    }

    /// Partition ids of a topic in ascending order.
    pub fn partitions(&self, topic_name: &str) -> Option<Vec<i32>> {
        let topic = self.topics.get(topic_name)?;
        if topic.partitions.is_empty() {
            return None;
        }
        Some(topic.partitions.keys().copied().collect())
    }

    /// Why a partition has no usable leader.
    pub fn leader_error(&self, topic_name: &str, partition_id: i32) -> KafkaCode {
        let Some(topic) = self.topics.get(topic_name) else {
            return KafkaCode::UnknownTopicOrPartition;
        };
        if topic.error_code != KafkaCode::None {
            return topic.error_code;
        }
        match topic.partitions.get(&partition_id) {
            Some(partition) if partition.error_code != KafkaCode::None => partition.error_code,
            Some(_) => KafkaCode::LeaderNotAvailable,
            None => KafkaCode::UnknownTopicOrPartition,
        }
    }

    /// Build the snapshot that results from applying `response`, which
    /// answered a request for `requested` topics (empty meaning all).
    ///
    /// Returns the new snapshot and the ids of brokers whose address
    /// changed.
    pub fn merge(
        &self,
        response: &MetadataResponse,
        requested: &[String],
    ) -> Result<(MetadataSnapshot, Vec<i32>)> {
        let mut next = self.clone();
        let mut moved = vec![];

        for broker in response.brokers.iter() {
            let addr = broker.addr()?;
            if let Some(previous) = next.brokers.insert(broker.node_id, addr) {
                if next.brokers.get(&broker.node_id) != Some(&previous) {
                    moved.push(broker.node_id);
                }
            }
        }

        if requested.is_empty() {
            next.topics.clear();
        } else {
            for topic in requested {
                next.topics.remove(topic);
            }
        }

        for topic in response.topics.iter() {
            let name = topic_name(&topic.name)?;
            next.topics.insert(name, topic_metadata(topic));
        }

        Ok((next, moved))
    }
}

fn topic_name(name: &Bytes) -> Result<String> {
    String::from_utf8(name.to_vec()).map_err(|err| {
        tracing::error!("Error converting from UTF8 {:?}", err);
        Error::DecodingUtf8Error
    })
}

fn topic_metadata(topic: &Topic) -> TopicMetadata {
    if topic.error_code != KafkaCode::None {
        return TopicMetadata {
            error_code: topic.error_code,
            partitions: BTreeMap::new(),
        };
    }
    TopicMetadata {
        error_code: KafkaCode::None,
        partitions: topic
            .partitions
            .iter()
            .map(|p| (p.partition_index, partition_metadata(p)))
            .collect(),
    }
}

fn partition_metadata(partition: &Partition) -> PartitionMetadata {
    let leader = (partition.error_code == KafkaCode::None && partition.leader_id >= 0)
        .then_some(partition.leader_id);
    PartitionMetadata {
        error_code: partition.error_code,
        leader,
        replicas: partition.replica_nodes.clone(),
        isr: partition.isr_nodes.clone(),
    }
}

/// Shared, atomically refreshed cluster metadata.
#[derive(Debug)]
pub struct ClusterMetadata {
    snapshot: ArcSwap<MetadataSnapshot>,
}

impl Default for ClusterMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterMetadata {
    pub fn new() -> Self {
        ClusterMetadata {
            snapshot: ArcSwap::from_pointee(MetadataSnapshot::default()),
        }
    }

    /// The current view of the cluster.
    pub fn snapshot(&self) -> Arc<MetadataSnapshot> {
        self.snapshot.load_full()
    }

    /// Fold a Metadata response into the cache.
    ///
    /// Callers must not apply two responses concurrently.
    pub fn apply(&self, response: &MetadataResponse, requested: &[String]) -> Result<Vec<i32>> {
        let (next, moved) = self.snapshot.load().merge(response, requested)?;
        tracing::debug!(
            "Metadata now knows {} brokers and {} topics",
            next.brokers.len(),
            next.topics.len()
        );
        self.snapshot.store(Arc::new(next));
        Ok(moved)
    }
}
