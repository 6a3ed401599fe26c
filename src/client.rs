//! Connection pool & leader routing.
use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::instrument;

use crate::{
    error::{Error, KafkaCode, Result},
    metadata::{ClusterMetadata, MetadataSnapshot},
    network::{BrokerAddress, BrokerConnection},
    protocol::{MetadataRequest, MetadataResponse},
};

const DEFAULT_METADATA_RETRIES: usize = 3;
const DEFAULT_WAIT_FOR_ELECTION: Duration = Duration::from_millis(250);

/// How hard the client tries to find a leader.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde_derive::Deserialize))]
pub struct ClientConfig {
    /// Extra metadata refreshes performed while the cluster reports that a
    /// leader election is in progress.
    pub metadata_retries: usize,
    /// Back-off between those refreshes.
    pub wait_for_election: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            metadata_retries: DEFAULT_METADATA_RETRIES,
            wait_for_election: DEFAULT_WAIT_FOR_ELECTION,
        }
    }
}

/// Owns the cluster metadata cache and one connection per broker.
///
/// Cloning is cheap and shares the pool.
#[derive(Debug)]
pub struct Client<T: BrokerConnection> {
    inner: Arc<ClientInner<T>>,
}

impl<T: BrokerConnection> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct ClientInner<T: BrokerConnection> {
    seeds: Vec<BrokerAddress>,
    conn_config: T::ConnConfig,
    config: ClientConfig,
    metadata: ClusterMetadata,
    connections: Mutex<HashMap<i32, T>>,
    // one metadata request at a time
    refresh_lock: Mutex<()>,
}

enum Candidate {
    Broker(i32),
    Seed(BrokerAddress),
}

impl<T: BrokerConnection> Client<T> {
    /// Connect to the cluster through the `seeds` and load metadata for
    /// every topic.
    #[instrument(level = "debug", skip(conn_config, config))]
    pub async fn new(
        conn_config: T::ConnConfig,
        seeds: Vec<BrokerAddress>,
        config: ClientConfig,
    ) -> Result<Self> {
        if seeds.is_empty() {
            return Err(Error::MissingBrokerConfigOptions);
        }
        tracing::info!(
            "Connecting to cluster at {}",
            seeds
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
        let client = Client {
            inner: Arc::new(ClientInner {
                seeds,
                conn_config,
                config,
                metadata: ClusterMetadata::new(),
                connections: Mutex::new(HashMap::new()),
                refresh_lock: Mutex::new(()),
            }),
        };
        client.refresh_metadata(&[]).await?;
        Ok(client)
    }

    /// The current view of the cluster.
    pub fn metadata(&self) -> Arc<MetadataSnapshot> {
        self.inner.metadata.snapshot()
    }

    /// Ask the cluster for fresh metadata about `topics` (all topics when
    /// empty) and swap it into the cache.
    ///
    /// Known brokers are asked first, then the seeds. A broker that cannot
    /// be reached or answers garbage is skipped in favour of the next one.
    #[instrument(name = "metadata-refresh", level = "debug", skip(self))]
    pub async fn refresh_metadata(&self, topics: &[String]) -> Result<()> {
        let _guard = self.inner.refresh_lock.lock().await;
        let request = MetadataRequest::new(topics);

        let mut last_err = Error::MissingBrokerConfigOptions;
        for candidate in self.refresh_candidates() {
            let (conn, pooled) = match candidate {
                Candidate::Broker(id) => match self.connection(id).await {
                    Ok(conn) => (conn, Some(id)),
                    Err(err) => {
                        tracing::debug!("Skipping broker {} for metadata: {}", id, err);
                        last_err = err;
                        continue;
                    }
                },
                Candidate::Seed(addr) => {
                    match T::from_addr(self.inner.conn_config.clone(), addr.clone()).await {
                        Ok(conn) => (conn, None),
                        Err(err) => {
                            tracing::debug!("Skipping seed {} for metadata: {}", addr, err);
                            last_err = err;
                            continue;
                        }
                    }
                }
            };

            let response = conn
                .send_request(&request)
                .await
                .and_then(MetadataResponse::try_from);
            match pooled {
                Some(id) => {
                    if response.is_err() {
                        self.discard(id, &conn).await;
                    }
                }
                None => conn.close().await,
            }

            match response {
                Ok(response) => {
                    let moved = self.inner.metadata.apply(&response, topics)?;
                    for id in moved {
                        tracing::info!("Broker {} changed address, reconnecting lazily", id);
                        let old = self.inner.connections.lock().await.remove(&id);
                        if let Some(old) = old {
                            old.close().await;
                        }
                    }
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!("Metadata request to {} failed: {}", conn.addr(), err);
                    last_err = err;
                }
            }
        }

        tracing::error!("ERROR: No broker could serve metadata: {}", last_err);
        Err(last_err)
    }

    fn refresh_candidates(&self) -> Vec<Candidate> {
        let snapshot = self.inner.metadata.snapshot();
        let mut known: Vec<i32> = snapshot.brokers.keys().copied().collect();
        known.sort_unstable();

        known
            .into_iter()
            .map(Candidate::Broker)
            .chain(self.inner.seeds.iter().cloned().map(Candidate::Seed))
            .collect()
    }

    /// Look something up in the metadata, refreshing `topic` when it is
    /// not there. While the cluster answers `LeaderNotAvailable` the
    /// refresh is retried to give a leader election time to finish.
    async fn resolve<R, F>(&self, topic: &str, lookup: F) -> Result<R>
    where
        F: Fn(&MetadataSnapshot) -> std::result::Result<R, KafkaCode>,
    {
        if let Ok(found) = lookup(&self.inner.metadata.snapshot()) {
            return Ok(found);
        }

        let topics = [topic.to_owned()];
        let mut attempt = 0;
        loop {
            self.refresh_metadata(&topics).await?;
            let code = match lookup(&self.inner.metadata.snapshot()) {
                Ok(found) => return Ok(found),
                Err(code) => code,
            };
            if code != KafkaCode::LeaderNotAvailable || attempt >= self.inner.config.metadata_retries
            {
                return Err(Error::KafkaError(code));
            }
            attempt += 1;
            tracing::debug!(
                "Waiting {:?} for leader election on {} ({}/{})",
                self.inner.config.wait_for_election,
                topic,
                attempt,
                self.inner.config.metadata_retries
            );
            tokio::time::sleep(self.inner.config.wait_for_election).await;
        }
    }

    /// The broker id leading `topic`/`partition`.
    pub async fn leader(&self, topic: &str, partition: i32) -> Result<i32> {
        self.resolve(topic, |snapshot| {
            snapshot
                .get_leader_for_topic_partition(topic, partition)
                .ok_or_else(|| snapshot.leader_error(topic, partition))
        })
        .await
    }

    /// The partition ids of `topic`, ascending.
    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.resolve(topic, |snapshot| {
            snapshot.partitions(topic).ok_or_else(|| {
                match snapshot.topics.get(topic).map(|t| t.error_code) {
                    Some(code) if code != KafkaCode::None => code,
                    _ => KafkaCode::UnknownTopicOrPartition,
                }
            })
        })
        .await
    }

    /// The pooled connection to `broker_id`, opening one if there is none
    /// or the pooled one has failed.
    pub async fn connection(&self, broker_id: i32) -> Result<T> {
        if let Some(conn) = self.inner.connections.lock().await.get(&broker_id) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        let addr = self
            .inner
            .metadata
            .snapshot()
            .get_broker_by_id(broker_id)
            .cloned()
            .ok_or(Error::NoConnectionForBroker(broker_id))?;
        // connect without holding the pool, other brokers stay reachable
        let conn = T::from_addr(self.inner.conn_config.clone(), addr).await?;

        let mut connections = self.inner.connections.lock().await;
        if let Some(existing) = connections.get(&broker_id) {
            if !existing.is_closed() {
                // somebody else won the race
                let existing = existing.clone();
                drop(connections);
                conn.close().await;
                return Ok(existing);
            }
        }
        tracing::debug!("Connected to broker {} at {}", broker_id, conn.addr());
        connections.insert(broker_id, conn.clone());
        Ok(conn)
    }

    /// Connection to whichever broker leads `topic`/`partition`.
    pub async fn leader_connection(&self, topic: &str, partition: i32) -> Result<(i32, T)> {
        let broker_id = self.leader(topic, partition).await?;
        let conn = self.connection(broker_id).await?;
        Ok((broker_id, conn))
    }

    /// Close `conn` and drop it from the pool, unless the pool already
    /// holds a newer connection for that broker.
    pub async fn discard(&self, broker_id: i32, conn: &T) {
        conn.close().await;
        let mut connections = self.inner.connections.lock().await;
        if connections
            .get(&broker_id)
            .is_some_and(|pooled| pooled.is_closed())
        {
            tracing::debug!("Dropping connection to broker {}", broker_id);
            connections.remove(&broker_id);
        }
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        let connections: Vec<T> = self
            .inner
            .connections
            .lock()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            conn.close().await;
        }
    }
}
