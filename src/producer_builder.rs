use std::{sync::Arc, time::Duration};

use crate::{
    client::{Client, ClientConfig},
    error::Result,
    network::{BrokerAddress, BrokerConnection},
    partitioner::{HashPartitioner, Partitioner},
    producer::{Producer, ProducerConfig, RequiredAcks},
};

/// Configure a [`Producer`].
///
/// ### Example
/// ```rust,ignore
/// let seeds = vec!["127.0.0.1:9092".parse()?];
///
/// let producer = ferry::prelude::ProducerBuilder::<TcpConnection>::new(TcpConfig::default(), seeds)
///     .required_acks(RequiredAcks::WaitForLocal)
///     .max_buffer_bytes(64 * 1024)
///     .max_buffer_time(Duration::from_millis(5))
///     .build()
///     .await?;
///
/// producer
///     .send_message("my-topic", Some(Bytes::from_static(b"Tester")), "Value")
///     .await?;
/// ```
pub struct ProducerBuilder<T: BrokerConnection> {
    conn_config: T::ConnConfig,
    seeds: Vec<BrokerAddress>,
    client_config: ClientConfig,
    config: ProducerConfig,
    partitioner: Arc<dyn Partitioner>,
}

impl<T: BrokerConnection> ProducerBuilder<T> {
    /// Start a producer builder. To complete, use the [`build`](Self::build) method.
    pub fn new(conn_config: T::ConnConfig, seeds: Vec<BrokerAddress>) -> Self {
        Self {
            conn_config,
            seeds,
            client_config: ClientConfig::default(),
            config: ProducerConfig::default(),
            partitioner: Arc::new(HashPartitioner),
        }
    }

    /// Replace every producing parameter at once.
    pub fn config(mut self, config: ProducerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client_config(mut self, client_config: ClientConfig) -> Self {
        self.client_config = client_config;
        self
    }

    /// The number of acknowledgments the producer requires the leader to
    /// have received before considering a request complete.
    pub fn required_acks(mut self, required_acks: RequiredAcks) -> Self {
        self.config.required_acks = required_acks;
        self
    }

    /// How long the broker may wait for the required acknowledgments.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// The number of key and value bytes that will sit in a broker's batch.
    ///
    /// When a batch reaches this size it is flushed, unless the
    /// [`max_buffer_time`](Self::max_buffer_time) has passed first.
    ///
    /// Increasing this number will increase latency, but also increase throughput.
    pub fn max_buffer_bytes(mut self, max_buffer_bytes: usize) -> Self {
        self.config.max_buffer_bytes = max_buffer_bytes;
        self
    }

    /// The maximum time a record will sit in a batch.
    ///
    /// Decreasing this number will lower latency, but also lower throughput.
    /// `Duration::MAX` turns the timer off.
    pub fn max_buffer_time(mut self, max_buffer_time: Duration) -> Self {
        self.config.max_buffer_time = max_buffer_time;
        self
    }

    pub fn partitioner(mut self, partitioner: impl Partitioner + 'static) -> Self {
        self.partitioner = Arc::new(partitioner);
        self
    }

    /// Connect to the cluster and start producing.
    pub async fn build(self) -> Result<Producer<T>> {
        let client = Client::new(self.conn_config, self.seeds, self.client_config).await?;
        Ok(Producer::new(client, self.config, self.partitioner))
    }
}
