//! Client that sends records to a cluster.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    Mutex, RwLock,
};
use tokio_stream::Stream;
use tracing::instrument;

use crate::{
    aggregator::{AggregatorHandle, Record},
    client::Client,
    error::{Error, KafkaCode, Result},
    network::BrokerConnection,
    partitioner::Partitioner,
    protocol::{ProduceRequest, ProduceResponse},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_BUFFER_BYTES: usize = 16 * 1024;
const DEFAULT_MAX_BUFFER_TIME: Duration = Duration::from_millis(100);

/// How many replicas must have a write before the broker answers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde_derive::Deserialize))]
#[repr(i16)]
pub enum RequiredAcks {
    /// The broker does not answer at all.
    WaitForNone = 0,
    /// Only the leader.
    #[default]
    WaitForLocal = 1,
    /// Every in-sync replica.
    WaitForAll = -1,
}

/// Producing parameters.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde_derive::Deserialize))]
pub struct ProducerConfig {
    pub required_acks: RequiredAcks,
    /// How long the broker may wait for replicas before answering.
    pub timeout: Duration,
    /// A broker's batch is sent once its keys and values add up to this
    /// many bytes.
    pub max_buffer_bytes: usize,
    /// A broker's batch is sent once its oldest record has waited this
    /// long. `Duration::MAX` means never.
    pub max_buffer_time: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            required_acks: RequiredAcks::default(),
            timeout: DEFAULT_TIMEOUT,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            max_buffer_time: DEFAULT_MAX_BUFFER_TIME,
        }
    }
}

impl ProducerConfig {
    fn timeout_ms(&self) -> i32 {
        i32::try_from(self.timeout.as_millis()).unwrap_or(i32::MAX)
    }
}

/// Kafka/Redpanda Producer.
///
/// Records are routed to the broker leading their partition and batched
/// per broker by a background aggregator. A batch is sent when it reaches
/// [`max_buffer_bytes`](ProducerConfig::max_buffer_bytes) or when its oldest
/// record is [`max_buffer_time`](ProducerConfig::max_buffer_time) old, and
/// brokers never wait on each other.
///
/// [`send_message`](Self::send_message) only reports routing problems.
/// Whether a record was actually written shows up later on
/// [`errors`](Self::errors), one outcome per accepted record.
///
/// ### Example
/// ```rust,ignore
/// let seeds = vec!["127.0.0.1:9092".parse()?];
/// let producer = ferry::prelude::ProducerBuilder::<TcpConnection>::new(TcpConfig::default(), seeds)
///     .max_buffer_bytes(1024)
///     .build()
///     .await?;
///
/// producer.send_message("my-topic", None, "hello").await?;
/// producer.close().await?;
///
/// while let Some(outcome) = producer.errors().recv().await {
///     outcome?;
/// }
/// ```
pub struct Producer<T: BrokerConnection> {
    client: Client<T>,
    config: Arc<ProducerConfig>,
    partitioner: Arc<dyn Partitioner>,
    routing: RwLock<Routing>,
    errors: ErrorChannel,
}

struct Routing {
    aggregators: HashMap<i32, AggregatorHandle>,
    // dropped on close so the outcome channel ends once every flush is in
    outcomes: Option<UnboundedSender<Result<()>>>,
    closed: bool,
}

impl<T: BrokerConnection> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("config", &self.config)
            .field("partitioner", &self.partitioner)
            .finish_non_exhaustive()
    }
}

impl<T: BrokerConnection> Producer<T> {
    pub fn new(
        client: Client<T>,
        config: ProducerConfig,
        partitioner: Arc<dyn Partitioner>,
    ) -> Producer<T> {
        let (sender, receiver) = unbounded_channel();
        Producer {
            client,
            config: Arc::new(config),
            partitioner,
            routing: RwLock::new(Routing {
                aggregators: HashMap::new(),
                outcomes: Some(sender),
                closed: false,
            }),
            errors: ErrorChannel::new(receiver),
        }
    }

    pub fn client(&self) -> &Client<T> {
        &self.client
    }

    /// Queue a record for `topic`.
    ///
    /// Fails with [`Error::RoutingError`] when no leader can be found for
    /// the record's partition, and with [`Error::ProducerClosed`] after
    /// [`close`](Self::close). Success only means the record was accepted.
    #[instrument(level = "trace", skip(self, key, value))]
    pub async fn send_message(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        let value = value.into();
        if self.routing.read().await.closed {
            return Err(Error::ProducerClosed);
        }

        let (broker_id, partition) = self.route(topic, key.as_deref()).await.map_err(|err| {
            tracing::warn!("No route for topic {}: {}", topic, err);
            Error::RoutingError(topic.to_owned())
        })?;

        let record = Record {
            topic: topic.to_owned(),
            partition,
            key,
            value,
        };
        self.enqueue(broker_id, record).await
    }

    async fn route(&self, topic: &str, key: Option<&[u8]>) -> Result<(i32, i32)> {
        let partitions = self.client.partitions(topic).await?;
        let num_partitions =
            i32::try_from(partitions.len()).map_err(|_| Error::RoutingError(topic.to_owned()))?;
        let index = self.partitioner.partition(key, num_partitions)?;
        let partition = usize::try_from(index)
            .ok()
            .and_then(|i| partitions.get(i).copied())
            .ok_or(Error::KafkaError(KafkaCode::UnknownTopicOrPartition))?;
        let broker_id = self.client.leader(topic, partition).await?;
        tracing::trace!(
            "Routing record for {}/{} to broker {}",
            topic,
            partition,
            broker_id
        );
        Ok((broker_id, partition))
    }

    async fn enqueue(&self, broker_id: i32, record: Record) -> Result<()> {
        {
            let routing = self.routing.read().await;
            if routing.closed {
                return Err(Error::ProducerClosed);
            }
            if let Some(aggregator) = routing.aggregators.get(&broker_id) {
                return aggregator.send(record);
            }
        }

        let mut routing = self.routing.write().await;
        if routing.closed {
            return Err(Error::ProducerClosed);
        }
        let Routing {
            aggregators,
            outcomes,
            ..
        } = &mut *routing;
        let outcomes = outcomes.as_ref().ok_or(Error::ProducerClosed)?;
        aggregators
            .entry(broker_id)
            .or_insert_with(|| {
                AggregatorHandle::spawn(
                    broker_id,
                    self.client.clone(),
                    self.config.clone(),
                    outcomes.clone(),
                )
            })
            .send(record)
    }

    /// Where delivery outcomes are reported.
    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    /// Flush every pending batch, wait for every outstanding request, and
    /// release all connections.
    ///
    /// The outcome channel ends once the last outcome has been delivered.
    /// A second call fails with [`Error::ProducerClosed`].
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&self) -> Result<()> {
        let (aggregators, outcomes) = {
            let mut routing = self.routing.write().await;
            if routing.closed {
                return Err(Error::ProducerClosed);
            }
            routing.closed = true;
            let aggregators: Vec<AggregatorHandle> =
                routing.aggregators.drain().map(|(_, a)| a).collect();
            (aggregators, routing.outcomes.take())
        };

        tracing::debug!("Draining {} aggregators", aggregators.len());
        futures::future::join_all(aggregators.into_iter().map(AggregatorHandle::shutdown)).await;
        drop(outcomes);

        self.client.close().await;
        Ok(())
    }
}

/// Produce records over one connection.
///
/// Returns one outcome per record, in the order given. Every record of a
/// partition shares the error code the broker reported for that partition.
/// With [`RequiredAcks::WaitForNone`] the broker does not answer and
/// writing the request counts as success.
///
/// See this [protocol spec](crate::prelude::protocol::produce) for more information.
pub(crate) async fn produce(
    broker_conn: &impl BrokerConnection,
    config: &ProducerConfig,
    records: &[Record],
) -> Result<Vec<Result<()>>> {
    tracing::debug!("Producing {} records to {}", records.len(), broker_conn.addr());

    let mut produce_request = ProduceRequest::new(config.required_acks as i16, config.timeout_ms());
    for record in records {
        produce_request.add(
            &record.topic,
            record.partition,
            record.key.clone(),
            Some(record.value.clone()),
        );
    }

    if config.required_acks == RequiredAcks::WaitForNone {
        broker_conn
            .send_request_without_response(&produce_request)
            .await?;
        return Ok(vec![Ok(()); records.len()]);
    }

    let response = ProduceResponse::try_from(broker_conn.send_request(&produce_request).await?)?;
    Ok(records
        .iter()
        .map(
            |record| match response.error_code_for(&record.topic, record.partition) {
                Some(KafkaCode::None) => Ok(()),
                Some(code) => Err(Error::KafkaError(code)),
                None => Err(Error::MissingPartitionResponse(
                    record.topic.clone(),
                    record.partition,
                )),
            },
        )
        .collect())
}

/// Delivery outcomes, one per accepted record.
///
/// `Ok(())` means the record was written, `Err` says why it was not.
/// Outcomes for one partition arrive in the order the records were sent.
/// Clones share the same channel.
#[derive(Clone)]
pub struct ErrorChannel {
    receiver: Arc<Mutex<UnboundedReceiver<Result<()>>>>,
}

impl fmt::Debug for ErrorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorChannel").finish_non_exhaustive()
    }
}

impl ErrorChannel {
    fn new(receiver: UnboundedReceiver<Result<()>>) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Wait for the next outcome. `None` once the producer is closed and
    /// every outcome has been received.
    pub async fn recv(&self) -> Option<Result<()>> {
        self.receiver.lock().await.recv().await
    }

    /// The next outcome if one is ready.
    pub fn try_recv(&self) -> Option<Result<()>> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }

    /// Outcomes as a stream.
    ///
    /// ### Example
    /// ```rust,ignore
    /// let stream = producer.errors().clone().into_stream();
    /// // have to pin streams before iterating
    /// tokio::pin!(stream);
    ///
    /// while let Some(outcome) = stream.next().await {
    ///     println!("{:?}", outcome);
    /// }
    /// ```
    pub fn into_stream(self) -> impl Stream<Item = Result<()>> {
        async_stream::stream! {
            while let Some(outcome) = self.recv().await {
                yield outcome;
            }
        }
    }
}
