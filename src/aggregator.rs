//! Per-broker batching.
//!
//! Each broker the producer writes to gets its own aggregator task. Records
//! reach it over a channel and pile up in a [`Batch`] until the batch is
//! big enough or old enough, at which point it is handed to a flush task
//! and a fresh batch starts filling. Only one flush per broker is in flight
//! at a time; if the next batch fills up before the previous flush is done
//! it waits.
use std::{collections::BTreeSet, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future::OptionFuture;
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::instrument;

use crate::{
    client::Client,
    error::{Error, Result},
    network::BrokerConnection,
    producer::{produce, ProducerConfig},
};

/// A record that has been assigned a partition.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Record {
    pub topic: String,
    pub partition: i32,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl Record {
    /// Bytes this record counts against the buffer limit.
    pub fn size(&self) -> usize {
        self.key.as_ref().map_or(0, Bytes::len) + self.value.len()
    }
}

/// Records waiting to be sent to one broker, in arrival order.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    pub records: Vec<Record>,
    size: usize,
    first_at: Option<Instant>,
}

impl Batch {
    pub fn push(&mut self, record: Record) {
        if self.records.is_empty() {
            self.first_at = Some(Instant::now());
        }
        self.size += record.size();
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self, max_bytes: usize) -> bool {
        !self.is_empty() && self.size >= max_bytes
    }

    /// When the oldest record has waited long enough. `None` for an empty
    /// batch or a wait too long to represent.
    pub fn deadline(&self, max_wait: Duration) -> Option<Instant> {
        self.first_at?.checked_add(max_wait)
    }

    /// Distinct topics in the batch.
    pub fn topics(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| r.topic.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    fn take(&mut self) -> Batch {
        std::mem::take(self)
    }
}

enum AggregatorMessage {
    Record(Record),
    /// Flush whatever is left and stop.
    Shutdown,
}

/// Producer side of an aggregator task.
#[derive(Debug)]
pub(crate) struct AggregatorHandle {
    broker_id: i32,
    sender: UnboundedSender<AggregatorMessage>,
    task: JoinHandle<()>,
}

impl AggregatorHandle {
    pub fn spawn<T: BrokerConnection>(
        broker_id: i32,
        client: Client<T>,
        config: Arc<ProducerConfig>,
        outcomes: UnboundedSender<Result<()>>,
    ) -> AggregatorHandle {
        tracing::debug!("Starting aggregator for broker {}", broker_id);
        let (sender, receiver) = unbounded_channel();
        let aggregator = Aggregator {
            broker_id,
            client,
            config,
            outcomes,
        };
        AggregatorHandle {
            broker_id,
            sender,
            task: tokio::spawn(aggregator.run(receiver)),
        }
    }

    pub fn send(&self, record: Record) -> Result<()> {
        self.sender
            .send(AggregatorMessage::Record(record))
            .map_err(|_| Error::ProducerClosed)
    }

    /// Ask the task to flush and stop, then wait for it.
    pub async fn shutdown(self) {
        // the task may already be gone
        let _ = self.sender.send(AggregatorMessage::Shutdown);
        if let Err(err) = self.task.await {
            tracing::error!("ERROR: Aggregator for broker {} died: {:?}", self.broker_id, err);
        }
    }
}

struct Aggregator<T: BrokerConnection> {
    broker_id: i32,
    client: Client<T>,
    config: Arc<ProducerConfig>,
    outcomes: UnboundedSender<Result<()>>,
}

impl<T: BrokerConnection> Aggregator<T> {
    async fn run(self, mut messages: UnboundedReceiver<AggregatorMessage>) {
        let mut batch = Batch::default();
        let mut in_flight: Option<JoinHandle<()>> = None;
        let mut draining = false;

        loop {
            if in_flight.is_none()
                && (batch.is_full(self.config.max_buffer_bytes) || (draining && !batch.is_empty()))
            {
                in_flight = Some(self.start_flush(batch.take()));
                continue;
            }
            if draining && in_flight.is_none() {
                break;
            }

            let deadline = batch.deadline(self.config.max_buffer_time);
            tokio::select! {
                message = messages.recv(), if !draining => match message {
                    Some(AggregatorMessage::Record(record)) => batch.push(record),
                    Some(AggregatorMessage::Shutdown) | None => draining = true,
                },
                Some(joined) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                    if let Err(err) = joined {
                        tracing::error!("ERROR: Flush to broker {} died: {:?}", self.broker_id, err);
                    }
                    in_flight = None;
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && in_flight.is_none() => {
                    tracing::trace!("Batch for broker {} timed out", self.broker_id);
                    in_flight = Some(self.start_flush(batch.take()));
                },
                else => break,
            }
        }
        tracing::debug!("Aggregator for broker {} stopped", self.broker_id);
    }

    fn start_flush(&self, batch: Batch) -> JoinHandle<()> {
        tokio::spawn(flush(
            self.broker_id,
            self.client.clone(),
            self.config.clone(),
            self.outcomes.clone(),
            batch,
        ))
    }
}

/// Send one batch and report exactly one outcome per record, in batch
/// order.
#[instrument(name = "flush", level = "debug", skip(client, config, outcomes, batch), fields(records = batch.len()))]
async fn flush<T: BrokerConnection>(
    broker_id: i32,
    client: Client<T>,
    config: Arc<ProducerConfig>,
    outcomes: UnboundedSender<Result<()>>,
    batch: Batch,
) {
    for outcome in send_batch(broker_id, &client, &config, &batch).await {
        if outcomes.send(outcome).is_err() {
            tracing::warn!("Outcome channel is gone, dropping outcomes");
            break;
        }
    }
}

async fn send_batch<T: BrokerConnection>(
    broker_id: i32,
    client: &Client<T>,
    config: &ProducerConfig,
    batch: &Batch,
) -> Vec<Result<()>> {
    let conn = match client.connection(broker_id).await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::warn!("Cannot reach broker {}: {}", broker_id, err);
            heal(client, batch.topics()).await;
            return vec![Err(err); batch.len()];
        }
    };

    match produce(&conn, config, &batch.records).await {
        Ok(outcomes) => {
            let stale: Vec<String> = batch
                .records
                .iter()
                .zip(outcomes.iter())
                .filter(|(_, outcome)| matches!(outcome, Err(err) if err.is_stale_metadata()))
                .map(|(record, _)| record.topic.as_str())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(str::to_owned)
                .collect();
            if !stale.is_empty() {
                tracing::debug!("Broker {} is no longer leading {:?}", broker_id, stale);
                heal(client, stale).await;
            }
            outcomes
        }
        Err(err) => {
            tracing::warn!("Flush to broker {} failed: {}", broker_id, err);
            if err.is_connection_fatal() {
                client.discard(broker_id, &conn).await;
                heal(client, batch.topics()).await;
            }
            vec![Err(err); batch.len()]
        }
    }
}

/// Refresh leadership for `topics` so later records find their way.
async fn heal<T: BrokerConnection>(client: &Client<T>, topics: Vec<String>) {
    if let Err(err) = client.refresh_metadata(&topics).await {
        tracing::warn!("Could not refresh metadata for {:?}: {}", topics, err);
    }
}
