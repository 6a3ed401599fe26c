//! # Ferry
//! Rust-native multi-broker batching producer for Kafka-compatible clusters.
//!
//! This crate publishes keyed records to Kafka or Redpanda without the
//! caller having to manage broker connections, partition leadership,
//! wire encoding, or batching. It speaks the binary protocol directly,
//! with Tokio and Nom doing the heavy lifting.
//!
//! ## Table of contents
//! - [Getting started](#getting-started)
//!     - [Producer](#producer)
//!     - [Outcomes](#outcomes)
//! - [Resources](#resources)
//!
//! ## Getting started
//! Include the following snippet in your `Cargo.toml` dependencies:
//! ```toml
//! ferry = "0.1"
//! ```
//!
//! ### Producer
//! A [`Producer`](prelude::Producer) routes each record to the broker that
//! leads its partition. Records for one broker are collected into a batch
//! that is sent once it holds enough bytes or once its oldest record has
//! waited long enough. To instantiate one, start with a
//! [`ProducerBuilder`](prelude::ProducerBuilder).
//! ```rust,ignore
//! use ferry::prelude::*;
//!
//! let seeds = vec!["127.0.0.1:9092".parse()?];
//! let producer = ProducerBuilder::<TcpConnection>::new(TcpConfig::default(), seeds)
//!     .max_buffer_bytes(16 * 1024)
//!     .max_buffer_time(std::time::Duration::from_millis(10))
//!     .build()
//!     .await?;
//!
//! producer
//!     .send_message("my-topic", Some(bytes::Bytes::from_static(b"Tester")), "Value")
//!     .await?;
//! ```
//!
//! ### Outcomes
//! [`send_message`](prelude::Producer::send_message) returns as soon as
//! the record is queued. Whether it was written is reported later on the
//! producer's [`ErrorChannel`](prelude::ErrorChannel): exactly one outcome
//! per accepted record, `Ok(())` on success.
//! ```rust,ignore
//! producer.close().await?;
//!
//! let stream = producer.errors().clone().into_stream();
//! // have to pin streams before iterating
//! tokio::pin!(stream);
//!
//! while let Some(outcome) = stream.next().await {
//!     if let Err(err) = outcome {
//!         eprintln!("record lost: {err}");
//!     }
//! }
//! ```
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)
//! - [Confluence Docs](https://cwiki.apache.org/confluence/display/KAFKA/A+Guide+To+The+Kafka+Protocol)

mod aggregator;
mod client;
mod encode;
mod error;
mod metadata;
mod network;
mod parser;
mod partitioner;
mod producer;
mod producer_builder;
mod protocol;
mod utils;

const DEFAULT_CORRELATION_ID: i32 = 1;
const DEFAULT_CLIENT_ID: &str = "ferry";

pub mod prelude {
    //! Main export of various structures and methods
    //!
    //! # Producing
    //!
    //! The [`Producer`] takes care of routing, batching and delivery. It is
    //! built with a [`ProducerBuilder`] from a list of seed brokers and a
    //! connection config. Delivery outcomes come back on its
    //! [`ErrorChannel`].
    //!
    //! # Cluster access
    //!
    //! The [`Client`] underneath the producer owns one connection per
    //! broker and the [`ClusterMetadata`] cache. It can be used on its own
    //! to look up partition leaders.
    //!
    //! # Protocol
    //!
    //! For those looking to get their hands dirtier and handle the specific
    //! requests and responses that make up the Kafka protocol, visit the
    //! [protocol module]. Any [`BrokerConnection`] can send them.
    //!
    //! [protocol module]: protocol
    pub use crate::client::{Client, ClientConfig};
    pub use crate::error::{Error, KafkaCode, Result};
    pub use crate::metadata::{ClusterMetadata, MetadataSnapshot, PartitionMetadata, TopicMetadata};
    pub use crate::network::{
        tcp::{TcpConfig, TcpConnection},
        BrokerAddress, BrokerConnection,
    };
    pub use crate::partitioner::{
        FixedPartitioner, HashPartitioner, Partitioner, RoundRobinPartitioner,
    };
    pub use crate::producer::{ErrorChannel, Producer, ProducerConfig, RequiredAcks};
    pub use crate::producer_builder::ProducerBuilder;

    pub mod encode {
        pub use crate::encode::*;
    }

    pub mod protocol {
        pub use crate::protocol::*;
    }
}
