//! Encoding and creation for Produce requests.
//!
//! ### Protocol Def
//! ```text
//! Produce Request (Version: 0) => acks timeout_ms [topic_data]
//!   acks => INT16
//!   timeout_ms => INT32
//!   topic_data => name [partition_data]
//!     name => STRING
//!     partition_data => index records
//!       index => INT32
//!       records => MESSAGE_SET
//! ```
//!
//! Messages are appended in the order they are added; within one
//! partition that order is the order the broker will write them in.

use bytes::{BufMut, Bytes};

use crate::{encode::ToByte, error::Result, protocol::Request, utils::to_crc};

const API_KEY_PRODUCE: i16 = 0;
const API_VERSION: i16 = 0;

/// The magic byte (a.k.a version) we use for sent messages.
const MESSAGE_MAGIC_BYTE: i8 = 0;
/// No compression.
const MESSAGE_ATTRIBUTES: i8 = 0;

#[derive(Debug)]
pub struct ProduceRequest<'a> {
    /// The number of acknowledgments the producer requires the leader to have received before considering a request complete. Allowed values: 0 for no acknowledgments, 1 for only the leader and -1 for the full ISR.
    pub required_acks: i16,
    /// The timeout to await a response in milliseconds.
    pub timeout_ms: i32,
    /// Each topic to produce to.
    pub topic_partitions: Vec<TopicPartitionProduceRequest<'a>>,
}

#[derive(Debug)]
pub struct TopicPartitionProduceRequest<'a> {
    /// The topic name.
    pub name: &'a str,
    /// Each partition to produce to.
    pub partitions: Vec<PartitionProduceRequest>,
}

#[derive(Debug)]
pub struct PartitionProduceRequest {
    /// The partition index.
    pub partition: i32,
    /// The record data to be produced.
    pub messages: Vec<MessageProduceRequest>,
}

#[derive(Debug)]
pub struct MessageProduceRequest {
    key: Option<Bytes>,
    value: Option<Bytes>,
}

impl<'a> ProduceRequest<'a> {
    pub fn new(required_acks: i16, timeout_ms: i32) -> ProduceRequest<'a> {
        ProduceRequest {
            required_acks,
            timeout_ms,
            topic_partitions: vec![],
        }
    }

    pub fn add(&mut self, topic: &'a str, partition: i32, key: Option<Bytes>, value: Option<Bytes>) {
        match self.topic_partitions.iter_mut().find(|tp| tp.name == topic) {
            Some(tp) => tp.add(partition, key, value),
            None => {
                let mut tp = TopicPartitionProduceRequest::new(topic);
                tp.add(partition, key, value);
                self.topic_partitions.push(tp);
            }
        }
    }

    /// Total number of messages across all topics and partitions.
    pub fn len(&self) -> usize {
        self.topic_partitions
            .iter()
            .flat_map(|tp| tp.partitions.iter())
            .map(|p| p.messages.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> TopicPartitionProduceRequest<'a> {
    pub fn new(name: &'a str) -> TopicPartitionProduceRequest<'a> {
        TopicPartitionProduceRequest {
            name,
            partitions: vec![],
        }
    }

    pub fn add(&mut self, partition: i32, key: Option<Bytes>, value: Option<Bytes>) {
        match self.partitions.iter_mut().find(|p| p.partition == partition) {
            Some(pp) => pp.add(key, value),
            None => {
                let mut pp = PartitionProduceRequest::new(partition);
                pp.add(key, value);
                self.partitions.push(pp);
            }
        }
    }
}

impl PartitionProduceRequest {
    pub fn new(partition: i32) -> PartitionProduceRequest {
        PartitionProduceRequest {
            partition,
            messages: Vec::new(),
        }
    }

    pub fn add(&mut self, key: Option<Bytes>, value: Option<Bytes>) {
        self.messages.push(MessageProduceRequest { key, value });
    }
}

impl<'a> ToByte for ProduceRequest<'a> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        tracing::trace!("Encoding ProduceRequest {:?}", self);
        self.required_acks.encode(buffer)?;
        self.timeout_ms.encode(buffer)?;
        self.topic_partitions.encode(buffer)?;
        Ok(())
    }
}

impl<'a> Request for ProduceRequest<'a> {
    const API_KEY: i16 = API_KEY_PRODUCE;
    const API_VERSION: i16 = API_VERSION;
}

impl<'a> ToByte for TopicPartitionProduceRequest<'a> {
    // render: TopicName [Partition MessageSetSize MessageSet]
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.name.encode(buffer)?;
        self.partitions.encode(buffer)
    }
}

impl ToByte for PartitionProduceRequest {
    // render: Partition MessageSetSize MessageSet
    //
    // MessageSet => [Offset MessageSize Message]
    // MessageSets are not preceded by an element count like other arrays.
    fn encode<W: BufMut>(&self, out: &mut W) -> Result<()> {
        self.partition.encode(out)?;

        // render the whole MessageSet first so its size is known
        let mut buf = Vec::new();
        for msg in &self.messages {
            msg.encode_to_buf(&mut buf)?;
        }

        buf[..].encode(out)
    }
}

impl MessageProduceRequest {
    // render a single message as: Offset MessageSize Message
    //
    // Offset => int64 (always zero, the broker assigns it)
    // MessageSize => int32
    // Message => Crc MagicByte Attributes Key Value
    fn encode_to_buf(&self, buffer: &mut Vec<u8>) -> Result<()> {
        (0i64).encode(buffer)?;

        let size_pos = buffer.len();
        0i32.encode(buffer)?; // size, filled in below

        let crc_pos = buffer.len();
        0i32.encode(buffer)?; // crc, filled in below
        MESSAGE_MAGIC_BYTE.encode(buffer)?;
        MESSAGE_ATTRIBUTES.encode(buffer)?;
        self.key.encode(buffer)?;
        self.value.encode(buffer)?;

        let crc = to_crc(&buffer[(crc_pos + 4)..]) as i32;
        crc.encode(&mut &mut buffer[crc_pos..crc_pos + 4])?;

        let size = (buffer.len() - crc_pos) as i32;
        size.encode(&mut &mut buffer[size_pos..size_pos + 4])?;

        Ok(())
    }
}
