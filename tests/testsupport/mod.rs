#![allow(dead_code)]
//! In-process broker for integration tests.
//!
//! A [`MockBroker`] accepts any number of connections, records every
//! request it reads, and answers:
//! - Metadata requests with whatever [`MockBroker::set_metadata`] last set,
//! - Produce requests with success for every partition written to, unless
//!   a [`Reply`] was scripted with [`MockBroker::push_reply`],
//! - Produce requests with `acks = 0` never.
//!
//! Each request is answered from its own task so a scripted stall does not
//! hold up later requests on the same connection.
use std::{
    collections::{HashMap, VecDeque},
    env,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes};
use ferry::prelude::{BrokerAddress, Error};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    task::JoinHandle,
};

const KAFKA_BROKERS: &str = "KAFKA_BROKERS";
const KAFKA_TOPIC: &str = "KAFKA_TOPIC";

pub const PRODUCE: i16 = 0;
pub const METADATA: i16 = 3;

/// The message everybody produces.
pub const MESSAGE: &str = "ABC THE MESSAGE";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Brokers of a real cluster, when `KAFKA_BROKERS` is set.
pub fn get_brokers() -> Result<(bool, Vec<BrokerAddress>), Error> {
    let brokers = match env::var(KAFKA_BROKERS) {
        Ok(brokers) => brokers
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<BrokerAddress>, Error>>()?,
        Err(_) => {
            tracing::warn!("Skipping test because no {} is set", KAFKA_BROKERS);
            return Ok((true, vec![]));
        }
    };
    Ok((false, brokers))
}

pub fn get_brokers_and_topic() -> Result<(bool, Vec<BrokerAddress>, String), Error> {
    let (skip, brokers) = get_brokers()?;
    if skip {
        return Ok((skip, vec![], "".to_string()));
    }
    let topic = match env::var(KAFKA_TOPIC) {
        Ok(topic) => topic,
        Err(_) => {
            tracing::warn!("Skipping test because no {} is set", KAFKA_TOPIC);
            return Ok((true, vec![], "".to_string()));
        }
    };
    Ok((false, brokers, topic))
}

#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
    pub body: Bytes,
}

/// How to answer one request.
pub enum Reply {
    Body(Vec<u8>),
    Delayed(Duration, Vec<u8>),
    /// Never answer.
    Hang,
    /// Hang up the connection instead of answering.
    Close,
    /// Answer with a correlation id nobody asked for.
    WrongCorrelationId(Vec<u8>),
}

#[derive(Default)]
struct State {
    metadata: Vec<u8>,
    replies: HashMap<i16, VecDeque<Reply>>,
    requests: Vec<ReceivedRequest>,
}

pub struct MockBroker {
    pub node_id: i32,
    pub addr: BrokerAddress,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl MockBroker {
    pub async fn start(node_id: i32) -> MockBroker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(State::default()));

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        MockBroker {
            node_id,
            addr: BrokerAddress {
                host: "127.0.0.1".to_owned(),
                port,
            },
            state,
            task,
        }
    }

    pub fn set_metadata(&self, body: Vec<u8>) {
        self.state.lock().unwrap().metadata = body;
    }

    pub fn push_reply(&self, api_key: i16, reply: Reply) {
        self.state
            .lock()
            .unwrap()
            .replies
            .entry(api_key)
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self, api_key: i16) -> Vec<ReceivedRequest> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.api_key == api_key)
            .cloned()
            .collect()
    }

    /// Wait until at least `n` requests with `api_key` have arrived.
    pub async fn wait_for_requests(&self, api_key: i16, n: usize, limit: Duration) {
        let waited = tokio::time::timeout(limit, async {
            while self.requests(api_key).len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            waited.is_ok(),
            "broker {} got {} requests with api key {}, expected {}",
            self.node_id,
            self.requests(api_key).len(),
            api_key,
            n
        );
    }

    pub fn produce_requests(&self) -> Vec<ProducedRequest> {
        self.requests(PRODUCE)
            .iter()
            .map(|r| decode_produce(&r.body))
            .collect()
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<State>>) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(writer));
    loop {
        let size = match reader.read_i32().await {
            Ok(size) => size,
            Err(_) => return,
        };
        let mut frame = vec![0u8; size as usize];
        if reader.read_exact(&mut frame).await.is_err() {
            return;
        }

        let mut buf = Bytes::from(frame);
        let api_key = buf.get_i16();
        let api_version = buf.get_i16();
        let correlation_id = buf.get_i32();
        let client_id_len = buf.get_i16() as usize;
        let client_id = String::from_utf8_lossy(&buf.split_to(client_id_len)).into_owned();
        let request = ReceivedRequest {
            api_key,
            api_version,
            correlation_id,
            client_id,
            body: buf,
        };

        let reply = {
            let mut state = state.lock().unwrap();
            state.requests.push(request.clone());
            next_reply(&mut state, &request)
        };
        if let Some(reply) = reply {
            tokio::spawn(respond(writer.clone(), correlation_id, reply));
        }
    }
}

fn next_reply(state: &mut State, request: &ReceivedRequest) -> Option<Reply> {
    if request.api_key == PRODUCE && decode_produce(&request.body).acks == 0 {
        return None;
    }
    if let Some(reply) = state
        .replies
        .get_mut(&request.api_key)
        .and_then(VecDeque::pop_front)
    {
        return Some(reply);
    }
    match request.api_key {
        METADATA => Some(Reply::Body(state.metadata.clone())),
        PRODUCE => Some(Reply::Body(ack_all(&request.body))),
        _ => None,
    }
}

async fn respond(
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    correlation_id: i32,
    reply: Reply,
) {
    let (correlation_id, body) = match reply {
        Reply::Body(body) => (correlation_id, body),
        Reply::Delayed(delay, body) => {
            tokio::time::sleep(delay).await;
            (correlation_id, body)
        }
        Reply::Hang => return,
        Reply::Close => {
            let _ = writer.lock().await.shutdown().await;
            return;
        }
        Reply::WrongCorrelationId(body) => (correlation_id.wrapping_add(1000), body),
    };

    let mut frame = Vec::with_capacity(body.len() + 8);
    frame.put_i32(body.len() as i32 + 4);
    frame.put_i32(correlation_id);
    frame.extend_from_slice(&body);
    let _ = writer.lock().await.write_all(&frame).await;
}

pub struct PartitionSpec {
    pub error: i16,
    pub id: i32,
    pub leader: i32,
}

pub struct TopicSpec {
    pub name: String,
    pub error: i16,
    pub partitions: Vec<PartitionSpec>,
}

/// A topic whose partition `i` is led by `leaders[i]`.
pub fn topic(name: &str, leaders: &[i32]) -> TopicSpec {
    TopicSpec {
        name: name.to_owned(),
        error: 0,
        partitions: leaders
            .iter()
            .enumerate()
            .map(|(id, leader)| PartitionSpec {
                error: 0,
                id: id as i32,
                leader: *leader,
            })
            .collect(),
    }
}

impl TopicSpec {
    /// Report `error` and no leader for partition `id`.
    pub fn partition_error(mut self, id: i32, error: i16) -> Self {
        for p in self.partitions.iter_mut().filter(|p| p.id == id) {
            p.error = error;
            p.leader = -1;
        }
        self
    }

    pub fn error(mut self, error: i16) -> Self {
        self.error = error;
        self.partitions.clear();
        self
    }
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.extend_from_slice(s.as_bytes());
}

pub fn metadata_body(brokers: &[&MockBroker], topics: &[TopicSpec]) -> Vec<u8> {
    let mut buf = vec![];
    buf.put_i32(brokers.len() as i32);
    for broker in brokers {
        buf.put_i32(broker.node_id);
        put_string(&mut buf, &broker.addr.host);
        buf.put_i32(broker.addr.port as i32);
    }
    buf.put_i32(topics.len() as i32);
    for topic in topics {
        buf.put_i16(topic.error);
        put_string(&mut buf, &topic.name);
        buf.put_i32(topic.partitions.len() as i32);
        for p in topic.partitions.iter() {
            buf.put_i16(p.error);
            buf.put_i32(p.id);
            buf.put_i32(p.leader);
            let replicas: &[i32] = if p.leader >= 0 { &[p.leader] } else { &[] };
            for _ in 0..2 {
                // replicas, then isr
                buf.put_i32(replicas.len() as i32);
                for r in replicas {
                    buf.put_i32(*r);
                }
            }
        }
    }
    buf
}

/// A produce response body with one `(topic, partition, error)` entry per
/// partition, grouped by topic in order of first appearance.
pub fn produce_body(partitions: &[(&str, i32, i16)]) -> Vec<u8> {
    let mut topics: Vec<(&str, Vec<(i32, i16)>)> = vec![];
    for (name, partition, error) in partitions {
        match topics.iter_mut().find(|(t, _)| t == name) {
            Some((_, ps)) => ps.push((*partition, *error)),
            None => topics.push((*name, vec![(*partition, *error)])),
        }
    }

    let mut buf = vec![];
    buf.put_i32(topics.len() as i32);
    for (name, ps) in topics {
        put_string(&mut buf, name);
        buf.put_i32(ps.len() as i32);
        for (partition, error) in ps {
            buf.put_i32(partition);
            buf.put_i16(error);
            buf.put_i64(0);
        }
    }
    buf
}

fn ack_all(body: &Bytes) -> Vec<u8> {
    let request = decode_produce(body);
    let mut seen: Vec<(&str, i32, i16)> = vec![];
    for m in request.messages.iter() {
        if !seen
            .iter()
            .any(|(t, p, _)| *t == m.topic.as_str() && *p == m.partition)
        {
            seen.push((m.topic.as_str(), m.partition, 0));
        }
    }
    produce_body(&seen)
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProducedMessage {
    pub topic: String,
    pub partition: i32,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

#[derive(Clone, Debug)]
pub struct ProducedRequest {
    pub acks: i16,
    pub timeout_ms: i32,
    pub messages: Vec<ProducedMessage>,
}

impl ProducedRequest {
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.messages.iter().map(|m| m.topic.clone()).collect();
        topics.dedup();
        topics
    }
}

fn get_bytes(buf: &mut Bytes) -> Option<Bytes> {
    let len = buf.get_i32();
    if len < 0 {
        None
    } else {
        Some(buf.split_to(len as usize))
    }
}

pub fn decode_produce(body: &Bytes) -> ProducedRequest {
    let mut buf = body.clone();
    let acks = buf.get_i16();
    let timeout_ms = buf.get_i32();
    let mut messages = vec![];

    for _ in 0..buf.get_i32() {
        let len = buf.get_i16() as usize;
        let topic = String::from_utf8_lossy(&buf.split_to(len)).into_owned();
        for _ in 0..buf.get_i32() {
            let partition = buf.get_i32();
            let set_size = buf.get_i32() as usize;
            let mut set = buf.split_to(set_size);
            while set.has_remaining() {
                let _offset = set.get_i64();
                let size = set.get_i32() as usize;
                let mut message = set.split_to(size);
                let _crc = message.get_i32();
                let _magic = message.get_i8();
                let _attributes = message.get_i8();
                let key = get_bytes(&mut message);
                let value = get_bytes(&mut message);
                messages.push(ProducedMessage {
                    topic: topic.clone(),
                    partition,
                    key,
                    value,
                });
            }
        }
    }

    ProducedRequest {
        acks,
        timeout_ms,
        messages,
    }
}
