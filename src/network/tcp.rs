use std::{
    collections::HashMap,
    fmt, io,
    io::ErrorKind,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::{net::TcpStream, sync::oneshot, task::JoinHandle, time::timeout};
use tracing::instrument;

use super::{BrokerAddress, BrokerConnection};
use crate::{
    encode::ToByte,
    error::{Error, Result},
    protocol::{HeaderRequest, Request},
    DEFAULT_CLIENT_ID, DEFAULT_CORRELATION_ID,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Largest response frame accepted from a broker.
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Settings shared by every [`TcpConnection`] a client opens.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde_derive::Deserialize))]
pub struct TcpConfig {
    /// Sent in the header of every request.
    pub client_id: String,
    /// How long to wait for the TCP handshake.
    pub connect_timeout: Duration,
    /// How long to wait for a response before the connection is
    /// considered dead.
    pub request_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_ID)
    }
}

impl TcpConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

type ResponseSlot = oneshot::Sender<Result<Bytes>>;

/// Requests waiting for a response, keyed by correlation id.
#[derive(Default)]
struct InFlight {
    slots: Mutex<HashMap<i32, ResponseSlot>>,
    closed: AtomicBool,
}

impl InFlight {
    fn slots(&self) -> MutexGuard<'_, HashMap<i32, ResponseSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, correlation_id: i32) -> Result<oneshot::Receiver<Result<Bytes>>> {
        let mut slots = self.slots();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionError(ErrorKind::NotConnected));
        }
        let (tx, rx) = oneshot::channel();
        slots.insert(correlation_id, tx);
        Ok(rx)
    }

    fn forget(&self, correlation_id: i32) {
        self.slots().remove(&correlation_id);
    }

    /// Hand `frame` to whoever is waiting on `correlation_id`.
    fn resolve(&self, correlation_id: i32, frame: Bytes) -> bool {
        match self.slots().remove(&correlation_id) {
            Some(slot) => {
                // the sender may have given up already, that is fine
                let _ = slot.send(Ok(frame));
                true
            }
            None => false,
        }
    }

    /// Mark the connection dead and fail everything still waiting.
    fn fail_all(&self, err: Error) {
        let drained: Vec<ResponseSlot> = {
            let mut slots = self.slots();
            self.closed.store(true, Ordering::Release);
            slots.drain().map(|(_, slot)| slot).collect()
        };
        if !drained.is_empty() {
            tracing::warn!("Failing {} in-flight requests: {}", drained.len(), err);
        }
        for slot in drained {
            let _ = slot.send(Err(err.clone()));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Multiplexed TCP connection to a Kafka/Redpanda broker.
///
/// Cloning the connection shares the socket. A background task reads
/// response frames and routes them by correlation id, so any number of
/// requests can be outstanding at once and responses may come back in
/// any order.
///
/// Once the connection fails (I/O error, timeout, or a response for an
/// unknown correlation id) every waiting request gets the error and the
/// connection refuses further requests. Open a new one instead.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<Inner>,
}

struct Inner {
    addr: BrokerAddress,
    config: TcpConfig,
    stream: Arc<TcpStream>,
    // one frame is written at a time
    write_lock: tokio::sync::Mutex<()>,
    in_flight: Arc<InFlight>,
    next_correlation_id: AtomicI32,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("addr", &self.inner.addr)
            .field("closed", &self.inner.in_flight.is_closed())
            .finish()
    }
}

impl TcpConnection {
    /// Connect to a Kafka/Redpanda broker.
    ///
    /// ### Example
    /// ```rust,ignore
    /// let addr = "localhost:9092".parse()?;
    /// let conn = ferry::prelude::TcpConnection::connect(TcpConfig::default(), addr).await?;
    /// ```
    #[instrument(level = "debug", skip(config))]
    pub async fn connect(config: TcpConfig, addr: BrokerAddress) -> Result<Self> {
        tracing::debug!("Connecting to {}", addr);
        let stream = timeout(
            config.connect_timeout,
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await
        .map_err(|_| {
            tracing::warn!("Timed out connecting to {}", addr);
            Error::ConnectionError(ErrorKind::TimedOut)
        })?
        .map_err(|err| {
            tracing::warn!("Could not connect to {}: {:?}", addr, err);
            Error::ConnectionError(err.kind())
        })?;
        stream.set_nodelay(true)?;

        let stream = Arc::new(stream);
        let in_flight = Arc::new(InFlight::default());
        let reader = tokio::spawn(read_responses(
            stream.clone(),
            in_flight.clone(),
            addr.clone(),
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                addr,
                config,
                stream,
                write_lock: tokio::sync::Mutex::new(()),
                in_flight,
                next_correlation_id: AtomicI32::new(DEFAULT_CORRELATION_ID),
                reader,
            }),
        })
    }

    fn next_correlation_id(&self) -> i32 {
        self.inner
            .next_correlation_id
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Frame a request: size, header, body.
    fn encode_frame<R: Request>(&self, correlation_id: i32, req: &R) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(64);
        buffer.extend_from_slice(&[0, 0, 0, 0]);
        HeaderRequest::for_request::<R>(correlation_id, &self.inner.config.client_id)
            .encode(&mut buffer)?;
        req.encode(&mut buffer)?;

        let size = i32::try_from(buffer.len() - 4).map_err(|_| Error::EncodingError)?;
        size.encode(&mut &mut buffer[..4])?;
        Ok(buffer)
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        if let Err(err) = write(&self.inner.stream, frame).await {
            self.inner.in_flight.fail_all(err.clone());
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for TcpConnection {
    type ConnConfig = TcpConfig;

    async fn from_addr(config: Self::ConnConfig, addr: BrokerAddress) -> Result<Self> {
        Self::connect(config, addr).await
    }

    async fn send_request<R: Request>(&self, req: &R) -> Result<Bytes> {
        let correlation_id = self.next_correlation_id();
        let frame = self.encode_frame(correlation_id, req)?;
        let response = self.inner.in_flight.register(correlation_id)?;

        tracing::trace!(
            "Sending request {} ({} bytes) to {}",
            correlation_id,
            frame.len(),
            self.inner.addr
        );
        if let Err(err) = self.write_frame(&frame).await {
            self.inner.in_flight.forget(correlation_id);
            return Err(err);
        }

        match timeout(self.inner.config.request_timeout, response).await {
            Ok(Ok(result)) => result,
            // the reader went away without answering
            Ok(Err(_)) => Err(Error::ConnectionError(ErrorKind::ConnectionAborted)),
            Err(_) => {
                tracing::warn!(
                    "Request {} to {} timed out after {:?}",
                    correlation_id,
                    self.inner.addr,
                    self.inner.config.request_timeout
                );
                self.inner.in_flight.forget(correlation_id);
                let err = Error::ConnectionError(ErrorKind::TimedOut);
                self.inner.in_flight.fail_all(err.clone());
                Err(err)
            }
        }
    }

    async fn send_request_without_response<R: Request>(&self, req: &R) -> Result<()> {
        if self.inner.in_flight.is_closed() {
            return Err(Error::ConnectionError(ErrorKind::NotConnected));
        }
        let correlation_id = self.next_correlation_id();
        let frame = self.encode_frame(correlation_id, req)?;
        self.write_frame(&frame).await
    }

    fn addr(&self) -> &BrokerAddress {
        &self.inner.addr
    }

    fn is_closed(&self) -> bool {
        self.inner.in_flight.is_closed()
    }

    async fn close(&self) {
        tracing::debug!("Closing connection to {}", self.inner.addr);
        self.inner
            .in_flight
            .fail_all(Error::ConnectionError(ErrorKind::NotConnected));
        self.inner.reader.abort();
    }
}

/// Background loop routing response frames to their waiting requests.
async fn read_responses(stream: Arc<TcpStream>, in_flight: Arc<InFlight>, addr: BrokerAddress) {
    let err = loop {
        let frame = match read_frame(&stream).await {
            Ok(frame) => frame,
            Err(err) => break err,
        };
        if frame.len() < 4 {
            break Error::MalformedResponse(frame);
        }
        let correlation_id = (&frame[..4]).get_i32();
        tracing::trace!("Received response {} from {}", correlation_id, addr);
        if !in_flight.resolve(correlation_id, frame) {
            tracing::error!(
                "ERROR: Response {} from {} matches no request, dropping connection",
                correlation_id,
                addr
            );
            break Error::UnexpectedCorrelationId(correlation_id);
        }
    };
    tracing::debug!("Connection to {} is done: {}", addr, err);
    in_flight.fail_all(err);
}

async fn read_frame(stream: &TcpStream) -> Result<Bytes> {
    // figure out the message size
    let mut size = read(stream, 4).await?;
    let length = usize::try_from(size.get_i32())
        .map_err(|_| Error::MalformedResponse(Bytes::new()))?;
    if length > MAX_FRAME_SIZE {
        tracing::error!("ERROR: Refusing a {} byte frame", length);
        return Err(Error::MalformedResponse(Bytes::new()));
    }
    tracing::trace!("Reading {} bytes", length);
    Ok(read(stream, length).await?.freeze())
}

#[instrument(name = "network-read", level = "trace", skip(stream))]
async fn read(stream: &TcpStream, size: usize) -> Result<BytesMut> {
    let mut buf = BytesMut::zeroed(size);
    let mut index = 0_usize;
    while index < size {
        // Wait for the socket to be readable
        stream.readable().await?;

        // Try to read data, this may still fail with `WouldBlock`
        // if the readiness event is a false positive.
        match stream.try_read(&mut buf[index..]) {
            Ok(0) => {
                tracing::debug!("Socket closed by peer");
                return Err(Error::ConnectionError(ErrorKind::UnexpectedEof));
            }
            Ok(n) => {
                index += n;
                tracing::trace!("Read {} bytes, {} left", n, size - index);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                continue;
            }
            Err(e) => {
                tracing::error!("ERROR: Reading on Socket {:?}", e);
                return Err(Error::ConnectionError(e.kind()));
            }
        }
    }
    Ok(buf)
}

#[instrument(name = "network-write", level = "trace", skip(stream, buf))]
async fn write(stream: &TcpStream, buf: &[u8]) -> Result<()> {
    let size = buf.len();
    let mut index = 0_usize;
    while index < size {
        // Wait for the socket to be writable
        stream.writable().await?;

        // Try to write data, this may still fail with `WouldBlock`
        // if the readiness event is a false positive.
        match stream.try_write(&buf[index..]) {
            Ok(n) => {
                index += n;
                tracing::trace!("Wrote {} bytes, {} left", n, size - index);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                continue;
            }
            Err(e) => {
                tracing::error!("ERROR: Writing to Socket {:?}", e);
                return Err(Error::ConnectionError(e.kind()));
            }
        }
    }
    Ok(())
}
