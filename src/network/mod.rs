//! Connection & communication with a broker.
//!
//! # Network Module
//!
//! Kafka uses a binary protocol over TCP. The protocol defines all APIs as
//! request response message pairs. All messages are size delimited and are
//! made up of the following primitive types.
//!
//! The client initiates a socket connection and then writes a sequence of
//! request messages and reads back the corresponding response message. No
//! handshake is required on connection or disconnection.
//!
//! Every request carries a correlation id which the broker echoes back in
//! its response. A [`BrokerConnection`] uses that id to hand each response
//! to whoever sent the matching request, so many callers can share one
//! socket and have requests in flight at the same time. A response whose
//! id nobody is waiting for means the stream is out of sync; such a
//! connection is closed and never reused.
//!
//! The client will likely need to maintain a connection to multiple brokers,
//! as data is partitioned and the clients will need to talk to the server
//! that has their data. The [`Client`](crate::prelude::Client) keeps one
//! connection per broker id.
use std::{fmt, str::FromStr};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    error::{Error, Result},
    protocol::Request,
};

pub mod tcp;

/// Where a broker can be reached.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde_derive::Deserialize))]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BrokerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidBrokerAddress(s.to_owned()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidBrokerAddress(s.to_owned()))?;
        if host.is_empty() {
            return Err(Error::InvalidBrokerAddress(s.to_owned()));
        }
        Ok(BrokerAddress {
            host: host.to_owned(),
            port,
        })
    }
}

/// One logical connection to one broker.
///
/// Implementations are cheap handles: cloning shares the underlying
/// connection. All methods take `&self` so that many tasks can send
/// through the same handle concurrently.
#[async_trait]
pub trait BrokerConnection: Clone + fmt::Debug + Send + Sync + 'static {
    type ConnConfig: Clone + fmt::Debug + Send + Sync;

    /// Connect to the broker at `addr`.
    async fn from_addr(config: Self::ConnConfig, addr: BrokerAddress) -> Result<Self>;

    /// Send a request and wait for its response.
    ///
    /// Returns the full response frame, starting with the correlation id.
    async fn send_request<R: Request>(&self, req: &R) -> Result<Bytes>;

    /// Send a request the broker will not answer, such as a produce
    /// request with no required acknowledgements.
    async fn send_request_without_response<R: Request>(&self, req: &R) -> Result<()>;

    /// The address this connection was opened to.
    fn addr(&self) -> &BrokerAddress;

    /// Whether the connection has failed or been closed.
    fn is_closed(&self) -> bool;

    /// Close the connection, failing any request still waiting on it.
    async fn close(&self);
}
