//! Bytecode protocol requests & responses.
//!
//! This module implements the two message pairs the producer needs from
//! the [Kafka protocol](https://kafka.apache.org/protocol.html): Metadata,
//! to learn which broker leads which partition, and Produce, to write
//! message sets.
//!
//! Each pair lives in its own module with a request file holding the
//! structs and encoding, and a response file holding the parsing.
//!
//! Request bodies do not carry their own header. The connection that
//! sends them stamps a [`HeaderRequest`] with a fresh correlation id, so
//! that many requests can be in flight on one socket at once.

pub mod metadata;
pub mod produce;

use bytes::BufMut;
use nom::{number::complete::be_i32, IResult};
use nombytes::NomBytes;

pub use self::{
    metadata::{request::MetadataRequest, response::MetadataResponse},
    produce::{request::ProduceRequest, response::ProduceResponse},
};
use crate::{encode::ToByte, error::Result};

/// A request body that can be framed and sent to a broker.
pub trait Request: ToByte + Send + Sync {
    /// The API key of this request.
    const API_KEY: i16;
    /// The API version of this request.
    const API_VERSION: i16;
}

#[derive(Debug, Clone)]
pub struct HeaderRequest<'a> {
    /// The API key of this request.
    pub api_key: i16,
    /// The API version of this request.
    pub api_version: i16,
    /// The correlation ID of this request.
    pub correlation_id: i32,
    /// The client ID string.
    pub client_id: &'a str,
}

impl<'a> HeaderRequest<'a> {
    /// Create the header for a request of type `R`.
    pub fn for_request<R: Request>(correlation_id: i32, client_id: &'a str) -> HeaderRequest<'a> {
        HeaderRequest {
            api_key: R::API_KEY,
            api_version: R::API_VERSION,
            correlation_id,
            client_id,
        }
    }
}

impl<'a> ToByte for HeaderRequest<'a> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.api_key.encode(buffer)?;
        self.api_version.encode(buffer)?;
        self.correlation_id.encode(buffer)?;
        self.client_id.encode(buffer)?;
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct HeaderResponse {
    /// The correlation ID of this response.
    pub correlation_id: i32,
}

pub fn parse_header_response(s: NomBytes) -> IResult<NomBytes, HeaderResponse> {
    let (s, correlation_id) = be_i32(s)?;
    Ok((s, HeaderResponse { correlation_id }))
}
