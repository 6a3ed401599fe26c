//! Encoding and creation for Metadata requests.
//!
//! ### Example
//! ```rust,ignore
//! let metadata_request = protocol::MetadataRequest::new(&topics);
//! let response_bytes = conn.send_request(&metadata_request).await?;
//! ```
//!
//! ### Protocol Def
//! ```text
//! Metadata Request (Version: 0) => [topics]
//!   topics => name
//!   name => STRING
//! ```
//!
//! An empty topic list asks for every topic in the cluster.

use bytes::BufMut;

use crate::{
    encode::{AsStrings, ToByte},
    error::Result,
    protocol::Request,
};

const API_KEY_METADATA: i16 = 3;
const API_VERSION: i16 = 0;

/// The base Metadata request object.
#[derive(Debug)]
pub struct MetadataRequest<'a, T> {
    /// The topics to fetch metadata for.
    pub topics: &'a [T],
}

impl<'a, T: AsRef<str>> MetadataRequest<'a, T> {
    pub fn new(topics: &'a [T]) -> MetadataRequest<'a, T> {
        MetadataRequest { topics }
    }
}

impl<'a, T: AsRef<str> + 'a> ToByte for MetadataRequest<'a, T> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        AsStrings(self.topics).encode(buffer)
    }
}

impl<'a, T: AsRef<str> + Send + Sync + 'a> Request for MetadataRequest<'a, T> {
    const API_KEY: i16 = API_KEY_METADATA;
    const API_VERSION: i16 = API_VERSION;
}
