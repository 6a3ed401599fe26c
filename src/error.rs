//! Error types for producing, routing and decoding.
use std::{fmt, io::ErrorKind};

use bytes::Bytes;
use num_traits::FromPrimitive;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while talking to the cluster.
///
/// Errors are cheap to clone so that a single failure can be reported
/// once for every record that was part of the affected batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The topic (or its partition) could not be resolved to a leader,
    /// even after refreshing the cluster metadata.
    RoutingError(String),
    /// Transport failure talking to a broker. The connection is unusable.
    ConnectionError(ErrorKind),
    /// A response arrived for a correlation id nobody is waiting on.
    /// The connection is desynchronised and must be discarded.
    UnexpectedCorrelationId(i32),
    /// A response could not be decoded.
    MalformedResponse(Bytes),
    /// The producer has been closed.
    ProducerClosed,
    /// An error code reported by the broker.
    KafkaError(KafkaCode),
    EncodingError,
    DecodingUtf8Error,
    MissingBrokerConfigOptions,
    InvalidBrokerAddress(String),
    NoConnectionForBroker(i32),
    /// The produce response did not mention a partition we wrote to.
    MissingPartitionResponse(String, i32),
}

impl Error {
    /// Whether the connection that produced this error must be thrown away.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionError(_)
                | Error::UnexpectedCorrelationId(_)
                | Error::MalformedResponse(_)
        )
    }

    /// Whether this error means our view of partition leadership is stale.
    pub fn is_stale_metadata(&self) -> bool {
        match self {
            Error::KafkaError(code) => code.is_stale_metadata(),
            err => err.is_connection_fatal(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::RoutingError(topic) => {
                write!(f, "could not route message for topic {topic} to a leader")
            }
            Error::ConnectionError(kind) => write!(f, "broker connection failed: {kind}"),
            Error::UnexpectedCorrelationId(id) => {
                write!(f, "received response for unknown correlation id {id}")
            }
            Error::MalformedResponse(bytes) => {
                write!(f, "malformed response of {} bytes", bytes.len())
            }
            Error::ProducerClosed => write!(f, "producer is closed"),
            Error::KafkaError(code) => {
                write!(f, "broker returned error {:?} (code {})", code, code.code())
            }
            Error::EncodingError => write!(f, "request could not be encoded"),
            Error::DecodingUtf8Error => write!(f, "response contained invalid utf-8"),
            Error::MissingBrokerConfigOptions => write!(f, "no broker addresses configured"),
            Error::InvalidBrokerAddress(addr) => write!(f, "invalid broker address {addr}"),
            Error::NoConnectionForBroker(id) => write!(f, "no known address for broker {id}"),
            Error::MissingPartitionResponse(topic, partition) => write!(
                f,
                "produce response is missing topic {topic} partition {partition}"
            ),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::ConnectionError(err.kind())
    }
}

macro_rules! kafka_codes {
    ($($name:ident = $code:literal,)+) => {
        /// Error codes the broker can answer with.
        ///
        /// Codes without a name here are kept as [`KafkaCode::Other`] so the
        /// caller still sees exactly what the broker said.
        ///
        /// See the [protocol error codes](https://kafka.apache.org/protocol.html#protocol_error_codes).
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum KafkaCode {
            $($name,)+
            Other(i16),
        }

        impl KafkaCode {
            /// The code as it appears on the wire.
            pub fn code(&self) -> i16 {
                match self {
                    $(KafkaCode::$name => $code,)+
                    KafkaCode::Other(code) => *code,
                }
            }
        }

        impl FromPrimitive for KafkaCode {
            fn from_i64(n: i64) -> Option<Self> {
                let n = i16::try_from(n).ok()?;
                Some(match n {
                    $($code => KafkaCode::$name,)+
                    other => KafkaCode::Other(other),
                })
            }

            fn from_u64(n: u64) -> Option<Self> {
                i64::try_from(n).ok().and_then(Self::from_i64)
            }
        }
    };
}

kafka_codes! {
    Unknown = -1,
    None = 0,
    OffsetOutOfRange = 1,
    CorruptMessage = 2,
    UnknownTopicOrPartition = 3,
    InvalidFetchSize = 4,
    LeaderNotAvailable = 5,
    NotLeaderForPartition = 6,
    RequestTimedOut = 7,
    BrokerNotAvailable = 8,
    ReplicaNotAvailable = 9,
    MessageSizeTooLarge = 10,
    StaleControllerEpoch = 11,
    OffsetMetadataTooLarge = 12,
    NetworkException = 13,
    CoordinatorLoadInProgress = 14,
    CoordinatorNotAvailable = 15,
    NotCoordinator = 16,
    InvalidTopicException = 17,
    RecordListTooLarge = 18,
    NotEnoughReplicas = 19,
    NotEnoughReplicasAfterAppend = 20,
    InvalidRequiredAcks = 21,
    IllegalGeneration = 22,
    InconsistentGroupProtocol = 23,
    InvalidGroupId = 24,
    UnknownMemberId = 25,
    InvalidSessionTimeout = 26,
    RebalanceInProgress = 27,
    InvalidCommitOffsetSize = 28,
    TopicAuthorizationFailed = 29,
    GroupAuthorizationFailed = 30,
    ClusterAuthorizationFailed = 31,
    InvalidTimestamp = 32,
    UnsupportedSaslMechanism = 33,
    IllegalSaslState = 34,
    UnsupportedVersion = 35,
}

impl KafkaCode {
    /// Codes after which cached leadership can no longer be trusted.
    pub fn is_stale_metadata(&self) -> bool {
        matches!(
            self,
            KafkaCode::UnknownTopicOrPartition
                | KafkaCode::LeaderNotAvailable
                | KafkaCode::NotLeaderForPartition
        )
    }
}
