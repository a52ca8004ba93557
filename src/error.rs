//! Errors raised by the processing engine and its collaborators.

use std::fmt;

use crate::types::{Offset, Partition, Topic};

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
///
/// The orchestrator uses this to tell a misconfigured deployment apart from a
/// framework bug or a broker hiccup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The processor was set up wrong. Nothing will fix this at runtime.
    Configuration,
    /// Tracking state and the broker client disagree.
    InvariantViolation,
    /// A key or value could not be encoded or decoded.
    Codec,
    /// The broker client reported a failure.
    Broker,
    /// A partition worker stopped abnormally.
    Worker,
    /// A key-value store operation failed.
    Store,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidConfig(String),
    MissingCodec(Topic),
    EncodingError(String),
    DecodingError(String),
    UnknownGroup {
        topic: Topic,
        sequence: u64,
    },
    UnknownSubmission {
        topic: Topic,
        sequence: u64,
        slot: usize,
    },
    DuplicateCompletion {
        topic: Topic,
        sequence: u64,
        slot: usize,
    },
    OutOfOrderGroup {
        topic: Topic,
        offset: Offset,
        tail: Offset,
    },
    SendFailed {
        topic: Topic,
        partition: Partition,
        reason: String,
    },
    ProducerClosed,
    UnknownTopicOrPartition(Topic, Partition),
    OffsetOutOfRange {
        topic: Topic,
        partition: Partition,
        offset: Offset,
    },
    BrokerError(String),
    PartitionFailed {
        partition: Partition,
        source: Box<Error>,
    },
    WorkerPanicked(String),
    StoreError(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfig(_) | Error::MissingCodec(_) => ErrorKind::Configuration,
            Error::EncodingError(_) | Error::DecodingError(_) => ErrorKind::Codec,
            Error::UnknownGroup { .. }
            | Error::UnknownSubmission { .. }
            | Error::DuplicateCompletion { .. }
            | Error::OutOfOrderGroup { .. } => ErrorKind::InvariantViolation,
            Error::SendFailed { .. }
            | Error::ProducerClosed
            | Error::UnknownTopicOrPartition(_, _)
            | Error::OffsetOutOfRange { .. }
            | Error::BrokerError(_) => ErrorKind::Broker,
            Error::PartitionFailed { source, .. } => source.kind(),
            Error::WorkerPanicked(_) => ErrorKind::Worker,
            Error::StoreError(_) => ErrorKind::Store,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
            Error::MissingCodec(topic) => write!(f, "could not find codec for topic '{}'", topic),
            Error::EncodingError(reason) => write!(f, "could not encode record: {}", reason),
            Error::DecodingError(reason) => write!(f, "could not decode record: {}", reason),
            Error::UnknownGroup { topic, sequence } => write!(
                f,
                "could not find in-flight group {} for topic '{}'",
                sequence, topic
            ),
            Error::UnknownSubmission {
                topic,
                sequence,
                slot,
            } => write!(
                f,
                "could not find submission {} of in-flight group {} for topic '{}'",
                slot, sequence, topic
            ),
            Error::DuplicateCompletion {
                topic,
                sequence,
                slot,
            } => write!(
                f,
                "submission {} of in-flight group {} for topic '{}' completed twice",
                slot, sequence, topic
            ),
            Error::OutOfOrderGroup {
                topic,
                offset,
                tail,
            } => write!(
                f,
                "offset {} for topic '{}' arrived after offset {}",
                offset, topic, tail
            ),
            Error::SendFailed {
                topic,
                partition,
                reason,
            } => write!(
                f,
                "send to topic '{}' partition {} failed: {}",
                topic, partition, reason
            ),
            Error::ProducerClosed => write!(f, "producer has hung up channel"),
            Error::UnknownTopicOrPartition(topic, partition) => {
                write!(f, "unknown topic '{}' or partition {}", topic, partition)
            }
            Error::OffsetOutOfRange {
                topic,
                partition,
                offset,
            } => write!(
                f,
                "offset {} is out of range for topic '{}' partition {}",
                offset, topic, partition
            ),
            Error::BrokerError(reason) => write!(f, "broker error: {}", reason),
            Error::PartitionFailed { partition, source } => {
                write!(f, "partition {} failed: {}", partition, source)
            }
            Error::WorkerPanicked(reason) => write!(f, "partition worker panicked: {}", reason),
            Error::StoreError(reason) => write!(f, "store error: {}", reason),
        }
    }
}

impl std::error::Error for Error {}
