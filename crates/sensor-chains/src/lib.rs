//! SDN Sensor Classification Chains
//!
//! Three independent ways of picking packets out of the stream, each entry
//! owning the output queue its matches are published to:
//!
//! - **Filter chain**: pcap-style expressions compiled once and run over the
//!   raw frame
//! - **Pattern chain**: regular expressions over string fields of the header
//!   record (DNS names and answers), with an invert flag
//! - **Address table**: exact host lookups backed by longest-prefix tries,
//!   for IPv4 and IPv6
//!
//! Chains never short-circuit: every entry is tried for every packet, so one
//! packet can fan out to several queues.

pub mod address_table;
pub mod classifier;
pub mod filter;
pub mod filter_chain;
pub mod pattern_chain;
pub mod queue;

pub use address_table::{AddressEntry, AddressTable, AddressTableStats, LookupKind};
pub use classifier::{ChainKind, ChainSet, Classifier, MatchRecord};
pub use filter::FilterProgram;
pub use filter_chain::{FilterChain, FilterEntry};
pub use pattern_chain::{PatternChain, PatternEntry, PatternField};
pub use queue::{
    ContentType, InprocRegistry, OutputQueue, QueueDescriptor, QueueFormat, QueueStatsSnapshot,
    SocketKind,
};

use sensor_common::AtomicCounter;
use thiserror::Error;

/// Chain construction errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("invalid filter '{expression}': {reason}")]
    InvalidFilter { expression: String, reason: String },

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("duplicate prefix: {0}")]
    DuplicatePrefix(String),

    #[error("missing key: {0}")]
    MissingKey(&'static str),

    #[error("invalid entry: {0}")]
    InvalidEntry(String),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Output queue construction errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("missing key: {0}")]
    MissingKey(&'static str),

    #[error("unknown socket kind: {0}")]
    UnknownKind(String),

    #[error("socket kind {0} cannot publish")]
    ReceiveOnly(SocketKind),

    #[error("unknown queue format: {0}")]
    UnknownFormat(String),

    #[error("unknown content type: {0}")]
    UnknownContent(String),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChainError>;

/// Stable identifier of an entry within its chain
pub type EntryId = u32;

/// Fields every chain entry carries
#[derive(Debug)]
pub struct EntryCore {
    id: EntryId,
    name: String,
    matches: AtomicCounter,
    queue: OutputQueue,
}

impl EntryCore {
    pub(crate) fn new(id: EntryId, name: String, queue: OutputQueue) -> Self {
        Self {
            id,
            name,
            matches: AtomicCounter::default(),
            queue,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Packets this entry has matched
    pub fn matches(&self) -> u64 {
        self.matches.get()
    }

    pub fn queue(&self) -> &OutputQueue {
        &self.queue
    }

    #[inline(always)]
    pub(crate) fn record_match(&self) {
        self.matches.inc();
    }
}

/// Read a required string key from a chain entry
pub(crate) fn entry_str<'a>(entry: &'a serde_json::Value, key: &'static str) -> Result<&'a str> {
    entry
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or(ChainError::MissingKey(key))
}

/// Entry name, defaulting to the chain kind and position
pub(crate) fn entry_name(entry: &serde_json::Value, fallback: impl FnOnce() -> String) -> String {
    entry
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .unwrap_or_else(fallback)
}
