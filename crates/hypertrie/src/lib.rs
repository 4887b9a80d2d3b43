//! A persistent key/value index stored inside an append-only feed.
//!
//! Block 0 is a header naming the protocol and carrying opaque caller
//! metadata. Every later block is one mutation: a keyed value, or a
//! tombstone. Live keys are tracked in an in-memory map that is
//! replayed from the feed on open and lazily caught up before every
//! operation, so mutations arriving through replication become visible
//! without any extra wiring.

mod trie;
pub use trie::{Trie, TrieOptions, Watcher};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("index header has not arrived yet")]
    AwaitingHeader,
    #[error("block 0 is not a valid index header")]
    BadHeader,
    #[error("version {version} exceeds feed length {length}")]
    BadVersion { version: u64, length: u64 },
    #[error(transparent)]
    Feed(#[from] hypercore::Error),
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
}

pub(crate) mod messages {
    pub const PROTOCOL: &str = "hypertrie";

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Header {
        #[prost(string, tag = "1")]
        pub protocol: String,
        /// Opaque caller metadata, e.g. a companion feed's public key.
        #[prost(bytes = "vec", tag = "2")]
        pub metadata: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Node {
        #[prost(string, tag = "1")]
        pub key: String,
        #[prost(bytes = "vec", tag = "2")]
        pub value: Vec<u8>,
        #[prost(bool, tag = "3")]
        pub deleted: bool,
    }
}
