pub mod replication;
pub mod storage;

mod feed;
pub use feed::{ByteRange, Event, Feed, FeedOptions};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("feed is not writable")]
    NotWritable,
    #[error("block {0} is out of bounds of feed length {1}")]
    OutOfBounds(u64, u64),
    #[error("block {0} failed hash verification")]
    Corrupt(u64),
    #[error("block {0} failed signature verification")]
    BadSignature(u64),
    #[error("remote block {index} does not extend local length {length}")]
    NonContiguous { index: u64, length: u64 },
    #[error("stored key {stored} does not match requested key {requested}")]
    KeyMismatch { stored: String, requested: String },
    #[error("invalid key material: {0}")]
    BadKey(&'static str),
    #[error("replication protocol: {0}")]
    Protocol(&'static str),
    #[error(transparent)]
    Decode(#[from] prost::DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
