//! A versioned, peer-to-peer drive: POSIX-shaped file operations over
//! two append-only signed logs. The metadata log carries a persistent
//! path index whose header names the content log, the content log
//! carries raw file bytes, and both derive from one root keypair so a
//! single public key identifies the whole drive.

mod drive;
mod keys;
mod path;
mod stat;
mod storage;

pub use drive::{
    Drive, DriveOptions, Event, ReadOptions, ReplicateOptions, WriteOptions, WRITE_BLOCK_SIZE,
};
pub use hypertrie::Watcher;
pub use keys::derive_content_keypair;
pub use stat::Stat;
pub use storage::Storage;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such file or directory: '{0}'")]
    FileNotFound(String),
    #[error("directory is not empty: '{0}'")]
    DirectoryNotEmpty(String),
    #[error("checkout requires both logs and an index snapshot")]
    InvalidCheckout,
    #[error(transparent)]
    Feed(#[from] hypercore::Error),
    #[error(transparent)]
    Index(#[from] hypertrie::Error),
    #[error("malformed stat record for '{0}'")]
    BadStat(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
