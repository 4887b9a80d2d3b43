//! The per-path metadata record stored as the index value. Field tags
//! are fixed: the encoding must round-trip byte-identically between
//! implementations, and decoders ignore unknown fields, so records may
//! grow new fields without breaking older peers.

use std::time::{SystemTime, UNIX_EPOCH};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Stat {
    /// File type and permission bits. Permissions are advisory.
    #[prost(uint32, tag = "1")]
    pub mode: u32,
    #[prost(uint32, tag = "2")]
    pub uid: u32,
    #[prost(uint32, tag = "3")]
    pub gid: u32,
    /// Content bytes (files only).
    #[prost(uint64, tag = "4")]
    pub size: u64,
    /// Content-log blocks occupied (files only).
    #[prost(uint64, tag = "5")]
    pub blocks: u64,
    /// First content-log block of this file.
    #[prost(uint64, tag = "6")]
    pub offset: u64,
    /// First content-log byte of this file.
    #[prost(uint64, tag = "7")]
    pub byte_offset: u64,
    #[prost(uint64, tag = "8")]
    pub mtime: u64,
    #[prost(uint64, tag = "9")]
    pub ctime: u64,
}

impl Stat {
    /// A file record covering the given content-log range.
    pub fn file(size: u64, blocks: u64, offset: u64, byte_offset: u64) -> Stat {
        let now = unix_millis();
        Stat {
            mode: S_IFREG | DEFAULT_FILE_MODE,
            uid: 0,
            gid: 0,
            size,
            blocks,
            offset,
            byte_offset,
            mtime: now,
            ctime: now,
        }
    }

    /// A directory record. It snapshots the content-log position at
    /// creation time but never consumes content bytes.
    pub fn directory(offset: u64, byte_offset: u64) -> Stat {
        let now = unix_millis();
        Stat {
            mode: S_IFDIR | DEFAULT_DIR_MODE,
            uid: 0,
            gid: 0,
            size: 0,
            blocks: 0,
            offset,
            byte_offset,
            mtime: now,
            ctime: now,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Replaces the permission bits, preserving the file-type bits.
    pub fn set_permissions(&mut self, mode: u32) {
        self.mode = (self.mode & S_IFMT) | (mode & !S_IFMT);
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
