use crate::storage::{RandomAccess, Volume};
use crate::{Error, Result};
use blake2::digest::consts::U32;
use blake2::digest::{FixedOutput, KeyInit, Update};
use blake2::{Blake2b, Blake2bMac, Digest};
use bytes::{Buf, Bytes};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

type Blake2b256 = Blake2b<U32>;

// Fixed-width tree record per block: byte offset (u64) | size (u32) | hash.
const TREE_ENTRY_SIZE: u64 = 8 + 4 + 32;
const SIGNATURE_SIZE: u64 = 64;

/// An append event, broadcast after every local or replicated append.
#[derive(Debug, Clone)]
pub enum Event {
    Append { length: u64, byte_length: u64 },
}

#[derive(Default)]
pub struct FeedOptions {
    /// Expected public key. Errors if storage holds a different feed.
    pub key: Option<[u8; 32]>,
    /// 64-byte keypair granting append rights.
    pub secret_key: Option<[u8; 64]>,
    /// Generate a fresh keypair when storage is empty and none is given.
    pub create: bool,
}

/// An append-only log of signed blocks over random-access storage.
///
/// Feeds are cheap clonable handles; the backing state lives as long as
/// any clone, which is how a drive and its checkouts share one log.
#[derive(Clone)]
pub struct Feed {
    shared: Arc<Shared>,
}

struct Shared {
    public: VerifyingKey,
    signing: Option<SigningKey>,
    state: RwLock<State>,
    events: broadcast::Sender<Event>,
}

struct State {
    data: Arc<dyn RandomAccess>,
    tree: Arc<dyn RandomAccess>,
    signatures: Arc<dyn RandomAccess>,
    length: u64,
    byte_length: u64,
}

/// A byte range over a run of blocks, as recorded by an index entry.
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub block_offset: u64,
    pub blocks: u64,
    /// Absolute feed byte offset of the first byte to yield.
    pub byte_offset: u64,
    pub byte_length: u64,
}

impl Feed {
    /// Opens the feed persisted under `volume`, or creates one.
    ///
    /// Key resolution order: an explicit `secret_key` option, then key
    /// material already in storage, then the `key` option (read-only),
    /// then a freshly generated keypair when `create` is set.
    pub fn open(volume: &dyn Volume, opts: FeedOptions) -> Result<Feed> {
        let key_file = volume.open("key")?;
        let secret_file = volume.open("secret_key")?;
        let data = volume.open("data")?;
        let tree = volume.open("tree")?;
        let signatures = volume.open("signatures")?;

        let stored_public: Option<[u8; 32]> = if key_file.len()? >= 32 {
            let buf = key_file.read_at(0, 32)?;
            Some(buf.try_into().expect("read of 32 bytes"))
        } else {
            None
        };
        let stored_secret: Option<[u8; 64]> = if secret_file.len()? >= 64 {
            let buf = secret_file.read_at(0, 64)?;
            Some(buf.try_into().expect("read of 64 bytes"))
        } else {
            None
        };

        let signing = match (opts.secret_key, stored_secret) {
            (Some(bytes), _) | (None, Some(bytes)) => Some(
                SigningKey::from_keypair_bytes(&bytes)
                    .map_err(|_| Error::BadKey("malformed 64-byte keypair"))?,
            ),
            (None, None) => None,
        };

        let public = match (&signing, stored_public, opts.key) {
            (Some(signing), _, _) => signing.verifying_key(),
            (None, Some(bytes), _) | (None, None, Some(bytes)) => {
                VerifyingKey::from_bytes(&bytes)
                    .map_err(|_| Error::BadKey("malformed 32-byte public key"))?
            }
            (None, None, None) => {
                if !opts.create {
                    return Err(Error::BadKey("no key in storage and create not requested"));
                }
                let signing = SigningKey::generate(&mut rand::rngs::OsRng);
                let public = signing.verifying_key();
                return Self::finish_open(
                    public,
                    Some(signing),
                    stored_public,
                    key_file,
                    secret_file,
                    data,
                    tree,
                    signatures,
                );
            }
        };

        if let Some(requested) = opts.key {
            if requested != public.to_bytes() {
                return Err(Error::KeyMismatch {
                    stored: hex::encode(public.to_bytes()),
                    requested: hex::encode(requested),
                });
            }
        }
        if let Some(stored) = stored_public {
            if stored != public.to_bytes() {
                return Err(Error::KeyMismatch {
                    stored: hex::encode(stored),
                    requested: hex::encode(public.to_bytes()),
                });
            }
        }

        Self::finish_open(
            public,
            signing,
            stored_public,
            key_file,
            secret_file,
            data,
            tree,
            signatures,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_open(
        public: VerifyingKey,
        signing: Option<SigningKey>,
        stored_public: Option<[u8; 32]>,
        key_file: Arc<dyn RandomAccess>,
        secret_file: Arc<dyn RandomAccess>,
        data: Arc<dyn RandomAccess>,
        tree: Arc<dyn RandomAccess>,
        signatures: Arc<dyn RandomAccess>,
    ) -> Result<Feed> {
        if stored_public.is_none() {
            key_file.write_at(0, &public.to_bytes())?;
        }
        if let Some(signing) = &signing {
            if secret_file.len()? < 64 {
                secret_file.write_at(0, &signing.to_keypair_bytes())?;
            }
        }

        let length = tree.len()? / TREE_ENTRY_SIZE;
        let byte_length = if length > 0 {
            let entry = TreeEntry::read(tree.as_ref(), length - 1)?;
            entry.byte_offset + entry.size as u64
        } else {
            0
        };

        tracing::debug!(
            key = %hex::encode(public.to_bytes()),
            length,
            byte_length,
            writable = signing.is_some(),
            "opened feed"
        );

        let (events, _) = broadcast::channel(256);
        Ok(Feed {
            shared: Arc::new(Shared {
                public,
                signing,
                state: RwLock::new(State {
                    data,
                    tree,
                    signatures,
                    length,
                    byte_length,
                }),
                events,
            }),
        })
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.shared.public.to_bytes()
    }

    /// A public, non-reversible rendezvous tag: keyed blake2b of the
    /// string "hypercore" under the feed public key.
    pub fn discovery_key(&self) -> [u8; 32] {
        let mut mac = Blake2bMac::<U32>::new_from_slice(&self.shared.public.to_bytes())
            .expect("32-byte key is a valid blake2b key");
        Update::update(&mut mac, b"hypercore");
        mac.finalize_fixed().into()
    }

    pub fn writable(&self) -> bool {
        self.shared.signing.is_some()
    }

    /// The 64-byte keypair, present on writable feeds only.
    pub fn secret_key_bytes(&self) -> Option<[u8; 64]> {
        self.shared
            .signing
            .as_ref()
            .map(|signing| signing.to_keypair_bytes())
    }

    /// Number of blocks.
    pub fn len(&self) -> u64 {
        self.shared.state.read().unwrap().length
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes across all blocks.
    pub fn byte_len(&self) -> u64 {
        self.shared.state.read().unwrap().byte_length
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Appends a block, signing it with the local keypair.
    pub fn append(&self, block: &[u8]) -> Result<u64> {
        let signing = self.shared.signing.as_ref().ok_or(Error::NotWritable)?;

        let mut state = self.shared.state.write().unwrap();
        let index = state.length;
        let hash = block_hash(block);
        let signature = signing.sign(&signable(index, &hash));
        state.persist(index, block, &hash, &signature.to_bytes())?;

        let (length, byte_length) = (state.length, state.byte_length);
        drop(state);

        tracing::trace!(index, size = block.len(), "appended block");
        let _ = self.shared.events.send(Event::Append {
            length,
            byte_length,
        });
        Ok(index)
    }

    /// Verifies a replicated block against the feed public key and
    /// appends it. Blocks must arrive in order; no secret key required.
    pub fn verify_and_append(&self, index: u64, block: &[u8], signature: &[u8]) -> Result<()> {
        let signature = Signature::from_slice(signature).map_err(|_| Error::BadSignature(index))?;
        let hash = block_hash(block);
        self.shared
            .public
            .verify(&signable(index, &hash), &signature)
            .map_err(|_| Error::BadSignature(index))?;

        let mut state = self.shared.state.write().unwrap();
        if index != state.length {
            return Err(Error::NonContiguous {
                index,
                length: state.length,
            });
        }
        state.persist(index, block, &hash, &signature.to_bytes())?;

        let (length, byte_length) = (state.length, state.byte_length);
        drop(state);

        tracing::trace!(index, size = block.len(), "verified and appended remote block");
        let _ = self.shared.events.send(Event::Append {
            length,
            byte_length,
        });
        Ok(())
    }

    /// Reads one block, verifying its stored hash.
    pub fn get(&self, index: u64) -> Result<Bytes> {
        let state = self.shared.state.read().unwrap();
        if index >= state.length {
            return Err(Error::OutOfBounds(index, state.length));
        }
        let entry = TreeEntry::read(state.tree.as_ref(), index)?;
        let block = state.data.read_at(entry.byte_offset, entry.size as usize)?;
        if block_hash(&block) != entry.hash {
            return Err(Error::Corrupt(index));
        }
        Ok(Bytes::from(block))
    }

    /// The stored signature of a block, for serving replication peers.
    pub fn proof(&self, index: u64) -> Result<[u8; 64]> {
        let state = self.shared.state.read().unwrap();
        if index >= state.length {
            return Err(Error::OutOfBounds(index, state.length));
        }
        let buf = state
            .signatures
            .read_at(index * SIGNATURE_SIZE, SIGNATURE_SIZE as usize)?;
        Ok(buf.try_into().expect("read of 64 bytes"))
    }

    /// Streams the bytes of `range`, discarding any leading portion of
    /// the first blocks down to `range.byte_offset` and truncating to
    /// `range.byte_length`.
    pub fn read_byte_stream(
        &self,
        range: ByteRange,
    ) -> impl futures::Stream<Item = Result<Bytes>> + Send + 'static {
        struct Cursor {
            index: u64,
            end: u64,
            discard: Option<u64>,
            remaining: u64,
            byte_offset: u64,
        }

        let feed = self.clone();
        let cursor = Cursor {
            index: range.block_offset,
            end: range.block_offset + range.blocks,
            discard: None,
            remaining: range.byte_length,
            byte_offset: range.byte_offset,
        };

        futures::stream::try_unfold(cursor, move |mut cursor| {
            let feed = feed.clone();
            async move {
                loop {
                    if cursor.remaining == 0 || cursor.index >= cursor.end {
                        return Ok(None);
                    }
                    let mut block = feed.get(cursor.index)?;

                    // Resolve the leading discard against the first block's
                    // starting position. It may span multiple blocks.
                    let discard = match cursor.discard {
                        Some(discard) => discard,
                        None => {
                            let span = feed.block_span(cursor.index)?;
                            cursor.byte_offset.saturating_sub(span.0)
                        }
                    };

                    cursor.index += 1;
                    if discard >= block.len() as u64 {
                        cursor.discard = Some(discard - block.len() as u64);
                        continue;
                    }
                    if discard > 0 {
                        block.advance(discard as usize);
                    }
                    cursor.discard = Some(0);

                    if block.len() as u64 > cursor.remaining {
                        block.truncate(cursor.remaining as usize);
                    }
                    cursor.remaining -= block.len() as u64;
                    return Ok(Some((block, cursor)));
                }
            }
        })
    }

    fn block_span(&self, index: u64) -> Result<(u64, u32)> {
        let state = self.shared.state.read().unwrap();
        if index >= state.length {
            return Err(Error::OutOfBounds(index, state.length));
        }
        let entry = TreeEntry::read(state.tree.as_ref(), index)?;
        Ok((entry.byte_offset, entry.size))
    }

    /// Flushes all storage handles.
    pub fn close(&self) -> Result<()> {
        let state = self.shared.state.read().unwrap();
        state.data.sync()?;
        state.tree.sync()?;
        state.signatures.sync()?;
        Ok(())
    }
}

impl State {
    fn persist(&mut self, index: u64, block: &[u8], hash: &[u8; 32], signature: &[u8; 64]) -> Result<()> {
        let mut entry = [0u8; TREE_ENTRY_SIZE as usize];
        entry[..8].copy_from_slice(&self.byte_length.to_be_bytes());
        entry[8..12].copy_from_slice(&(block.len() as u32).to_be_bytes());
        entry[12..].copy_from_slice(hash);

        self.data.write_at(self.byte_length, block)?;
        self.tree.write_at(index * TREE_ENTRY_SIZE, &entry)?;
        self.signatures.write_at(index * SIGNATURE_SIZE, signature)?;

        self.length += 1;
        self.byte_length += block.len() as u64;
        Ok(())
    }
}

struct TreeEntry {
    byte_offset: u64,
    size: u32,
    hash: [u8; 32],
}

impl TreeEntry {
    fn read(tree: &dyn RandomAccess, index: u64) -> Result<TreeEntry> {
        let buf = tree.read_at(index * TREE_ENTRY_SIZE, TREE_ENTRY_SIZE as usize)?;
        Ok(TreeEntry {
            byte_offset: u64::from_be_bytes(buf[..8].try_into().expect("8-byte slice")),
            size: u32::from_be_bytes(buf[8..12].try_into().expect("4-byte slice")),
            hash: buf[12..].try_into().expect("32-byte slice"),
        })
    }
}

fn block_hash(block: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    Digest::update(&mut hasher, block);
    hasher.finalize().into()
}

// Signatures cover the block index and hash, binding position as well
// as content.
fn signable(index: u64, hash: &[u8; 32]) -> [u8; 40] {
    let mut buf = [0u8; 40];
    buf[..8].copy_from_slice(&index.to_be_bytes());
    buf[8..].copy_from_slice(hash);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DirVolume, MemVolume};
    use futures::TryStreamExt;

    fn create(volume: &dyn Volume) -> Feed {
        Feed::open(
            volume,
            FeedOptions {
                create: true,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn append_and_get_round_trip() {
        let volume = MemVolume::new();
        let feed = create(&volume);

        assert_eq!(feed.append(b"hello").unwrap(), 0);
        assert_eq!(feed.append(b" world").unwrap(), 1);

        assert_eq!(feed.len(), 2);
        assert_eq!(feed.byte_len(), 11);
        assert_eq!(&feed.get(0).unwrap()[..], b"hello");
        assert_eq!(&feed.get(1).unwrap()[..], b" world");

        assert!(matches!(feed.get(2), Err(Error::OutOfBounds(2, 2))));
    }

    #[test]
    fn reopen_restores_counters_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let volume = DirVolume::new(dir.path());

        let feed = create(&volume);
        let key = feed.public_key();
        feed.append(b"one").unwrap();
        feed.append(b"two").unwrap();
        feed.close().unwrap();
        drop(feed);

        let feed = create(&volume);
        assert_eq!(feed.public_key(), key);
        assert!(feed.writable());
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.byte_len(), 6);
        assert_eq!(&feed.get(1).unwrap()[..], b"two");
    }

    #[test]
    fn read_only_feed_rejects_appends() {
        let volume = MemVolume::new();
        let writer = create(&volume);
        writer.append(b"data").unwrap();

        let reader = Feed::open(
            &MemVolume::new(),
            FeedOptions {
                key: Some(writer.public_key()),
                create: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert!(!reader.writable());
        assert!(matches!(reader.append(b"nope"), Err(Error::NotWritable)));
    }

    #[test]
    fn key_mismatch_is_rejected() {
        let volume = MemVolume::new();
        let feed = create(&volume);
        drop(feed);

        let err = Feed::open(
            &volume,
            FeedOptions {
                key: Some([7u8; 32]),
                create: true,
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(Error::KeyMismatch { .. })));
    }

    #[test]
    fn verify_and_append_replicates_blocks() {
        let writer = create(&MemVolume::new());
        writer.append(b"alpha").unwrap();
        writer.append(b"beta").unwrap();

        let reader = Feed::open(
            &MemVolume::new(),
            FeedOptions {
                key: Some(writer.public_key()),
                create: true,
                ..Default::default()
            },
        )
        .unwrap();

        for index in 0..writer.len() {
            let block = writer.get(index).unwrap();
            let proof = writer.proof(index).unwrap();
            reader.verify_and_append(index, &block, &proof).unwrap();
        }
        assert_eq!(reader.len(), 2);
        assert_eq!(&reader.get(0).unwrap()[..], b"alpha");

        // Tampered content is rejected.
        let proof = writer.proof(0).unwrap();
        assert!(matches!(
            reader.verify_and_append(2, b"evil", &proof),
            Err(Error::BadSignature(2))
        ));

        // Out-of-order blocks are rejected.
        let block = writer.get(0).unwrap();
        let proof = writer.proof(0).unwrap();
        assert!(matches!(
            reader.verify_and_append(0, &block, &proof),
            Err(Error::NonContiguous { index: 0, length: 2 })
        ));
    }

    #[tokio::test]
    async fn byte_stream_discards_and_truncates() {
        let feed = create(&MemVolume::new());
        feed.append(b"aaaa").unwrap(); // bytes 0..4
        feed.append(b"bbbb").unwrap(); // bytes 4..8
        feed.append(b"cccc").unwrap(); // bytes 8..12

        // Full range.
        let all: Vec<Bytes> = feed
            .read_byte_stream(ByteRange {
                block_offset: 0,
                blocks: 3,
                byte_offset: 0,
                byte_length: 12,
            })
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.concat(), b"aaaabbbbcccc");

        // Interior range spanning a block boundary, with a discard that
        // swallows the entire first block.
        let mid: Vec<Bytes> = feed
            .read_byte_stream(ByteRange {
                block_offset: 0,
                blocks: 3,
                byte_offset: 5,
                byte_length: 5,
            })
            .try_collect()
            .await
            .unwrap();
        assert_eq!(mid.concat(), b"bbbcc");
    }

    #[test]
    fn discovery_key_is_stable_and_distinct() {
        let feed = create(&MemVolume::new());
        assert_eq!(feed.discovery_key(), feed.discovery_key());
        assert_ne!(feed.discovery_key(), feed.public_key());
    }

    #[test]
    fn append_events_are_broadcast() {
        let feed = create(&MemVolume::new());
        let mut events = feed.subscribe();
        feed.append(b"x").unwrap();

        let Ok(Event::Append {
            length,
            byte_length,
        }) = events.try_recv()
        else {
            panic!("expected an append event");
        };
        assert_eq!((length, byte_length), (1, 1));
    }
}
