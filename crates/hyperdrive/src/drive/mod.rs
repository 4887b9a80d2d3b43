mod read;
mod replicate;
mod write;

pub use read::ReadOptions;
pub use replicate::ReplicateOptions;
pub use write::{WriteOptions, WRITE_BLOCK_SIZE};

use crate::keys::derive_content_keypair;
use crate::path;
use crate::stat::Stat;
use crate::storage::Storage;
use crate::{Error, Result};
use hypercore::storage::Volume;
use hypercore::{Feed, FeedOptions};
use hypertrie::{Trie, TrieOptions, Watcher};
use prost::Message as _;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, OnceCell};

/// Observable drive signals. `Update` fires on every metadata-log
/// append, local or replicated; `Content` fires once, when the content
/// log becomes available.
#[derive(Debug, Clone)]
pub enum Event {
    Content,
    Update,
    Appending { path: String },
    Append { path: String },
}

#[derive(Default)]
pub struct DriveOptions {
    /// Open an existing drive by its public key.
    pub key: Option<[u8; 32]>,
    /// Full metadata keypair, granting write access.
    pub secret_key: Option<[u8; 64]>,
}

/// A versioned filesystem over a metadata log and a content log.
///
/// Cheaply clonable; clones (and checkouts) share the underlying logs,
/// which live as long as any holder.
#[derive(Clone)]
pub struct Drive {
    inner: Arc<Inner>,
}

struct Inner {
    metadata: Feed,
    index: Trie,
    content: OnceCell<Feed>,
    content_volume: Arc<dyn Volume>,
    // Single-writer gate over the content log.
    append_lock: Mutex<()>,
    events: broadcast::Sender<Event>,
    update_forwarder: tokio::task::JoinHandle<()>,
    is_checkout: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.update_forwarder.abort();
    }
}

impl Drive {
    /// Opens or creates a drive over `storage`.
    ///
    /// With a secret key (or nothing, which generates a fresh identity)
    /// the drive is writable and the content log's keypair is derived
    /// from the metadata keypair. With only a public key the drive is a
    /// read-only replica: the content log is located through the
    /// metadata header, lazily if that header has not been replicated
    /// yet.
    pub async fn open(storage: Storage, options: DriveOptions) -> Result<Drive> {
        let (metadata_volume, content_volume) = storage.bind();

        let metadata = Feed::open(
            metadata_volume.as_ref(),
            FeedOptions {
                key: options.key,
                secret_key: options.secret_key,
                create: true,
            },
        )?;

        let content = OnceCell::new();
        let mut header_metadata = None;

        if metadata.writable() {
            let secret = metadata
                .secret_key_bytes()
                .expect("writable feed exposes its keypair");
            let content_keypair = derive_content_keypair(&secret);
            let feed = Feed::open(
                content_volume.as_ref(),
                FeedOptions {
                    secret_key: Some(content_keypair.to_keypair_bytes()),
                    create: true,
                    ..Default::default()
                },
            )?;
            header_metadata = Some(feed.public_key().to_vec());
            assert!(content.set(feed).is_ok(), "fresh content cell");
        }

        // On a writable, still-empty metadata log this writes the
        // header block carrying the content key; everywhere else the
        // metadata option is ignored and the existing log is replayed.
        let index = Trie::open(
            metadata.clone(),
            TrieOptions {
                metadata: header_metadata,
            },
        )?;

        if !metadata.writable() && !metadata.is_empty() {
            let feed = open_content_from_header(&index, content_volume.as_ref())?;
            assert!(content.set(feed).is_ok(), "fresh content cell");
        }

        let (events, _) = broadcast::channel(256);
        let update_forwarder = spawn_update_forwarder(&metadata, events.clone());

        tracing::debug!(
            key = %hex_key(&metadata),
            writable = metadata.writable(),
            version = index.version(),
            content_ready = content.initialized(),
            "opened drive"
        );

        Ok(Drive {
            inner: Arc::new(Inner {
                metadata,
                index,
                content,
                content_volume,
                append_lock: Mutex::new(()),
                events,
                update_forwarder,
                is_checkout: false,
            }),
        })
    }

    /// The drive identity: the metadata log's public key.
    pub fn key(&self) -> [u8; 32] {
        self.inner.metadata.public_key()
    }

    /// Public rendezvous tag for peer discovery.
    pub fn discovery_key(&self) -> [u8; 32] {
        self.inner.metadata.discovery_key()
    }

    pub fn writable(&self) -> bool {
        self.inner.metadata.writable()
    }

    /// Index version, usable with [`Drive::checkout`]. 1-based: the
    /// metadata header block counts as the first entry.
    pub fn version(&self) -> u64 {
        self.inner.index.version()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// The content log, resolving it first if this replica has not yet
    /// seen the metadata header.
    pub(crate) async fn content(&self) -> Result<Feed> {
        let feed = self
            .inner
            .content
            .get_or_try_init(|| self.resolve_content())
            .await?;
        Ok(feed.clone())
    }

    async fn resolve_content(&self) -> Result<Feed> {
        // Subscribe before checking emptiness so an append between the
        // two cannot be missed.
        let mut appends = self.inner.metadata.subscribe();
        while self.inner.metadata.is_empty() {
            match appends.recv().await {
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Feed(hypercore::Error::Protocol(
                        "metadata feed closed while awaiting its header",
                    )))
                }
            }
        }

        let feed = open_content_from_header(&self.inner.index, self.inner.content_volume.as_ref())?;
        tracing::debug!(key = %hex_key(&feed), "content feed resolved");
        self.emit(Event::Content);
        Ok(feed)
    }

    /// Metadata about a path. When no record exists but descendants
    /// do, the path is an implicit directory and a synthetic directory
    /// Stat is returned.
    pub async fn stat(&self, path: &str) -> Result<Stat> {
        let key = path::normalize(path);
        match self.inner.index.get(&key)? {
            Some(value) => Stat::decode(&value[..]).map_err(|_| Error::BadStat(key)),
            None => {
                let children = self.inner.index.keys(&key)?;
                if children.iter().any(|child| child != &key) {
                    Ok(Stat::directory(0, 0))
                } else {
                    Err(Error::FileNotFound(key))
                }
            }
        }
    }

    /// Identical to [`Drive::stat`]: symbolic links are not modeled.
    pub async fn lstat(&self, path: &str) -> Result<Stat> {
        self.stat(path).await
    }

    pub async fn access(&self, path: &str) -> Result<()> {
        self.stat(path).await.map(|_| ())
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(Error::FileNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Names of the entries directly under `path` (bare names, not full
    /// keys). The root lists top-level names.
    pub async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let prefix = path::normalize(path);
        let keys = self.inner.index.keys(&prefix)?;

        let mut names: Vec<String> = Vec::new();
        for key in &keys {
            if let Some(name) = path::child_name(key, &prefix) {
                if names.last().map(String::as_str) != Some(name) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Removes a file entry. The content bytes it referenced stay in
    /// the content log; only the index forgets them.
    pub async fn unlink(&self, path: &str) -> Result<()> {
        let key = path::normalize(path);
        if !self.inner.index.del(&key)? {
            return Err(Error::FileNotFound(key));
        }
        Ok(())
    }

    /// Removes an empty directory.
    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let key = path::normalize(path);
        let children = self.inner.index.keys(&key)?;
        if children.iter().any(|child| child != &key) {
            return Err(Error::DirectoryNotEmpty(key));
        }
        if !self.inner.index.del(&key)? {
            return Err(Error::FileNotFound(key));
        }
        Ok(())
    }

    /// Subscribes to index changes under a path prefix. Dropping the
    /// watcher unsubscribes.
    pub fn watch(&self, path: &str) -> Watcher {
        self.inner.index.watch(&path::normalize(path))
    }

    /// A read-only view of this drive at a historical `version`,
    /// sharing both logs. Closing the checkout leaves the logs open.
    pub fn checkout(&self, version: u64) -> Result<Drive> {
        let content = self
            .inner
            .content
            .get()
            .cloned()
            .ok_or(Error::InvalidCheckout)?;
        let index = self.inner.index.checkout(version)?;

        let (events, _) = broadcast::channel(256);
        let update_forwarder = spawn_update_forwarder(&self.inner.metadata, events.clone());

        Ok(Drive {
            inner: Arc::new(Inner {
                metadata: self.inner.metadata.clone(),
                index,
                content: OnceCell::new_with(Some(content)),
                content_volume: self.inner.content_volume.clone(),
                append_lock: Mutex::new(()),
                events,
                update_forwarder,
                is_checkout: true,
            }),
        })
    }

    /// Flushes both logs. A checkout's close is a no-op: the parent
    /// owns the logs' lifetime.
    pub fn close(&self) -> Result<()> {
        if self.inner.is_checkout {
            return Ok(());
        }
        self.inner.metadata.close()?;
        if let Some(content) = self.inner.content.get() {
            content.close()?;
        }
        Ok(())
    }

    pub(crate) fn index(&self) -> &Trie {
        &self.inner.index
    }

    pub(crate) fn metadata_feed(&self) -> &Feed {
        &self.inner.metadata
    }

    pub(crate) fn append_lock(&self) -> &Mutex<()> {
        &self.inner.append_lock
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.inner.events.send(event);
    }
}

fn open_content_from_header(index: &Trie, volume: &dyn Volume) -> Result<Feed> {
    let header = index.metadata()?;
    let key: [u8; 32] = header
        .try_into()
        .map_err(|_| Error::Index(hypertrie::Error::BadHeader))?;
    Ok(Feed::open(
        volume,
        FeedOptions {
            key: Some(key),
            create: true,
            ..Default::default()
        },
    )?)
}

fn spawn_update_forwarder(
    metadata: &Feed,
    events: broadcast::Sender<Event>,
) -> tokio::task::JoinHandle<()> {
    let mut appends = metadata.subscribe();
    tokio::spawn(async move {
        loop {
            match appends.recv().await {
                Ok(_) => {
                    let _ = events.send(Event::Update);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn hex_key(feed: &Feed) -> String {
    hex::encode(feed.public_key())
}
