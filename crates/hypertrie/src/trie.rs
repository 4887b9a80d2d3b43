use crate::messages::{Header, Node, PROTOCOL};
use crate::{Error, Result};
use hypercore::Feed;
use prost::Message as _;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard, Weak};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct TrieOptions {
    /// Written into the header block when this open creates the index.
    pub metadata: Option<Vec<u8>>,
}

/// The index handle. Clones share state; a checkout is an independent
/// handle frozen at a historical version.
#[derive(Clone)]
pub struct Trie {
    shared: Arc<Shared>,
}

struct Shared {
    feed: Feed,
    state: RwLock<State>,
    watchers: Mutex<Vec<Watch>>,
    watch_ids: AtomicU64,
    // Some(version) freezes this handle at that feed length.
    snapshot: Option<u64>,
}

struct State {
    // Live key -> feed block holding its latest value.
    keydir: BTreeMap<String, u64>,
    // Feed blocks replayed so far, header included.
    applied: u64,
}

struct Watch {
    id: u64,
    prefix: String,
    tx: mpsc::UnboundedSender<String>,
}

impl Trie {
    /// Opens the index over `feed`. A writable, still-empty feed gets
    /// the header block appended before anything else, which is the
    /// one chance to embed caller metadata.
    pub fn open(feed: Feed, options: TrieOptions) -> Result<Trie> {
        if feed.writable() && feed.is_empty() {
            let header = Header {
                protocol: PROTOCOL.to_string(),
                metadata: options.metadata.unwrap_or_default(),
            };
            feed.append(&header.encode_to_vec())?;
            tracing::debug!("wrote index header block");
        }

        let trie = Trie {
            shared: Arc::new(Shared {
                feed,
                state: RwLock::new(State {
                    keydir: BTreeMap::new(),
                    applied: 0,
                }),
                watchers: Mutex::new(Vec::new()),
                watch_ids: AtomicU64::new(0),
                snapshot: None,
            }),
        };

        let mut changed = Vec::new();
        let mut state = trie.shared.state.write().unwrap();
        trie.sync_locked(&mut state, &mut changed)?;
        drop(state);
        Ok(trie)
    }

    pub fn feed(&self) -> &Feed {
        &self.shared.feed
    }

    /// Index version: the feed length this handle observes. 1-based,
    /// since block 0 is the header.
    pub fn version(&self) -> u64 {
        self.shared.snapshot.unwrap_or_else(|| self.shared.feed.len())
    }

    /// The opaque metadata embedded in the header block.
    pub fn metadata(&self) -> Result<Vec<u8>> {
        if self.shared.feed.is_empty() {
            return Err(Error::AwaitingHeader);
        }
        let block = self.shared.feed.get(0)?;
        let header = Header::decode(block).map_err(|_| Error::BadHeader)?;
        if header.protocol != PROTOCOL {
            return Err(Error::BadHeader);
        }
        Ok(header.metadata)
    }

    /// Point lookup of the latest value under `key`.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let state = self.read_synced()?;
        let Some(&block) = state.keydir.get(key) else {
            return Ok(None);
        };
        let node = Node::decode(self.shared.feed.get(block)?)?;
        Ok(Some(node.value))
    }

    /// Inserts or replaces `key`.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut changed = Vec::new();
        {
            let mut state = self.shared.state.write().unwrap();
            self.sync_locked(&mut state, &mut changed)?;

            let node = Node {
                key: key.to_string(),
                value: value.to_vec(),
                deleted: false,
            };
            self.shared.feed.append(&node.encode_to_vec())?;
            // Replays our own block (and any that raced in before it).
            self.sync_locked(&mut state, &mut changed)?;
        }
        self.notify(&changed);
        Ok(())
    }

    /// Removes `key`, returning whether it existed.
    pub fn del(&self, key: &str) -> Result<bool> {
        let mut changed = Vec::new();
        let existed;
        {
            let mut state = self.shared.state.write().unwrap();
            self.sync_locked(&mut state, &mut changed)?;

            existed = state.keydir.contains_key(key);
            if existed {
                let node = Node {
                    key: key.to_string(),
                    value: Vec::new(),
                    deleted: true,
                };
                self.shared.feed.append(&node.encode_to_vec())?;
                self.sync_locked(&mut state, &mut changed)?;
            }
        }
        self.notify(&changed);
        Ok(existed)
    }

    /// All live keys under `prefix`, in lexicographic order.
    pub fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.read_synced()?;
        Ok(state
            .keydir
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| prefix_matches(key, prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    /// All live nodes under `prefix`.
    pub fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let blocks: Vec<(String, u64)> = {
            let state = self.read_synced()?;
            state
                .keydir
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .filter(|(key, _)| prefix_matches(key, prefix))
                .map(|(key, &block)| (key.clone(), block))
                .collect()
        };

        let mut nodes = Vec::with_capacity(blocks.len());
        for (key, block) in blocks {
            let node = Node::decode(self.shared.feed.get(block)?)?;
            nodes.push((key, node.value));
        }
        Ok(nodes)
    }

    /// An immutable view of the index at a historical version. The
    /// snapshot shares the feed but never observes later mutations.
    pub fn checkout(&self, version: u64) -> Result<Trie> {
        let length = self.shared.feed.len();
        if version > length {
            return Err(Error::BadVersion { version, length });
        }

        let mut keydir = BTreeMap::new();
        for index in 1..version {
            let node = Node::decode(self.shared.feed.get(index)?)?;
            if node.deleted {
                keydir.remove(&node.key);
            } else {
                keydir.insert(node.key, index);
            }
        }

        Ok(Trie {
            shared: Arc::new(Shared {
                feed: self.shared.feed.clone(),
                state: RwLock::new(State {
                    keydir,
                    applied: version,
                }),
                watchers: Mutex::new(Vec::new()),
                watch_ids: AtomicU64::new(0),
                snapshot: Some(version),
            }),
        })
    }

    /// Subscribes to mutations of keys under `prefix`. Dropping the
    /// watcher unsubscribes.
    pub fn watch(&self, prefix: &str) -> Watcher {
        let id = self.shared.watch_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.watchers.lock().unwrap().push(Watch {
            id,
            prefix: prefix.to_string(),
            tx,
        });
        Watcher {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    // Replays feed blocks that the keydir has not seen yet. Mutated
    // keys are pushed onto `changed` for watcher notification once the
    // state lock is released.
    fn sync_locked(&self, state: &mut RwLockWriteGuard<'_, State>, changed: &mut Vec<String>) -> Result<()> {
        let head = self.shared.snapshot.unwrap_or_else(|| self.shared.feed.len());
        while state.applied < head {
            let index = state.applied;
            if index > 0 {
                let node = Node::decode(self.shared.feed.get(index)?)?;
                if node.deleted {
                    state.keydir.remove(&node.key);
                } else {
                    state.keydir.insert(node.key.clone(), index);
                }
                changed.push(node.key);
            }
            state.applied += 1;
        }
        Ok(())
    }

    fn read_synced(&self) -> Result<std::sync::RwLockReadGuard<'_, State>> {
        let mut changed = Vec::new();
        {
            let mut state = self.shared.state.write().unwrap();
            self.sync_locked(&mut state, &mut changed)?;
        }
        self.notify(&changed);
        Ok(self.shared.state.read().unwrap())
    }

    fn notify(&self, changed: &[String]) {
        if changed.is_empty() {
            return;
        }
        let mut watchers = self.shared.watchers.lock().unwrap();
        watchers.retain(|watch| {
            for key in changed {
                if prefix_matches(key, &watch.prefix) && watch.tx.send(key.clone()).is_err() {
                    return false;
                }
            }
            !watch.tx.is_closed()
        });
    }
}

/// A key matches a prefix when it equals the prefix or lives below
/// `prefix + "/"`. The empty prefix matches everything.
fn prefix_matches(key: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match key.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Live subscription handle returned by [`Trie::watch`].
pub struct Watcher {
    id: u64,
    rx: mpsc::UnboundedReceiver<String>,
    shared: Weak<Shared>,
}

impl Watcher {
    /// The next mutated key under the watched prefix, or None once the
    /// index is gone.
    pub async fn changed(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .watchers
                .lock()
                .unwrap()
                .retain(|watch| watch.id != self.id);
        }
    }
}
