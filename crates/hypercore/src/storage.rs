use std::collections::HashMap;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

/// Positional byte storage backing a single named file of a feed.
/// Reads are exact: a read past the written extent is an error.
pub trait RandomAccess: Send + Sync {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;
    fn len(&self) -> io::Result<u64>;
    fn sync(&self) -> io::Result<()>;
}

/// Factory of named storage handles. A feed opens all of its files
/// ("key", "data", "tree", ...) through one Volume.
pub trait Volume: Send + Sync {
    fn open(&self, name: &str) -> io::Result<Arc<dyn RandomAccess>>;
}

/// Storage over a regular file, using positional unix IO so that
/// concurrent readers never contend on a shared cursor.
pub struct FileStorage {
    file: std::fs::File,
}

impl FileStorage {
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }
}

impl RandomAccess for FileStorage {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// In-memory storage, used by tests and by callers that want a drive
/// with no on-disk footprint.
#[derive(Default)]
pub struct MemStorage {
    data: RwLock<Vec<u8>>,
}

impl RandomAccess for MemStorage {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let data = self.data.read().unwrap();
        let start = offset as usize;
        if start + len > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of storage",
            ));
        }
        Ok(data[start..start + len].to_vec())
    }

    fn write_at(&self, offset: u64, chunk: &[u8]) -> io::Result<()> {
        let mut data = self.data.write().unwrap();
        let end = offset as usize + chunk.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(chunk);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.read().unwrap().len() as u64)
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Volume rooted at a directory: names map to files beneath it, and
/// names containing `/` create intermediate directories.
pub struct DirVolume {
    root: PathBuf,
}

impl DirVolume {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Volume for DirVolume {
    fn open(&self, name: &str) -> io::Result<Arc<dyn RandomAccess>> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Arc::new(FileStorage::open(&path)?))
    }
}

/// Volume of shared in-memory files. Clones see the same files, which
/// is what lets a second drive open "the same storage" in one process.
#[derive(Clone, Default)]
pub struct MemVolume {
    files: Arc<Mutex<HashMap<String, Arc<MemStorage>>>>,
}

impl MemVolume {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Volume for MemVolume {
    fn open(&self, name: &str) -> io::Result<Arc<dyn RandomAccess>> {
        let mut files = self.files.lock().unwrap();
        let storage = files
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemStorage::default()));
        Ok(storage.clone())
    }
}

/// Wraps a volume so every opened name is prefixed with `<prefix>/`.
pub struct Namespaced {
    inner: Arc<dyn Volume>,
    prefix: String,
}

impl Namespaced {
    pub fn new(inner: Arc<dyn Volume>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }
}

impl Volume for Namespaced {
    fn open(&self, name: &str) -> io::Result<Arc<dyn RandomAccess>> {
        self.inner.open(&format!("{}/{}", self.prefix, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_volume_shares_files_across_clones() {
        let vol = MemVolume::new();
        let file = vol.open("data").unwrap();
        file.write_at(0, b"hello").unwrap();

        let other = vol.clone().open("data").unwrap();
        assert_eq!(other.read_at(0, 5).unwrap(), b"hello");
        assert_eq!(other.len().unwrap(), 5);
    }

    #[test]
    fn mem_storage_zero_fills_gaps() {
        let storage = MemStorage::default();
        storage.write_at(4, b"x").unwrap();
        assert_eq!(storage.read_at(0, 5).unwrap(), &[0, 0, 0, 0, b'x']);
    }

    #[test]
    fn dir_volume_creates_nested_paths() {
        let dir = tempfile::tempdir().unwrap();
        let vol = DirVolume::new(dir.path());

        let file = vol.open("metadata/tree").unwrap();
        file.write_at(0, b"abc").unwrap();
        file.sync().unwrap();

        assert!(dir.path().join("metadata/tree").is_file());
        assert_eq!(file.read_at(1, 2).unwrap(), b"bc");
    }

    #[test]
    fn namespaced_volume_prefixes_names() {
        let vol = MemVolume::new();
        let ns = Namespaced::new(Arc::new(vol.clone()), "content");
        ns.open("data").unwrap().write_at(0, b"z").unwrap();

        assert_eq!(vol.open("content/data").unwrap().read_at(0, 1).unwrap(), b"z");
    }
}
