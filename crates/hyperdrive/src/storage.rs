//! Binds a caller-supplied storage descriptor to the two namespaced
//! volumes a drive needs, one per log.

use hypercore::storage::{DirVolume, MemVolume, Namespaced, Volume};
use std::path::PathBuf;
use std::sync::Arc;

/// Where a drive keeps its logs.
#[derive(Clone)]
pub enum Storage {
    /// A folder: files land under `<dir>/metadata/*` and `<dir>/content/*`.
    Dir(PathBuf),
    /// Any volume, namespaced the same way.
    Volume(Arc<dyn Volume>),
    /// Explicit per-log volumes, used verbatim.
    Split {
        metadata: Arc<dyn Volume>,
        content: Arc<dyn Volume>,
    },
}

impl Storage {
    pub fn dir(path: impl Into<PathBuf>) -> Storage {
        Storage::Dir(path.into())
    }

    /// Shared in-memory storage; clones of the returned value refer to
    /// the same files.
    pub fn memory() -> Storage {
        Storage::Volume(Arc::new(MemVolume::new()))
    }

    pub(crate) fn bind(&self) -> (Arc<dyn Volume>, Arc<dyn Volume>) {
        match self {
            Storage::Dir(path) => {
                let root: Arc<dyn Volume> = Arc::new(DirVolume::new(path.clone()));
                namespace_pair(root)
            }
            Storage::Volume(root) => namespace_pair(root.clone()),
            Storage::Split { metadata, content } => (metadata.clone(), content.clone()),
        }
    }
}

fn namespace_pair(root: Arc<dyn Volume>) -> (Arc<dyn Volume>, Arc<dyn Volume>) {
    (
        Arc::new(Namespaced::new(root.clone(), "metadata")),
        Arc::new(Namespaced::new(root, "content")),
    )
}
