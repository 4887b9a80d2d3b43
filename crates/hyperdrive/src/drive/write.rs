use super::{Drive, Event};
use crate::path;
use crate::stat::Stat;
use crate::{Error, Result};
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use prost::Message as _;

/// Upper bound on a single content-log block. Larger caller buffers
/// are split so no append produces an oversized block.
pub const WRITE_BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Default, Clone)]
pub struct WriteOptions {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime: Option<u64>,
    pub ctime: Option<u64>,
}

impl Drive {
    /// Streams `source` into the content log and commits a file record
    /// at `path`.
    ///
    /// The whole operation holds the drive-wide append mutex: the
    /// content range is snapshotted at acquisition, bytes are appended
    /// in order, and the Stat referencing exactly the produced range is
    /// committed to the index before the mutex releases. On failure the
    /// index is left unchanged; any bytes already appended stay in the
    /// content log, unreferenced.
    pub async fn write_stream<S>(
        &self,
        path: &str,
        options: WriteOptions,
        source: S,
    ) -> Result<Stat>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send,
    {
        let key = path::normalize(path);
        let content = self.content().await?;

        let guard = self.append_lock().lock().await;
        self.emit(Event::Appending { path: key.clone() });

        let offset = content.len();
        let byte_offset = content.byte_len();
        let mut blocks: u64 = 0;
        let mut size: u64 = 0;

        let result = async {
            futures::pin_mut!(source);
            while let Some(chunk) = source.try_next().await.map_err(Error::Io)? {
                // An empty chunk yields no pieces, so it appends nothing.
                for piece in chunk.chunks(WRITE_BLOCK_SIZE) {
                    content.append(piece)?;
                    blocks += 1;
                    size += piece.len() as u64;
                }
            }

            let mut stat = Stat::file(size, blocks, offset, byte_offset);
            if let Some(mode) = options.mode {
                stat.set_permissions(mode);
            }
            if let Some(uid) = options.uid {
                stat.uid = uid;
            }
            if let Some(gid) = options.gid {
                stat.gid = gid;
            }
            if let Some(mtime) = options.mtime {
                stat.mtime = mtime;
            }
            if let Some(ctime) = options.ctime {
                stat.ctime = ctime;
            }

            self.index().put(&key, &stat.encode_to_vec())?;
            Ok(stat)
        }
        .await;
        drop(guard);

        match result {
            Ok(stat) => {
                tracing::debug!(path = %key, size, blocks, "wrote file");
                self.emit(Event::Append { path: key });
                Ok(stat)
            }
            Err(err) => {
                tracing::warn!(path = %key, error = %err, "write failed; content bytes orphaned");
                Err(err)
            }
        }
    }

    /// Writes a whole buffer as one file.
    pub async fn write_file(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        options: WriteOptions,
    ) -> Result<Stat> {
        let data = data.into();
        self.write_stream(path, options, futures::stream::once(async move { Ok(data) }))
            .await
    }

    /// Records a directory at `path`. Snapshots the current content-log
    /// position but never consumes content bytes.
    pub async fn mkdir(&self, path: &str, mode: Option<u32>) -> Result<()> {
        let key = path::normalize(path);
        let content = self.content().await?;

        let mut stat = Stat::directory(content.len(), content.byte_len());
        if let Some(mode) = mode {
            stat.set_permissions(mode);
        }
        self.index().put(&key, &stat.encode_to_vec())?;
        Ok(())
    }
}
