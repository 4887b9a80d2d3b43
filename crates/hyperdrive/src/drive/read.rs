use super::Drive;
use crate::{Error, Result};
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use hypercore::ByteRange;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReadOptions {
    /// Byte offset into the file to start from.
    pub start: u64,
    /// Bytes to read; the remainder of the file when unset. Clamped to
    /// what the file actually holds past `start`.
    pub length: Option<u64>,
}

impl Drive {
    /// Streams the bytes of the file at `path`. Every block is hash-
    /// verified by the content log as it is read.
    pub async fn read_stream(
        &self,
        path: &str,
        options: ReadOptions,
    ) -> Result<impl Stream<Item = Result<Bytes>> + Send + 'static> {
        let stat = self.stat(path).await?;
        let content = self.content().await?;

        let available = stat.size.saturating_sub(options.start);
        let byte_length = options
            .length
            .map_or(available, |length| length.min(available));

        let stream = content.read_byte_stream(ByteRange {
            block_offset: stat.offset,
            blocks: stat.blocks,
            byte_offset: stat.byte_offset + options.start,
            byte_length,
        });
        Ok(stream.map_err(Error::from))
    }

    /// Reads a whole file into one buffer.
    pub async fn read_file(&self, path: &str) -> Result<Bytes> {
        let stream = self.read_stream(path, ReadOptions::default()).await?;
        futures::pin_mut!(stream);

        let mut chunks: Vec<Bytes> = Vec::new();
        while let Some(chunk) = stream.try_next().await? {
            chunks.push(chunk);
        }
        match chunks.len() {
            0 => Ok(Bytes::new()),
            1 => Ok(chunks.remove(0)),
            _ => Ok(Bytes::from(chunks.concat())),
        }
    }

    /// Reads a whole file and decodes it as UTF-8.
    pub async fn read_file_to_string(&self, path: &str) -> Result<String> {
        let data = self.read_file(path).await?;
        String::from_utf8(data.to_vec()).map_err(|err| {
            Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })
    }
}
