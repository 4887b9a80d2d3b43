use super::Drive;
use crate::Result;
use tokio::io::{AsyncRead, AsyncWrite};

// A drive always replicates its metadata and content logs over one
// stream, so peers expect both to complete.
const EXPECTED_FEEDS: u32 = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReplicateOptions {
    /// Keep the session open after both sides are in sync, forwarding
    /// new appends as they happen.
    pub live: bool,
}

impl Drive {
    /// Replicates this drive with one peer over `io`.
    ///
    /// The metadata log attaches immediately. The content log attaches
    /// as soon as it is known — which, on a fresh replica, is only
    /// after the metadata header has arrived through this very session.
    pub async fn replicate<S>(&self, io: S, options: ReplicateOptions) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (peer, session) = hypercore::replication::replicate(
            io,
            vec![self.metadata_feed().clone()],
            hypercore::replication::ReplicateOptions {
                expected_feeds: EXPECTED_FEEDS,
                live: options.live,
            },
        );

        let attach = {
            let drive = self.clone();
            tokio::spawn(async move {
                if let Ok(content) = drive.content().await {
                    peer.attach(content);
                }
            })
        };

        let result = session.await;
        attach.abort();
        Ok(result?)
    }
}
