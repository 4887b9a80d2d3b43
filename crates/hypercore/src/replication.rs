//! Pairwise feed replication over any duplex byte stream.
//!
//! Both sides run the same session: feeds are announced by discovery
//! key on numbered channels, each side advertises how much it has, the
//! side that is behind requests blocks one at a time, and every
//! received block is signature-verified before it is appended. A
//! non-live session completes once `expected_feeds` channels are in
//! sync in both directions.

use crate::feed::{Event, Feed};
use crate::{Error, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message as _;
use std::collections::HashMap;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Clone, PartialEq, prost::Message)]
pub struct Handshake {
    /// How many feeds the sender intends to replicate on this stream.
    #[prost(uint32, tag = "1")]
    pub expected_feeds: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OpenChannel {
    #[prost(bytes = "vec", tag = "1")]
    pub discovery_key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Have {
    #[prost(uint64, tag = "1")]
    pub length: u64,
    #[prost(uint64, tag = "2")]
    pub byte_length: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(uint64, tag = "1")]
    pub index: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub block: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Synced {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    /// Sender-assigned channel number; 0 is the handshake channel.
    #[prost(uint32, tag = "1")]
    pub channel: u32,
    #[prost(oneof = "Frame", tags = "2, 3, 4, 5, 6, 7")]
    pub frame: Option<Frame>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Frame {
    #[prost(message, tag = "2")]
    Handshake(Handshake),
    #[prost(message, tag = "3")]
    Open(OpenChannel),
    #[prost(message, tag = "4")]
    Have(Have),
    #[prost(message, tag = "5")]
    Request(Request),
    #[prost(message, tag = "6")]
    Data(Data),
    #[prost(message, tag = "7")]
    Synced(Synced),
}

#[derive(Debug, Clone, Copy)]
pub struct ReplicateOptions {
    /// Channels that must fully sync before a non-live session ends.
    pub expected_feeds: u32,
    /// Keep the session open, forwarding later appends as they happen.
    pub live: bool,
}

impl Default for ReplicateOptions {
    fn default() -> Self {
        Self {
            expected_feeds: 1,
            live: false,
        }
    }
}

/// Handle for attaching additional feeds to a running session, e.g. a
/// content feed whose key only becomes known mid-replication.
#[derive(Clone)]
pub struct Peer {
    tx: mpsc::UnboundedSender<Feed>,
}

impl Peer {
    /// Returns false if the session has already ended.
    pub fn attach(&self, feed: Feed) -> bool {
        self.tx.send(feed).is_ok()
    }
}

/// Starts a replication session over `io`. The returned future drives
/// the session to completion; the [`Peer`] attaches feeds to it.
pub fn replicate<S>(
    io: S,
    feeds: Vec<Feed>,
    options: ReplicateOptions,
) -> (Peer, impl Future<Output = Result<()>> + Send)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (attach_tx, attach_rx) = mpsc::unbounded_channel();
    for feed in feeds {
        // Seeded feeds flow through the same attach path as late ones.
        let _ = attach_tx.send(feed);
    }
    let peer = Peer {
        tx: attach_tx.clone(),
    };
    (peer, run_session(io, attach_rx, options))
}

struct ChannelState {
    feed: Feed,
    local_channel: u32,
    remote_channel: Option<u32>,
    remote_have: Option<Have>,
    inflight: bool,
    sent_sync: bool,
    recv_sync: bool,
}

struct Parked {
    remote_channel: u32,
    have: Option<Have>,
}

struct Session<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    sink: futures::stream::SplitSink<Framed<S, LengthDelimitedCodec>, Bytes>,
    channels: Vec<ChannelState>,
    // Remote channel number -> slot in `channels`.
    remote: HashMap<u32, usize>,
    // Remote opens for feeds we have not attached yet, by discovery key.
    parked: HashMap<Vec<u8>, Parked>,
    expected: u32,
    live: bool,
    next_channel: u32,
    event_tx: mpsc::UnboundedSender<usize>,
}

async fn run_session<S>(
    io: S,
    mut attach_rx: mpsc::UnboundedReceiver<Feed>,
    options: ReplicateOptions,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, mut stream) = Framed::new(io, LengthDelimitedCodec::new()).split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let mut session = Session {
        sink,
        channels: Vec::new(),
        remote: HashMap::new(),
        parked: HashMap::new(),
        expected: options.expected_feeds,
        live: options.live,
        next_channel: 1,
        event_tx,
    };

    session
        .send(
            0,
            Frame::Handshake(Handshake {
                expected_feeds: options.expected_feeds,
            }),
        )
        .await?;

    loop {
        if !session.live && session.complete() {
            session.sink.flush().await.map_err(Error::Io)?;
            tracing::debug!(channels = session.channels.len(), "replication complete");
            return Ok(());
        }

        tokio::select! {
            Some(feed) = attach_rx.recv() => {
                session.attach(feed).await?;
            }
            Some(slot) = event_rx.recv() => {
                session.announce_have(slot).await?;
            }
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    let envelope = Envelope::decode(frame.freeze())?;
                    session.on_frame(envelope).await?;
                }
                Some(Err(err)) => return Err(Error::Io(err)),
                None => {
                    return if session.live || session.complete() {
                        Ok(())
                    } else {
                        Err(Error::Protocol("peer closed before replication finished"))
                    };
                }
            },
        }
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&mut self, channel: u32, frame: Frame) -> Result<()> {
        let envelope = Envelope {
            channel,
            frame: Some(frame),
        };
        self.sink
            .send(Bytes::from(envelope.encode_to_vec()))
            .await
            .map_err(Error::Io)
    }

    async fn attach(&mut self, feed: Feed) -> Result<()> {
        let discovery_key = feed.discovery_key().to_vec();
        let channel = self.next_channel;
        self.next_channel += 1;

        let slot = self.channels.len();
        self.spawn_event_forwarder(&feed, slot);

        tracing::debug!(channel, key = %hex::encode(feed.public_key()), "announcing feed");
        self.channels.push(ChannelState {
            feed,
            local_channel: channel,
            remote_channel: None,
            remote_have: None,
            inflight: false,
            sent_sync: false,
            recv_sync: false,
        });

        self.send(
            channel,
            Frame::Open(OpenChannel {
                discovery_key: discovery_key.clone(),
            }),
        )
        .await?;
        self.announce_have(slot).await?;

        // The remote may have opened this feed before we attached it.
        if let Some(parked) = self.parked.remove(&discovery_key) {
            self.bind_remote(parked.remote_channel, slot, parked.have)
                .await?;
        }
        Ok(())
    }

    fn spawn_event_forwarder(&self, feed: &Feed, slot: usize) {
        let mut events = feed.subscribe();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::Append { .. }) => {
                        if tx.send(slot).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn announce_have(&mut self, slot: usize) -> Result<()> {
        let state = &self.channels[slot];
        let (channel, length, byte_length) = (
            state.local_channel,
            state.feed.len(),
            state.feed.byte_len(),
        );
        self.send(
            channel,
            Frame::Have(Have {
                length,
                byte_length,
            }),
        )
        .await
    }

    async fn bind_remote(
        &mut self,
        remote_channel: u32,
        slot: usize,
        have: Option<Have>,
    ) -> Result<()> {
        self.remote.insert(remote_channel, slot);
        self.channels[slot].remote_channel = Some(remote_channel);
        if let Some(have) = have {
            self.channels[slot].remote_have = Some(have);
        }
        self.progress(slot).await
    }

    async fn on_frame(&mut self, envelope: Envelope) -> Result<()> {
        let frame = envelope
            .frame
            .ok_or(Error::Protocol("empty replication envelope"))?;

        match frame {
            Frame::Handshake(handshake) => {
                self.expected = self.expected.max(handshake.expected_feeds);
            }
            Frame::Open(open) => {
                match self
                    .channels
                    .iter()
                    .position(|state| state.feed.discovery_key()[..] == open.discovery_key[..])
                {
                    Some(slot) => self.bind_remote(envelope.channel, slot, None).await?,
                    None => {
                        // Feed not attached locally (yet). Park the open;
                        // a later attach will bind it.
                        self.parked.insert(
                            open.discovery_key,
                            Parked {
                                remote_channel: envelope.channel,
                                have: None,
                            },
                        );
                    }
                }
            }
            Frame::Have(have) => {
                if let Some(slot) = self.remote.get(&envelope.channel).copied() {
                    self.channels[slot].remote_have = Some(have);
                    self.progress(slot).await?;
                } else if let Some(parked) = self
                    .parked
                    .values_mut()
                    .find(|parked| parked.remote_channel == envelope.channel)
                {
                    parked.have = Some(have);
                }
            }
            Frame::Request(request) => {
                let slot = self.resolve(envelope.channel)?;
                let feed = self.channels[slot].feed.clone();
                let block = feed.get(request.index)?;
                let signature = feed.proof(request.index)?;
                let channel = self.channels[slot].local_channel;
                self.send(
                    channel,
                    Frame::Data(Data {
                        index: request.index,
                        block: block.to_vec(),
                        signature: signature.to_vec(),
                    }),
                )
                .await?;
            }
            Frame::Data(data) => {
                let slot = self.resolve(envelope.channel)?;
                self.channels[slot]
                    .feed
                    .verify_and_append(data.index, &data.block, &data.signature)?;
                self.channels[slot].inflight = false;
                self.progress(slot).await?;
            }
            Frame::Synced(Synced {}) => {
                let slot = self.resolve(envelope.channel)?;
                self.channels[slot].recv_sync = true;
            }
        }
        Ok(())
    }

    fn resolve(&self, remote_channel: u32) -> Result<usize> {
        self.remote
            .get(&remote_channel)
            .copied()
            .ok_or(Error::Protocol("message on an unopened channel"))
    }

    /// Requests the next missing block, or declares this channel in
    /// sync once caught up with the remote head.
    async fn progress(&mut self, slot: usize) -> Result<()> {
        let state = &self.channels[slot];
        let Some(remote_length) = state.remote_have.as_ref().map(|have| have.length) else {
            return Ok(());
        };
        let (channel, inflight, sent_sync) = (state.local_channel, state.inflight, state.sent_sync);
        let length = state.feed.len();

        if length < remote_length {
            if !inflight {
                self.channels[slot].inflight = true;
                self.send(channel, Frame::Request(Request { index: length }))
                    .await?;
            }
        } else if !sent_sync {
            self.channels[slot].sent_sync = true;
            self.send(channel, Frame::Synced(Synced {})).await?;
        }
        Ok(())
    }

    fn complete(&self) -> bool {
        let matched = self
            .channels
            .iter()
            .filter(|state| state.remote_channel.is_some());
        matched.clone().count() as u32 >= self.expected
            && matched.into_iter().all(|state| state.sent_sync && state.recv_sync)
    }
}
