// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP-interleaved transport: RTP/RTCP packets multiplexed onto
//! the RTSP control connection's byte stream. The wire framing itself lives
//! in [crate::wire]; this module is just the per-media handle onto it:
//! a receive queue fed by the connection's demux loop, and a reference to
//! the connection's single outbound write queue.

use bytes::Bytes;
use tokio::sync::mpsc;

use super::Channel;
use crate::wire::{CodecItem, ConnectionWriter};
use crate::Error;

/// Channel-id pair assigned at SETUP: a distinct pair of interleaved
/// channel-ids for RTP and RTCP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelIds {
    pub rtp: u8,
    pub rtcp: u8,
}

pub struct InterleavedTransport {
    channels: ChannelIds,
    writer: ConnectionWriter,
    incoming: mpsc::Receiver<(u8, Bytes)>,
}

impl InterleavedTransport {
    pub fn new(
        channels: ChannelIds,
        writer: ConnectionWriter,
        incoming: mpsc::Receiver<(u8, Bytes)>,
    ) -> Self {
        Self {
            channels,
            writer,
            incoming,
        }
    }

    pub fn channels(&self) -> ChannelIds {
        self.channels
    }

    pub async fn read_packet(&mut self) -> Result<(Channel, Bytes), Error> {
        match self.incoming.recv().await {
            Some((channel_id, payload)) if channel_id == self.channels.rtp => {
                Ok((Channel::Rtp, payload))
            }
            Some((channel_id, payload)) if channel_id == self.channels.rtcp => {
                Ok((Channel::Rtcp, payload))
            }
            Some((channel_id, _)) => Err(crate::wrap!(crate::ErrorInt::TransportError {
                conn_ctx: None,
                description: format!("unexpected interleaved channel id {}", channel_id),
            })),
            None => Err(crate::wrap!(crate::ErrorInt::TransportError {
                conn_ctx: None,
                description: "connection closed".to_string(),
            })),
        }
    }

    pub async fn write_packet(&mut self, channel: Channel, data: &[u8]) -> Result<(), Error> {
        let channel_id = match channel {
            Channel::Rtp => self.channels.rtp,
            Channel::Rtcp => self.channels.rtcp,
        };
        self.writer.send(CodecItem::Data {
            channel_id,
            payload: Bytes::copy_from_slice(data),
        })
    }
}

/// Demultiplexes incoming interleaved frames read off the control
/// connection to the per-channel-id queue registered for them. Owned by the
/// connection's single control-read task; media-side consumers
/// never read the socket directly.
#[derive(Default)]
pub struct Demuxer {
    routes: std::collections::HashMap<u8, mpsc::Sender<(u8, Bytes)>>,
}

impl Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `channels` to be routed to a freshly-created queue, returning
    /// the receiving end for a newly-SETUP media's [InterleavedTransport].
    pub fn register(&mut self, channels: ChannelIds, depth: usize) -> mpsc::Receiver<(u8, Bytes)> {
        let (tx, rx) = mpsc::channel(depth);
        self.routes.insert(channels.rtp, tx.clone());
        self.routes.insert(channels.rtcp, tx);
        rx
    }

    pub fn unregister(&mut self, channels: ChannelIds) {
        self.routes.remove(&channels.rtp);
        self.routes.remove(&channels.rtcp);
    }

    /// True if either channel-id of `channels` is already claimed by a
    /// previously-registered media (used to reject a `SETUP` that asks for
    /// channels already in use on this connection).
    pub fn contains(&self, channels: ChannelIds) -> bool {
        self.routes.contains_key(&channels.rtp) || self.routes.contains_key(&channels.rtcp)
    }

    /// Routes one received frame; drops it with a debug log if no media has
    /// claimed its channel id (can happen briefly around TEARDOWN).
    pub async fn route(&self, channel_id: u8, payload: Bytes) {
        if let Some(tx) = self.routes.get(&channel_id) {
            if tx.send((channel_id, payload)).await.is_err() {
                log::debug!("dropping interleaved frame for channel {}: queue closed", channel_id);
            }
        } else {
            log::debug!("dropping interleaved frame for unregistered channel {}", channel_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demuxer_routes_by_registered_channel() {
        let mut demux = Demuxer::new();
        let channels = ChannelIds { rtp: 0, rtcp: 1 };
        let mut rx = demux.register(channels, 8);
        demux.route(0, Bytes::from_static(b"rtp-data")).await;
        demux.route(1, Bytes::from_static(b"rtcp-data")).await;
        let (id1, data1) = rx.recv().await.unwrap();
        assert_eq!(id1, 0);
        assert_eq!(&data1[..], b"rtp-data");
        let (id2, _) = rx.recv().await.unwrap();
        assert_eq!(id2, 1);
    }

    #[tokio::test]
    async fn unregistered_channel_is_dropped_silently() {
        let demux = Demuxer::new();
        demux.route(5, Bytes::from_static(b"x")).await;
    }
}
