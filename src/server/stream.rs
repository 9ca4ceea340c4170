// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Publisher-to-reader packet fanout: per-reader bounded queues, default
//! 512 packets.
//!
//! Each `RECORD`ing session owns one [ServerStream] per installed media.
//! `PLAY`ing sessions subscribe a [Reader] handle to it; the publisher's
//! ingress task pushes every received packet to each subscriber's bounded
//! queue without blocking, per the ordering rule ("writes are
//! non-blocking").

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::transport::Channel;

/// One packet as forwarded through the fanout: which sub-channel it arrived
/// on (RTP and RTCP are kept distinct end to end) plus the raw bytes.
#[derive(Clone, Debug)]
pub struct FanoutPacket {
    pub channel: Channel,
    pub payload: Bytes,
}

struct Subscriber {
    reader_id: u64,
    tx: mpsc::Sender<FanoutPacket>,
}

/// Per-media fanout point owned by a publishing (`RECORD`) session. Reader
/// (`PLAY`) sessions subscribe at `PLAY` and unsubscribe at `PAUSE`/
/// `TEARDOWN`/disconnect.
#[derive(Clone)]
pub struct ServerStream {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    subscribers: Vec<Subscriber>,
    queue_depth: usize,
    next_reader_id: u64,
}

/// A subscription handle held by a reader session; dropping it unsubscribes.
pub struct Reader {
    stream: ServerStream,
    reader_id: u64,
    rx: mpsc::Receiver<FanoutPacket>,
}

impl Reader {
    pub async fn recv(&mut self) -> Option<FanoutPacket> {
        self.rx.recv().await
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.stream.unsubscribe(self.reader_id);
    }
}

impl ServerStream {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                subscribers: Vec::new(),
                queue_depth: queue_depth.max(1),
                next_reader_id: 1,
            })),
        }
    }

    /// Subscribes a new reader; each reader session subscribes at `PLAY`.
    pub fn subscribe(&self) -> Reader {
        let mut inner = self.inner.lock().unwrap();
        let reader_id = inner.next_reader_id;
        inner.next_reader_id += 1;
        let (tx, rx) = mpsc::channel(inner.queue_depth);
        inner.subscribers.push(Subscriber { reader_id, tx });
        Reader {
            stream: self.clone(),
            reader_id,
            rx,
        }
    }

    fn unsubscribe(&self, reader_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|s| s.reader_id != reader_id);
    }

    /// Forwards `packet` to every current subscriber without blocking. A
    /// slow subscriber that exceeds its queue depth is dropped with reason
    /// `ReaderQueueOverflow`; its `Reader::recv` then observes channel
    /// closure, which the reader's task maps to that disconnect reason.
    pub fn publish(&self, packet: FanoutPacket) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|s| match s.tx.try_send(packet.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "reader {} exceeded fanout queue depth; disconnecting (ReaderQueueOverflow)",
                    s.reader_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let stream = ServerStream::new(8);
        let mut a = stream.subscribe();
        let mut b = stream.subscribe();
        stream.publish(FanoutPacket {
            channel: Channel::Rtp,
            payload: Bytes::from_static(b"x"),
        });
        assert_eq!(a.recv().await.unwrap().payload, Bytes::from_static(b"x"));
        assert_eq!(b.recv().await.unwrap().payload, Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn dropping_reader_unsubscribes() {
        let stream = ServerStream::new(8);
        let reader = stream.subscribe();
        assert_eq!(stream.subscriber_count(), 1);
        drop(reader);
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_reader_is_dropped_on_overflow() {
        let stream = ServerStream::new(1);
        let mut slow = stream.subscribe();
        // Fill the one slot without draining it.
        stream.publish(FanoutPacket {
            channel: Channel::Rtp,
            payload: Bytes::from_static(b"1"),
        });
        // This publish finds the queue full and evicts the subscriber.
        stream.publish(FanoutPacket {
            channel: Channel::Rtp,
            payload: Bytes::from_static(b"2"),
        });
        assert_eq!(stream.subscriber_count(), 0);
        // The one packet that did make it through is still readable.
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());
    }
}
