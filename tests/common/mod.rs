// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared fixtures for the end-to-end scenario tests: a server spun up on a
//! loopback ephemeral port, minimal SDP bodies, and raw RTP packet bytes for
//! a "server as source" publisher to inject through a [ServerStream].

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rtsp_rt::server::stream::ServerStream;
use rtsp_rt::server::{Server, ServerHandler, ServerOptions};
use rtsp_rt::{ConnectionContext, Error};
use url::Url;

/// A handler with nothing to resolve on its own; every resource in these
/// tests is pushed in directly via [Server::publish], so `describe` is
/// never actually reached.
pub struct NoDescribeHandler;

impl ServerHandler for NoDescribeHandler {
    fn describe(&self, _url: &Url) -> Result<sdp::session_description::SessionDescription, Error> {
        unreachable!("test resources are always pre-published via Server::publish")
    }
}

/// Binds a throwaway loopback listener to claim a free port, drops it, then
/// starts a [Server] on that same port and returns its address once it's
/// accepting connections.
pub async fn spawn_server<H: ServerHandler>(handler: H, options: ServerOptions) -> (SocketAddr, Arc<Server<H>>) {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let server = Arc::new(Server::new(options, handler));
    let listening = server.clone();
    tokio::spawn(async move {
        let _ = listening.listen(addr).await;
    });
    // Give the accept loop a moment to bind before a test tries to connect.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, server)
}

fn sdp_from(text: &[u8]) -> sdp::session_description::SessionDescription {
    let mut cursor = std::io::Cursor::new(text);
    sdp::session_description::SessionDescription::unmarshal(&mut cursor).unwrap()
}

/// One H.264 video media, control `trackID=0`.
pub fn h264_sdp() -> sdp::session_description::SessionDescription {
    sdp_from(
        b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
a=control:*\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=control:trackID=0\r\n",
    )
}

/// One LPCM (L16) audio media, control `trackID=0`.
pub fn lpcm_sdp() -> sdp::session_description::SessionDescription {
    sdp_from(
        b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
a=control:*\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=rtpmap:97 L16/16000/2\r\n\
a=control:trackID=0\r\n",
    )
}

/// A minimal well-formed 12-byte RTP header plus `payload`, suitable for
/// injection through [ServerStream::publish] or a raw publisher connection:
/// version 2, no padding/extension/CSRCs.
pub fn raw_rtp_packet(pt: u8, marker: bool, seq: u16, timestamp: u32, ssrc: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(12 + payload.len());
    buf.put_u8(0x80);
    buf.put_u8(if marker { 0x80 } else { 0 } | (pt & 0x7f));
    buf.put_u16(seq);
    buf.put_u32(timestamp);
    buf.put_u32(ssrc);
    buf.put_slice(payload);
    buf.freeze()
}

/// Polls `stream`'s subscriber count until a reader has subscribed (a `PLAY`
/// pump subscribes asynchronously, just after the `PLAY` response is sent),
/// or panics after a couple of seconds.
pub async fn wait_for_subscriber(stream: &ServerStream) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while stream.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reader never subscribed to the fanout");
}

pub fn dummy_conn_ctx() -> ConnectionContext {
    ConnectionContext::dummy()
}
