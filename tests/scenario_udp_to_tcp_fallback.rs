// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Under `Auto` transport selection, a `PLAY` whose UDP media never receives
//! a packet within the reachability probe window falls back to a fresh
//! TCP-interleaved `SETUP` automatically, and playback continues over the
//! new transport without the caller doing anything special.

mod common;

use url::Url;

use rtsp_rt::client::{Session, SessionOptions, TransportPreference};
use rtsp_rt::headers::transport::Mode;
use rtsp_rt::server::stream::FanoutPacket;
use rtsp_rt::server::ServerOptions;
use rtsp_rt::transport::Channel;

#[tokio::test]
async fn a_silent_udp_media_falls_back_to_tcp_interleaved_during_play() {
    let (addr, server) = common::spawn_server(common::NoDescribeHandler, ServerOptions::default()).await;
    let base_url = Url::parse(&format!("rtsp://{}/cam/", addr)).unwrap();
    let streams = server.publish("/cam", common::h264_sdp(), base_url).unwrap();
    let video = streams[0].clone();

    let mut session = Session::start(
        "rtsp",
        &addr.ip().to_string(),
        addr.port(),
        SessionOptions::default().transport(TransportPreference::Auto),
    )
    .await
    .unwrap();

    let url = Url::parse(&format!("rtsp://{}/cam", addr)).unwrap();
    session.describe(&url).await.unwrap();
    session.setup(0, Mode::Play).await.unwrap();

    // No UDP packet is ever published, so the ~3s reachability probe inside
    // `play()` times out and it re-SETUPs the media over TCP-interleaved
    // before returning.
    session.play(None).await.unwrap();

    common::wait_for_subscriber(&video).await;
    let payload = common::raw_rtp_packet(96, true, 42, 270_000, 0xFEEDFACE, b"post-fallback-frame");
    video.publish(FanoutPacket {
        channel: Channel::Rtp,
        payload: payload.clone(),
    });

    let item = session.next().await.unwrap().expect("one packet");
    match item {
        rtsp_rt::client::PacketItem::RtpPacket(pkt) => {
            assert_eq!(pkt.ssrc, 0xFEEDFACE);
            assert_eq!(pkt.sequence_number, 42);
            assert_eq!(&pkt.payload[..], b"post-fallback-frame");
        }
        other => panic!("expected an RTP packet, got {:?}", other),
    }

    session.close().await;
}
