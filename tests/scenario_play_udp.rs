// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end: `DESCRIBE` -> `SETUP` (UDP unicast) -> `PLAY`, then a real
//! RTP packet delivered from a published [ServerStream] through to a
//! client's `Session::next`.

mod common;

use url::Url;

use rtsp_rt::client::{Session, SessionOptions, TransportPreference};
use rtsp_rt::headers::transport::Mode;
use rtsp_rt::server::stream::FanoutPacket;
use rtsp_rt::server::ServerOptions;
use rtsp_rt::transport::Channel;

#[tokio::test]
async fn describe_setup_play_over_udp_delivers_one_h264_packet() {
    let (addr, server) = common::spawn_server(common::NoDescribeHandler, ServerOptions::default()).await;
    let base_url = Url::parse(&format!("rtsp://{}/cam/", addr)).unwrap();
    let streams = server.publish("/cam", common::h264_sdp(), base_url).unwrap();
    let video = streams[0].clone();

    let mut session = Session::start(
        "rtsp",
        &addr.ip().to_string(),
        addr.port(),
        SessionOptions::default().transport(TransportPreference::Udp),
    )
    .await
    .unwrap();

    let url = Url::parse(&format!("rtsp://{}/cam", addr)).unwrap();
    session.describe(&url).await.unwrap();
    session.setup(0, Mode::Play).await.unwrap();
    session.play(None).await.unwrap();

    common::wait_for_subscriber(&video).await;
    let payload = common::raw_rtp_packet(96, true, 1000, 90_000, 0xCAFEBABE, b"H264-frame-bytes");
    video.publish(FanoutPacket {
        channel: Channel::Rtp,
        payload: payload.clone(),
    });

    let item = session.next().await.unwrap().expect("one packet");
    match item {
        rtsp_rt::client::PacketItem::RtpPacket(pkt) => {
            assert_eq!(pkt.ssrc, 0xCAFEBABE);
            assert_eq!(pkt.sequence_number, 1000);
            assert!(pkt.mark);
            assert_eq!(&pkt.payload[..], b"H264-frame-bytes");
        }
        other => panic!("expected an RTP packet, got {:?}", other),
    }

    session.close().await;
}
