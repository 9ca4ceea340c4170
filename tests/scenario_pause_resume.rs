// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end: `PLAY` -> `PAUSE` -> `PLAY` again resumes delivery on the
//! same session, per spec §4.6's `… → Read → Paused → …` leg.

mod common;

use url::Url;

use rtsp_rt::client::{Session, SessionOptions, TransportPreference};
use rtsp_rt::headers::transport::Mode;
use rtsp_rt::server::stream::FanoutPacket;
use rtsp_rt::server::ServerOptions;
use rtsp_rt::transport::Channel;

#[tokio::test]
async fn pause_then_play_resumes_delivery() {
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
    let first = common::raw_rtp_packet(96, true, 1000, 90_000, 0xCAFEBABE, b"before-pause");
    video.publish(FanoutPacket {
        channel: Channel::Rtp,
        payload: first,
    });
    match session.next().await.unwrap().expect("one packet before pause") {
        rtsp_rt::client::PacketItem::RtpPacket(pkt) => assert_eq!(&pkt.payload[..], b"before-pause"),
        other => panic!("expected an RTP packet, got {:?}", other),
    }

    session.pause().await.unwrap();
    session.play(None).await.unwrap();

    common::wait_for_subscriber(&video).await;
    let second = common::raw_rtp_packet(96, true, 1001, 90_090, 0xCAFEBABE, b"after-resume");
    video.publish(FanoutPacket {
        channel: Channel::Rtp,
        payload: second,
    });
    match session.next().await.unwrap().expect("one packet after resume") {
        rtsp_rt::client::PacketItem::RtpPacket(pkt) => assert_eq!(&pkt.payload[..], b"after-resume"),
        other => panic!("expected an RTP packet, got {:?}", other),
    }

    session.close().await;
}

#[tokio::test]
async fn play_from_initial_state_is_rejected() {
    let (addr, server) = common::spawn_server(common::NoDescribeHandler, ServerOptions::default()).await;
    let base_url = Url::parse(&format!("rtsp://{}/cam/", addr)).unwrap();
    server.publish("/cam", common::h264_sdp(), base_url).unwrap();

    let mut session = Session::start(
        "rtsp",
        &addr.ip().to_string(),
        addr.port(),
        SessionOptions::default().transport(TransportPreference::Udp),
    )
    .await
    .unwrap();

    let err = session.play(None).await.unwrap_err();
    assert!(format!("{}", err).contains("PLAY"));
}
