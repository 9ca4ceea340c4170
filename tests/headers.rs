// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Round-trips the typed headers against the literal values in
//! the end-to-end scenarios.

use rtsp_rt::headers::rtp_info::RtpInfo;
use rtsp_rt::headers::session::SessionHeader;
use rtsp_rt::headers::transport::{ChannelPair, Delivery, Mode, Protocol, Transport};

fn parse_one(value: &str) -> Transport {
    Transport::parse_all(value).unwrap().remove(0)
}

/// A client proposes `client_port=9000-9001`.
#[test]
fn parses_client_proposed_udp_transport() {
    let t = parse_one("RTP/AVP;unicast;client_port=9000-9001");
    assert_eq!(t.protocol, Protocol::Udp);
    assert_eq!(t.delivery, Delivery::Unicast);
    assert_eq!(t.client_port, Some(ChannelPair { rtp: 9000, rtcp: 9001 }));
    assert_eq!(t.server_port, None);
}

/// A server replies `server_port=9002-9003`.
#[test]
fn parses_server_replied_udp_transport() {
    let t = parse_one(
        "RTP/AVP/UDP;unicast;client_port=9000-9001;server_port=9002-9003;ssrc=1234ABCD",
    );
    assert_eq!(t.server_port, Some(ChannelPair { rtp: 9002, rtcp: 9003 }));
    assert_eq!(t.ssrc, Some(0x1234ABCD));
}

/// `Transport: RTP/AVP/TCP;interleaved=0-1`.
#[test]
fn parses_interleaved_transport() {
    let t = parse_one("RTP/AVP/TCP;interleaved=0-1");
    assert_eq!(t.protocol, Protocol::Tcp);
    assert_eq!(t.interleaved, Some(ChannelPair { rtp: 0, rtcp: 1 }));
    assert!(t.protocol.is_tcp());
    assert!(!t.protocol.is_secure());
}

#[test]
fn secure_profile_is_recognized() {
    let t = parse_one("RTP/SAVP/TCP;interleaved=4-5");
    assert!(t.protocol.is_secure());
    assert!(t.protocol.is_tcp());
}

#[test]
fn multicast_transport_carries_destination_and_ttl() {
    let t = parse_one("RTP/AVP;multicast;destination=239.1.1.1;ttl=32;port=5000-5001");
    assert_eq!(t.delivery, Delivery::Multicast);
    assert_eq!(t.destination.as_deref(), Some("239.1.1.1"));
    assert_eq!(t.ttl, Some(32));
}

#[test]
fn record_mode_is_recognized() {
    let t = parse_one("RTP/AVP/TCP;interleaved=0-1;mode=record");
    assert_eq!(t.mode, Some(Mode::Record));
}

#[test]
fn unknown_transport_keys_are_ignored_for_forward_compatibility() {
    let t = parse_one("RTP/AVP;unicast;client_port=9000-9001;x-vendor-quirk=7");
    assert_eq!(t.client_port, Some(ChannelPair { rtp: 9000, rtcp: 9001 }));
}

#[test]
fn udp_unicast_write_round_trips() {
    let t = Transport::udp_unicast(ChannelPair { rtp: 9000, rtcp: 9001 });
    let written = t.write();
    let reparsed = parse_one(&written);
    assert_eq!(reparsed.client_port, t.client_port);
    assert_eq!(reparsed.protocol, Protocol::Udp);
}

/// `Session: xyz;timeout=30`.
#[test]
fn session_header_parses_timeout() {
    let s = SessionHeader::parse("xyz;timeout=30").unwrap();
    assert_eq!(s.id, "xyz");
    assert_eq!(s.timeout, Some(30));
}

#[test]
fn session_header_without_timeout_defaults_on_write() {
    let s = SessionHeader::new("abc".to_string());
    assert_eq!(s.id, "abc");
    assert_eq!(s.timeout, None);
    assert_eq!(s.write(), "abc");
}

/// `RTP-Info` lets the client align its first-packet sequence/rtptime
/// expectations.
#[test]
fn rtp_info_parses_multiple_entries() {
    let info = RtpInfo::parse(
        "url=rtsp://localhost/s/track1;seq=1;rtptime=90000,url=rtsp://localhost/s/track2;seq=5",
    )
    .unwrap();
    assert_eq!(info.0.len(), 2);
    assert_eq!(info.0[0].seq, Some(1));
    assert_eq!(info.0[0].rtptime, Some(90000));
    assert_eq!(info.0[1].rtptime, None);
}
