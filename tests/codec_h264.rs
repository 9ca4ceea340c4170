// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.264 FU-A fragmentation/reassembly end-to-end, through the public
//! `codec::Depacketizer` facade rather than the crate-internal `h264`
//! module directly.

use std::num::NonZeroU32;

use bytes::Bytes;
use rtsp_rt::client::rtp;
use rtsp_rt::codec::{CodecItem, Depacketizer};
use rtsp_rt::{ConnectionContext, RtspMessageContext, Timestamp};

fn fragment(payload: &'static [u8], mark: bool, seq: u16) -> rtp::Packet {
    rtp::Packet {
        ctx: RtspMessageContext::default(),
        channel_id: 0,
        stream_id: 0,
        timestamp: Timestamp::new(0, NonZeroU32::new(90_000).unwrap(), 90_000),
        ssrc: 0x1234,
        sequence_number: seq,
        loss: 0,
        mark,
        payload: Bytes::from_static(payload),
    }
}

/// One FU-A group (start, middle, end), all sharing RTP timestamp 90000,
/// marker set on the last fragment: reassembles into one access unit.
#[test]
fn fu_a_group_reassembles_into_one_access_unit() {
    let mut d = Depacketizer::new("video", "h264", 90_000, None, None).unwrap();

    // FU indicator (nal_ref_idc=3 | type=28=FU-A), FU header start|type=1 (non-IDR slice).
    d.push(fragment(&[0x7c, 0x81, 0xAA, 0xBB], false, 1)).unwrap();
    assert!(d.pull(&ConnectionContext::dummy()).unwrap().is_none());

    d.push(fragment(&[0x7c, 0x01, 0xCC], false, 2)).unwrap();
    assert!(d.pull(&ConnectionContext::dummy()).unwrap().is_none());

    d.push(fragment(&[0x7c, 0x41, 0xDD], true, 3)).unwrap();
    let item = d
        .pull(&ConnectionContext::dummy())
        .unwrap()
        .expect("reassembled access unit");

    match item {
        CodecItem::VideoFrame(f) => {
            assert_eq!(f.timestamp.timestamp(), 0);
            // Reconstructed NAL header: (0x7c & 0xE0) | 1 == 0x61, length-prefixed.
            assert_eq!(&f.into_data()[..], &[0, 0, 0, 6, 0x61, 0xAA, 0xBB, 0xCC, 0xDD]);
        }
        other => panic!("expected a video frame, got {:?}", other),
    }
    assert!(d.pull(&ConnectionContext::dummy()).unwrap().is_none());
}

#[test]
fn single_nal_packet_with_marker_yields_a_random_access_frame() {
    let mut d = Depacketizer::new("video", "h264", 90_000, None, None).unwrap();
    // NAL type 5 (IDR slice).
    d.push(fragment(&[0x65, 1, 2, 3], true, 1)).unwrap();
    match d.pull(&ConnectionContext::dummy()).unwrap().unwrap() {
        CodecItem::VideoFrame(f) => {
            assert!(f.is_random_access_point);
            assert_eq!(&f.data()[4..], &[0x65, 1, 2, 3]);
        }
        other => panic!("expected a video frame, got {:?}", other),
    }
}

#[test]
fn empty_payload_is_rejected() {
    let mut d = Depacketizer::new("video", "h264", 90_000, None, None).unwrap();
    assert!(d.push(fragment(&[], true, 1)).is_err());
}
