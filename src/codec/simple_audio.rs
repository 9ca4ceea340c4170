// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Depacketization for audio codecs where one RTP packet carries exactly
//! one frame's worth of samples, with no AU headers or fragmentation: raw
//! G.711 (`PCMA`/`PCMU`), G.722, DVI4, G.726 (at several bit depths), and
//! L16, per [RFC 3551](https://datatracker.ietf.org/doc/html/rfc3551) §4, as
//! well as the compressed "one packet is one frame" codecs —
//! Opus, MPEG-1/2 audio (`MPA`), and AC-3 — whose payload this module also
//! passes through untouched, reporting only PTS.

use std::num::NonZeroU32;

use crate::client::rtp;

#[derive(Debug)]
pub(crate) struct Depacketizer {
    clock_rate: u32,
    bits_per_sample: u32,
    pending: Option<super::AudioFrame>,
}

impl Depacketizer {
    /// `bits_per_sample` follows the dispatch table in `mod.rs`: the number
    /// of bits each payload octet's worth of samples expands to (used only
    /// to report `AudioParameters`, not to reinterpret the payload, which
    /// is passed through untouched).
    pub(super) fn new(clock_rate: u32, bits_per_sample: u32) -> Self {
        Self {
            clock_rate,
            bits_per_sample,
            pending: None,
        }
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        Some(super::Parameters::Audio(super::AudioParameters {
            rfc6381_codec: None,
            frame_length: NonZeroU32::new(1),
            clock_rate: self.clock_rate,
            extra_data: bytes::Bytes::new(),
            sample_entry: None,
        }))
    }

    pub(super) fn push(&mut self, pkt: rtp::Packet) -> Result<(), String> {
        if pkt.payload.is_empty() {
            return Err("empty simple-audio RTP payload".to_string());
        }
        let samples = (pkt.payload.len() as u64 * 8) / u64::from(self.bits_per_sample.max(1));
        let frame_length = NonZeroU32::new(samples.max(1) as u32)
            .unwrap_or_else(|| NonZeroU32::new(1).unwrap());
        self.pending = Some(super::AudioFrame {
            ctx: pkt.ctx,
            stream_id: pkt.stream_id,
            timestamp: pkt.timestamp,
            frame_length,
            loss: pkt.loss,
            data: pkt.payload,
        });
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take().map(super::CodecItem::AudioFrame)
    }
}

/// Encodes raw PCM-like audio by splitting it into `payload_max_size` chunks;
/// there's no header or fragmentation format of its own to preserve.
#[derive(Debug)]
pub(crate) struct Packetizer {
    payload_max_size: usize,
    ssrc: u32,
    sequence_number: u16,
}

impl Packetizer {
    pub(super) fn new(payload_max_size: usize, ssrc: u32, initial_sequence_number: u16) -> Self {
        Self {
            payload_max_size,
            ssrc,
            sequence_number: initial_sequence_number,
        }
    }

    pub(super) fn packetize(&mut self, data: &bytes::Bytes) -> Vec<super::EncodedPacket> {
        let packets = super::fragment_payload(data, self.payload_max_size);
        self.sequence_number = self.sequence_number.wrapping_add(packets.len() as u16);
        packets
    }

    pub(super) fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub(super) fn sequence_number(&self) -> u16 {
        self.sequence_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::num::NonZeroU32 as NZU32;

    fn pkt(payload: &'static [u8]) -> rtp::Packet {
        rtp::Packet {
            ctx: crate::RtspMessageContext::default(),
            channel_id: 0,
            stream_id: 0,
            timestamp: crate::Timestamp::new(0, NZU32::new(8_000).unwrap(), 0),
            ssrc: 1,
            sequence_number: 0,
            loss: 0,
            mark: true,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn each_packet_is_one_frame() {
        let mut d = Depacketizer::new(8_000, 8);
        d.push(pkt(&[1, 2, 3, 4])).unwrap();
        let item = d.pull().unwrap();
        match item {
            super::super::CodecItem::AudioFrame(f) => {
                assert_eq!(&f.data[..], &[1, 2, 3, 4]);
                assert_eq!(f.frame_length.get(), 4);
            }
            _ => panic!("expected audio frame"),
        }
        assert!(d.pull().is_none());
    }

    #[test]
    fn empty_payload_is_rejected() {
        let mut d = Depacketizer::new(8_000, 8);
        assert!(d.push(pkt(&[])).is_err());
    }
}
