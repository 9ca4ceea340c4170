// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.265/HEVC depacketization/packetization, per [RFC 7798](https://datatracker.ietf.org/doc/html/rfc7798).
//!
//! Supports AP (aggregation packet) and FU (fragmentation unit) NAL types,
//! plus optional DONL/DOND fields when the SDP advertises
//! `sprop-max-don-diff > 0`. Aggregation packets are capped at
//! [MAX_NALUS_PER_AU] NALUs; exceeding that is a decode error.

use bytes::{BufMut, Bytes, BytesMut};

use crate::client::rtp;

const NAL_TYPE_AP: u8 = 48;
const NAL_TYPE_FU: u8 = 49;
const MAX_NALUS_PER_AU: usize = 20;

fn nal_type(hdr: &[u8]) -> u8 {
    (hdr[0] >> 1) & 0x3F
}

#[derive(Debug)]
struct FragmentState {
    start_ctx: crate::RtspMessageContext,
    nal_header: [u8; 2],
    data: BytesMut,
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    has_don: bool,
    fragment: Option<FragmentState>,
    au: BytesMut,
    au_start_ctx: Option<crate::RtspMessageContext>,
    au_nalu_count: usize,
    au_has_irap: bool,
    au_loss: u16,
    stream_id: usize,
    pending: Option<super::CodecItem>,
}

impl Depacketizer {
    pub(super) fn new(format_specific_params: Option<&str>) -> Result<Self, String> {
        let has_don = format_specific_params
            .and_then(|fmtp| {
                fmtp.split(';')
                    .map(str::trim)
                    .find_map(|p| p.strip_prefix("sprop-max-don-diff="))
            })
            .and_then(|v| v.parse::<u32>().ok())
            .map(|v| v > 0)
            .unwrap_or(false);
        Ok(Self {
            has_don,
            fragment: None,
            au: BytesMut::new(),
            au_start_ctx: None,
            au_nalu_count: 0,
            au_has_irap: false,
            au_loss: 0,
            stream_id: 0,
            pending: None,
        })
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        // VPS/SPS/PPS parsing (profile/level, dimensions) isn't implemented;
        // callers needing `extra_data` should inspect the NALs directly.
        None
    }

    fn append_nal(&mut self, nal: &[u8]) -> Result<(), String> {
        if nal.is_empty() {
            return Err("empty HEVC NAL".to_string());
        }
        let t = nal_type(nal);
        // IRAP NAL unit types, per RFC 7798 / H.265 §NAL unit types 16..=23.
        if (16..=23).contains(&t) {
            self.au_has_irap = true;
        }
        self.au_nalu_count += 1;
        if self.au_nalu_count > MAX_NALUS_PER_AU {
            return Err("TooManyNALUs".to_string());
        }
        self.au.put_u32(nal.len() as u32);
        self.au.put_slice(nal);
        Ok(())
    }

    pub(super) fn push(&mut self, pkt: rtp::Packet) -> Result<(), String> {
        self.stream_id = pkt.stream_id;
        self.au_loss = self.au_loss.saturating_add(pkt.loss);
        if self.au_start_ctx.is_none() {
            self.au_start_ctx = Some(pkt.ctx);
        }
        let data = &pkt.payload[..];
        if data.len() < 2 {
            return Err("HEVC RTP payload too short for NAL header".to_string());
        }
        let t = nal_type(data);
        match t {
            NAL_TYPE_AP => {
                if self.fragment.is_some() {
                    log::debug!("discarding incomplete HEVC FU: AP packet arrived");
                    self.fragment = None;
                    self.au_loss = self.au_loss.saturating_add(1);
                }
                let mut rest = &data[2..];
                let mut first = true;
                while rest.len() >= 2 {
                    // DONL (first NALU) / DOND (subsequent) are present only when
                    // `sprop-max-don-diff > 0`; this depacketizer doesn't expose
                    // decoding order, so it only needs to skip past them.
                    let don_field_len = if first { 2 } else { 1 };
                    if self.has_don {
                        if rest.len() < don_field_len {
                            return Err("HEVC AP packet truncated before DON field".to_string());
                        }
                        rest = &rest[don_field_len..];
                    }
                    if rest.len() < 2 {
                        return Err("HEVC AP packet truncated before NALU size".to_string());
                    }
                    let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                    rest = &rest[2..];
                    if rest.len() < len {
                        return Err("HEVC AP NAL length exceeds packet".to_string());
                    }
                    let (nal, tail) = rest.split_at(len);
                    self.append_nal(nal)?;
                    rest = tail;
                    first = false;
                }
            }
            NAL_TYPE_FU => {
                if data.len() < 3 {
                    return Err("HEVC FU packet too short".to_string());
                }
                let fu_header = data[2];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let frag_type = fu_header & 0x3F;
                let nal_header = [
                    (data[0] & 0x81) | (frag_type << 1),
                    data[1],
                ];
                let body_start = 3;
                if start {
                    if self.fragment.is_some() {
                        log::debug!("discarding incomplete HEVC FU: new start bit before previous end");
                        self.au_loss = self.au_loss.saturating_add(1);
                    }
                    let mut buf = BytesMut::with_capacity(data.len());
                    buf.put_slice(&nal_header);
                    buf.put_slice(&data[body_start..]);
                    self.fragment = Some(FragmentState {
                        start_ctx: pkt.ctx,
                        nal_header,
                        data: buf,
                    });
                } else {
                    match &mut self.fragment {
                        Some(frag) if frag.nal_header == nal_header => {
                            frag.data.put_slice(&data[body_start..]);
                        }
                        _ => return Err("HEVC FU continuation without matching start".to_string()),
                    }
                }
                if end {
                    if let Some(frag) = self.fragment.take() {
                        if self.au_start_ctx.is_none() {
                            self.au_start_ctx = Some(frag.start_ctx);
                        }
                        let nal = frag.data.freeze();
                        self.append_nal(&nal)?;
                    }
                } else {
                    return Ok(());
                }
            }
            _ => {
                if self.fragment.is_some() {
                    log::debug!("discarding incomplete HEVC FU: single-NAL packet arrived");
                    self.fragment = None;
                    self.au_loss = self.au_loss.saturating_add(1);
                }
                self.append_nal(data)?;
            }
        }
        if pkt.mark {
            self.end_access_unit(&pkt);
        }
        Ok(())
    }

    fn end_access_unit(&mut self, pkt: &rtp::Packet) {
        if self.au.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.au).freeze();
        let frame = super::VideoFrame {
            new_parameters: None,
            loss: std::mem::take(&mut self.au_loss),
            start_ctx: self.au_start_ctx.take().unwrap_or(pkt.ctx),
            end_ctx: pkt.ctx,
            timestamp: pkt.timestamp,
            stream_id: self.stream_id,
            is_random_access_point: std::mem::take(&mut self.au_has_irap),
            is_disposable: false,
            data,
        };
        self.au_nalu_count = 0;
        self.pending = Some(super::CodecItem::VideoFrame(frame));
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take()
    }
}

/// Encodes access units into H.265 RTP packets (AP for NALs that fit
/// together, FU fragmentation for any NAL exceeding `payload_max_size`).
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

    pub(super) fn packetize_nal(
        &mut self,
        nal: &[u8],
        is_last_nal_in_au: bool,
        mut emit: impl FnMut(bool, Bytes),
    ) {
        if nal.len() <= self.payload_max_size {
            emit(is_last_nal_in_au, Bytes::copy_from_slice(nal));
            self.sequence_number = self.sequence_number.wrapping_add(1);
            return;
        }
        let nal_type = nal_type(nal);
        let fu_indicator = [(nal[0] & 0x81) | (NAL_TYPE_FU << 1), nal[1]];
        let mut rest = &nal[2..];
        let max_fragment = self.payload_max_size.saturating_sub(3).max(1);
        let mut first = true;
        while !rest.is_empty() {
            let take = max_fragment.min(rest.len());
            let (chunk, tail) = rest.split_at(take);
            let is_end = tail.is_empty();
            let mut fu_header = nal_type;
            if first {
                fu_header |= 0x80;
            }
            if is_end {
                fu_header |= 0x40;
            }
            let mut payload = BytesMut::with_capacity(3 + chunk.len());
            payload.put_slice(&fu_indicator);
            payload.put_u8(fu_header);
            payload.put_slice(chunk);
            emit(is_end && is_last_nal_in_au, payload.freeze());
            self.sequence_number = self.sequence_number.wrapping_add(1);
            first = false;
            rest = tail;
        }
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
    use std::num::NonZeroU32;

    fn pkt(payload: impl Into<Bytes>, mark: bool) -> rtp::Packet {
        rtp::Packet {
            ctx: crate::RtspMessageContext::default(),
            channel_id: 0,
            stream_id: 0,
            timestamp: crate::Timestamp::new(0, NonZeroU32::new(90_000).unwrap(), 0),
            ssrc: 1,
            sequence_number: 0,
            loss: 0,
            mark,
            payload: payload.into(),
        }
    }

    #[test]
    fn single_nal_on_marker_yields_frame() {
        let mut d = Depacketizer::new(None).unwrap();
        // NAL type 19 (IDR_W_RADL) => header byte0 = 19<<1 = 38 = 0x26
        d.push(pkt(&[0x26, 0x01, 0xAA, 0xBB][..], true)).unwrap();
        match d.pull().unwrap() {
            super::super::CodecItem::VideoFrame(f) => {
                assert!(f.is_random_access_point);
                assert_eq!(&f.data()[4..], &[0x26, 0x01, 0xAA, 0xBB]);
            }
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn fu_reassembles_fragments() {
        let mut d = Depacketizer::new(None).unwrap();
        // FU type=49 => header0 = 49<<1 = 98 = 0x62; fu_header start|type=1 (trail_n)
        d.push(pkt(&[0x62, 0x01, 0x81, 0xAA][..], false)).unwrap();
        d.push(pkt(&[0x62, 0x01, 0x01, 0xBB][..], false)).unwrap();
        d.push(pkt(&[0x62, 0x01, 0x41, 0xCC][..], true)).unwrap();
        match d.pull().unwrap() {
            super::super::CodecItem::VideoFrame(f) => {
                assert_eq!(&f.data()[6..], &[0xAA, 0xBB, 0xCC]);
            }
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn fu_start_bit_discards_incomplete_previous_group_and_counts_loss() {
        let mut d = Depacketizer::new(None).unwrap();
        d.push(pkt(&[0x62, 0x01, 0x81, 0xAA][..], false)).unwrap();
        // A new start bit before the previous group's end bit.
        d.push(pkt(&[0x62, 0x01, 0x81, 0xDD][..], false)).unwrap();
        d.push(pkt(&[0x62, 0x01, 0x41, 0xEE][..], true)).unwrap();
        match d.pull().unwrap() {
            super::super::CodecItem::VideoFrame(f) => {
                assert_eq!(&f.data()[6..], &[0xDD, 0xEE]);
                assert_eq!(f.loss, 1);
            }
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn too_many_nalus_is_rejected() {
        let mut d = Depacketizer::new(None).unwrap();
        // AP packet with 21 tiny NALUs exceeds MAX_NALUS_PER_AU.
        let mut payload = vec![0x60u8, 0x01];
        for _ in 0..21 {
            payload.extend_from_slice(&[0, 1, 0x02]);
        }
        assert!(d.push(pkt(payload, true)).is_err());
    }

    #[test]
    fn packetizer_splits_oversized_nal_into_fu() {
        let mut p = Packetizer::new(8, 1, 0);
        let nal = [0x26u8, 0x01].iter().chain([0xAAu8; 20].iter()).copied().collect::<Vec<u8>>();
        let mut packets = Vec::new();
        p.packetize_nal(&nal, true, |mark, payload| packets.push((mark, payload)));
        assert!(packets.len() > 1);
        assert!(packets.last().unwrap().0);
    }
}
