// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.264 depacketization/packetization, per [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184).
//!
//! Supports STAP-A aggregation, FU-A fragmentation, and single-NAL packets
//!. PTS is deferred to the marker bit, matching common
//! `packetization-mode=1` camera behavior.

use std::convert::TryFrom;
use std::num::NonZeroU32;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::client::rtp;

const NAL_HDR_TYPE_MASK: u8 = 0x1f;
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;
const NAL_TYPE_SEI: u8 = 6;
const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;
const NAL_TYPE_SLICE_IDR: u8 = 5;

/// Parameters derived from the most recently seen SPS/PPS pair.
#[derive(Clone, Debug)]
struct InternalParameters {
    sps_nal: Bytes,
    pps_nal: Bytes,
    pixel_dimensions: (u32, u32),
    rfc6381_codec: String,
    /// ISO/IEC 14496-15 `AVCDecoderConfigurationRecord`.
    extra_data: Bytes,
}

impl InternalParameters {
    fn parse(sps_nal: &[u8], pps_nal: &[u8]) -> Result<Self, String> {
        let rbsp = h264_reader::rbsp::decode_nal(&sps_nal[1..]);
        let mut reader = h264_reader::rbsp::BitReader::new(&rbsp[..]);
        let sps = h264_reader::nal::sps::SeqParameterSet::from_bits(&mut reader)
            .map_err(|e| format!("can't parse SPS: {:?}", e))?;
        let pixel_dimensions = sps
            .pixel_dimensions()
            .map_err(|e| format!("can't get pixel dimensions from SPS: {:?}", e))?;
        if sps_nal.len() < 4 {
            return Err("SPS NAL too short for profile/level bytes".to_string());
        }
        let rfc6381_codec = format!(
            "avc1.{:02X}{:02X}{:02X}",
            sps_nal[1], sps_nal[2], sps_nal[3]
        );
        let extra_data = build_avc_decoder_config(sps_nal, pps_nal);
        Ok(Self {
            sps_nal: Bytes::copy_from_slice(sps_nal),
            pps_nal: Bytes::copy_from_slice(pps_nal),
            pixel_dimensions,
            rfc6381_codec,
            extra_data,
        })
    }

    fn parameters(&self) -> super::Parameters {
        super::Parameters::Video(super::VideoParameters {
            pixel_dimensions: self.pixel_dimensions,
            rfc6381_codec: self.rfc6381_codec.clone(),
            pixel_aspect_ratio: None,
            frame_rate: None,
            extra_data: self.extra_data.clone(),
        })
    }
}

/// Builds an ISO/IEC 14496-15 `AVCDecoderConfigurationRecord` ("avcC") from a
/// single SPS/PPS pair. Minimal but spec-compliant: `lengthSizeMinusOne = 3`
/// (matches the 4-byte length prefixes this depacketizer emits).
fn build_avc_decoder_config(sps_nal: &[u8], pps_nal: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(11 + sps_nal.len() + pps_nal.len());
    out.put_u8(1); // configurationVersion
    out.put_u8(sps_nal.get(1).copied().unwrap_or(0)); // AVCProfileIndication
    out.put_u8(sps_nal.get(2).copied().unwrap_or(0)); // profile_compatibility
    out.put_u8(sps_nal.get(3).copied().unwrap_or(0)); // AVCLevelIndication
    out.put_u8(0xFC | 0x03); // reserved(6) + lengthSizeMinusOne(2) = 3
    out.put_u8(0xE0 | 0x01); // reserved(3) + numOfSequenceParameterSets(5) = 1
    out.put_u16(u16::try_from(sps_nal.len()).unwrap_or(u16::MAX));
    out.put_slice(sps_nal);
    out.put_u8(1); // numOfPictureParameterSets
    out.put_u16(u16::try_from(pps_nal.len()).unwrap_or(u16::MAX));
    out.put_slice(pps_nal);
    out.freeze()
}

struct FragmentState {
    start_ctx: crate::RtspMessageContext,
    nal_header: u8,
    data: BytesMut,
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    parameters: Option<InternalParameters>,
    fragment: Option<FragmentState>,
    /// NALs accumulated for the access unit currently in progress (between
    /// marker bits), length-prefixed in AVC form.
    au: BytesMut,
    au_start_ctx: Option<crate::RtspMessageContext>,
    au_has_idr: bool,
    au_loss: u16,
    pending: Option<super::CodecItem>,
    new_parameters: bool,
    stream_id: usize,
    pending_sps: Option<Vec<u8>>,
    pending_pps: Option<Vec<u8>>,
}

impl std::fmt::Debug for FragmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentState")
            .field("nal_header", &self.nal_header)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Depacketizer {
    pub(super) fn new(
        _clock_rate: u32,
        format_specific_params: Option<&str>,
    ) -> Result<Self, String> {
        let mut d = Self {
            parameters: None,
            fragment: None,
            au: BytesMut::new(),
            au_start_ctx: None,
            au_has_idr: false,
            au_loss: 0,
            pending: None,
            new_parameters: false,
            stream_id: 0,
            pending_sps: None,
            pending_pps: None,
        };
        // `sprop-parameter-sets=<sps-base64>,<pps-base64>` may appear in the
        // SDP `fmtp`, letting the depacketizer produce parameters before the
        // first in-band SPS/PPS arrives.
        if let Some(fmtp) = format_specific_params {
            if let Some(v) = fmtp
                .split(';')
                .map(str::trim)
                .find_map(|p| p.strip_prefix("sprop-parameter-sets="))
            {
                let mut parts = v.splitn(2, ',');
                if let (Some(sps_b64), Some(pps_b64)) = (parts.next(), parts.next()) {
                    if let (Ok(sps), Ok(pps)) = (
                        base64::decode(sps_b64),
                        base64::decode(pps_b64),
                    ) {
                        if let Ok(params) = InternalParameters::parse(&sps, &pps) {
                            d.parameters = Some(params);
                        }
                    }
                }
            }
        }
        Ok(d)
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        self.parameters.as_ref().map(InternalParameters::parameters)
    }

    fn append_nal(&mut self, nal: &[u8]) {
        self.au.put_u32(nal.len() as u32);
        self.au.put_slice(nal);
    }

    fn handle_nal(&mut self, pkt: &rtp::Packet, nal: &[u8]) -> Result<(), String> {
        if nal.is_empty() {
            return Err("empty NAL".to_string());
        }
        let nal_type = nal[0] & NAL_HDR_TYPE_MASK;
        if self.au_start_ctx.is_none() {
            self.au_start_ctx = Some(pkt.ctx);
        }
        match nal_type {
            NAL_TYPE_SPS => {
                self.pending_sps = Some(nal.to_vec());
                self.maybe_update_parameters();
                self.append_nal(nal);
            }
            NAL_TYPE_PPS => {
                self.pending_pps = Some(nal.to_vec());
                self.maybe_update_parameters();
                self.append_nal(nal);
            }
            NAL_TYPE_SLICE_IDR => {
                self.au_has_idr = true;
                self.append_nal(nal);
            }
            NAL_TYPE_SEI => {
                self.append_nal(nal);
            }
            _ => {
                self.append_nal(nal);
            }
        }
        Ok(())
    }

    fn maybe_update_parameters(&mut self) {
        if let (Some(sps), Some(pps)) = (self.pending_sps.clone(), self.pending_pps.clone()) {
            if let Ok(params) = InternalParameters::parse(&sps, &pps) {
                let changed = self
                    .parameters
                    .as_ref()
                    .map(|p| p.sps_nal.as_ref() != sps.as_slice() || p.pps_nal.as_ref() != pps.as_slice())
                    .unwrap_or(true);
                if changed {
                    self.new_parameters = true;
                }
                self.parameters = Some(params);
            }
        }
    }

    pub(super) fn push(&mut self, pkt: rtp::Packet) -> Result<(), String> {
        self.stream_id = pkt.stream_id;
        self.au_loss = self.au_loss.saturating_add(pkt.loss);
        let data = &pkt.payload[..];
        if data.is_empty() {
            return Err("empty RTP payload".to_string());
        }
        let nal_type = data[0] & NAL_HDR_TYPE_MASK;
        match nal_type {
            1..=23 => {
                // Single NAL unit packet.
                if self.fragment.is_some() {
                    log::debug!("discarding incomplete FU-A group: new single-NAL packet arrived");
                    self.fragment = None;
                    self.au_loss = self.au_loss.saturating_add(1);
                }
                self.handle_nal(&pkt, data)?;
            }
            NAL_TYPE_STAP_A => {
                if self.fragment.is_some() {
                    log::debug!("discarding incomplete FU-A group: STAP-A packet arrived");
                    self.fragment = None;
                    self.au_loss = self.au_loss.saturating_add(1);
                }
                let mut rest = &data[1..];
                while rest.len() >= 2 {
                    let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                    rest = &rest[2..];
                    if rest.len() < len {
                        return Err("STAP-A NAL length exceeds packet".to_string());
                    }
                    let (nal, tail) = rest.split_at(len);
                    self.handle_nal(&pkt, nal)?;
                    rest = tail;
                }
            }
            NAL_TYPE_FU_A => {
                if data.len() < 2 {
                    return Err("FU-A packet too short".to_string());
                }
                let fu_header = data[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let nal_header = (data[0] & 0xE0) | (fu_header & NAL_HDR_TYPE_MASK);
                if start {
                    if self.fragment.is_some() {
                        log::debug!("discarding incomplete FU-A group: new start bit before previous end");
                        self.au_loss = self.au_loss.saturating_add(1);
                    }
                    let mut buf = BytesMut::with_capacity(data.len());
                    buf.put_u8(nal_header);
                    buf.put_slice(&data[2..]);
                    self.fragment = Some(FragmentState {
                        start_ctx: pkt.ctx,
                        nal_header,
                        data: buf,
                    });
                } else {
                    match &mut self.fragment {
                        Some(frag) if frag.nal_header == nal_header => {
                            frag.data.put_slice(&data[2..]);
                        }
                        _ => {
                            return Err(
                                "FU-A continuation/end without matching start".to_string()
                            );
                        }
                    }
                }
                if end {
                    if let Some(frag) = self.fragment.take() {
                        if self.au_start_ctx.is_none() {
                            self.au_start_ctx = Some(frag.start_ctx);
                        }
                        let nal = frag.data.freeze();
                        self.handle_nal(&pkt, &nal)?;
                    }
                } else {
                    return Ok(());
                }
            }
            _ => return Err(format!("unsupported H.264 NAL type {}", nal_type)),
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
        let new_parameters = if self.new_parameters {
            self.new_parameters = false;
            self.parameters
                .as_ref()
                .map(|p| Box::new(match p.parameters() {
                    super::Parameters::Video(v) => v,
                    _ => unreachable!(),
                }))
        } else {
            None
        };
        let frame = super::VideoFrame {
            new_parameters,
            loss: std::mem::take(&mut self.au_loss),
            start_ctx: self.au_start_ctx.take().unwrap_or(pkt.ctx),
            end_ctx: pkt.ctx,
            timestamp: pkt.timestamp,
            stream_id: self.stream_id,
            is_random_access_point: self.au_has_idr,
            is_disposable: false,
            data,
        };
        self.au_has_idr = false;
        self.pending = Some(super::CodecItem::VideoFrame(frame));
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take()
    }
}

/// Encodes access units into H.264 RTP packets (STAP-A for small NALs that
/// fit together, FU-A fragmentation for any NAL exceeding
/// `payload_max_size`), per the MTU fragmentation policy.
#[derive(Debug)]
pub struct Packetizer {
    payload_max_size: usize,
    ssrc: u32,
    sequence_number: u16,
}

impl Packetizer {
    pub fn new(payload_max_size: usize, ssrc: u32, initial_sequence_number: u16) -> Self {
        Self {
            payload_max_size,
            ssrc,
            sequence_number: initial_sequence_number,
        }
    }

    /// Packetizes one Annex-B-delimited NAL unit (no start code, no length
    /// prefix) as one or more RTP payloads, calling `emit` with each
    /// `(marker, payload)` pair in order.
    pub fn packetize_nal(&mut self, nal: &[u8], is_last_nal_in_au: bool, mut emit: impl FnMut(bool, Bytes)) {
        if nal.len() <= self.payload_max_size {
            emit(is_last_nal_in_au, Bytes::copy_from_slice(nal));
            self.sequence_number = self.sequence_number.wrapping_add(1);
            return;
        }
        let nal_header = nal[0];
        let nal_type = nal_header & NAL_HDR_TYPE_MASK;
        let fu_indicator = (nal_header & 0xE0) | NAL_TYPE_FU_A;
        let mut rest = &nal[1..];
        let max_fragment = self.payload_max_size - 2;
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
            let mut payload = BytesMut::with_capacity(2 + chunk.len());
            payload.put_u8(fu_indicator);
            payload.put_u8(fu_header);
            payload.put_slice(chunk);
            emit(is_end && is_last_nal_in_au, payload.freeze());
            self.sequence_number = self.sequence_number.wrapping_add(1);
            first = false;
            rest = tail;
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(payload: &'static [u8], mark: bool, loss: u16) -> rtp::Packet {
        rtp::Packet {
            ctx: crate::RtspMessageContext::default(),
            channel_id: 0,
            stream_id: 0,
            timestamp: crate::Timestamp::new(0, NonZeroU32::new(90_000).unwrap(), 0),
            ssrc: 1,
            sequence_number: 0,
            loss,
            mark,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn single_nal_on_marker_yields_frame() {
        let mut d = Depacketizer::new(90_000, None).unwrap();
        d.push(pkt(&[0x65, 1, 2, 3], true, 0)).unwrap();
        match d.pull().unwrap() {
            super::super::CodecItem::VideoFrame(f) => {
                assert!(f.is_random_access_point);
                assert_eq!(&f.data()[4..], &[0x65, 1, 2, 3]);
            }
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn fu_a_reassembles_fragments() {
        let mut d = Depacketizer::new(90_000, None).unwrap();
        // FU indicator (nal_ref_idc=3 | type=28), FU header start|type=1 (non-IDR slice)
        d.push(pkt(&[0x7c, 0x81, 0xAA], false, 0)).unwrap();
        d.push(pkt(&[0x7c, 0x01, 0xBB], false, 0)).unwrap();
        d.push(pkt(&[0x7c, 0x41, 0xCC], true, 0)).unwrap();
        match d.pull().unwrap() {
            super::super::CodecItem::VideoFrame(f) => {
                // nal header reconstructed as (0x7c & 0xE0) | 1 = 0x61
                assert_eq!(&f.data()[4..], &[0x61, 0xAA, 0xBB, 0xCC]);
            }
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn stap_a_splits_into_multiple_nals() {
        let mut d = Depacketizer::new(90_000, None).unwrap();
        // STAP-A header (type 24), then two 2-byte NALs: [0x06, 0xAA] and [0x06, 0xBB]
        d.push(pkt(&[24, 0, 2, 0x06, 0xAA, 0, 2, 0x06, 0xBB], true, 0))
            .unwrap();
        match d.pull().unwrap() {
            super::super::CodecItem::VideoFrame(f) => {
                let data = f.data();
                assert_eq!(&data[0..4], &[0, 0, 0, 2]);
                assert_eq!(&data[4..6], &[0x06, 0xAA]);
                assert_eq!(&data[6..10], &[0, 0, 0, 2]);
                assert_eq!(&data[10..12], &[0x06, 0xBB]);
            }
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn fu_a_start_bit_discards_incomplete_previous_group() {
        let mut d = Depacketizer::new(90_000, None).unwrap();
        d.push(pkt(&[0x7c, 0x81, 0xAA], false, 0)).unwrap();
        // A new start bit before the previous group's end bit.
        d.push(pkt(&[0x7c, 0x81, 0xDD], false, 0)).unwrap();
        d.push(pkt(&[0x7c, 0x41, 0xEE], true, 0)).unwrap();
        match d.pull().unwrap() {
            super::super::CodecItem::VideoFrame(f) => {
                assert_eq!(&f.data()[4..], &[0x61, 0xDD, 0xEE]);
                assert_eq!(f.loss, 1);
            }
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn packetizer_splits_oversized_nal_into_fu_a() {
        let mut p = Packetizer::new(8, 1, 0);
        let nal = [0x65u8; 20];
        let mut packets = Vec::new();
        p.packetize_nal(&nal, true, |mark, payload| packets.push((mark, payload)));
        assert!(packets.len() > 1);
        assert!(!packets.first().unwrap().0);
        assert!(packets.last().unwrap().0);
    }

    #[test]
    fn packetizer_emits_single_packet_under_max_size() {
        let mut p = Packetizer::new(1460, 1, 0);
        let nal = [0x65u8; 10];
        let mut packets = Vec::new();
        p.packetize_nal(&nal, true, |mark, payload| packets.push((mark, payload)));
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].1[..], &nal[..]);
    }
}
