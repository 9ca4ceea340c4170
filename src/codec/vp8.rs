// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VP8 depacketization/packetization, per [RFC 7741](https://datatracker.ietf.org/doc/html/rfc7741).
//!
//! Each RTP payload starts with a payload descriptor (§4.2) whose `S` bit
//! marks the start of a new VP8 partition; fragments are simply
//! concatenated in sequence order and the access unit completes on the
//! marker bit.

use bytes::{BufMut, Bytes, BytesMut};

use crate::client::rtp;

/// Parses a VP8 payload descriptor, returning `(header_len, is_start)`.
fn parse_descriptor(data: &[u8]) -> Result<(usize, bool), String> {
    if data.is_empty() {
        return Err("empty VP8 payload".to_string());
    }
    let b0 = data[0];
    let x = b0 & 0x80 != 0;
    let s = b0 & 0x10 != 0;
    let mut len = 1;
    if x {
        if data.len() < 2 {
            return Err("VP8 payload too short for extended descriptor".to_string());
        }
        let b1 = data[1];
        len += 1;
        if b1 & 0x80 != 0 {
            // PictureID present; 1 or 2 bytes depending on the M bit.
            if data.len() < len + 1 {
                return Err("VP8 payload too short for PictureID".to_string());
            }
            len += if data[len] & 0x80 != 0 { 2 } else { 1 };
        }
        if b1 & 0x40 != 0 {
            len += 1; // TL0PICIDX
        }
        if b1 & 0x20 != 0 || b1 & 0x10 != 0 {
            len += 1; // TID and/or KEYIDX, packed into one byte
        }
    }
    if data.len() < len {
        return Err("VP8 payload descriptor exceeds packet".to_string());
    }
    Ok((len, s))
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    buf: BytesMut,
    start_ctx: Option<crate::RtspMessageContext>,
    loss: u16,
    stream_id: usize,
    is_key_frame: bool,
    pending: Option<super::CodecItem>,
}

impl Depacketizer {
    pub(super) fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            start_ctx: None,
            loss: 0,
            stream_id: 0,
            is_key_frame: false,
            pending: None,
        }
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        Some(super::Parameters::Video(super::VideoParameters {
            pixel_dimensions: (0, 0),
            rfc6381_codec: "vp08".to_string(),
            pixel_aspect_ratio: None,
            frame_rate: None,
            extra_data: Bytes::new(),
        }))
    }

    pub(super) fn push(&mut self, pkt: rtp::Packet) -> Result<(), String> {
        let (header_len, is_start) = parse_descriptor(&pkt.payload)?;
        if self.buf.is_empty() {
            self.start_ctx = Some(pkt.ctx);
            let body = &pkt.payload[header_len..];
            if is_start && !body.is_empty() {
                // First byte of the first partition: bit 0 clear => key frame.
                self.is_key_frame = body[0] & 0x01 == 0;
            }
        }
        self.loss = self.loss.saturating_add(pkt.loss);
        self.buf.put_slice(&pkt.payload[header_len..]);
        self.stream_id = pkt.stream_id;
        if pkt.mark {
            let data = std::mem::replace(&mut self.buf, BytesMut::new()).freeze();
            self.pending = Some(super::CodecItem::VideoFrame(super::VideoFrame {
                new_parameters: None,
                loss: std::mem::take(&mut self.loss),
                start_ctx: self.start_ctx.take().unwrap_or(pkt.ctx),
                end_ctx: pkt.ctx,
                timestamp: pkt.timestamp,
                stream_id: self.stream_id,
                is_random_access_point: std::mem::take(&mut self.is_key_frame),
                is_disposable: false,
                data,
            }));
        }
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take()
    }
}

/// Encodes VP8 frames by splitting the (already-encoded) bitstream into
/// `payload_max_size` chunks, each prefixed with a minimal non-extended
/// payload descriptor whose `S` bit marks the first fragment.
#[derive(Debug)]
pub(crate) struct Packetizer {
    payload_max_size: usize,
    ssrc: u32,
    sequence_number: u16,
}

impl Packetizer {
    pub(super) fn new(payload_max_size: usize, ssrc: u32, initial_sequence_number: u16) -> Self {
        Self {
            payload_max_size: payload_max_size.saturating_sub(1).max(1),
            ssrc,
            sequence_number: initial_sequence_number,
        }
    }

    pub(super) fn packetize(&mut self, data: &Bytes) -> Vec<super::EncodedPacket> {
        let mut out = Vec::new();
        let mut offset = 0;
        let mut first = true;
        if data.is_empty() {
            out.push(super::EncodedPacket {
                payload: Bytes::from_static(&[0x10]),
                marker: true,
            });
        }
        while offset < data.len() {
            let end = (offset + self.payload_max_size).min(data.len());
            let mut payload = BytesMut::with_capacity(1 + (end - offset));
            payload.put_u8(if first { 0x10 } else { 0x00 });
            payload.extend_from_slice(&data[offset..end]);
            out.push(super::EncodedPacket {
                payload: payload.freeze(),
                marker: end == data.len(),
            });
            offset = end;
            first = false;
        }
        self.sequence_number = self.sequence_number.wrapping_add(out.len() as u16);
        out
    }

    pub(super) fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub(super) fn sequence_number(&self) -> u16 {
        self.sequence_number
    }
}
