// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VP9 depacketization/packetization, per
//! [draft-ietf-payload-vp9-16](https://datatracker.ietf.org/doc/html/draft-ietf-payload-vp9-16).
//!
//! Each payload descriptor carries `B` (start of frame) and `E` (end of
//! frame) bits; fragments are joined from a `B` packet through the
//! matching `E` packet. A non-`B` fragment with no prior start is rejected
//! (`NonStartingNoPrevious`), and an assembled frame exceeding
//! [MAX_FRAME_SIZE] is rejected too.

use bytes::{BufMut, Bytes, BytesMut};

use crate::client::rtp;

const MAX_FRAME_SIZE: usize = 1 << 20; // 1 MiB.

struct Descriptor {
    header_len: usize,
    start: bool,
    end: bool,
}

fn parse_descriptor(data: &[u8]) -> Result<Descriptor, String> {
    if data.is_empty() {
        return Err("empty VP9 payload".to_string());
    }
    let b0 = data[0];
    let i = b0 & 0x80 != 0;
    let p = b0 & 0x40 != 0;
    let l = b0 & 0x20 != 0;
    let f = b0 & 0x10 != 0;
    let start = b0 & 0x08 != 0;
    let end = b0 & 0x04 != 0;
    let v = b0 & 0x02 != 0;
    let mut len = 1;
    if i {
        if data.len() <= len {
            return Err("VP9 payload too short for PictureID".to_string());
        }
        len += if data[len] & 0x80 != 0 { 2 } else { 1 };
    }
    if l {
        if data.len() <= len {
            return Err("VP9 payload too short for layer indices".to_string());
        }
        len += 1;
        if !f {
            len += 1; // TL0PICIDX
        }
    }
    if f && p {
        loop {
            if data.len() <= len {
                return Err("VP9 payload too short for reference indices".to_string());
            }
            let more = data[len] & 0x01 != 0;
            len += 1;
            if !more {
                break;
            }
        }
    }
    if v {
        return Err("VP9 scalability structure not supported".to_string());
    }
    if data.len() < len {
        return Err("VP9 payload descriptor exceeds packet".to_string());
    }
    Ok(Descriptor {
        header_len: len,
        start,
        end,
    })
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    buf: BytesMut,
    started: bool,
    start_ctx: Option<crate::RtspMessageContext>,
    loss: u16,
    stream_id: usize,
    pending: Option<super::CodecItem>,
}

impl Depacketizer {
    pub(super) fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            started: false,
            start_ctx: None,
            loss: 0,
            stream_id: 0,
            pending: None,
        }
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        Some(super::Parameters::Video(super::VideoParameters {
            pixel_dimensions: (0, 0),
            rfc6381_codec: "vp09".to_string(),
            pixel_aspect_ratio: None,
            frame_rate: None,
            extra_data: Bytes::new(),
        }))
    }

    pub(super) fn push(&mut self, pkt: rtp::Packet) -> Result<(), String> {
        let d = parse_descriptor(&pkt.payload)?;
        if d.start {
            self.buf.clear();
            self.started = true;
            self.start_ctx = Some(pkt.ctx);
            self.loss = 0;
        } else if !self.started {
            return Err("NonStartingNoPrevious".to_string());
        }
        self.loss = self.loss.saturating_add(pkt.loss);
        self.buf.put_slice(&pkt.payload[d.header_len..]);
        if self.buf.len() > MAX_FRAME_SIZE {
            self.started = false;
            self.buf.clear();
            return Err("VP9 assembled frame exceeds 1 MiB".to_string());
        }
        self.stream_id = pkt.stream_id;
        if d.end {
            self.started = false;
            let data = std::mem::replace(&mut self.buf, BytesMut::new()).freeze();
            self.pending = Some(super::CodecItem::VideoFrame(super::VideoFrame {
                new_parameters: None,
                loss: std::mem::take(&mut self.loss),
                start_ctx: self.start_ctx.take().unwrap_or(pkt.ctx),
                end_ctx: pkt.ctx,
                timestamp: pkt.timestamp,
                stream_id: self.stream_id,
                is_random_access_point: false,
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

/// Encodes VP9 frames with a minimal (non-flexible, no picture-id) payload
/// descriptor carrying only `B`/`E`.
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
        loop {
            let end = (offset + self.payload_max_size).min(data.len());
            let is_start = offset == 0;
            let is_end = end == data.len();
            let mut b0 = 0u8;
            if is_start {
                b0 |= 0x08;
            }
            if is_end {
                b0 |= 0x04;
            }
            let mut payload = BytesMut::with_capacity(1 + (end - offset));
            payload.put_u8(b0);
            payload.extend_from_slice(&data[offset..end]);
            out.push(super::EncodedPacket {
                payload: payload.freeze(),
                marker: is_end,
            });
            offset = end;
            if is_end {
                break;
            }
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
