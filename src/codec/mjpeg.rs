// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! M-JPEG depacketization, per [RFC 2435](https://datatracker.ietf.org/doc/html/rfc2435).
//!
//! The RTP payload carries a stripped-down JPEG frame: the main header
//! (type, Q, dimensions), an optional quantization table header, then raw
//! entropy-coded scan data with no JPEG markers at all. This module
//! reconstructs a standalone JPEG bitstream (SOI, DQT, DHT, SOF0, SOS,
//! entropy data, EOI) so the result can be handed to any JPEG decoder.
//!
//! Only `Type` 0 and 1 (4:2:0 and 4:2:2, no restart markers) are supported;
//! other types are a decode error.

use bytes::{BufMut, Bytes, BytesMut};

use crate::client::rtp;

const TYPE_420: u8 = 0;
const TYPE_422: u8 = 1;

#[rustfmt::skip]
const DEFAULT_LUMA_QUANTIZER: [u8; 64] = [
    16, 11, 10, 16, 24, 40, 51, 61,
    12, 12, 14, 19, 26, 58, 60, 55,
    14, 13, 16, 24, 40, 57, 69, 56,
    14, 17, 22, 29, 51, 87, 80, 62,
    18, 22, 37, 56, 68, 109, 103, 77,
    24, 35, 55, 64, 81, 104, 113, 92,
    49, 64, 78, 87, 103, 121, 120, 101,
    72, 92, 95, 98, 112, 100, 103, 99,
];

#[rustfmt::skip]
const DEFAULT_CHROMA_QUANTIZER: [u8; 64] = [
    17, 18, 24, 47, 99, 99, 99, 99,
    18, 21, 26, 66, 99, 99, 99, 99,
    24, 26, 56, 99, 99, 99, 99, 99,
    47, 66, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
    99, 99, 99, 99, 99, 99, 99, 99,
];

const HUFF_DC_LUMA_BITS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
const HUFF_DC_LUMA_VALUES: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

const HUFF_DC_CHROMA_BITS: [u8; 16] = [0, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0];
const HUFF_DC_CHROMA_VALUES: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

const HUFF_AC_LUMA_BITS: [u8; 16] = [0, 2, 1, 3, 3, 2, 4, 3, 5, 5, 4, 4, 0, 0, 1, 0x7d];
#[rustfmt::skip]
const HUFF_AC_LUMA_VALUES: [u8; 162] = [
    0x01, 0x02, 0x03, 0x00, 0x04, 0x11, 0x05, 0x12,
    0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61, 0x07,
    0x22, 0x71, 0x14, 0x32, 0x81, 0x91, 0xa1, 0x08,
    0x23, 0x42, 0xb1, 0xc1, 0x15, 0x52, 0xd1, 0xf0,
    0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0a, 0x16,
    0x17, 0x18, 0x19, 0x1a, 0x25, 0x26, 0x27, 0x28,
    0x29, 0x2a, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39,
    0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49,
    0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59,
    0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69,
    0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79,
    0x7a, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89,
    0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98,
    0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7,
    0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6,
    0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5,
    0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4,
    0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe1, 0xe2,
    0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea,
    0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];

const HUFF_AC_CHROMA_BITS: [u8; 16] = [0, 2, 1, 2, 4, 4, 3, 4, 7, 5, 4, 4, 0, 1, 2, 0x77];
#[rustfmt::skip]
const HUFF_AC_CHROMA_VALUES: [u8; 162] = [
    0x00, 0x01, 0x02, 0x03, 0x11, 0x04, 0x05, 0x21,
    0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61, 0x71,
    0x13, 0x22, 0x32, 0x81, 0x08, 0x14, 0x42, 0x91,
    0xa1, 0xb1, 0xc1, 0x09, 0x23, 0x33, 0x52, 0xf0,
    0x15, 0x62, 0x72, 0xd1, 0x0a, 0x16, 0x24, 0x34,
    0xe1, 0x25, 0xf1, 0x17, 0x18, 0x19, 0x1a, 0x26,
    0x27, 0x28, 0x29, 0x2a, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48,
    0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58,
    0x59, 0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68,
    0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78,
    0x79, 0x7a, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87,
    0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96,
    0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5,
    0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4,
    0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3,
    0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2,
    0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda,
    0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9,
    0xea, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];

/// Scales a default quantization table by `Q`, per RFC 2435 Appendix A.
fn scale_quantizer(default: &[u8; 64], q: u32) -> [u8; 64] {
    let q = q.clamp(1, 99);
    let factor = if q < 50 { 5000 / q } else { 200 - q * 2 };
    let mut out = [0u8; 64];
    for (o, d) in out.iter_mut().zip(default.iter()) {
        let v = (u32::from(*d) * factor + 50) / 100;
        *o = v.clamp(1, 255) as u8;
    }
    out
}

fn write_dqt(buf: &mut BytesMut, table_id: u8, table: &[u8; 64]) {
    buf.put_u8(0xff);
    buf.put_u8(0xdb); // DQT
    buf.put_u16(67); // length: 2 + 1 + 64
    buf.put_u8(table_id); // precision 0 (8 bit) in high nibble, id in low nibble
    buf.put_slice(table);
}

fn write_dht(buf: &mut BytesMut, class_and_id: u8, bits: &[u8; 16], values: &[u8]) {
    buf.put_u8(0xff);
    buf.put_u8(0xc4); // DHT
    buf.put_u16(2 + 1 + 16 + values.len() as u16);
    buf.put_u8(class_and_id);
    buf.put_slice(bits);
    buf.put_slice(values);
}

/// Reconstructs a full JPEG bitstream from an RFC 2435 fragment's header
/// fields, quantization tables, and raw entropy-coded scan data.
fn make_jpeg(
    ty: u8,
    width: u32,
    height: u32,
    luma: &[u8; 64],
    chroma: &[u8; 64],
    scan_data: &[u8],
) -> Result<Bytes, String> {
    if ty != TYPE_420 && ty != TYPE_422 {
        return Err(format!("unsupported M-JPEG Type {}", ty));
    }
    let mut buf = BytesMut::with_capacity(scan_data.len() + 512);
    buf.put_u8(0xff);
    buf.put_u8(0xd8); // SOI

    write_dqt(&mut buf, 0x00, luma);
    write_dqt(&mut buf, 0x01, chroma);

    // SOF0 (baseline DCT).
    buf.put_u8(0xff);
    buf.put_u8(0xc0);
    buf.put_u16(17); // length: 2 + 1 + 2 + 2 + 1 + 3*3
    buf.put_u8(8); // sample precision
    buf.put_u16(height as u16);
    buf.put_u16(width as u16);
    buf.put_u8(3); // 3 components: Y, Cb, Cr
    let y_sampling = if ty == TYPE_420 { 0x22 } else { 0x21 };
    buf.put_u8(0x01); // Y component id
    buf.put_u8(y_sampling);
    buf.put_u8(0x00); // quant table 0
    buf.put_u8(0x02); // Cb component id
    buf.put_u8(0x11);
    buf.put_u8(0x01); // quant table 1
    buf.put_u8(0x03); // Cr component id
    buf.put_u8(0x11);
    buf.put_u8(0x01); // quant table 1

    write_dht(&mut buf, 0x00, &HUFF_DC_LUMA_BITS, &HUFF_DC_LUMA_VALUES);
    write_dht(&mut buf, 0x01, &HUFF_DC_CHROMA_BITS, &HUFF_DC_CHROMA_VALUES);
    write_dht(&mut buf, 0x10, &HUFF_AC_LUMA_BITS, &HUFF_AC_LUMA_VALUES);
    write_dht(
        &mut buf,
        0x11,
        &HUFF_AC_CHROMA_BITS,
        &HUFF_AC_CHROMA_VALUES,
    );

    // SOS.
    buf.put_u8(0xff);
    buf.put_u8(0xda);
    buf.put_u16(12); // length: 2 + 1 + 2*3 + 3
    buf.put_u8(3);
    buf.put_u8(0x01);
    buf.put_u8(0x00); // Y: DC table 0, AC table 0
    buf.put_u8(0x02);
    buf.put_u8(0x11); // Cb: DC table 1, AC table 1
    buf.put_u8(0x03);
    buf.put_u8(0x11); // Cr: DC table 1, AC table 1
    buf.put_u8(0); // spectral selection start
    buf.put_u8(63); // spectral selection end
    buf.put_u8(0); // approximation

    buf.put_slice(scan_data);

    buf.put_u8(0xff);
    buf.put_u8(0xd9); // EOI

    Ok(buf.freeze())
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    buf: BytesMut,
    ty: u8,
    width: u32,
    height: u32,
    luma: [u8; 64],
    chroma: [u8; 64],
    have_qtables: bool,
    start_ctx: Option<crate::RtspMessageContext>,
    expected_offset: u32,
    loss: u16,
    stream_id: usize,
    pending: Option<super::CodecItem>,
}

impl Depacketizer {
    pub(super) fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            ty: 0,
            width: 0,
            height: 0,
            luma: DEFAULT_LUMA_QUANTIZER,
            chroma: DEFAULT_CHROMA_QUANTIZER,
            have_qtables: false,
            start_ctx: None,
            expected_offset: 0,
            loss: 0,
            stream_id: 0,
            pending: None,
        }
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        Some(super::Parameters::Video(super::VideoParameters {
            pixel_dimensions: (self.width, self.height),
            rfc6381_codec: "mp4v.6C".to_string(),
            pixel_aspect_ratio: None,
            frame_rate: None,
            extra_data: Bytes::new(),
        }))
    }

    pub(super) fn push(&mut self, pkt: rtp::Packet) -> Result<(), String> {
        let data = &pkt.payload[..];
        if data.len() < 8 {
            return Err("M-JPEG RTP payload shorter than main header".to_string());
        }
        let fragment_offset = u32::from_be_bytes([0, data[1], data[2], data[3]]);
        let ty = data[4];
        let q = data[5];
        let width = u32::from(data[6]) * 8;
        let height = u32::from(data[7]) * 8;
        let mut offset = 8;

        if fragment_offset == 0 {
            self.buf.clear();
            self.ty = ty;
            self.width = width;
            self.height = height;
            self.have_qtables = false;
            self.start_ctx = Some(pkt.ctx);
            self.expected_offset = 0;
            self.loss = 0;
            if q >= 128 {
                if data.len() < offset + 4 {
                    return Err("M-JPEG payload too short for quantization header".to_string());
                }
                let precision = data[offset + 1];
                let length = usize::from(u16::from_be_bytes([data[offset + 2], data[offset + 3]]));
                offset += 4;
                if data.len() < offset + length {
                    return Err("M-JPEG quantization table truncated".to_string());
                }
                if length < 128 || precision != 0 {
                    return Err("unsupported M-JPEG quantization table encoding".to_string());
                }
                self.luma.copy_from_slice(&data[offset..offset + 64]);
                self.chroma
                    .copy_from_slice(&data[offset + 64..offset + 128]);
                offset += length;
                self.have_qtables = true;
            } else {
                self.luma = scale_quantizer(&DEFAULT_LUMA_QUANTIZER, u32::from(q));
                self.chroma = scale_quantizer(&DEFAULT_CHROMA_QUANTIZER, u32::from(q));
                self.have_qtables = true;
            }
        } else {
            if !self.have_qtables || fragment_offset != self.expected_offset {
                return Err(
                    "M-JPEG fragment arrived without a matching frame start".to_string(),
                );
            }
        }

        self.loss = self.loss.saturating_add(pkt.loss);
        self.buf.put_slice(&data[offset..]);
        self.expected_offset = fragment_offset + (data.len() - offset) as u32;
        self.stream_id = pkt.stream_id;

        if pkt.mark {
            if !self.have_qtables {
                return Err("M-JPEG frame ended with no quantization tables seen".to_string());
            }
            let scan = std::mem::replace(&mut self.buf, BytesMut::new());
            let data = make_jpeg(self.ty, self.width, self.height, &self.luma, &self.chroma, &scan)?;
            self.have_qtables = false;
            self.pending = Some(super::CodecItem::VideoFrame(super::VideoFrame {
                new_parameters: None,
                loss: std::mem::take(&mut self.loss),
                start_ctx: self.start_ctx.take().unwrap_or(pkt.ctx),
                end_ctx: pkt.ctx,
                timestamp: pkt.timestamp,
                stream_id: self.stream_id,
                is_random_access_point: true,
                is_disposable: true,
                data,
            }));
        }
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take()
    }
}

struct ParsedJpeg<'a> {
    ty: u8,
    width_units: u8,
    height_units: u8,
    luma: [u8; 64],
    chroma: [u8; 64],
    scan: &'a [u8],
}

/// Extracts the fields an RFC 2435 main header and quantization table
/// header need from an already-encoded baseline JPEG bitstream.
fn parse_jpeg(data: &[u8]) -> Result<ParsedJpeg<'_>, String> {
    if data.len() < 4 || data[0..2] != [0xff, 0xd8] {
        return Err("not a JPEG bitstream (missing SOI)".to_string());
    }
    let mut luma = DEFAULT_LUMA_QUANTIZER;
    let mut chroma = DEFAULT_CHROMA_QUANTIZER;
    let mut width_units = 0u8;
    let mut height_units = 0u8;
    let mut ty = TYPE_420;
    let mut pos = 2;
    loop {
        if pos + 4 > data.len() || data[pos] != 0xff {
            return Err("malformed JPEG marker segment".to_string());
        }
        let marker = data[pos + 1];
        if marker == 0xd9 {
            return Err("reached EOI before SOS".to_string());
        }
        let seg_len = usize::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));
        let seg_start = pos + 4;
        let seg_end = seg_start + seg_len - 2;
        if seg_end > data.len() {
            return Err("JPEG marker segment exceeds bitstream".to_string());
        }
        match marker {
            0xdb => {
                // DQT: one or more tables, each [id:1][64 bytes] (8-bit precision only).
                let mut p = seg_start;
                while p + 65 <= seg_end {
                    let id = data[p] & 0x0f;
                    let table = &data[p + 1..p + 65];
                    if id == 0 {
                        luma.copy_from_slice(table);
                    } else {
                        chroma.copy_from_slice(table);
                    }
                    p += 65;
                }
            }
            0xc0 | 0xc1 => {
                let height = u16::from_be_bytes([data[seg_start + 1], data[seg_start + 2]]);
                let width = u16::from_be_bytes([data[seg_start + 3], data[seg_start + 4]]);
                width_units = (width.div_ceil(8)).min(255) as u8;
                height_units = (height.div_ceil(8)).min(255) as u8;
                let num_components = data[seg_start + 5];
                if num_components == 3 {
                    let y_sampling = data[seg_start + 7];
                    ty = if y_sampling == 0x22 {
                        TYPE_420
                    } else {
                        TYPE_422
                    };
                }
            }
            0xda => {
                // SOS: header ends at seg_end; entropy data follows until EOI.
                let scan_start = seg_end;
                let mut p = scan_start;
                while p + 1 < data.len() {
                    if data[p] == 0xff && data[p + 1] == 0xd9 {
                        return Ok(ParsedJpeg {
                            ty,
                            width_units,
                            height_units,
                            luma,
                            chroma,
                            scan: &data[scan_start..p],
                        });
                    }
                    p += 1;
                }
                return Err("JPEG bitstream missing EOI".to_string());
            }
            _ => {}
        }
        pos = seg_end;
    }
}

/// Re-packetizes an already-encoded baseline JPEG bitstream into RFC 2435
/// fragments, carrying the source image's own quantization tables
/// explicitly (`Q=255`) on the first fragment only.
#[derive(Debug)]
pub(crate) struct Packetizer {
    payload_max_size: usize,
    ssrc: u32,
    sequence_number: u16,
}

impl Packetizer {
    pub(super) fn new(payload_max_size: usize, ssrc: u32, initial_sequence_number: u16) -> Self {
        Self {
            payload_max_size: payload_max_size.saturating_sub(8).max(1),
            ssrc,
            sequence_number: initial_sequence_number,
        }
    }

    pub(super) fn packetize(&mut self, jpeg: &Bytes) -> Result<Vec<super::EncodedPacket>, String> {
        let parsed = parse_jpeg(jpeg)?;
        let mut out = Vec::new();
        let mut offset = 0usize;
        let scan = parsed.scan;
        loop {
            let end = (offset + self.payload_max_size).min(scan.len());
            let mut payload = BytesMut::with_capacity(8 + 128 + (end - offset));
            let fo = offset as u32;
            payload.put_u8(0); // type-specific
            payload.put_u8((fo >> 16) as u8);
            payload.put_u8((fo >> 8) as u8);
            payload.put_u8(fo as u8);
            payload.put_u8(parsed.ty);
            payload.put_u8(255); // Q: explicit quantization tables follow
            payload.put_u8(parsed.width_units);
            payload.put_u8(parsed.height_units);
            if offset == 0 {
                payload.put_u8(0); // MBZ
                payload.put_u8(0); // precision: 8-bit
                payload.put_u16(128); // length
                payload.put_slice(&parsed.luma);
                payload.put_slice(&parsed.chroma);
            }
            payload.put_slice(&scan[offset..end]);
            let is_end = end == scan.len();
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
        Ok(out)
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
    fn single_fragment_frame_yields_full_jpeg() {
        let mut d = Depacketizer::new();
        // offset=0, type=0 (4:2:0), q=50, width=16 (2*8), height=16 (2*8).
        let mut payload = vec![0u8, 0, 0, 0, TYPE_420, 50, 2, 2];
        payload.extend_from_slice(&[0xAA; 16]);
        d.push(pkt(payload, true)).unwrap();
        match d.pull().unwrap() {
            super::super::CodecItem::VideoFrame(f) => {
                let data = f.data();
                assert_eq!(&data[0..2], &[0xff, 0xd8]);
                assert_eq!(&data[data.len() - 2..], &[0xff, 0xd9]);
            }
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn unsupported_type_is_rejected() {
        let mut d = Depacketizer::new();
        let mut payload = vec![0u8, 0, 0, 0, 64, 50, 2, 2];
        payload.extend_from_slice(&[0xAA; 16]);
        assert!(d.push(pkt(payload, true)).is_err());
    }

    #[test]
    fn fragment_with_no_start_is_rejected() {
        let mut d = Depacketizer::new();
        let payload = vec![0u8, 0, 0, 4, TYPE_420, 50, 2, 2];
        assert!(d.push(pkt(payload, false)).is_err());
    }

    #[test]
    fn explicit_quantization_tables_are_used_at_q255() {
        let mut d = Depacketizer::new();
        let mut payload = vec![0u8, 0, 0, 0, TYPE_420, 255, 1, 1];
        payload.extend_from_slice(&[0, 0, 0, 128]); // MBZ, precision=0, length=128
        payload.extend_from_slice(&[7u8; 64]); // luma
        payload.extend_from_slice(&[9u8; 64]); // chroma
        payload.extend_from_slice(&[0xAA; 8]);
        d.push(pkt(payload, true)).unwrap();
        assert!(d.pull().is_some());
    }

    #[test]
    fn packetizer_round_trips_through_synthesized_jpeg() {
        let jpeg = make_jpeg(
            TYPE_420,
            16,
            16,
            &DEFAULT_LUMA_QUANTIZER,
            &DEFAULT_CHROMA_QUANTIZER,
            &[0xAAu8; 32],
        )
        .unwrap();
        let mut p = Packetizer::new(1460, 1, 0);
        let packets = p.packetize(&jpeg).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].marker);
        assert_eq!(packets[0].payload[6], 2); // width units: 16/8
    }
}
