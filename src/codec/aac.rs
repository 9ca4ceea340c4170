// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MPEG-4 audio depacketization, per [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640)
//! (`audio/mpeg4-generic`). Handles the AU-header section (`SizeLength`,
//! `IndexLength`, `IndexDeltaLength`) and fragmentation of a single AU
//! across multiple RTP packets.

use std::collections::VecDeque;
use std::num::{NonZeroU16, NonZeroU32};

use bitreader::BitReader;
use bytes::{Bytes, BytesMut};

use crate::client::rtp;
use crate::{ConnectionContext, Error};

struct FragmentState {
    remaining: usize,
    data: BytesMut,
    ctx: crate::RtspMessageContext,
    timestamp: crate::Timestamp,
    loss: u16,
}

impl std::fmt::Debug for FragmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentState")
            .field("remaining", &self.remaining)
            .field("have", &self.data.len())
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    clock_rate: u32,
    channels: Option<NonZeroU16>,
    config: Bytes,
    size_length: u32,
    index_length: u32,
    index_delta_length: u32,
    fragment: Option<FragmentState>,
    pending: VecDeque<super::AudioFrame>,
}

/// A default samples-per-frame of 1024, used only to space out the
/// timestamps of multiple AUs aggregated into a single RTP packet absent a
/// fragment-based AU header count (most encoders send one AU per packet in
/// practice, so this is rarely exercised).
const DEFAULT_SAMPLES_PER_FRAME: u32 = 1024;

impl Depacketizer {
    pub(super) fn new(
        clock_rate: u32,
        channels: Option<NonZeroU16>,
        format_specific_params: Option<&str>,
    ) -> Result<Self, String> {
        let fmtp = format_specific_params.ok_or("mpeg4-generic stream missing fmtp")?;
        let mut config = Bytes::new();
        let mut size_length = 0u32;
        let mut index_length = 0u32;
        let mut index_delta_length = 0u32;
        let mut mode = None;
        for part in fmtp.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| format!("malformed fmtp parameter {:?}", part))?;
            match key.trim().to_ascii_lowercase().as_str() {
                "config" => {
                    config = Bytes::from(
                        hex::decode(value.trim())
                            .map_err(|e| format!("bad config hex: {}", e))?,
                    );
                }
                "sizelength" => size_length = value.trim().parse().map_err(|_| "bad sizelength")?,
                "indexlength" => {
                    index_length = value.trim().parse().map_err(|_| "bad indexlength")?
                }
                "indexdeltalength" => {
                    index_delta_length = value
                        .trim()
                        .parse()
                        .map_err(|_| "bad indexdeltalength")?
                }
                "mode" => mode = Some(value.trim().to_ascii_lowercase()),
                _ => {}
            }
        }
        if let Some(mode) = &mode {
            if mode != "aac-hbr" && mode != "aac-lbr" {
                return Err(format!("unsupported mpeg4-generic mode {:?}", mode));
            }
        }
        if size_length == 0 {
            return Err("mpeg4-generic fmtp missing sizelength".to_string());
        }
        Ok(Self {
            clock_rate,
            channels,
            config,
            size_length,
            index_length,
            index_delta_length,
            fragment: None,
            pending: VecDeque::new(),
        })
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        Some(super::Parameters::Audio(super::AudioParameters {
            rfc6381_codec: Some("mp4a.40.2".to_string()),
            frame_length: NonZeroU32::new(DEFAULT_SAMPLES_PER_FRAME),
            clock_rate: self.clock_rate,
            extra_data: self.config.clone(),
            sample_entry: None,
        }))
    }

    /// Parses the AU-header section, returning `(sizes, header_bytes_len)`.
    fn parse_au_headers(&self, data: &[u8]) -> Result<(Vec<u32>, usize), String> {
        if data.len() < 2 {
            return Err("mpeg4-generic packet too short for AU-headers-length".to_string());
        }
        let au_headers_length_bits = u16::from_be_bytes([data[0], data[1]]) as usize;
        let header_bytes = 2 + (au_headers_length_bits + 7) / 8;
        if data.len() < header_bytes {
            return Err("mpeg4-generic AU-headers section truncated".to_string());
        }
        let mut reader = BitReader::new(&data[2..header_bytes]);
        let mut sizes = Vec::new();
        let mut read_bits = 0usize;
        let per_header_bits = (self.size_length + self.index_length) as usize;
        if per_header_bits == 0 {
            return Err("mpeg4-generic AU header has zero width".to_string());
        }
        let mut first = true;
        while read_bits + per_header_bits <= au_headers_length_bits {
            let size = reader
                .read_u32(self.size_length as u8)
                .map_err(|e| format!("bad AU-header size field: {}", e))?;
            let delta_bits = if first {
                self.index_length
            } else {
                self.index_delta_length
            };
            if delta_bits > 0 {
                let _ = reader
                    .read_u32(delta_bits as u8)
                    .map_err(|e| format!("bad AU-header index field: {}", e))?;
            }
            sizes.push(size);
            read_bits += (self.size_length + delta_bits) as usize;
            first = false;
        }
        if sizes.is_empty() {
            return Err("mpeg4-generic packet has no AU headers".to_string());
        }
        Ok((sizes, header_bytes))
    }

    pub(super) fn push(&mut self, pkt: rtp::Packet) -> Result<(), String> {
        if let Some(frag) = &mut self.fragment {
            let take = frag.remaining.min(pkt.payload.len());
            frag.data.extend_from_slice(&pkt.payload[..take]);
            frag.remaining -= take;
            frag.loss = frag.loss.saturating_add(pkt.loss);
            if frag.remaining == 0 || pkt.mark {
                let frag = self.fragment.take().unwrap();
                let frame_length = NonZeroU32::new(DEFAULT_SAMPLES_PER_FRAME).unwrap();
                self.pending.push_back(super::AudioFrame {
                    ctx: frag.ctx,
                    stream_id: pkt.stream_id,
                    timestamp: frag.timestamp,
                    frame_length,
                    loss: frag.loss,
                    data: frag.data.freeze(),
                });
            }
            return Ok(());
        }

        let (sizes, header_bytes) = self.parse_au_headers(&pkt.payload)?;
        let mut offset = header_bytes;
        let frame_length = NonZeroU32::new(DEFAULT_SAMPLES_PER_FRAME).unwrap();
        for (i, &size) in sizes.iter().enumerate() {
            let size = size as usize;
            let available = pkt.payload.len() - offset;
            let is_last_header = i + 1 == sizes.len();
            if is_last_header && available < size {
                // AU fragmented across subsequent packets (no AU-header there).
                let mut data = BytesMut::with_capacity(size);
                data.extend_from_slice(&pkt.payload[offset..]);
                self.fragment = Some(FragmentState {
                    remaining: size - available,
                    data,
                    ctx: pkt.ctx,
                    timestamp: pkt.timestamp,
                    loss: pkt.loss,
                });
                return Ok(());
            }
            if available < size {
                return Err("mpeg4-generic AU-header declares more data than present".to_string());
            }
            let data = pkt.payload.slice(offset..offset + size);
            offset += size;
            self.pending.push_back(super::AudioFrame {
                ctx: pkt.ctx,
                stream_id: pkt.stream_id,
                timestamp: pkt.timestamp,
                frame_length,
                loss: if i == 0 { pkt.loss } else { 0 },
                data,
            });
        }
        Ok(())
    }

    pub(super) fn pull(
        &mut self,
        _conn_ctx: &ConnectionContext,
    ) -> Result<Option<super::CodecItem>, Error> {
        Ok(self.pending.pop_front().map(super::CodecItem::AudioFrame))
    }
}

/// Encodes AAC access units per RFC 3640 §3.2, using the common `sizelength
/// = 13, indexlength = 3` AU-header layout (one AU-header per packet; this
/// packetizer never aggregates multiple AUs into one packet). An AU larger
/// than `payload_max_size` is fragmented across subsequent packets carrying
/// no AU-header section, per §3.2.3.2.
#[derive(Debug)]
pub(crate) struct Packetizer {
    payload_max_size: usize,
    ssrc: u32,
    sequence_number: u16,
}

const SIZE_LENGTH_BITS: u32 = 13;
const HEADER_SECTION_BYTES: usize = 4; // 2-byte AU-headers-length + 2-byte AU-header.

impl Packetizer {
    pub(super) fn new(payload_max_size: usize, ssrc: u32, initial_sequence_number: u16) -> Self {
        Self {
            payload_max_size,
            ssrc,
            sequence_number: initial_sequence_number,
        }
    }

    pub(super) fn packetize(&mut self, data: &Bytes) -> Vec<super::EncodedPacket> {
        let mut out = Vec::new();
        if data.len() >= (1 << SIZE_LENGTH_BITS) {
            // Can't represent the AU's size in 13 bits; truncate rather than panic.
            log::warn!("AAC access unit of {} bytes exceeds AU-header size field", data.len());
        }
        let au_size = (data.len() as u32).min((1 << SIZE_LENGTH_BITS) - 1);
        let au_header: u16 = ((au_size as u16) << 3) & 0xFFF8;
        let first_chunk_max = self.payload_max_size.saturating_sub(HEADER_SECTION_BYTES);
        let first_take = first_chunk_max.min(data.len());
        let mut header = BytesMut::with_capacity(HEADER_SECTION_BYTES + first_take);
        header.extend_from_slice(&(16u16).to_be_bytes());
        header.extend_from_slice(&au_header.to_be_bytes());
        header.extend_from_slice(&data[..first_take]);
        let is_last = first_take == data.len();
        out.push(super::EncodedPacket {
            payload: header.freeze(),
            marker: is_last,
        });
        let mut offset = first_take;
        while offset < data.len() {
            let end = (offset + self.payload_max_size).min(data.len());
            out.push(super::EncodedPacket {
                payload: data.slice(offset..end),
                marker: end == data.len(),
            });
            offset = end;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::rtp::Packet as RtpPacket;

    fn fmtp() -> &'static str {
        "streamtype=5; profile-level-id=15; mode=AAC-hbr; sizelength=13; indexlength=3; indexdeltalength=3; config=1210"
    }

    fn pkt(payload: Bytes, mark: bool) -> RtpPacket {
        RtpPacket {
            ctx: crate::RtspMessageContext::default(),
            channel_id: 0,
            stream_id: 0,
            timestamp: crate::Timestamp::new(0, NonZeroU32::new(48_000).unwrap(), 0),
            ssrc: 1,
            sequence_number: 0,
            loss: 0,
            mark,
            payload,
        }
    }

    #[test]
    fn single_au_round_trips() {
        let mut d = Depacketizer::new(48_000, NonZeroU16::new(2), Some(fmtp())).unwrap();
        // AU-headers-length = 16 bits (one header: 13-bit size + 3-bit index).
        // size=4 (0b0000000000100), index=0 => header bits: 0000000000100 000
        let mut payload = vec![0u8, 16];
        payload.push(0b0000_0000);
        payload.push(0b0100_0000);
        payload.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD]);
        d.push(pkt(Bytes::from(payload), true)).unwrap();
        let item = d.pull(&ConnectionContext::dummy()).unwrap().unwrap();
        match item {
            super::super::CodecItem::AudioFrame(f) => {
                assert_eq!(&f.data[..], &[0xAA, 0xBB, 0xCC, 0xDD]);
            }
            _ => panic!("expected audio frame"),
        }
    }

    #[test]
    fn missing_fmtp_is_rejected() {
        assert!(Depacketizer::new(48_000, None, None).is_err());
    }
}
