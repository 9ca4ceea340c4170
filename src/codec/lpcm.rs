// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LPCM depacketization/packetization, per [RFC 3190](https://datatracker.ietf.org/doc/html/rfc3190).
//!
//! Each RTP payload is raw interleaved PCM samples; `sample_size =
//! bit_depth * channels / 8` bytes, and the payload length must be a
//! multiple of it. PTS advances by `payload_len / sample_size` samples.

use std::num::NonZeroU32;

use crate::client::rtp;

#[derive(Debug)]
pub(crate) struct Depacketizer {
    clock_rate: u32,
    bit_depth: u32,
    channels: u32,
    sample_size: usize,
    pending: Option<super::AudioFrame>,
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32, bit_depth: u32, channels: u32) -> Result<Self, String> {
        if bit_depth == 0 || channels == 0 {
            return Err("LPCM requires nonzero bit depth and channel count".to_string());
        }
        let bits = bit_depth * channels;
        if bits % 8 != 0 {
            return Err(format!(
                "LPCM bit_depth {} * channels {} isn't a whole number of bytes",
                bit_depth, channels
            ));
        }
        Ok(Self {
            clock_rate,
            bit_depth,
            channels,
            sample_size: (bits / 8) as usize,
            pending: None,
        })
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        Some(super::Parameters::Audio(super::AudioParameters {
            rfc6381_codec: Some(format!("lpcm{}", self.bit_depth)),
            frame_length: NonZeroU32::new(1),
            clock_rate: self.clock_rate,
            extra_data: bytes::Bytes::new(),
            sample_entry: None,
        }))
    }

    pub(super) fn push(&mut self, pkt: rtp::Packet) -> Result<(), String> {
        if pkt.payload.is_empty() {
            return Err("empty LPCM RTP payload".to_string());
        }
        if pkt.payload.len() % self.sample_size != 0 {
            return Err(format!(
                "LPCM payload length {} isn't a multiple of sample_size {}",
                pkt.payload.len(),
                self.sample_size
            ));
        }
        let samples_per_channel = (pkt.payload.len() / self.sample_size) as u32;
        let frame_length = NonZeroU32::new(samples_per_channel)
            .ok_or_else(|| "LPCM payload yields zero samples".to_string())?;
        self.pending = Some(super::AudioFrame {
            ctx: pkt.ctx,
            stream_id: pkt.stream_id,
            timestamp: pkt.timestamp,
            frame_length,
            loss: pkt.loss,
            data: pkt.payload,
        });
        let _ = self.channels;
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take().map(super::CodecItem::AudioFrame)
    }
}

/// Encodes raw PCM by splitting it into `payload_max_size` chunks, rounded
/// down to a whole number of samples so no fragment splits a sample.
#[derive(Debug)]
pub(crate) struct Packetizer {
    payload_max_size: usize,
    sample_size: usize,
    ssrc: u32,
    sequence_number: u16,
}

impl Packetizer {
    pub(super) fn new(
        payload_max_size: usize,
        sample_size: usize,
        ssrc: u32,
        initial_sequence_number: u16,
    ) -> Self {
        let sample_size = sample_size.max(1);
        let max_size = (payload_max_size / sample_size).max(1) * sample_size;
        Self {
            payload_max_size: max_size,
            sample_size,
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

    #[cfg(test)]
    fn sample_size(&self) -> usize {
        self.sample_size
    }
}
