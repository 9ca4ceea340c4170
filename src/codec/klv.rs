// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! KLV (SMPTE 336M) metadata over RTP, per
//! [RFC 6597](https://datatracker.ietf.org/doc/html/rfc6597). Each RTP
//! packet carries exactly one complete KLV unit; the RTP clock runs at
//! 90 kHz.

use bytes::Bytes;

use crate::client::rtp;

#[derive(Debug)]
pub(crate) struct Depacketizer {
    pending: Option<super::MessageFrame>,
}

impl Depacketizer {
    pub(super) fn new() -> Self {
        Self { pending: None }
    }

    pub(super) fn parameters(&self) -> Option<super::Parameters> {
        None
    }

    pub(super) fn push(&mut self, pkt: rtp::Packet) -> Result<(), String> {
        if pkt.payload.is_empty() {
            return Err("empty KLV RTP payload".to_string());
        }
        if !pkt.mark {
            return Err("KLV unit spans multiple RTP packets, which isn't supported".to_string());
        }
        self.pending = Some(super::MessageFrame {
            ctx: pkt.ctx,
            timestamp: pkt.timestamp,
            stream_id: pkt.stream_id,
            loss: pkt.loss,
            data: pkt.payload,
        });
        Ok(())
    }

    pub(super) fn pull(&mut self) -> Option<super::CodecItem> {
        self.pending.take().map(super::CodecItem::MessageFrame)
    }
}

/// Encodes each KLV unit as a single RTP packet; units larger than
/// `payload_max_size` are rejected rather than silently fragmented, since
/// RFC 6597 has no fragmentation format.
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

    pub(super) fn packetize(&mut self, data: &Bytes) -> Result<Vec<super::EncodedPacket>, String> {
        if data.len() > self.payload_max_size {
            return Err(format!(
                "KLV unit of {} bytes exceeds payload_max_size {} with no fragmentation format",
                data.len(),
                self.payload_max_size
            ));
        }
        self.sequence_number = self.sequence_number.wrapping_add(1);
        Ok(vec![super::EncodedPacket {
            payload: data.clone(),
            marker: true,
        }])
    }

    pub(super) fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub(super) fn sequence_number(&self) -> u16 {
        self.sequence_number
    }
}
