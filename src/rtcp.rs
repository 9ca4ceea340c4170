// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP packet parsing and generation; see [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).
//!
//! This module only speaks the subset of RTCP the rest of the crate needs:
//! Sender Report and Receiver Report parsing (for [crate::client::rtp]) and
//! SR/RR/SDES/BYE generation (for the liveness timer on both client and
//! server, and for a server's RECORD ingress echo).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::NtpTimestamp;

const RTCP_VERSION: u8 = 2;

const PT_SR: u8 = 200;
const PT_RR: u8 = 201;
const PT_SDES: u8 = 202;
const PT_BYE: u8 = 203;

const SDES_CNAME: u8 = 1;

/// A single parsed RTCP packet, as found within a compound RTCP packet.
#[derive(Debug)]
pub enum Packet<'a> {
    SenderReport(SenderReport<'a>),
    Unknown(Unknown<'a>),
}

impl<'a> Packet<'a> {
    /// Parses the first RTCP packet from `data`, returning it along with the
    /// remaining bytes (for compound packets, where several short packets
    /// follow one another per RFC 3550 §6.1).
    pub fn parse(data: &'a [u8]) -> Result<(Self, &'a [u8]), String> {
        if data.len() < 4 {
            return Err("RTCP packet too short for header".into());
        }
        let version = data[0] >> 6;
        if version != RTCP_VERSION {
            return Err(format!("bad RTCP version {}", version));
        }
        let count = data[0] & 0x1f;
        let payload_type = data[1];
        let length_words = u16::from_be_bytes([data[2], data[3]]);
        let total_len = (usize::from(length_words) + 1) * 4;
        if data.len() < total_len {
            return Err(format!(
                "RTCP packet of {} declared bytes but only {} present",
                total_len,
                data.len()
            ));
        }
        let (this, rest) = data.split_at(total_len);
        let pkt = match payload_type {
            PT_SR => Packet::SenderReport(SenderReport::parse(this)?),
            _ => Packet::Unknown(Unknown {
                payload_type,
                count,
                data: this,
            }),
        };
        Ok((pkt, rest))
    }
}

/// An RTCP Sender Report (RFC 3550 §6.4.1): sent by an active sender,
/// correlating its RTP timestamp with wall-clock (NTP) time.
#[derive(Debug)]
pub struct SenderReport<'a> {
    data: &'a [u8],
}

impl<'a> SenderReport<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, String> {
        if data.len() < 28 {
            return Err("SR packet too short".into());
        }
        Ok(Self { data })
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes(self.data[4..8].try_into().unwrap())
    }

    pub fn ntp_timestamp(&self) -> NtpTimestamp {
        NtpTimestamp(u64::from_be_bytes(self.data[8..16].try_into().unwrap()))
    }

    pub fn rtp_timestamp(&self) -> u32 {
        u32::from_be_bytes(self.data[16..20].try_into().unwrap())
    }

    pub fn sender_packet_count(&self) -> u32 {
        u32::from_be_bytes(self.data[20..24].try_into().unwrap())
    }

    pub fn sender_octet_count(&self) -> u32 {
        u32::from_be_bytes(self.data[24..28].try_into().unwrap())
    }
}

/// A report block type this crate doesn't otherwise decode (RR, SDES, BYE,
/// APP, or a profile-specific extension); kept around only so
/// [Packet::parse] can skip past it to find subsequent packets in a compound
/// RTCP message.
#[derive(Debug)]
pub struct Unknown<'a> {
    payload_type: u8,
    count: u8,
    data: &'a [u8],
}

impl<'a> Unknown<'a> {
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn raw(&self) -> &'a [u8] {
        self.data
    }
}

/// One "report block" within an RR or SR, per RFC 3550 §6.4.1/§6.4.2.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: i32,
    pub extended_highest_seq: u32,
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

/// Appends a Receiver Report (RFC 3550 §6.4.2) for one or more streams.
pub fn write_receiver_report(out: &mut BytesMut, reporter_ssrc: u32, blocks: &[ReportBlock]) {
    assert!(blocks.len() <= 31);
    let length_words = 1 + blocks.len() * 6; // +1 for the SSRC word
    out.put_u8((RTCP_VERSION << 6) | (blocks.len() as u8));
    out.put_u8(PT_RR);
    out.put_u16(length_words as u16);
    out.put_u32(reporter_ssrc);
    for b in blocks {
        out.put_u32(b.ssrc);
        out.put_u8(b.fraction_lost);
        let lost = b.cumulative_lost.clamp(-0x80_0000, 0x7F_FFFF);
        let lost_bytes = lost.to_be_bytes();
        out.put_slice(&lost_bytes[1..4]);
        out.put_u32(b.extended_highest_seq);
        out.put_u32(b.jitter);
        out.put_u32(b.last_sr);
        out.put_u32(b.delay_since_last_sr);
    }
}

/// Appends a Sender Report (RFC 3550 §6.4.1) with no attached report blocks
/// (a server generating ingress-side keep-alive, or a publishing client,
/// neither of which track peer reception statistics).
pub fn write_sender_report(
    out: &mut BytesMut,
    ssrc: u32,
    ntp_timestamp: NtpTimestamp,
    rtp_timestamp: u32,
    packet_count: u32,
    octet_count: u32,
) {
    out.put_u8(RTCP_VERSION << 6);
    out.put_u8(PT_SR);
    out.put_u16(6);
    out.put_u32(ssrc);
    out.put_u64(ntp_timestamp.0);
    out.put_u32(rtp_timestamp);
    out.put_u32(packet_count);
    out.put_u32(octet_count);
}

/// Appends an SDES packet (RFC 3550 §6.5) carrying only a CNAME, which is
/// the one SDES item every compliant implementation must send.
pub fn write_sdes_cname(out: &mut BytesMut, ssrc: u32, cname: &str) {
    let cname_bytes = cname.as_bytes();
    assert!(cname_bytes.len() <= 255);
    // header(4) + ssrc(4) + item-type(1) + item-len(1) + text + null terminator,
    // padded to a 4-byte boundary.
    let mut body = BytesMut::with_capacity(4 + 2 + cname_bytes.len() + 4);
    body.put_u32(ssrc);
    body.put_u8(SDES_CNAME);
    body.put_u8(cname_bytes.len() as u8);
    body.put_slice(cname_bytes);
    body.put_u8(0);
    while body.len() % 4 != 0 {
        body.put_u8(0);
    }
    let length_words = body.len() / 4;
    out.put_u8((RTCP_VERSION << 6) | 1); // one SSRC/CSRC chunk
    out.put_u8(PT_SDES);
    out.put_u16(length_words as u16);
    out.put_slice(&body);
}

/// Appends a BYE packet (RFC 3550 §6.6), sent once when a sender's stream
/// ends (TEARDOWN, or a publisher closing).
pub fn write_bye(out: &mut BytesMut, ssrc: u32) {
    out.put_u8((RTCP_VERSION << 6) | 1);
    out.put_u8(PT_BYE);
    out.put_u16(1);
    out.put_u32(ssrc);
}

/// Computes the RTCP reporting interval (RFC 3550 §6.2): period per the
/// RFC 3550 bandwidth formula, capped to `[min, max]` ([1s, 5s] by default).
pub fn reporting_interval(
    members: usize,
    rtcp_bw_bytes_per_sec: f64,
    is_sender: bool,
    avg_packet_size_bytes: f64,
    min: std::time::Duration,
    max: std::time::Duration,
) -> std::time::Duration {
    let members = members.max(1) as f64;
    let sender_fraction = if is_sender { 0.25 } else { 0.75 };
    let bw = (rtcp_bw_bytes_per_sec * sender_fraction).max(1.0);
    let secs = (members * avg_packet_size_bytes.max(1.0)) / bw;
    let secs = secs.clamp(min.as_secs_f64(), max.as_secs_f64());
    std::time::Duration::from_secs_f64(secs)
}

/// Jitter estimator per RFC 3550 §A.8: an exponential moving average of the
/// inter-arrival difference between expected and actual RTP timestamps.
#[derive(Debug, Default)]
pub struct JitterEstimator {
    transit: Option<i64>,
    jitter: f64,
}

impl JitterEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `arrival` and `rtp_timestamp` are both in the stream's clock-rate
    /// units. Returns the current jitter estimate (RFC 3550's `J`).
    pub fn update(&mut self, arrival: i64, rtp_timestamp: i64) -> u32 {
        let transit = arrival - rtp_timestamp;
        if let Some(prev_transit) = self.transit {
            let d = (transit - prev_transit).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.transit = Some(transit);
        self.jitter as u32
    }
}

pub fn as_bytes(f: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut b = BytesMut::new();
    f(&mut b);
    b.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sr(ssrc: u32, ntp: u64, rtp_ts: u32) -> Bytes {
        let mut b = BytesMut::new();
        write_sender_report(&mut b, ssrc, NtpTimestamp(ntp), rtp_ts, 10, 1500);
        b.freeze()
    }

    #[test]
    fn parse_round_trips_sender_report() {
        let data = sample_sr(0x1122_3344, 0x00000000_8000_0000_u64 << 0, 90_000);
        let (pkt, rest) = Packet::parse(&data).unwrap();
        assert!(rest.is_empty());
        match pkt {
            Packet::SenderReport(sr) => {
                assert_eq!(sr.ssrc(), 0x1122_3344);
                assert_eq!(sr.rtp_timestamp(), 90_000);
                assert_eq!(sr.sender_packet_count(), 10);
                assert_eq!(sr.sender_octet_count(), 1500);
            }
            _ => panic!("expected sender report"),
        }
    }

    #[test]
    fn parse_rejects_short_packet() {
        assert!(Packet::parse(&[0, 0]).is_err());
    }

    #[test]
    fn parse_rejects_declared_length_past_buffer() {
        let mut data = sample_sr(1, 0, 0).to_vec();
        data[3] = 0xff; // declare an enormous length
        assert!(Packet::parse(&data).is_err());
    }

    #[test]
    fn compound_packet_parses_both_members() {
        let mut data = BytesMut::new();
        write_sender_report(&mut data, 1, NtpTimestamp(0), 0, 0, 0);
        write_sdes_cname(&mut data, 1, "abc");
        let (first, rest) = Packet::parse(&data).unwrap();
        assert!(matches!(first, Packet::SenderReport(_)));
        let (second, rest2) = Packet::parse(rest).unwrap();
        assert!(rest2.is_empty());
        match second {
            Packet::Unknown(u) => assert_eq!(u.payload_type(), PT_SDES),
            _ => panic!("expected SDES as Unknown"),
        }
    }

    #[test]
    fn jitter_estimator_is_zero_with_no_variance() {
        let mut j = JitterEstimator::new();
        j.update(0, 0);
        let v = j.update(3000, 3000);
        assert_eq!(v, 0);
    }

    #[test]
    fn reporting_interval_is_clamped() {
        let d = reporting_interval(
            1,
            1.0,
            false,
            10_000.0,
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(5),
        );
        assert_eq!(d, std::time::Duration::from_secs(5));
    }
}
