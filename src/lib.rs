// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `rtsp-rt`: a client and server library for RTSP/1.0 ([RFC 2326]/[RFC 7826])
//! carrying RTP/RTCP ([RFC 3550]) media.
//!
//! This crate implements the full signaling state machine on both sides of
//! the wire (`client` and `server` modules), a transport abstraction over
//! UDP unicast, UDP multicast, and TCP-interleaved (`transport`), and an RTP
//! processing pipeline with per-codec packetization/depacketization
//! (`codec`).
//!
//! [RFC 2326]: https://datatracker.ietf.org/doc/html/rfc2326
//! [RFC 7826]: https://datatracker.ietf.org/doc/html/rfc7826
//! [RFC 3550]: https://datatracker.ietf.org/doc/html/rfc3550

use std::fmt::Debug;
use std::num::NonZeroU32;

pub mod auth;
pub mod client;
pub mod codec;
pub mod headers;
pub mod liveness;
pub mod rtcp;
pub mod server;
pub mod transport;
pub mod wire;

/// Position within a TCP byte stream, for error messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    pub local_addr: std::net::SocketAddr,
    pub peer_addr: std::net::SocketAddr,
    /// Monotonically-increasing id, unique within the process, assigned when the
    /// connection is established. Useful for correlating log lines across tasks.
    pub id: u64,
}

impl ConnectionContext {
    pub fn dummy() -> Self {
        use std::net::{IpAddr, Ipv4Addr, SocketAddr};
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_addr: addr,
            peer_addr: addr,
            id: 0,
        }
    }
}

/// Position of a single RTSP message (or interleaved data frame) on the wire,
/// for error messages and for pairing a `CSeq` response with its request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RtspMessageContext {
    /// Byte position within the connection's read stream at which this message started.
    pub pos: u64,
    /// Wall-clock time the message was fully received, for latency debugging.
    pub received_wall: Option<std::time::SystemTime>,
}

/// An NTP timestamp, as carried in an RTCP Sender Report: 32 bits of seconds
/// since the 1900 epoch, 32 bits of fractional seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NtpTimestamp(pub u64);

impl std::fmt::Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{:09}",
            self.0 >> 32,
            (((self.0 & 0xFFFF_FFFF) * 1_000_000_000) >> 32)
        )
    }
}

/// A presentation timestamp: a monotonically non-decreasing count of a
/// stream's clock-rate ticks since an arbitrary (per-session) epoch, as
/// reconstructed by [Timeline] from wrapping 32-bit RTP timestamps.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Unwrapped timestamp, relative to the stream's epoch.
    timestamp: i64,
    clock_rate: NonZeroU32,

    /// The RTP timestamp corresponding to `timestamp`, for correlating with
    /// further RTP/RTCP packets without recomputing the full unwrap.
    start: u32,
}

impl Timestamp {
    pub fn new(timestamp: i64, clock_rate: NonZeroU32, start: u32) -> Self {
        Self {
            timestamp,
            clock_rate,
            start,
        }
    }

    #[inline]
    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The RTP (wrapping 32-bit) timestamp this value was derived from.
    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Splits the timestamp into `(seconds, remainder-in-clock-ticks)`, avoiding
    /// the overflow a naive `timestamp * 1_000_000_000 / clock_rate` would risk
    /// for large `timestamp` values.
    pub fn as_seconds_and_remainder(&self) -> (i64, u32) {
        let rate = i64::from(self.clock_rate.get());
        let secs = self.timestamp.div_euclid(rate);
        let rem = self.timestamp.rem_euclid(rate) as u32;
        (secs, rem)
    }

    /// Elapsed time since `self`, as a floating-point number of seconds.
    /// Intended for human-readable logging only.
    pub fn elapsed_since(&self, other: &Timestamp) -> f64 {
        debug_assert_eq!(self.clock_rate, other.clock_rate);
        (self.timestamp - other.timestamp) as f64 / f64::from(self.clock_rate.get())
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.timestamp, self.clock_rate)
    }
}

impl std::fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}@{}Hz, start={:08x})",
            self.timestamp, self.timestamp, self.clock_rate, self.start
        )
    }
}

/// Reconstructs a monotonically non-decreasing [Timestamp] from a stream of
/// wrapping 32-bit RTP timestamps.
///
/// The first observed raw timestamp becomes timestamp `0`; subsequent values
/// are unwrapped by detecting forward/backward 2^32 rollovers using the
/// "more than half the range changed" heuristic.
#[derive(Debug)]
pub struct Timeline {
    clock_rate: NonZeroU32,
    start: Option<u32>,
    prev: i64,
    add: i64,
}

/// Maximum amount (in clock-rate ticks) a single RTP timestamp step may jump
/// before it's treated as a wraparound rather than ordinary clock advance: a
/// conservative quarter of the 32-bit range.
const MAX_FORWARD_TIME_JUMP: i64 = 0x00FF_FFFF;
const MAX_BACKWARD_TIME_JUMP: i64 = -0x00FF_FFFF;

impl Timeline {
    pub fn new(clock_rate: NonZeroU32) -> Self {
        Self {
            clock_rate,
            start: None,
            prev: 0,
            add: 0,
        }
    }

    /// Advances the timeline to `raw`, returning the unwrapped [Timestamp] or
    /// an error description if the implied jump is implausibly large (more
    /// than one rollover within the observation window).
    pub fn advance_to(&mut self, raw: u32) -> Result<Timestamp, String> {
        let start = match self.start {
            None => {
                self.start = Some(raw);
                self.prev = 0;
                return Ok(Timestamp::new(0, self.clock_rate, raw));
            }
            Some(s) => s,
        };
        let prev_raw = (i64::from(start) + self.prev - self.add) as u32;
        let diff = i64::from(raw.wrapping_sub(prev_raw) as i32);
        let unwrapped = self.prev + diff;
        if unwrapped < self.prev.saturating_sub(i64::from(i32::MAX)) {
            return Err(format!(
                "implausible timestamp jump from {} to raw={:08x}",
                self.prev, raw
            ));
        }
        self.prev = unwrapped;
        Ok(Timestamp::new(unwrapped, self.clock_rate, raw))
    }

    /// Alias for [Self::advance_to].
    pub fn place(&mut self, raw: u32) -> Result<Timestamp, String> {
        self.advance_to(raw)
    }

    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }
}

/// Computes the byte range of `subset` within `buf`, if `subset` is in fact
/// a sub-slice of `buf`'s backing storage. Used to turn a `&[u8]` borrowed
/// from a [bytes::Bytes] (e.g. via `rtp_rs::RtpReader::payload`) back into
/// an owned, zero-copy [bytes::Bytes] slice.
pub(crate) fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    let buf_start = buf.as_ptr() as usize;
    let buf_end = buf_start + buf.len();
    let sub_start = subset.as_ptr() as usize;
    let sub_end = sub_start + subset.len();
    if sub_start < buf_start || sub_end > buf_end {
        return None;
    }
    Some((sub_start - buf_start)..(sub_end - buf_start))
}

/// The kinds of failure this crate can report.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub(crate) enum ErrorInt {
    #[error("[{conn_ctx:?}] malformed RTSP message at {msg_ctx:?}: {description}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("[{conn_ctx:?}] RTSP message too large: {description}")]
    RtspTooLargeError {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("[{conn_ctx:?}] unexpected EOF: {description}")]
    RtspUnexpectedEofError {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error(
        "[{conn_ctx:?}] bad data message at {msg_ctx:?} on channel={channel_id} stream={stream_id}: {description}"
    )]
    RtspDataMessageError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        stream_id: usize,
        description: String,
    },

    #[error(
        "[{conn_ctx:?}] bad RTP packet at {msg_ctx:?} on channel={channel_id} stream={stream_id} \
         ssrc={ssrc:08x} seq={sequence_number:04x}: {description}"
    )]
    RtpPacketError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        stream_id: usize,
        ssrc: u32,
        sequence_number: u16,
        description: String,
    },

    #[error("[{conn_ctx:?}] RTCP error at {msg_ctx:?}: {description}")]
    RtcpError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("[{conn_ctx:?}] server returned {status} {reason}: {description}")]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        status: u16,
        reason: String,
        description: String,
    },

    #[error("[{conn_ctx:?}] authentication failed: {description}")]
    AuthError {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("transport error: {description}")]
    TransportError {
        conn_ctx: Option<ConnectionContext>,
        description: String,
    },

    #[error("timed out: {description}")]
    TimeoutError { description: String },

    #[error("operation not valid in current state ({state}): {description}")]
    StateMismatchError { state: String, description: String },

    #[error("codec decode error: {description}")]
    DecodeError { description: String },

    #[error("operation cancelled")]
    CancelledError,
}

/// A cheap-to-clone handle to an [ErrorInt]. Kept thin (one pointer) so it
/// can be threaded through `Result`s on hot paths without bloating them; see
/// `codec::tests::print_sizes` for the convention this follows.
#[derive(Clone)]
pub struct Error(std::sync::Arc<ErrorInt>);

impl Error {
    pub(crate) fn wrap(inner: ErrorInt) -> Self {
        Error(std::sync::Arc::new(inner))
    }

    /// True if this is a per-packet codec error that the caller may simply
    /// log and continue past, per the propagation policy.
    pub fn is_recoverable_decode_error(&self) -> bool {
        matches!(&*self.0, ErrorInt::DecodeError { .. })
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorInt> for Error {
    fn from(inner: ErrorInt) -> Self {
        Error::wrap(inner)
    }
}

/// Builds an [ErrorInt] and wraps it in [Error], so call sites read like
/// ordinary struct literals.
macro_rules! wrap {
    ($e:expr) => {
        $crate::Error::wrap($e)
    };
}
pub(crate) use wrap;

/// `return Err(wrap!($e))`.
macro_rules! bail {
    ($e:expr) => {
        return Err($crate::wrap!($e))
    };
}
pub(crate) use bail;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_first_packet_is_zero() {
        let mut t = Timeline::new(NonZeroU32::new(90_000).unwrap());
        let ts = t.advance_to(12345).unwrap();
        assert_eq!(ts.timestamp(), 0);
    }

    #[test]
    fn timeline_is_monotonic_forward() {
        let mut t = Timeline::new(NonZeroU32::new(90_000).unwrap());
        t.advance_to(0).unwrap();
        let a = t.advance_to(3000).unwrap();
        let b = t.advance_to(6000).unwrap();
        assert!(b.timestamp() > a.timestamp());
    }

    #[test]
    fn timeline_handles_forward_wraparound() {
        let mut t = Timeline::new(NonZeroU32::new(90_000).unwrap());
        let start = u32::MAX - 1000;
        let first = t.advance_to(start).unwrap();
        let second = t.advance_to(start.wrapping_add(3000)).unwrap();
        assert_eq!(second.timestamp() - first.timestamp(), 3000);
    }

    #[test]
    fn as_range_finds_subslice() {
        let buf = [1u8, 2, 3, 4, 5];
        let sub = &buf[1..3];
        assert_eq!(as_range(&buf, sub), Some(1..3));
    }

    #[test]
    fn as_range_rejects_foreign_slice() {
        let buf = [1u8, 2, 3];
        let other = [1u8, 2, 3];
        assert_eq!(as_range(&buf, &other[..]), None);
    }
}
