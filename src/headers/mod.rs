// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed parsers/encoders for the RTSP headers this crate cares about.
//!
//! Each header is a plain struct with `parse(&str) -> Result<Self, String>`
//! and `write(&self) -> String`, following the grammar in [RFC 2326]/
//! [RFC 7826]. Headers not covered here (e.g. `Content-Type`, `Accept`,
//! `Public`, `CSeq`) are simple enough that callers read/write them as plain
//! strings via [crate::wire]; only the ones with real internal structure
//! get a dedicated type.
//!
//! [RFC 2326]: https://datatracker.ietf.org/doc/html/rfc2326
//! [RFC 7826]: https://datatracker.ietf.org/doc/html/rfc7826

pub mod authenticate;
pub mod range;
pub mod rtp_info;
pub mod session;
pub mod transport;

pub use authenticate::{Authenticate, WwwAuthenticate};
pub use range::Range;
pub use rtp_info::RtpInfo;
pub use session::SessionHeader;
pub use transport::{Delivery, Protocol, Transport};

/// Splits `s` on `sep`, trimming whitespace from each part and discarding
/// empty parts. Used throughout this module for `;`-delimited parameter
/// lists and `,`-delimited value lists.
pub(crate) fn split_nonempty(s: &str, sep: char) -> impl Iterator<Item = &str> {
    s.split(sep).map(str::trim).filter(|p| !p.is_empty())
}

/// Splits a `key=value` parameter on the first `=`, trimming both sides.
/// If there's no `=`, returns `(key, "")` so bare flags (e.g. `unicast`)
/// still parse.
pub(crate) fn split_param(s: &str) -> (&str, &str) {
    match s.find('=') {
        Some(i) => (s[..i].trim(), s[i + 1..].trim().trim_matches('"')),
        None => (s.trim(), ""),
    }
}
