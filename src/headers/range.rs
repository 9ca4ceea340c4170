// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `Range:` header (RFC 2326 §12.29 / RFC 7826 §18.40), `npt=` variant.
//! Other range units (`smpte=`, `clock=`) are accepted on parse but not
//! otherwise interpreted, matching the crate's client-driven use (callers
//! normally just want "from now" or "from t0 to t1").

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RangeEnd {
    Unbounded,
    Seconds(f64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Range {
    pub start: f64,
    pub end: RangeEnd,
}

impl Range {
    pub fn from_start(start: f64) -> Self {
        Self {
            start,
            end: RangeEnd::Unbounded,
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim();
        let npt = value
            .strip_prefix("npt=")
            .ok_or_else(|| format!("only npt= ranges are supported, got {:?}", value))?;
        let (start_str, end_str) = npt
            .split_once('-')
            .ok_or_else(|| format!("malformed npt range {:?}", npt))?;
        let start = parse_npt_time(start_str)?;
        let end = if end_str.is_empty() {
            RangeEnd::Unbounded
        } else {
            RangeEnd::Seconds(parse_npt_time(end_str)?)
        };
        Ok(Self { start, end })
    }

    pub fn write(&self) -> String {
        match self.end {
            RangeEnd::Unbounded => format!("npt={:.3}-", self.start),
            RangeEnd::Seconds(e) => format!("npt={:.3}-{:.3}", self.start, e),
        }
    }
}

fn parse_npt_time(s: &str) -> Result<f64, String> {
    if s == "now" {
        return Ok(0.0);
    }
    // HH:MM:SS[.frac] or plain seconds.
    if let Some((h, rest)) = s.split_once(':') {
        let (m, sec) = rest
            .split_once(':')
            .ok_or_else(|| format!("malformed npt time {:?}", s))?;
        let h: f64 = h.parse().map_err(|_| format!("bad hour in {:?}", s))?;
        let m: f64 = m.parse().map_err(|_| format!("bad minute in {:?}", s))?;
        let sec: f64 = sec.parse().map_err(|_| format!("bad seconds in {:?}", s))?;
        Ok(h * 3600.0 + m * 60.0 + sec)
    } else {
        s.parse()
            .map_err(|_| format!("malformed npt time {:?}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unbounded_range_from_now() {
        let r = Range::parse("npt=0.000-").unwrap();
        assert_eq!(r.start, 0.0);
        assert_eq!(r.end, RangeEnd::Unbounded);
    }

    #[test]
    fn parses_bounded_range() {
        let r = Range::parse("npt=5.0-10.0").unwrap();
        assert_eq!(r.start, 5.0);
        assert_eq!(r.end, RangeEnd::Seconds(10.0));
    }

    #[test]
    fn parses_hh_mm_ss() {
        let r = Range::parse("npt=00:01:30.000-").unwrap();
        assert!((r.start - 90.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_non_npt_unit_gracefully() {
        assert!(Range::parse("smpte=0:00:00-").is_err());
    }

    #[test]
    fn write_round_trips_bounded() {
        let r = Range {
            start: 1.5,
            end: RangeEnd::Seconds(2.5),
        };
        let reparsed = Range::parse(&r.write()).unwrap();
        assert!((reparsed.start - 1.5).abs() < 1e-6);
    }
}
