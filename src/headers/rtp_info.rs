// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `RTP-Info:` header (RFC 2326 §12.33), sent in a `PLAY` response to
//! let the client align its sequence-number/timestamp expectations with
//! the first packet the server is about to send for each stream.

/// One `url=...;seq=...;rtptime=...` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtpInfoEntry {
    pub url: String,
    pub seq: Option<u16>,
    pub rtptime: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct RtpInfo(pub Vec<RtpInfoEntry>);

impl RtpInfo {
    pub fn parse(value: &str) -> Result<Self, String> {
        let mut entries = Vec::new();
        for entry in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mut url = None;
            let mut seq = None;
            let mut rtptime = None;
            for part in entry.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                if let Some(v) = part.strip_prefix("url=") {
                    url = Some(v.to_string());
                } else if let Some(v) = part.strip_prefix("seq=") {
                    seq = Some(
                        v.parse()
                            .map_err(|_| format!("bad seq in RTP-Info: {:?}", v))?,
                    );
                } else if let Some(v) = part.strip_prefix("rtptime=") {
                    rtptime = Some(
                        v.parse()
                            .map_err(|_| format!("bad rtptime in RTP-Info: {:?}", v))?,
                    );
                }
            }
            let url = url.ok_or_else(|| "RTP-Info entry missing url=".to_string())?;
            entries.push(RtpInfoEntry { url, seq, rtptime });
        }
        Ok(Self(entries))
    }

    pub fn write(&self) -> String {
        self.0
            .iter()
            .map(|e| {
                let mut s = format!("url={}", e.url);
                if let Some(seq) = e.seq {
                    s.push_str(&format!(";seq={}", seq));
                }
                if let Some(rtptime) = e.rtptime {
                    s.push_str(&format!(";rtptime={}", rtptime));
                }
                s
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn for_url(&self, url: &str) -> Option<&RtpInfoEntry> {
        self.0.iter().find(|e| e.url == url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_entry() {
        let info = RtpInfo::parse("url=rtsp://h/s/trackID=0;seq=12345;rtptime=90000").unwrap();
        assert_eq!(info.0.len(), 1);
        assert_eq!(info.0[0].seq, Some(12345));
        assert_eq!(info.0[0].rtptime, Some(90000));
    }

    #[test]
    fn parses_multiple_entries() {
        let info = RtpInfo::parse(
            "url=rtsp://h/s/trackID=0;seq=1;rtptime=1,url=rtsp://h/s/trackID=1;seq=2;rtptime=2",
        )
        .unwrap();
        assert_eq!(info.0.len(), 2);
        assert!(info.for_url("rtsp://h/s/trackID=1").is_some());
    }

    #[test]
    fn rejects_entry_without_url() {
        assert!(RtpInfo::parse("seq=1;rtptime=1").is_err());
    }
}
