// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `Transport` header: the heart of transport negotiation.

use super::split_param;

/// The underlying network/security profile proposed or accepted for a media's
/// RTP/RTCP traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// `RTP/AVP` or `RTP/AVP/UDP`.
    Udp,
    /// `RTP/AVP/TCP`.
    Tcp,
    /// `RTP/SAVP` or `RTP/SAVP/UDP`: secure (SRTP-keyed) UDP.
    SecureUdp,
    /// `RTP/SAVP/TCP`.
    SecureTcp,
}

impl Protocol {
    fn profile_str(self) -> &'static str {
        match self {
            Protocol::Udp => "RTP/AVP/UDP",
            Protocol::Tcp => "RTP/AVP/TCP",
            Protocol::SecureUdp => "RTP/SAVP/UDP",
            Protocol::SecureTcp => "RTP/SAVP/TCP",
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Protocol::SecureUdp | Protocol::SecureTcp)
    }

    pub fn is_tcp(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::SecureTcp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Unicast,
    Multicast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Play,
    Record,
}

/// A parsed `client_port=`/`server_port=`/`interleaved=` dash-separated pair.
/// The two numbers must be adjacent (RTP then RTCP).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelPair {
    pub rtp: u16,
    pub rtcp: u16,
}

impl ChannelPair {
    fn parse(s: &str) -> Result<Self, String> {
        let mut it = s.splitn(2, '-');
        let rtp: u16 = it
            .next()
            .ok_or_else(|| "empty port/channel pair".to_string())?
            .parse()
            .map_err(|_| format!("bad first port/channel number in {:?}", s))?;
        let rtcp = match it.next() {
            Some(s) => s
                .parse()
                .map_err(|_| format!("bad second port/channel number in {:?}", s))?,
            None => rtp + 1,
        };
        Ok(Self { rtp, rtcp })
    }

    fn write(self) -> String {
        format!("{}-{}", self.rtp, self.rtcp)
    }
}

/// A single, fully-parsed `Transport:` header entry. RTSP allows a
/// comma-separated list of candidate transports; this models one of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transport {
    pub protocol: Protocol,
    pub delivery: Delivery,
    pub client_port: Option<ChannelPair>,
    pub server_port: Option<ChannelPair>,
    pub interleaved: Option<ChannelPair>,
    pub destination: Option<String>,
    pub source: Option<String>,
    pub ttl: Option<u8>,
    pub mode: Option<Mode>,
    pub ssrc: Option<u32>,
}

impl Transport {
    pub fn udp_unicast(client_port: ChannelPair) -> Self {
        Self {
            protocol: Protocol::Udp,
            delivery: Delivery::Unicast,
            client_port: Some(client_port),
            server_port: None,
            interleaved: None,
            destination: None,
            source: None,
            ttl: None,
            mode: None,
            ssrc: None,
        }
    }

    pub fn tcp_interleaved(channels: ChannelPair) -> Self {
        Self {
            protocol: Protocol::Tcp,
            delivery: Delivery::Unicast,
            client_port: None,
            server_port: None,
            interleaved: Some(channels),
            destination: None,
            source: None,
            ttl: None,
            mode: None,
            ssrc: None,
        }
    }

    pub fn udp_multicast(ttl: u8) -> Self {
        Self {
            protocol: Protocol::Udp,
            delivery: Delivery::Multicast,
            client_port: None,
            server_port: None,
            interleaved: None,
            destination: None,
            source: None,
            ttl: Some(ttl),
            mode: None,
            ssrc: None,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Parses a comma-separated `Transport:` header value into its candidate
    /// entries (RFC 2326 §12.39 allows multiple, in preference order).
    pub fn parse_all(value: &str) -> Result<Vec<Transport>, String> {
        // Candidates are comma-separated, but `destination=` values could in
        // theory embed commas only inside quotes, which we don't expect in
        // practice; split naively like every real-world server does.
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse_one)
            .collect()
    }

    fn parse_one(s: &str) -> Result<Transport, String> {
        let mut parts = super::split_nonempty(s, ';');
        let profile = parts
            .next()
            .ok_or_else(|| "empty Transport entry".to_string())?;
        let protocol = match profile {
            "RTP/AVP" | "RTP/AVP/UDP" => Protocol::Udp,
            "RTP/AVP/TCP" => Protocol::Tcp,
            "RTP/SAVP" | "RTP/SAVP/UDP" => Protocol::SecureUdp,
            "RTP/SAVP/TCP" => Protocol::SecureTcp,
            other => return Err(format!("unsupported Transport profile {:?}", other)),
        };

        let mut t = Transport {
            protocol,
            delivery: Delivery::Unicast,
            client_port: None,
            server_port: None,
            interleaved: None,
            destination: None,
            source: None,
            ttl: None,
            mode: None,
            ssrc: None,
        };

        for part in parts {
            let (key, value) = split_param(part);
            match key {
                "unicast" => t.delivery = Delivery::Unicast,
                "multicast" => t.delivery = Delivery::Multicast,
                "destination" => t.destination = Some(value.to_string()),
                "source" => t.source = Some(value.to_string()),
                "ttl" => {
                    t.ttl = Some(
                        value
                            .parse()
                            .map_err(|_| format!("bad ttl {:?}", value))?,
                    )
                }
                "port" => {
                    let pair = ChannelPair::parse(value)?;
                    t.client_port = Some(pair);
                }
                "client_port" => t.client_port = Some(ChannelPair::parse(value)?),
                "server_port" => t.server_port = Some(ChannelPair::parse(value)?),
                "interleaved" => t.interleaved = Some(ChannelPair::parse(value)?),
                "mode" => {
                    let value = value.trim_matches('"');
                    t.mode = Some(match value.to_ascii_lowercase().as_str() {
                        "play" => Mode::Play,
                        "record" | "receive" => Mode::Record,
                        other => return Err(format!("unsupported transport mode {:?}", other)),
                    });
                }
                "ssrc" => {
                    t.ssrc = Some(
                        u32::from_str_radix(value, 16)
                            .map_err(|_| format!("bad ssrc {:?}", value))?,
                    )
                }
                // Unknown keys are ignored for forward-compatibility.
                _ => {}
            }
        }
        Ok(t)
    }

    pub fn write(&self) -> String {
        let mut s = self.protocol.profile_str().to_string();
        s.push(';');
        s.push_str(match self.delivery {
            Delivery::Unicast => "unicast",
            Delivery::Multicast => "multicast",
        });
        if let Some(dest) = &self.destination {
            s.push_str(&format!(";destination={}", dest));
        }
        if let Some(ttl) = self.ttl {
            s.push_str(&format!(";ttl={}", ttl));
        }
        if let Some(p) = self.client_port {
            s.push_str(&format!(";client_port={}", p.write()));
        }
        if let Some(p) = self.server_port {
            s.push_str(&format!(";server_port={}", p.write()));
        }
        if let Some(p) = self.interleaved {
            s.push_str(&format!(";interleaved={}", p.write()));
        }
        if let Some(mode) = self.mode {
            s.push_str(match mode {
                Mode::Play => ";mode=play",
                Mode::Record => ";mode=record",
            });
        }
        if let Some(ssrc) = self.ssrc {
            s.push_str(&format!(";ssrc={:08x}", ssrc));
        }
        if let Some(source) = &self.source {
            s.push_str(&format!(";source={}", source));
        }
        s
    }

    /// Whether `self` (typically server-proposed) is compatible with
    /// `first` (the transport fixed at a reader session's first SETUP), per
    /// the invariant that subsequent SETUPs must match protocol,
    /// delivery, and mode.
    pub fn is_compatible_with(&self, first: &Transport) -> bool {
        self.protocol == first.protocol && self.delivery == first.delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_unicast_with_client_ports() {
        let t = Transport::parse_all("RTP/AVP;unicast;client_port=9000-9001")
            .unwrap()
            .remove(0);
        assert_eq!(t.protocol, Protocol::Udp);
        assert_eq!(t.delivery, Delivery::Unicast);
        assert_eq!(t.client_port, Some(ChannelPair { rtp: 9000, rtcp: 9001 }));
    }

    #[test]
    fn parses_tcp_interleaved() {
        let t = Transport::parse_all("RTP/AVP/TCP;interleaved=0-1")
            .unwrap()
            .remove(0);
        assert_eq!(t.protocol, Protocol::Tcp);
        assert_eq!(t.interleaved, Some(ChannelPair { rtp: 0, rtcp: 1 }));
    }

    #[test]
    fn parses_multicast_with_ttl_and_destination() {
        let t = Transport::parse_all("RTP/AVP;multicast;destination=239.1.1.1;ttl=16")
            .unwrap()
            .remove(0);
        assert_eq!(t.delivery, Delivery::Multicast);
        assert_eq!(t.ttl, Some(16));
        assert_eq!(t.destination.as_deref(), Some("239.1.1.1"));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let t = Transport::parse_all("RTP/AVP;unicast;client_port=9000-9001;RTX=123")
            .unwrap()
            .remove(0);
        assert_eq!(t.client_port, Some(ChannelPair { rtp: 9000, rtcp: 9001 }));
    }

    #[test]
    fn parse_all_splits_multiple_candidates() {
        let v = Transport::parse_all("RTP/AVP;unicast;client_port=9000-9001,RTP/AVP/TCP;interleaved=0-1")
            .unwrap();
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].protocol, Protocol::Udp);
        assert_eq!(v[1].protocol, Protocol::Tcp);
    }

    #[test]
    fn write_round_trips_tcp() {
        let t = Transport::tcp_interleaved(ChannelPair { rtp: 2, rtcp: 3 }).with_mode(Mode::Play);
        let s = t.write();
        let reparsed = Transport::parse_all(&s).unwrap().remove(0);
        assert_eq!(reparsed, t);
    }

    #[test]
    fn rejects_unsupported_profile() {
        assert!(Transport::parse_all("SCTP/DTLS;unicast").is_err());
    }

    #[test]
    fn compatibility_checks_protocol_and_delivery() {
        let first = Transport::udp_unicast(ChannelPair { rtp: 1, rtcp: 2 });
        let second = Transport::udp_unicast(ChannelPair { rtp: 3, rtcp: 4 });
        assert!(second.is_compatible_with(&first));
        let tcp = Transport::tcp_interleaved(ChannelPair { rtp: 0, rtcp: 1 });
        assert!(!tcp.is_compatible_with(&first));
    }
}
