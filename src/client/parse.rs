// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parses `DESCRIBE`/`SETUP`/`PLAY` responses into [Presentation]/[Stream].

use bytes::{Buf, Bytes};
use log::debug;
use sdp::media_description::MediaDescription;
use std::convert::TryFrom;
use url::Url;

use super::{Presentation, Stream, StreamState};
use crate::{wrap, Error, ErrorInt};

pub(crate) fn join_control(base_url: &Url, control: &str) -> Result<Url, Error> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    base_url.join(control).map_err(|e| {
        wrap!(ErrorInt::DecodeError {
            description: format!(
                "unable to join base url {} with control url {:?}: {}",
                base_url, control, e
            ),
        })
    })
}

/// Returns the `CSeq` from an RTSP response, or `None` if missing/unparseable.
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|cseq| cseq.as_str().parse().ok())
}

/// Splits on the first occurrence of `delimiter`, matching `str::split_once`
/// without requiring its MSRV.
pub(crate) fn split_once(s: &str, delimiter: char) -> Option<(&str, &str)> {
    s.find(delimiter).map(|p| (&s[0..p], &s[p + 1..]))
}

fn parse_media(base_url: &Url, media_description: &MediaDescription) -> Result<Stream, Error> {
    // RFC 8866 §5.14: "If the <proto> sub-field is 'RTP/AVP' or 'RTP/SAVP'
    // the <fmt> sub-fields contain RTP payload type numbers."
    if !media_description
        .media_name
        .protos
        .iter()
        .any(|p| p == "RTP")
    {
        return Err(decode_err("expected RTP-based proto"));
    }

    let rtp_payload_type_str = media_description
        .media_name
        .formats
        .first()
        .ok_or_else(|| decode_err("missing RTP payload type"))?;
    let rtp_payload_type: u8 = rtp_payload_type_str
        .parse()
        .map_err(|_| decode_err("invalid RTP payload type"))?;
    if (rtp_payload_type & 0x80) != 0 {
        return Err(decode_err("invalid RTP payload type"));
    }

    let mut rtpmap = None;
    let mut fmtp = None;
    let mut control = None;
    for a in &media_description.attributes {
        if a.key == "rtpmap" {
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| decode_err("rtpmap attribute with no value"))?;
            let (pt, v) = split_once(v, ' ').ok_or_else(|| decode_err("invalid rtpmap attribute"))?;
            if pt == rtp_payload_type_str {
                rtpmap = Some(v.to_string());
            }
        } else if a.key == "fmtp" {
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| decode_err("fmtp attribute with no value"))?;
            let (pt, v) = split_once(v, ' ').ok_or_else(|| decode_err("invalid fmtp attribute"))?;
            if pt == rtp_payload_type_str {
                fmtp = Some(v.to_string());
            }
        } else if a.key == "control" {
            control = a
                .value
                .as_deref()
                .map(|c| join_control(base_url, c))
                .transpose()?;
        }
    }
    let control = control.ok_or_else(|| decode_err("no control url"))?;
    let rtpmap = rtpmap.ok_or_else(|| decode_err("expected rtpmap for primary payload type"))?;
    let (encoding_name, rtpmap) =
        split_once(&rtpmap, '/').ok_or_else(|| decode_err("invalid rtpmap attribute"))?;
    let clock_rate_str = match rtpmap.find('/') {
        None => rtpmap,
        Some(i) => &rtpmap[..i],
    };
    let clock_rate: u32 = clock_rate_str
        .parse()
        .map_err(|_| decode_err("bad clock rate in rtpmap"))?;

    Ok(Stream {
        media: media_description.media_name.media.clone(),
        encoding_name: encoding_name.to_owned(),
        clock_rate,
        rtp_payload_type,
        format_specific_params: fmtp,
        control,
        state: StreamState::Uninit,
    })
}

/// Parses a successful `DESCRIBE` response.
pub(crate) fn parse_describe(
    request_url: Url,
    response: rtsp_types::Response<Bytes>,
) -> Result<Presentation, Error> {
    if !matches!(
        response.header(&rtsp_types::headers::CONTENT_TYPE),
        Some(v) if v.as_str() == "application/sdp"
    ) {
        return Err(decode_err("DESCRIBE response not of application/sdp content type"));
    }

    let sdp = {
        let mut cursor = std::io::Cursor::new(&response.body()[..]);
        let sdp = sdp::session_description::SessionDescription::unmarshal(&mut cursor)
            .map_err(|e| decode_err(&format!("bad SDP body: {}", e)))?;
        if cursor.has_remaining() {
            return Err(decode_err("garbage after SDP body"));
        }
        sdp
    };

    // RFC 2326 appendix C.1.1: base URL is Content-Base, else Content-Location, else request URL.
    let base_url = response
        .header(&rtsp_types::headers::CONTENT_BASE)
        .or_else(|| response.header(&rtsp_types::headers::CONTENT_LOCATION))
        .map(|v| Url::parse(v.as_str()).map_err(|e| decode_err(&e.to_string())))
        .unwrap_or(Ok(request_url))?;

    let mut control = None;
    for a in &sdp.attributes {
        if a.key == "control" {
            control = a
                .value
                .as_deref()
                .map(|c| join_control(&base_url, c))
                .transpose()?;
            break;
        }
    }
    let control = control.ok_or_else(|| decode_err("no session-level control url"))?;

    let streams = sdp
        .media_descriptions
        .iter()
        .enumerate()
        .map(|(i, m)| {
            parse_media(&base_url, m).map_err(|e| {
                wrap!(ErrorInt::DecodeError {
                    description: format!("unable to parse stream {}: {}", i, e),
                })
            })
        })
        .collect::<Result<Vec<Stream>, Error>>()?;

    Ok(Presentation {
        streams,
        base_url,
        control,
        sdp,
    })
}

pub(crate) struct SetupResponse<'a> {
    pub(crate) session_id: &'a str,
    pub(crate) ssrc: Option<u32>,
    pub(crate) channel_id: u8,
}

/// Parses a `SETUP` response, returning the session id and assigned
/// interleaved channel id (the next id is implicitly the RTCP channel).
pub(crate) fn parse_setup(response: &rtsp_types::Response<Bytes>) -> Result<SetupResponse, Error> {
    let session = response
        .header(&rtsp_types::headers::SESSION)
        .ok_or_else(|| decode_err("SETUP response has no Session header"))?;
    let session_id = match session.as_str().find(';') {
        None => session.as_str(),
        Some(i) => &session.as_str()[..i],
    };
    let transport = response
        .header(&rtsp_types::headers::TRANSPORT)
        .ok_or_else(|| decode_err("SETUP response has no Transport header"))?;
    let mut channel_id = None;
    let mut ssrc = None;
    for part in transport.as_str().split(';') {
        if let Some(v) = part.strip_prefix("ssrc=") {
            ssrc = Some(
                u32::from_str_radix(v, 16).map_err(|_| decode_err(&format!("unparseable ssrc {}", v)))?,
            );
        } else if let Some(interleaved) = part.strip_prefix("interleaved=") {
            let mut channels = interleaved.splitn(2, '-');
            let n = channels.next().expect("splitn returns at least one part");
            let n: u8 = n
                .parse()
                .map_err(|_| decode_err(&format!("bad channel number {}", n)))?;
            if let Some(m) = channels.next() {
                let m: u8 = m
                    .parse()
                    .map_err(|_| decode_err(&format!("bad second channel number {}", m)))?;
                if n.checked_add(1) != Some(m) {
                    return Err(decode_err(&format!("expected adjacent channels; got {}-{}", n, m)));
                }
            }
            channel_id = Some(n);
        }
    }
    let channel_id = channel_id
        .ok_or_else(|| decode_err("SETUP response Transport header has no interleaved parameter"))?;
    Ok(SetupResponse {
        session_id,
        channel_id,
        ssrc,
    })
}

/// Applies a `PLAY` response's `RTP-Info` header to each named stream's
/// [StreamStateInit].
pub(crate) fn parse_play(
    response: rtsp_types::Response<Bytes>,
    presentation: &mut Presentation,
) -> Result<(), Error> {
    let rtp_info = response
        .header(&rtsp_types::headers::RTP_INFO)
        .ok_or_else(|| decode_err("PLAY response has no RTP-Info header"))?;
    for s in rtp_info.as_str().split(',') {
        let s = s.trim();
        let mut parts = s.split(';');
        let url = parts
            .next()
            .expect("split always returns at least one part")
            .strip_prefix("url=")
            .ok_or_else(|| decode_err("RTP-Info missing stream URL"))?;
        let url = join_control(&presentation.base_url, url)?;
        let stream = match presentation.streams.iter_mut().find(|s| s.control == url) {
            Some(s) => s,
            None => {
                debug!("RTP-Info names unknown stream {}; ignoring", url);
                continue;
            }
        };
        let state = match &mut stream.state {
            StreamState::Uninit => {
                debug!("PLAY response described stream {} in Uninit state", &stream.control);
                continue;
            }
            StreamState::Init(init) => init,
            StreamState::Playing { .. } => continue,
        };
        for part in parts {
            let (key, value) = match split_once(part, '=') {
                Some(kv) => kv,
                None => continue,
            };
            match key {
                "seq" => {
                    state.initial_seq = value.parse().ok();
                }
                "rtptime" => {
                    state.initial_rtptime = value.parse().ok();
                }
                "ssrc" => {
                    state.ssrc = u32::from_str_radix(value, 16).ok();
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn decode_err(description: &str) -> Error {
    wrap!(ErrorInt::DecodeError {
        description: description.to_string(),
    })
}
