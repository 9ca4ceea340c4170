// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The client-side RTSP session state machine: connect, describe,
//! setup, play/record, pause, close, against a single server.

pub mod parse;
pub mod rtp;

use std::convert::TryFrom;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU16;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use url::Url;

use crate::auth::{Credentials, DigestClient};
use crate::headers::authenticate::WwwAuthenticate;
use crate::headers::transport::{ChannelPair, Delivery, Mode as TransportMode, Protocol, Transport};
use crate::transport::tcp::ChannelIds;
use crate::transport::tls::{MaybeTlsStream, TlsConfig};
use crate::transport::udp::UdpTransport;
use crate::transport::MediaTransport;
use crate::wire::{Codec, CodecItem};
use crate::{wrap, ConnectionContext, Error, ErrorInt, RtspMessageContext};

/// Per-session knobs a caller can set before [Session::describe].
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub creds: Option<Credentials>,
    pub user_agent: String,
    pub transport: TransportPreference,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// If true, RTP packets with an unexpected SSRC are dropped with a debug
    /// log instead of erroring the session, per the loss-tolerance.
    pub ignore_spurious_data: bool,
    pub max_redirects: u8,
    /// Certificate/trust material for `rtsps`; ignored for a plain `rtsp`
    /// [Session::start].
    pub tls: TlsConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            creds: None,
            user_agent: concat!("rtsp-rt/", env!("CARGO_PKG_VERSION")).to_string(),
            transport: TransportPreference::Auto,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            ignore_spurious_data: false,
            max_redirects: 5,
            tls: TlsConfig::default(),
        }
    }
}

impl SessionOptions {
    pub fn creds(mut self, creds: Credentials) -> Self {
        self.creds = Some(creds);
        self
    }

    pub fn transport(mut self, t: TransportPreference) -> Self {
        self.transport = t;
        self
    }
}

/// The `transport` configuration option: `auto | udp | udp_multicast | tcp`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportPreference {
    Auto,
    Udp,
    UdpMulticast,
    Tcp,
}

/// Controls how `play()` fills in a stream's initial sequence/rtptime
/// expectations, as an escape hatch for servers that omit or lie in
/// `RTP-Info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlayPolicy {
    ignore_zero_seq: bool,
}

impl PlayPolicy {
    /// Some servers send `RTP-Info` with `seq=0` even though the first
    /// packet's actual sequence number is nonzero; treat 0 as "absent"
    /// rather than as the literal expected value.
    pub fn ignore_zero_seq(mut self) -> Self {
        self.ignore_zero_seq = true;
        self
    }
}

/// A `DESCRIBE`d session: its base/control URLs and per-media [Stream]s.
#[derive(Debug)]
pub struct Presentation {
    pub streams: Vec<Stream>,
    pub base_url: Url,
    pub control: Url,
    pub sdp: sdp::session_description::SessionDescription,
}

/// One media described by SDP, not yet or already set up.
pub struct Stream {
    pub media: String,
    pub encoding_name: String,
    pub clock_rate: u32,
    pub rtp_payload_type: u8,
    pub format_specific_params: Option<String>,
    pub control: Url,
    pub state: StreamState,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("media", &self.media)
            .field("encoding_name", &self.encoding_name)
            .field("clock_rate", &self.clock_rate)
            .field("rtp_payload_type", &self.rtp_payload_type)
            .field("control", &self.control.as_str())
            .finish()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StreamStateInit {
    pub ssrc: Option<u32>,
    pub initial_seq: Option<u16>,
    pub initial_rtptime: Option<u32>,
}

pub enum StreamState {
    Uninit,
    Init(StreamStateInit),
    Playing {
        timeline: crate::Timeline,
        rtp_handler: rtp::StrictSequenceChecker,
    },
}

impl std::fmt::Debug for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Uninit => write!(f, "Uninit"),
            StreamState::Init(i) => write!(f, "Init({:?})", i),
            StreamState::Playing { .. } => write!(f, "Playing"),
        }
    }
}

/// One item produced by [Session::next].
#[derive(Debug)]
pub enum PacketItem {
    RtpPacket(rtp::Packet),
    SenderReport(rtp::SenderReport),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Initial,
    Connected,
    PreRead,
    Read,
    PreRecord,
    Record,
    Paused,
}

/// A per-media installed transport: either a UDP pair, or the channel-id
/// pair assigned on the shared control connection. Unlike the server (many
/// connections, each with its own writer task), a client has exactly one
/// connection and drives it inline, so TCP-interleaved writes go straight
/// through `self.io` rather than a queued [crate::wire::ConnectionWriter].
enum InstalledTransport {
    Udp(UdpTransport),
    Interleaved { channels: ChannelIds },
}

struct InstalledMedia {
    stream_index: usize,
    transport: InstalledTransport,
    negotiated: Transport,
}

/// A single client-to-server RTSP conversation and its installed media.
///
/// Mirrors the state graph:
/// `Initial -> Connected -> (PreRead|PreRecord) -> (Read|Record) -> Paused`.
pub struct Session {
    options: SessionOptions,
    state: SessionState,
    /// Set when `pause()` succeeds, so a subsequent `play()`/`record()` can
    /// restore the prior lifecycle without guessing from `Paused` alone,
    /// mirroring `ServerSessionState::paused_from`.
    paused_from: Option<SessionState>,
    conn_ctx: ConnectionContext,
    io: Framed<MaybeTlsStream<TcpStream>, Codec>,
    cseq: u32,
    session_id: Option<String>,
    timeout_secs: u32,
    digest: Option<DigestClient>,
    presentation: Option<Presentation>,
    media: Vec<InstalledMedia>,
    supports_get_parameter: bool,
}

const DEFAULT_SESSION_TIMEOUT: u32 = 60;

impl Session {
    /// Resolves `host:port` and establishes the control connection.
    /// `scheme` is `"rtsp"` or `"rtsps"`; the latter
    /// wraps the connection in TLS per `options.tls` before any RTSP bytes
    /// are exchanged.
    pub async fn start(scheme: &str, host: &str, port: u16, options: SessionOptions) -> Result<Self, Error> {
        let addr = format!("{}:{}", host, port);
        let tcp = timeout(options.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                wrap!(ErrorInt::TimeoutError {
                    description: format!("connect to {} timed out", addr),
                })
            })?
            .map_err(|e| {
                wrap!(ErrorInt::TransportError {
                    conn_ctx: None,
                    description: format!("connect to {} failed: {}", addr, e),
                })
            })?;
        let local_addr = tcp.local_addr().map_err(|e| {
            wrap!(ErrorInt::TransportError {
                conn_ctx: None,
                description: e.to_string(),
            })
        })?;
        let peer_addr = tcp.peer_addr().map_err(|e| {
            wrap!(ErrorInt::TransportError {
                conn_ctx: None,
                description: e.to_string(),
            })
        })?;
        let conn_ctx = ConnectionContext {
            local_addr,
            peer_addr,
            id: next_conn_id(),
        };
        let stream = match scheme {
            "rtsps" => {
                let connector = options.tls.client_connector()?;
                let server_name = rustls::ServerName::try_from(host).map_err(|_| {
                    wrap!(ErrorInt::TransportError {
                        conn_ctx: Some(conn_ctx),
                        description: format!("{} is not a valid TLS server name", host),
                    })
                })?;
                let tls = timeout(options.connect_timeout, connector.connect(server_name, tcp))
                    .await
                    .map_err(|_| timeout_err(&conn_ctx, "TLS handshake"))?
                    .map_err(|e| {
                        wrap!(ErrorInt::TransportError {
                            conn_ctx: Some(conn_ctx),
                            description: format!("TLS handshake with {} failed: {}", addr, e),
                        })
                    })?;
                MaybeTlsStream::Client(Box::new(tls))
            }
            "rtsp" => MaybeTlsStream::Plain(tcp),
            other => {
                return Err(wrap!(ErrorInt::TransportError {
                    conn_ctx: Some(conn_ctx),
                    description: format!("unsupported RTSP scheme {:?}", other),
                }))
            }
        };
        let io = Framed::new(stream, Codec::new(conn_ctx, crate::wire::Limits::default()));
        Ok(Self {
            options,
            state: SessionState::Connected,
            paused_from: None,
            conn_ctx,
            io,
            cseq: 0,
            session_id: None,
            timeout_secs: DEFAULT_SESSION_TIMEOUT,
            digest: None,
            presentation: None,
            media: Vec::new(),
            supports_get_parameter: false,
        })
    }

    fn require_state(&self, allowed: &[SessionState], op: &str) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(wrap!(ErrorInt::StateMismatchError {
                state: format!("{:?}", self.state),
                description: format!("{} not valid in current state", op),
            }))
        }
    }

    async fn send_request(
        &mut self,
        method: rtsp_types::Method,
        url: &Url,
        extra_headers: Vec<(rtsp_types::HeaderName, String)>,
        body: Bytes,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        self.cseq += 1;
        let mut builder = rtsp_types::Request::builder(method, rtsp_types::Version::V1_0)
            .request_uri(
                rtsp_types::Url::parse(url.as_str())
                    .map_err(|e| decode_err(&e.to_string()))?,
            )
            .header(rtsp_types::headers::CSEQ, self.cseq.to_string())
            .header(rtsp_types::headers::USER_AGENT, self.options.user_agent.clone());
        if let Some(session_id) = &self.session_id {
            builder = builder.header(rtsp_types::headers::SESSION, session_id.clone());
        }
        if let (Some(digest), Some(creds)) = (&mut self.digest, &self.options.creds) {
            let method_str = format!("{:?}", method).to_ascii_uppercase();
            let cnonce = crate::auth::fresh_nonce();
            let authz = digest.authorize(creds, &method_str, url.as_str(), &cnonce);
            builder = builder.header(rtsp_types::headers::AUTHORIZATION, authz);
        }
        for (name, value) in extra_headers {
            builder = builder.header(name, value);
        }
        let request = if body.is_empty() {
            builder.empty()
        } else {
            builder
                .header(rtsp_types::headers::CONTENT_LENGTH, body.len().to_string())
                .build(body)
        };
        timeout(
            self.options.write_timeout,
            self.io.send(CodecItem::Message(rtsp_types::Message::Request(request))),
        )
        .await
        .map_err(|_| timeout_err(&self.conn_ctx, "writing request"))??;

        // Interleaved RTP/RTCP frames may legitimately arrive between the
        // request and its response; route those to the demux and keep
        // waiting for the actual response.
        loop {
            let msg = timeout(self.options.read_timeout, self.io.next())
                .await
                .map_err(|_| timeout_err(&self.conn_ctx, "reading response"))?
                .ok_or_else(|| {
                    wrap!(ErrorInt::RtspUnexpectedEofError {
                        conn_ctx: self.conn_ctx,
                        description: "connection closed while awaiting response".to_string(),
                    })
                })??;
            match msg {
                CodecItem::Message(rtsp_types::Message::Response(r)) => {
                    return Ok(r.map_body(Bytes::from))
                }
                CodecItem::Message(other) => {
                    return Err(wrap!(ErrorInt::RtspFramingError {
                        conn_ctx: self.conn_ctx,
                        msg_ctx: RtspMessageContext::default(),
                        description: format!("expected response, got {:?}", other),
                    }))
                }
                CodecItem::Data { channel_id, payload } => {
                    log::debug!(
                        "dropping interleaved frame on channel {} received during control exchange ({} bytes)",
                        channel_id,
                        payload.len()
                    );
                }
            }
        }
    }

    /// Issues one request, transparently handling a single 401 (digest
    /// challenge) retry and bounded 3xx redirects.
    async fn send_with_retries(
        &mut self,
        method: rtsp_types::Method,
        mut url: Url,
        extra_headers: Vec<(rtsp_types::HeaderName, String)>,
        body: Bytes,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        let mut redirects = 0u8;
        let mut auth_retried = false;
        loop {
            let resp = self
                .send_request(method, &url, extra_headers.clone(), body.clone())
                .await?;
            let status = u16::from(resp.status());
            if status == 401 && !auth_retried && self.options.creds.is_some() {
                let www = resp
                    .header(&rtsp_types::headers::WWW_AUTHENTICATE)
                    .ok_or_else(|| decode_err("401 response missing WWW-Authenticate"))?;
                let challenge = WwwAuthenticate::parse(www.as_str())
                    .map_err(|e| decode_err(&e))?;
                self.digest = Some(
                    DigestClient::from_challenge(&challenge).map_err(|e| {
                        wrap!(ErrorInt::AuthError {
                            conn_ctx: self.conn_ctx,
                            description: e,
                        })
                    })?,
                );
                auth_retried = true;
                continue;
            }
            if (300..400).contains(&status) {
                if redirects >= self.options.max_redirects {
                    return Err(wrap!(ErrorInt::RtspResponseError {
                        conn_ctx: self.conn_ctx,
                        msg_ctx: RtspMessageContext::default(),
                        status,
                        reason: resp.reason_phrase().to_string(),
                        description: "too many redirects".to_string(),
                    }));
                }
                if let Some(location) = resp.header(&rtsp_types::headers::LOCATION) {
                    url = Url::parse(location.as_str()).map_err(|e| decode_err(&e.to_string()))?;
                    redirects += 1;
                    continue;
                }
            }
            if status >= 400 {
                return Err(wrap!(ErrorInt::RtspResponseError {
                    conn_ctx: self.conn_ctx,
                    msg_ctx: RtspMessageContext::default(),
                    status,
                    reason: resp.reason_phrase().to_string(),
                    description: "request failed".to_string(),
                }));
            }
            return Ok(resp);
        }
    }

    /// Sends `OPTIONS`, recording whether the server advertises
    /// `GET_PARAMETER` (used to pick the keep-alive method).
    pub async fn options(&mut self, url: &Url) -> Result<(), Error> {
        let resp = self
            .send_with_retries(rtsp_types::Method::Options, url.clone(), Vec::new(), Bytes::new())
            .await?;
        if let Some(public) = resp.header(&rtsp_types::headers::PUBLIC) {
            self.supports_get_parameter = public.as_str().contains("GET_PARAMETER");
        }
        Ok(())
    }

    /// Sends `DESCRIBE` and parses the SDP body into a [Presentation].
    pub async fn describe(&mut self, url: &Url) -> Result<&Presentation, Error> {
        self.require_state(&[SessionState::Connected], "DESCRIBE")?;
        let headers = vec![(
            rtsp_types::headers::ACCEPT,
            "application/sdp".to_string(),
        )];
        let resp = self
            .send_with_retries(rtsp_types::Method::Describe, url.clone(), headers, Bytes::new())
            .await?;
        let presentation = parse::parse_describe(url.clone(), resp)?;
        self.presentation = Some(presentation);
        Ok(self.presentation.as_ref().unwrap())
    }

    /// Picks the transport protocol to propose for `stream_index`, honoring
    /// `self.options.transport` and (for `Auto`) falling back from UDP to
    /// TCP if a caller invokes [Self::setup] again after a UDP timeout.
    fn candidate_protocols(&self, attempted_udp: bool) -> Vec<Protocol> {
        match self.options.transport {
            TransportPreference::Udp => vec![Protocol::Udp],
            TransportPreference::UdpMulticast => vec![Protocol::Udp],
            TransportPreference::Tcp => vec![Protocol::Tcp],
            TransportPreference::Auto if attempted_udp => vec![Protocol::Tcp],
            TransportPreference::Auto => vec![Protocol::Udp, Protocol::Tcp],
        }
    }

    /// `setup(media, mode)`: proposes a transport, falling back
    /// to the next candidate on a 461 Unsupported Transport.
    pub async fn setup(
        &mut self,
        stream_index: usize,
        mode: TransportMode,
    ) -> Result<(), Error> {
        self.require_state(
            &[SessionState::Connected, SessionState::PreRead, SessionState::PreRecord],
            "SETUP",
        )?;
        self.setup_transport(stream_index, mode, false).await
    }

    /// Re-proposes a transport for an already-installed media, used by
    /// [Self::ensure_udp_media_reachable] to fall back from UDP to
    /// TCP-interleaved mid-session. Unlike [Self::setup], this doesn't touch
    /// `self.state`'s `Read`/`Record` value, since playback is already
    /// underway by the time it runs.
    async fn resetup_over_tcp(&mut self, stream_index: usize, mode: TransportMode) -> Result<(), Error> {
        self.media.retain(|m| m.stream_index != stream_index);
        self.setup_transport(stream_index, mode, true).await
    }

    async fn setup_transport(
        &mut self,
        stream_index: usize,
        mode: TransportMode,
        attempted_udp: bool,
    ) -> Result<(), Error> {
        let control = self
            .presentation
            .as_ref()
            .ok_or_else(|| decode_err("SETUP before DESCRIBE"))?
            .streams
            .get(stream_index)
            .ok_or_else(|| decode_err("stream index out of range"))?
            .control
            .clone();

        let local_ip = self.conn_ctx.local_addr.ip();
        let mut last_err = None;
        for protocol in self.candidate_protocols(attempted_udp) {
            let proposal = match protocol {
                Protocol::Udp => {
                    let udp = UdpTransport::bind_pair(local_ip, None, false).await?;
                    let (rtp_port, _) = udp.local_ports();
                    Transport::udp_unicast(ChannelPair {
                        rtp: rtp_port,
                        rtcp: rtp_port + 1,
                    })
                    .with_mode(mode)
                }
                Protocol::Tcp => {
                    let n = (self.media.len() as u8) * 2;
                    Transport::tcp_interleaved(ChannelPair { rtp: n, rtcp: n + 1 }).with_mode(mode)
                }
                _ => continue,
            };
            let headers = vec![(rtsp_types::headers::TRANSPORT, proposal.write())];
            match self
                .send_with_retries(rtsp_types::Method::Setup, control.clone(), headers, Bytes::new())
                .await
            {
                Ok(resp) => {
                    let setup = parse::parse_setup(&resp)?;
                    if self.session_id.is_none() {
                        self.session_id = Some(setup.session_id.to_string());
                    }
                    let negotiated = resp
                        .header(&rtsp_types::headers::TRANSPORT)
                        .and_then(|v| Transport::parse_all(v.as_str()).ok())
                        .and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) })
                        .unwrap_or(proposal);
                    let transport = match protocol {
                        Protocol::Udp => {
                            let mut udp = UdpTransport::bind_pair(
                                local_ip,
                                negotiated.client_port.map(|p| p.rtp),
                                false,
                            )
                            .await?;
                            if let Some(server_port) = negotiated.server_port {
                                udp.connect_to(SocketAddr::new(
                                    self.conn_ctx.peer_addr.ip(),
                                    server_port.rtp,
                                ));
                            }
                            InstalledTransport::Udp(udp)
                        }
                        Protocol::Tcp => {
                            let channels = negotiated
                                .interleaved
                                .map(|p| ChannelIds { rtp: p.rtp as u8, rtcp: p.rtcp as u8 })
                                .ok_or_else(|| decode_err("TCP SETUP response missing interleaved="))?;
                            InstalledTransport::Interleaved { channels }
                        }
                        _ => unreachable!(),
                    };
                    self.media.retain(|m| m.stream_index != stream_index);
                    self.media.push(InstalledMedia {
                        stream_index,
                        transport,
                        negotiated,
                    });
                    self.state = match (self.state, mode) {
                        (SessionState::Read, _) | (SessionState::Record, _) => self.state,
                        (_, TransportMode::Play) => SessionState::PreRead,
                        (_, TransportMode::Record) => SessionState::PreRecord,
                    };
                    return Ok(());
                }
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| decode_err("no transport candidates available")))
    }

    /// `play(range)`: transitions PreRead → Read, or resumes Paused → Read
    /// when the session was paused from Read (the `… → Read → Paused → …`
    /// leg of the state graph).
    pub async fn play(&mut self, range: Option<crate::headers::range::Range>) -> Result<(), Error> {
        if !(self.state == SessionState::PreRead
            || (self.state == SessionState::Paused && self.paused_from == Some(SessionState::Read)))
        {
            return Err(wrap!(ErrorInt::StateMismatchError {
                state: format!("{:?}", self.state),
                description: "PLAY not valid in current state".to_string(),
            }));
        }
        let control = self
            .presentation
            .as_ref()
            .ok_or_else(|| decode_err("PLAY before DESCRIBE"))?
            .control
            .clone();
        let mut headers = Vec::new();
        if let Some(range) = range {
            headers.push((rtsp_types::headers::RANGE, range.write()));
        }
        let resp = self
            .send_with_retries(rtsp_types::Method::Play, control, headers, Bytes::new())
            .await?;
        if resp.header(&rtsp_types::headers::RTP_INFO).is_some() {
            let presentation = self.presentation.as_mut().unwrap();
            parse::parse_play(resp, presentation)?;
        }
        for m in &self.media {
            let stream = &mut self.presentation.as_mut().unwrap().streams[m.stream_index];
            let init = match &stream.state {
                StreamState::Init(i) => *i,
                _ => StreamStateInit::default(),
            };
            let clock_rate = std::num::NonZeroU32::new(stream.clock_rate)
                .ok_or_else(|| decode_err("stream has zero clock rate"))?;
            stream.state = StreamState::Playing {
                timeline: crate::Timeline::new(clock_rate),
                rtp_handler: rtp::StrictSequenceChecker::new(init.ssrc, init.initial_seq),
            };
        }
        self.state = SessionState::Read;
        self.paused_from = None;
        self.ensure_udp_media_reachable().await?;
        Ok(())
    }

    /// Gives each UDP-transported media ~3s to prove a packet actually
    /// arrives (a NAT/firewall along the path may silently drop it); any
    /// that stay silent get re-SETUP over TCP-interleaved instead. Only
    /// applies under `Auto` transport selection, which is what promises
    /// this fallback in the first place.
    async fn ensure_udp_media_reachable(&mut self) -> Result<(), Error> {
        if !matches!(self.options.transport, TransportPreference::Auto) {
            return Ok(());
        }
        let udp_streams: Vec<usize> = self
            .media
            .iter()
            .filter(|m| matches!(m.transport, InstalledTransport::Udp(_)))
            .map(|m| m.stream_index)
            .collect();
        for stream_index in udp_streams {
            let pos = match self.media.iter().position(|m| m.stream_index == stream_index) {
                Some(p) => p,
                None => continue,
            };
            match timeout(Duration::from_secs(3), self.wait_for_first_packet(pos)).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    log::warn!(
                        "no UDP packet for stream {} within 3s, retrying SETUP over TCP",
                        stream_index
                    );
                    self.resetup_over_tcp(stream_index, TransportMode::Play).await?;
                }
            }
        }
        Ok(())
    }

    /// Blocks until one packet (RTP or RTCP) arrives on `media_idx`'s UDP
    /// socket; a no-op for already-interleaved media.
    async fn wait_for_first_packet(&mut self, media_idx: usize) -> Result<(), Error> {
        match &mut self.media[media_idx].transport {
            InstalledTransport::Udp(udp) => {
                udp.read_packet().await?;
                Ok(())
            }
            InstalledTransport::Interleaved { .. } => Ok(()),
        }
    }

    /// `record()`: transitions PreRecord → Record, or resumes Paused →
    /// Record when the session was paused from Record (the
    /// `… → Record → Paused → …` leg of the state graph).
    pub async fn record(&mut self) -> Result<(), Error> {
        if !(self.state == SessionState::PreRecord
            || (self.state == SessionState::Paused && self.paused_from == Some(SessionState::Record)))
        {
            return Err(wrap!(ErrorInt::StateMismatchError {
                state: format!("{:?}", self.state),
                description: "RECORD not valid in current state".to_string(),
            }));
        }
        let control = self
            .presentation
            .as_ref()
            .ok_or_else(|| decode_err("RECORD before DESCRIBE"))?
            .control
            .clone();
        self.send_with_retries(rtsp_types::Method::Record, control, Vec::new(), Bytes::new())
            .await?;
        self.state = SessionState::Record;
        self.paused_from = None;
        Ok(())
    }

    /// `pause()`: stops the reader without tearing down transports. Records
    /// which mode it paused from so a later `play()`/`record()` can resume.
    pub async fn pause(&mut self) -> Result<(), Error> {
        self.require_state(&[SessionState::Read, SessionState::Record], "PAUSE")?;
        let control = self.presentation.as_ref().unwrap().control.clone();
        self.send_with_retries(rtsp_types::Method::Pause, control, Vec::new(), Bytes::new())
            .await?;
        self.paused_from = Some(self.state);
        self.state = SessionState::Paused;
        Ok(())
    }

    /// Sends a keep-alive (`GET_PARAMETER` if advertised in `Public:`, else
    /// `OPTIONS`), at the caller's chosen cadence (nominally
    /// `session.timeout / 2`).
    pub async fn send_keepalive(&mut self) -> Result<(), Error> {
        let control = self
            .presentation
            .as_ref()
            .map(|p| p.control.clone())
            .ok_or_else(|| decode_err("keep-alive before DESCRIBE"))?;
        let method = if self.supports_get_parameter {
            rtsp_types::Method::GetParameter
        } else {
            rtsp_types::Method::Options
        };
        self.send_with_retries(method, control, Vec::new(), Bytes::new())
            .await?;
        Ok(())
    }

    /// `close()`: best-effort `TEARDOWN`, then drops the socket
    /// regardless of whether a response was seen (the open question:
    /// the non-waiting TEARDOWN variant).
    pub async fn close(&mut self) {
        if let Some(presentation) = &self.presentation {
            let control = presentation.control.clone();
            let _ = self
                .send_with_retries(rtsp_types::Method::Teardown, control, Vec::new(), Bytes::new())
                .await;
        }
        self.state = SessionState::Initial;
    }

    /// Reads and returns the next RTP/RTCP-derived [PacketItem], draining the
    /// TCP-interleaved demux and UDP sockets for every installed media. Used
    /// by the reader task (the data-read task).
    pub async fn next(&mut self) -> Result<Option<PacketItem>, Error> {
        if self.media.is_empty() {
            return Ok(None);
        }
        loop {
            let (stream_index, channel, data) = self.read_one().await?;
            let presentation = self.presentation.as_mut().unwrap();
            let stream = &mut presentation.streams[stream_index];
            let (timeline, checker) = match &mut stream.state {
                StreamState::Playing { timeline, rtp_handler } => (timeline, rtp_handler),
                _ => continue,
            };
            let msg_ctx = RtspMessageContext::default();
            let item = match channel {
                crate::transport::Channel::Rtp => checker.rtp(
                    &self.options,
                    &self.conn_ctx,
                    &msg_ctx,
                    timeline,
                    0,
                    stream_index,
                    data,
                )?,
                crate::transport::Channel::Rtcp => checker
                    .rtcp(&self.options, &msg_ctx, timeline, stream_index, data)
                    .map_err(|description| {
                        wrap!(ErrorInt::RtcpError {
                            conn_ctx: self.conn_ctx,
                            msg_ctx,
                            description,
                        })
                    })?,
            };
            if let Some(item) = item {
                return Ok(Some(item));
            }
        }
    }

    async fn read_one(
        &mut self,
    ) -> Result<(usize, crate::transport::Channel, Bytes), Error> {
        for m in &mut self.media {
            if let InstalledTransport::Udp(udp) = &mut m.transport {
                if let Ok(res) = timeout(Duration::from_millis(1), udp.read_packet()).await {
                    let (channel, data) = res?;
                    return Ok((m.stream_index, channel, data));
                }
            }
        }
        // Fall back to a blocking wait on the first media's transport so we
        // don't busy-loop; a production fanout would use a single combined
        // future (tokio::select! across all installed media).
        if self
            .media
            .iter()
            .any(|m| matches!(m.transport, InstalledTransport::Interleaved { .. }))
        {
            loop {
                let msg = self.io.next().await.ok_or_else(|| {
                    wrap!(ErrorInt::RtspUnexpectedEofError {
                        conn_ctx: self.conn_ctx,
                        description: "connection closed while awaiting data".to_string(),
                    })
                })??;
                if let CodecItem::Data { channel_id, payload } = msg {
                    if let Some(m) = self.media.iter().find(|m| match m.transport {
                        InstalledTransport::Interleaved { channels } => {
                            channel_id == channels.rtp || channel_id == channels.rtcp
                        }
                        InstalledTransport::Udp(_) => false,
                    }) {
                        let channels = match m.transport {
                            InstalledTransport::Interleaved { channels } => channels,
                            InstalledTransport::Udp(_) => unreachable!(),
                        };
                        let channel = if channel_id == channels.rtp {
                            crate::transport::Channel::Rtp
                        } else {
                            crate::transport::Channel::Rtcp
                        };
                        return Ok((m.stream_index, channel, payload));
                    }
                    log::debug!("dropping interleaved frame for unregistered channel {}", channel_id);
                }
                // Unexpected control message between data frames (e.g. an
                // out-of-band PLAY_NOTIFY); ignore it and keep waiting.
            }
        }
        let m = self
            .media
            .first_mut()
            .ok_or_else(|| decode_err("no installed media"))?;
        match &mut m.transport {
            InstalledTransport::Udp(udp) => {
                let (channel, data) = udp.read_packet().await?;
                Ok((m.stream_index, channel, data))
            }
            InstalledTransport::Interleaved { .. } => unreachable!(),
        }
    }
}

fn decode_err(description: &str) -> Error {
    wrap!(ErrorInt::DecodeError {
        description: description.to_string(),
    })
}

fn timeout_err(conn_ctx: &ConnectionContext, what: &str) -> Error {
    wrap!(ErrorInt::TimeoutError {
        description: format!("{} on connection {:?}", what, conn_ctx),
    })
}

static NEXT_CONN_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Connects a real [Session] to a throwaway loopback listener so tests
    /// can exercise its methods without a live RTSP server.
    async fn dummy_session(options: SessionOptions) -> Session {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = tokio::spawn(async move { listener.accept().await.unwrap() });
        let session = Session::start("rtsp", &addr.ip().to_string(), addr.port(), options)
            .await
            .unwrap();
        accepted.await.unwrap();
        session
    }

    #[tokio::test]
    async fn candidate_protocols_auto_prefers_udp_then_tcp() {
        let session = dummy_session(SessionOptions::default()).await;
        assert_eq!(session.candidate_protocols(false), vec![Protocol::Udp, Protocol::Tcp]);
        assert_eq!(session.candidate_protocols(true), vec![Protocol::Tcp]);
    }

    #[tokio::test]
    async fn candidate_protocols_honors_fixed_preference() {
        let udp_only = dummy_session(SessionOptions::default().transport(TransportPreference::Udp)).await;
        assert_eq!(udp_only.candidate_protocols(false), vec![Protocol::Udp]);
        assert_eq!(udp_only.candidate_protocols(true), vec![Protocol::Udp]);

        let tcp_only = dummy_session(SessionOptions::default().transport(TransportPreference::Tcp)).await;
        assert_eq!(tcp_only.candidate_protocols(false), vec![Protocol::Tcp]);
    }

    #[test]
    fn play_policy_ignore_zero_seq_is_recorded() {
        let p = PlayPolicy::default().ignore_zero_seq();
        assert!(p.ignore_zero_seq);
    }
}
