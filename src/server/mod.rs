// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The server side of the RTSP state machine: accepts control
//! connections, authenticates and dispatches requests, negotiates
//! transports, and wires `RECORD` ingress into `PLAY` egress through the
//! per-media fanout in [stream].
//!
//! [ServerHandler] is a plain synchronous trait rather than relying on
//! `async fn` in traits or an extra `async-trait` dependency: all the async
//! I/O (accepting connections, reading/writing the control stream, pumping
//! media) lives on [Server] and the connection task below, so the
//! application only ever needs to answer quick, synchronous questions
//! (what's the SDP for this URL, what's the password for this user).

pub mod session;
pub mod stream;

use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rtsp_types::{Response, StatusCode, Version};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use url::Url;

use crate::auth::{DigestAlgorithm, DigestServer};
use crate::headers::authenticate::WwwAuthenticate;
use crate::headers::session::SessionHeader;
use crate::headers::transport::{ChannelPair, Delivery, Mode as TransportMode, Protocol, Transport};
use crate::headers::{self as rtsp_headers};
use crate::liveness::CancelToken;
use crate::transport::tcp::{ChannelIds, Demuxer, InterleavedTransport};
use crate::transport::tls::{MaybeTlsStream, TlsConfig};
use crate::transport::udp::UdpTransport;
use crate::transport::{Channel, MediaTransport};
use crate::wire::{Codec, CodecItem, ConnectionWriter};
use crate::{wrap, ConnectionContext, Error, ErrorInt};

use session::{PublishedResource, Registry, ServerMedia, ServerSessionState, SessionState};
use stream::{FanoutPacket, ServerStream};

/// Configuration knobs for a [Server] (the server-side options).
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub session_timeout_secs: u32,
    pub max_sessions: usize,
    /// Per-reader fanout queue depth (the fanout design: default 512).
    pub fanout_queue_depth: usize,
    pub user_agent: String,
    /// Restricts ephemeral UDP allocation to this `[lo, hi)` range; `None`
    /// means pick any free adjacent pair.
    pub udp_port_range: Option<(u16, u16)>,
    pub multicast_ttl: u32,
    pub realm: String,
    pub digest_algorithm: DigestAlgorithm,
    /// If true, every method but `OPTIONS` requires a verified
    /// `Authorization:` header.
    pub require_auth: bool,
    /// How long a torn-down session's id stays resolvable before the
    /// registry drops it, per the "linger" note.
    pub teardown_linger: Duration,
    /// Queue depth for the per-connection TCP-interleaved demultiplexer.
    pub demux_queue_depth: usize,
    /// Certificate/key material for `rtsps`; `None` means [Server::listen]
    /// only accepts plain `rtsp`.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            session_timeout_secs: crate::headers::session::DEFAULT_TIMEOUT_SECS,
            max_sessions: 1024,
            fanout_queue_depth: 512,
            user_agent: concat!("rtsp-rt/", env!("CARGO_PKG_VERSION")).to_string(),
            udp_port_range: None,
            multicast_ttl: 16,
            realm: "rtsp-rt".to_string(),
            digest_algorithm: DigestAlgorithm::Md5,
            require_auth: false,
            teardown_linger: Duration::from_secs(5),
            demux_queue_depth: 64,
            tls: None,
        }
    }
}

/// Application hooks a server implementation supplies, per the application-hook design.
pub trait ServerHandler: Send + Sync + 'static {
    /// Resolves `url` to an SDP description for a `DESCRIBE`, when no
    /// resource has already been published at that path (via `ANNOUNCE` or
    /// [Server::publish]).
    fn describe(&self, url: &Url) -> Result<sdp::session_description::SessionDescription, Error>;

    /// Looks up the password to verify `username`'s Digest credentials
    /// against; `None` rejects the request with a fresh challenge.
    fn password_for(&self, _username: &str) -> Option<String> {
        None
    }

    fn on_conn_open(&self, _ctx: &ConnectionContext) {}
    fn on_conn_close(&self, _ctx: &ConnectionContext) {}
    fn on_session_open(&self, _session_id: &str) {}
    fn on_session_close(&self, _session_id: &str) {}
    fn on_announce(&self, _session_id: &str, _sdp: &sdp::session_description::SessionDescription) {}
    fn on_setup(&self, _session_id: &str, _control: &Url) {}
    fn on_play(&self, _session_id: &str) {}
    fn on_record(&self, _session_id: &str) {}
    fn on_pause(&self, _session_id: &str) {}
    fn on_teardown(&self, _session_id: &str) {}
    /// Called for each RTP packet received on a `RECORD`-ing session's
    /// media, before it's handed to the fanout. `stream_index` is the
    /// index within that session's installed media, not a global id.
    fn on_packet_rtp(&self, _session_id: &str, _stream_index: usize, _payload: &[u8]) {}
    fn on_decode_error(&self, _err: &Error) {}
}

/// An RTSP server: a listening socket, a session/resource registry, and an
/// application [ServerHandler].
pub struct Server<H: ServerHandler> {
    options: ServerOptions,
    handler: Arc<H>,
    registry: Arc<Registry>,
    digest: DigestServer,
}

impl<H: ServerHandler> Server<H> {
    pub fn new(options: ServerOptions, handler: H) -> Self {
        let digest = DigestServer::new(options.realm.clone(), options.digest_algorithm);
        Self {
            options,
            handler: Arc::new(handler),
            registry: Arc::new(Registry::new()),
            digest,
        }
    }

    /// Publishes `description`'s media at `path` directly, without an
    /// `ANNOUNCE`, for a "server as source" deployment: the caller feeds the
    /// returned [ServerStream]s (one per media, in SDP order) from whatever
    /// upstream capture/bridge it owns, and readers `DESCRIBE`/`SETUP`/`PLAY`
    /// `path` as usual.
    pub fn publish(
        &self,
        path: impl Into<String>,
        description: sdp::session_description::SessionDescription,
        base_url: Url,
    ) -> Result<Vec<ServerStream>, Error> {
        let resource = self.publish_internal(path.into(), description, base_url, None)?;
        Ok(resource.streams.clone())
    }

    pub fn unpublish(&self, path: &str) {
        self.registry.unpublish(path);
    }

    fn publish_internal(
        &self,
        path: String,
        description: sdp::session_description::SessionDescription,
        base_url: Url,
        publisher_session_id: Option<String>,
    ) -> Result<Arc<PublishedResource>, Error> {
        let media_controls = resolve_media_controls(&base_url, &description)?;
        let streams = media_controls
            .iter()
            .map(|_| ServerStream::new(self.options.fanout_queue_depth))
            .collect();
        let resource = PublishedResource {
            description,
            base_url,
            media_controls,
            streams,
            publisher_session_id,
        };
        Ok(self.registry.publish_resource(path, resource))
    }

    /// Accepts connections on `addr` until an accept error occurs, spawning
    /// one task per connection plus a periodic session-expiry sweep.
    /// Plain `rtsp`; use [Server::listen_tls] for `rtsps`.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        log::info!("rtsp-rt server listening on {}", addr);
        self.spawn_expiry_sweep();

        loop {
            let (stream, peer_addr) = listener.accept().await.map_err(bind_err)?;
            let server = self.clone();
            tokio::spawn(async move {
                let result = server
                    .handle_connection(MaybeTlsStream::Plain(stream), peer_addr)
                    .await;
                if let Err(e) = result {
                    log::debug!("connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }

    /// Like [Server::listen], but accepts only TLS-wrapped connections
    /// (`rtsps`), terminating TLS with `options.tls` before the wire codec
    /// ever sees a byte. Fails immediately if `options.tls` is unset.
    pub async fn listen_tls(self: Arc<Self>, addr: SocketAddr) -> Result<(), Error> {
        let tls = self
            .options
            .tls
            .as_ref()
            .ok_or_else(|| {
                wrap!(ErrorInt::TransportError {
                    conn_ctx: None,
                    description: "listen_tls called with no tls_config".to_string(),
                })
            })?
            .server_acceptor()?;
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        log::info!("rtsp-rt server listening on {} (tls)", addr);
        self.spawn_expiry_sweep();

        loop {
            let (stream, peer_addr) = listener.accept().await.map_err(bind_err)?;
            let server = self.clone();
            let acceptor = tls.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        log::debug!("tls handshake with {} failed: {}", peer_addr, e);
                        return;
                    }
                };
                let result = server
                    .handle_connection(MaybeTlsStream::Server(Box::new(tls_stream)), peer_addr)
                    .await;
                if let Err(e) = result {
                    log::debug!("connection from {} ended: {}", peer_addr, e);
                }
            });
        }
    }

    fn spawn_expiry_sweep(self: &Arc<Self>) {
        let sweep_registry = self.registry.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                for id in sweep_registry.sweep_expired() {
                    log::debug!("session {} expired", id);
                }
            }
        });
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: MaybeTlsStream<TcpStream>,
        peer_addr: SocketAddr,
    ) -> Result<(), Error> {
        let local_addr = match &stream {
            MaybeTlsStream::Plain(s) => s.local_addr(),
            MaybeTlsStream::Client(s) => s.get_ref().0.local_addr(),
            MaybeTlsStream::Server(s) => s.get_ref().0.local_addr(),
        }
        .map_err(bind_err)?;
        let conn_ctx = ConnectionContext {
            local_addr,
            peer_addr,
            id: next_conn_id(),
        };
        self.handler.on_conn_open(&conn_ctx);

        let codec = Codec::new(conn_ctx, crate::wire::Limits::default());
        let framed = Framed::new(stream, codec);
        let (sink, mut stream_in) = framed.split();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let writer = ConnectionWriter::new(tx);
        tokio::spawn(crate::wire::run_writer(rx, sink));

        let mut conn = ConnHandler {
            server: self.clone(),
            conn_ctx,
            writer,
            demux: Demuxer::new(),
            next_channel: 0,
        };

        let result = (|| async {
            while let Some(item) = stream_in.next().await {
                match item? {
                    CodecItem::Message(rtsp_types::Message::Request(req)) => {
                        let resp = conn.dispatch(req).await;
                        conn.writer
                            .send(CodecItem::Message(rtsp_types::Message::Response(resp)))?;
                    }
                    CodecItem::Message(other) => {
                        log::debug!("ignoring unexpected message from client: {:?}", other);
                    }
                    CodecItem::Data { channel_id, payload } => {
                        conn.demux.route(channel_id, payload).await;
                    }
                }
            }
            Ok::<(), Error>(())
        })()
        .await;

        self.handler.on_conn_close(&conn_ctx);
        result
    }
}

/// Per-connection dispatch state: the demultiplexer for TCP-interleaved
/// ingress, the shared outbound-queue handle, and the next interleaved
/// channel-id pair to hand out on a TCP `SETUP`.
struct ConnHandler<H: ServerHandler> {
    server: Arc<Server<H>>,
    conn_ctx: ConnectionContext,
    writer: ConnectionWriter,
    demux: Demuxer,
    next_channel: u8,
}

impl<H: ServerHandler> ConnHandler<H> {
    async fn dispatch(&mut self, req: rtsp_types::Request<Bytes>) -> Response<Bytes> {
        let token = method_token(req.method());
        if !matches!(req.method(), rtsp_types::Method::Options) {
            if let Some(resp) = self.check_auth(&req, &token) {
                return resp;
            }
        }
        match req.method() {
            rtsp_types::Method::Options => self.handle_options(&req),
            rtsp_types::Method::Describe => self.handle_describe(&req).await,
            rtsp_types::Method::Announce => self.handle_announce(&req).await,
            rtsp_types::Method::Setup => self.handle_setup(&req).await,
            rtsp_types::Method::Play => self.handle_play(&req).await,
            rtsp_types::Method::Record => self.handle_record(&req).await,
            rtsp_types::Method::Pause => self.handle_pause(&req).await,
            rtsp_types::Method::Teardown => self.handle_teardown(&req).await,
            rtsp_types::Method::GetParameter => self.handle_get_parameter(&req).await,
            rtsp_types::Method::SetParameter => self.handle_set_parameter(&req).await,
            _ => self.error_response(StatusCode::NotImplemented, cseq_of(&req)),
        }
    }

    fn check_auth(&self, req: &rtsp_types::Request<Bytes>, method_token: &str) -> Option<Response<Bytes>> {
        if !self.server.options.require_auth {
            return None;
        }
        let cseq = cseq_of(req);
        let challenge = |this: &Self, cseq: Option<String>| {
            let c = this.server.digest.challenge();
            let mut builder = Response::builder(Version::V1_0, StatusCode::Unauthorized)
                .header(rtsp_types::headers::WWW_AUTHENTICATE, c.write());
            if let Some(cseq) = cseq {
                builder = builder.header(rtsp_types::headers::CSEQ, cseq);
            }
            builder.empty()
        };
        let auth_value = match req.header(&rtsp_types::headers::AUTHORIZATION) {
            Some(v) => v.as_str(),
            None => return Some(challenge(self, cseq)),
        };
        let parsed = match WwwAuthenticate::parse(auth_value) {
            Ok(p) => p,
            Err(_) => return Some(challenge(self, cseq)),
        };
        let username = match parsed.param("username") {
            Some(u) => u.to_string(),
            None => return Some(challenge(self, cseq)),
        };
        let password = match self.server.handler.password_for(&username) {
            Some(p) => p,
            None => return Some(challenge(self, cseq)),
        };
        match self.server.digest.verify(&parsed, method_token, &password) {
            Ok(()) => None,
            Err(_) => Some(challenge(self, cseq)),
        }
    }

    fn handle_options(&self, req: &rtsp_types::Request<Bytes>) -> Response<Bytes> {
        let cseq = cseq_of(req);
        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok).header(
            rtsp_types::headers::PUBLIC,
            "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER"
                .to_string(),
        );
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq);
        }
        builder.empty()
    }

    async fn handle_describe(&mut self, req: &rtsp_types::Request<Bytes>) -> Response<Bytes> {
        let cseq = cseq_of(req);
        let url = match request_url(req) {
            Some(u) => u,
            None => return self.error_response(StatusCode::BadRequest, cseq),
        };
        let path = url.path().to_string();
        let resource = match self.server.registry.resource(&path) {
            Some(r) => r,
            None => {
                let sdp = match self.server.handler.describe(&url) {
                    Ok(s) => s,
                    Err(_) => return self.error_response(StatusCode::NotFound, cseq),
                };
                match self.server.publish_internal(path.clone(), sdp, url.clone(), None) {
                    Ok(r) => r,
                    Err(_) => return self.error_response(StatusCode::InternalServerError, cseq),
                }
            }
        };
        let body = Bytes::from(resource.description.marshal());
        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok)
            .header(rtsp_types::headers::CONTENT_TYPE, "application/sdp".to_string())
            .header(rtsp_types::headers::CONTENT_BASE, resource.base_url.to_string());
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq);
        }
        builder.build(body)
    }

    async fn handle_announce(&mut self, req: &rtsp_types::Request<Bytes>) -> Response<Bytes> {
        let cseq = cseq_of(req);
        let url = match request_url(req) {
            Some(u) => u,
            None => return self.error_response(StatusCode::BadRequest, cseq),
        };
        if !matches!(
            req.header(&rtsp_types::headers::CONTENT_TYPE),
            Some(v) if v.as_str() == "application/sdp"
        ) {
            return self.error_response(StatusCode::UnsupportedMediaType, cseq);
        }
        let sdp = {
            let mut cursor = std::io::Cursor::new(&req.body()[..]);
            match sdp::session_description::SessionDescription::unmarshal(&mut cursor) {
                Ok(s) => s,
                Err(_) => return self.error_response(StatusCode::BadRequest, cseq),
            }
        };
        let session = match self.create_session(cseq.clone()) {
            Ok(s) => s,
            Err(r) => return r,
        };
        let session_id = session.lock().unwrap().id.clone();
        let path = url.path().to_string();
        let resource = match self
            .server
            .publish_internal(path.clone(), sdp, url.clone(), Some(session_id.clone()))
        {
            Ok(r) => r,
            Err(_) => return self.error_response(StatusCode::InternalServerError, cseq),
        };
        {
            let mut guard = session.lock().unwrap();
            guard.resource = Some(path);
        }
        self.server.handler.on_announce(&session_id, &resource.description);

        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok).header(
            rtsp_types::headers::SESSION,
            SessionHeader::new(session_id)
                .with_timeout(self.server.options.session_timeout_secs)
                .write(),
        );
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq);
        }
        builder.empty()
    }

    async fn handle_setup(&mut self, req: &rtsp_types::Request<Bytes>) -> Response<Bytes> {
        let cseq = cseq_of(req);
        let url = match request_url(req) {
            Some(u) => u,
            None => return self.error_response(StatusCode::BadRequest, cseq),
        };
        let transport_value = match req.header(&rtsp_types::headers::TRANSPORT) {
            Some(v) => v.as_str(),
            None => return self.error_response(StatusCode::BadRequest, cseq),
        };
        let candidates = match Transport::parse_all(transport_value) {
            Ok(c) if !c.is_empty() => c,
            _ => return self.error_response(StatusCode::UnsupportedTransport, cseq),
        };
        let candidate = candidates.into_iter().next().unwrap();

        let (path, resource, media_index) = match self.server.registry.resolve_media(&url) {
            Some(found) => found,
            None => return self.error_response(StatusCode::NotFound, cseq),
        };

        let session = match self.session_header_or_create(req) {
            Ok(s) => s,
            Err(r) => return r,
        };

        let mode = candidate.mode.unwrap_or(TransportMode::Play);

        {
            let guard = session.lock().unwrap();
            if guard.check_transition("SETUP").is_err() {
                return self.error_response(StatusCode::MethodNotValidInThisState, cseq);
            }
            // A session aggregates every media under one transport choice;
            // a SETUP for a new stream must match what's already installed.
            // Re-SETUP of the *same* stream (e.g. a UDP→TCP fallback retry)
            // is a replacement, not a new aggregate member, so it's exempt.
            if let Some(first) = guard.media.iter().find(|m| m.control != url) {
                if !transport_is_compatible(&first.negotiated, first.mode, &candidate, mode) {
                    return self.error_response(StatusCode::AggregateOperationNotAllowed, cseq);
                }
            }
        }

        if candidate.protocol.is_secure()
            && !media_has_srtp_keying(&resource.description.media_descriptions[media_index])
        {
            return self.error_response(StatusCode::UnsupportedTransport, cseq);
        }

        let (transport, negotiated) = match self.install_transport(&candidate).await {
            Ok(t) => t,
            Err(_) => return self.error_response(StatusCode::UnsupportedTransport, cseq),
        };

        let session_id = {
            let mut guard = session.lock().unwrap();
            guard.media.retain(|m| m.control != url);
            guard.media.push(ServerMedia {
                control: url.clone(),
                mode,
                transport: Some(transport),
                negotiated: negotiated.clone(),
                stream: Some(resource.streams[media_index].clone()),
            });
            guard.state = match (guard.state, mode) {
                (SessionState::Read, _) | (SessionState::Record, _) => guard.state,
                (_, TransportMode::Play) => SessionState::PreRead,
                (_, TransportMode::Record) => SessionState::PreRecord,
            };
            if guard.resource.is_none() {
                guard.resource = Some(path);
            }
            guard.timeout.touch();
            guard.id.clone()
        };

        // A SETUP that replaces a stream's transport mid-session (e.g. a
        // client's UDP->TCP fallback retry after PLAY) needs its egress pump
        // re-armed immediately; PLAY/RECORD only spawn pumps once, at the
        // transition into Read/Record.
        match mode {
            TransportMode::Play if session.lock().unwrap().state == SessionState::Read => {
                self.spawn_play_pumps(&session);
            }
            TransportMode::Record if session.lock().unwrap().state == SessionState::Record => {
                self.spawn_record_pumps(&session, &session_id);
            }
            _ => {}
        }

        self.server.handler.on_setup(&session_id, &url);

        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok)
            .header(rtsp_types::headers::TRANSPORT, negotiated.write())
            .header(
                rtsp_types::headers::SESSION,
                SessionHeader::new(session_id)
                    .with_timeout(self.server.options.session_timeout_secs)
                    .write(),
            );
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq);
        }
        builder.empty()
    }

    async fn handle_play(&mut self, req: &rtsp_types::Request<Bytes>) -> Response<Bytes> {
        let cseq = cseq_of(req);
        let session = match self.resolve_existing_session(req) {
            Ok(s) => s,
            Err(r) => return r,
        };
        {
            let mut guard = session.lock().unwrap();
            guard.timeout.touch();
            match guard.check_transition("PLAY") {
                Ok(next) => guard.state = next,
                Err(_) => return self.error_response(StatusCode::MethodNotValidInThisState, cseq),
            }
        }
        let session_id = session.lock().unwrap().id.clone();
        self.spawn_play_pumps(&session);
        self.server.handler.on_play(&session_id);

        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok).header(
            rtsp_types::headers::SESSION,
            SessionHeader::new(session_id)
                .with_timeout(self.server.options.session_timeout_secs)
                .write(),
        );
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq);
        }
        builder.empty()
    }

    async fn handle_record(&mut self, req: &rtsp_types::Request<Bytes>) -> Response<Bytes> {
        let cseq = cseq_of(req);
        let session = match self.resolve_existing_session(req) {
            Ok(s) => s,
            Err(r) => return r,
        };
        {
            let mut guard = session.lock().unwrap();
            guard.timeout.touch();
            match guard.check_transition("RECORD") {
                Ok(next) => guard.state = next,
                Err(_) => return self.error_response(StatusCode::MethodNotValidInThisState, cseq),
            }
        }
        let session_id = session.lock().unwrap().id.clone();
        self.spawn_record_pumps(&session, &session_id);
        self.server.handler.on_record(&session_id);

        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok).header(
            rtsp_types::headers::SESSION,
            SessionHeader::new(session_id)
                .with_timeout(self.server.options.session_timeout_secs)
                .write(),
        );
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq);
        }
        builder.empty()
    }

    async fn handle_pause(&mut self, req: &rtsp_types::Request<Bytes>) -> Response<Bytes> {
        let cseq = cseq_of(req);
        let session = match self.resolve_existing_session(req) {
            Ok(s) => s,
            Err(r) => return r,
        };
        let session_id = {
            let mut guard = session.lock().unwrap();
            guard.timeout.touch();
            match guard.check_transition("PAUSE") {
                Ok(next) => {
                    let prev = guard.state;
                    guard.state = next;
                    guard.paused_from = Some(prev);
                }
                Err(_) => return self.error_response(StatusCode::MethodNotValidInThisState, cseq),
            }
            guard.id.clone()
        };
        self.server.handler.on_pause(&session_id);

        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok);
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq);
        }
        builder.empty()
    }

    async fn handle_teardown(&mut self, req: &rtsp_types::Request<Bytes>) -> Response<Bytes> {
        let cseq = cseq_of(req);
        let session = match self.resolve_existing_session(req) {
            Ok(s) => s,
            Err(r) => return r,
        };
        let (session_id, resource_path) = {
            let guard = session.lock().unwrap();
            guard.cancel.cancel();
            (guard.id.clone(), guard.resource.clone())
        };
        if let Some(path) = resource_path {
            if let Some(resource) = self.server.registry.resource(&path) {
                if resource.publisher_session_id.as_deref() == Some(session_id.as_str()) {
                    self.server.registry.unpublish(&path);
                }
            }
        }
        self.server.handler.on_teardown(&session_id);
        self.server.handler.on_session_close(&session_id);
        self.server
            .registry
            .remove_after_linger(session_id, self.server.options.teardown_linger);

        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok);
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq);
        }
        builder.empty()
    }

    async fn handle_get_parameter(&mut self, req: &rtsp_types::Request<Bytes>) -> Response<Bytes> {
        let cseq = cseq_of(req);
        let session = match self.resolve_existing_session(req) {
            Ok(s) => s,
            Err(r) => return r,
        };
        session.lock().unwrap().timeout.touch();
        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok);
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq);
        }
        builder.empty()
    }

    async fn handle_set_parameter(&mut self, req: &rtsp_types::Request<Bytes>) -> Response<Bytes> {
        let cseq = cseq_of(req);
        let session = match self.resolve_existing_session(req) {
            Ok(s) => s,
            Err(r) => return r,
        };
        session.lock().unwrap().timeout.touch();
        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok);
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq);
        }
        builder.empty()
    }

    fn session_header_or_create(
        &self,
        req: &rtsp_types::Request<Bytes>,
    ) -> Result<Arc<Mutex<ServerSessionState>>, Response<Bytes>> {
        let cseq = cseq_of(req);
        match req.header(&rtsp_types::headers::SESSION) {
            Some(v) => {
                let parsed = SessionHeader::parse(v.as_str())
                    .map_err(|_| self.error_response(StatusCode::BadRequest, cseq.clone()))?;
                self.server
                    .registry
                    .get(&parsed.id)
                    .ok_or_else(|| self.error_response(StatusCode::SessionNotFound, cseq))
            }
            None => self.create_session(cseq),
        }
    }

    fn resolve_existing_session(
        &self,
        req: &rtsp_types::Request<Bytes>,
    ) -> Result<Arc<Mutex<ServerSessionState>>, Response<Bytes>> {
        let cseq = cseq_of(req);
        let v = match req.header(&rtsp_types::headers::SESSION) {
            Some(v) => v,
            None => return Err(self.error_response(StatusCode::SessionNotFound, cseq)),
        };
        let parsed = SessionHeader::parse(v.as_str())
            .map_err(|_| self.error_response(StatusCode::BadRequest, cseq.clone()))?;
        self.server
            .registry
            .get(&parsed.id)
            .ok_or_else(|| self.error_response(StatusCode::SessionNotFound, cseq))
    }

    fn create_session(&self, cseq: Option<String>) -> Result<Arc<Mutex<ServerSessionState>>, Response<Bytes>> {
        self.server
            .registry
            .create_session(
                self.conn_ctx.id,
                self.server.options.session_timeout_secs,
                self.server.options.max_sessions,
            )
            .map(|s| {
                let id = s.lock().unwrap().id.clone();
                self.server.handler.on_session_open(&id);
                s
            })
            .map_err(|_| self.error_response(StatusCode::InternalServerError, cseq))
    }

    /// Negotiates and binds the transport for one `SETUP` candidate:
    /// UDP unicast/multicast bind a fresh port pair; TCP claims
    /// the next adjacent channel-id pair on this connection and registers
    /// it with the demultiplexer. `SecureUdp`/`SecureTcp` reuse their plain
    /// counterparts' wiring once the caller has confirmed an SRTP keying
    /// context is present in the SDP.
    async fn install_transport(&mut self, candidate: &Transport) -> Result<(MediaTransport, Transport), Error> {
        match candidate.protocol {
            Protocol::Udp | Protocol::SecureUdp => {
                let local_ip = self.conn_ctx.local_addr.ip();
                let mut udp = match candidate.delivery {
                    Delivery::Unicast => {
                        crate::transport::udp::bind_in_range(local_ip, self.server.options.udp_port_range).await?
                    }
                    Delivery::Multicast => {
                        let group = candidate
                            .destination
                            .as_deref()
                            .and_then(|d| d.parse::<std::net::Ipv4Addr>().ok())
                            .ok_or_else(|| {
                                wrap!(ErrorInt::TransportError {
                                    conn_ctx: None,
                                    description: "multicast SETUP missing a usable destination".to_string(),
                                })
                            })?;
                        let port = candidate.client_port.map(|p| p.rtp).unwrap_or(0);
                        UdpTransport::join_multicast(group, port, self.server.options.multicast_ttl).await?
                    }
                };
                if let Some(client_port) = candidate.client_port {
                    udp.connect_to(std::net::SocketAddr::new(self.conn_ctx.peer_addr.ip(), client_port.rtp));
                }
                let (server_rtp, server_rtcp) = udp.local_ports();
                let mut negotiated = candidate.clone();
                negotiated.server_port = Some(ChannelPair {
                    rtp: server_rtp,
                    rtcp: server_rtcp,
                });
                Ok((MediaTransport::Udp(udp), negotiated))
            }
            Protocol::Tcp | Protocol::SecureTcp => {
                // Echo the client's requested interleaved= channels; only fall
                // back to server-chosen ones when it didn't propose any. SRTP
                // keying for `SecureTcp` was already checked by the caller.
                let channels = match candidate.interleaved {
                    Some(requested) => {
                        let rtp = u8::try_from(requested.rtp).map_err(|_| {
                            wrap!(ErrorInt::TransportError {
                                conn_ctx: None,
                                description: format!(
                                    "requested interleaved channel {} out of range",
                                    requested.rtp
                                ),
                            })
                        })?;
                        let rtcp = u8::try_from(requested.rtcp).map_err(|_| {
                            wrap!(ErrorInt::TransportError {
                                conn_ctx: None,
                                description: format!(
                                    "requested interleaved channel {} out of range",
                                    requested.rtcp
                                ),
                            })
                        })?;
                        let channels = ChannelIds { rtp, rtcp };
                        if self.demux.contains(channels) {
                            return Err(wrap!(ErrorInt::TransportError {
                                conn_ctx: None,
                                description: format!(
                                    "requested interleaved channels {}-{} already in use",
                                    rtp, rtcp
                                ),
                            }));
                        }
                        channels
                    }
                    None => {
                        let rtp = self.next_channel;
                        let rtcp = rtp + 1;
                        self.next_channel += 2;
                        ChannelIds { rtp, rtcp }
                    }
                };
                let incoming = self.demux.register(channels, self.server.options.demux_queue_depth);
                let transport = InterleavedTransport::new(channels, self.writer.clone(), incoming);
                let mut negotiated = candidate.clone();
                negotiated.interleaved = Some(ChannelPair {
                    rtp: u16::from(channels.rtp),
                    rtcp: u16::from(channels.rtcp),
                });
                Ok((MediaTransport::TcpInterleaved(transport), negotiated))
            }
        }
    }

    /// Spawns one egress pump per `PLAY`-mode installed media: subscribes a
    /// [stream::Reader] and forwards everything it yields to that media's
    /// transport, until the session's [CancelToken] fires or the write
    /// fails (the reader side of fanout).
    fn spawn_play_pumps(&self, session: &Arc<Mutex<ServerSessionState>>) {
        let mut guard = session.lock().unwrap();
        let cancel = guard.cancel.clone();
        for media in guard.media.iter_mut() {
            if media.mode != TransportMode::Play {
                continue;
            }
            let transport = match media.transport.take() {
                Some(t) => t,
                None => continue,
            };
            let server_stream = match media.stream.clone() {
                Some(s) => s,
                None => continue,
            };
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut transport = transport;
                let mut reader = server_stream.subscribe();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        item = reader.recv() => {
                            match item {
                                Some(pkt) => {
                                    if transport.write_packet(pkt.channel, &pkt.payload).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
                transport.close();
            });
        }
    }

    /// Spawns one ingress pump per `RECORD`-mode installed media: reads raw
    /// packets off the transport and republishes RTP payloads through the
    /// resource's fanout.
    fn spawn_record_pumps(&self, session: &Arc<Mutex<ServerSessionState>>, session_id: &str) {
        let mut guard = session.lock().unwrap();
        let cancel = guard.cancel.clone();
        for (idx, media) in guard.media.iter_mut().enumerate() {
            if media.mode != TransportMode::Record {
                continue;
            }
            let transport = match media.transport.take() {
                Some(t) => t,
                None => continue,
            };
            let server_stream = match media.stream.clone() {
                Some(s) => s,
                None => continue,
            };
            let handler = self.server.handler.clone();
            let cancel = cancel.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                let mut transport = transport;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = transport.read_packet() => {
                            match res {
                                Ok((channel, payload)) => {
                                    if channel == Channel::Rtp {
                                        handler.on_packet_rtp(&session_id, idx, &payload);
                                    }
                                    server_stream.publish(FanoutPacket { channel, payload });
                                }
                                Err(e) => {
                                    handler.on_decode_error(&e);
                                    break;
                                }
                            }
                        }
                    }
                }
                transport.close();
            });
        }
    }

    fn error_response(&self, status: StatusCode, cseq: Option<String>) -> Response<Bytes> {
        let mut builder = Response::builder(Version::V1_0, status);
        if let Some(cseq) = cseq {
            builder = builder.header(rtsp_types::headers::CSEQ, cseq);
        }
        builder.empty()
    }
}

/// Resolves the session- and media-level `a=control:` attributes of an SDP
/// description into one absolute [Url] per media, in declaration order,
/// mirroring [crate::client::parse]'s client-side equivalent.
fn resolve_media_controls(
    base_url: &Url,
    sdp: &sdp::session_description::SessionDescription,
) -> Result<Vec<Url>, Error> {
    let session_control = sdp
        .attributes
        .iter()
        .find(|a| a.key == "control")
        .and_then(|a| a.value.as_deref());
    let base = match session_control {
        Some(c) => crate::client::parse::join_control(base_url, c)?,
        None => base_url.clone(),
    };
    sdp.media_descriptions
        .iter()
        .map(|m| {
            let control = m
                .attributes
                .iter()
                .find(|a| a.key == "control")
                .and_then(|a| a.value.as_deref());
            match control {
                Some(c) => crate::client::parse::join_control(&base, c),
                None => Ok(base.clone()),
            }
        })
        .collect()
}

/// True if a media description carries an externally supplied SRTP keying
/// context (`a=crypto:` or `a=key-mgmt:mikey ...`), the only form of
/// SRTP/SAVP support this crate accepts: it never negotiates keys itself.
fn media_has_srtp_keying(media: &sdp::media_description::MediaDescription) -> bool {
    media.attributes.iter().any(|a| {
        a.key == "crypto"
            || (a.key == "key-mgmt" && a.value.as_deref().map_or(false, |v| v.starts_with("mikey")))
    })
}

/// Maps an [rtsp_types::Method] to its literal wire token, matching what
/// [ServerSessionState::check_transition] and Digest's A2 computation both
/// expect (not `Method`'s `Debug` output, which drops the underscores in
/// multi-word method names).
fn method_token(method: &rtsp_types::Method) -> String {
    use rtsp_types::Method::*;
    match method {
        Describe => "DESCRIBE",
        Announce => "ANNOUNCE",
        Setup => "SETUP",
        Play => "PLAY",
        Record => "RECORD",
        Pause => "PAUSE",
        Teardown => "TEARDOWN",
        Options => "OPTIONS",
        GetParameter => "GET_PARAMETER",
        SetParameter => "SET_PARAMETER",
        _ => "EXTENSION",
    }
    .to_string()
}

/// A session's transport selection is fixed at the first `SETUP`; later
/// `SETUP`s for a different stream in the same session must propose the
/// same protocol, delivery, and mode, or they get 459.
fn transport_is_compatible(
    installed: &Transport,
    installed_mode: TransportMode,
    candidate: &Transport,
    candidate_mode: TransportMode,
) -> bool {
    installed.protocol == candidate.protocol
        && installed.delivery == candidate.delivery
        && installed_mode == candidate_mode
}

fn cseq_of(req: &rtsp_types::Request<Bytes>) -> Option<String> {
    req.header(&rtsp_types::headers::CSEQ).map(|v| v.as_str().to_string())
}

fn request_url(req: &rtsp_types::Request<Bytes>) -> Option<Url> {
    Url::parse(&req.request_uri()?.to_string()).ok()
}

fn bind_err(e: std::io::Error) -> Error {
    wrap!(ErrorInt::TransportError {
        conn_ctx: None,
        description: e.to_string(),
    })
}

static NEXT_CONN_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

// Only referenced to keep the `rtsp_headers` import (for doc-linking the
// header module from this file's rustdoc) from looking unused under some
// feature combinations.
#[allow(unused_imports)]
use rtsp_headers as _headers_for_docs;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_token_uses_wire_names_not_debug_output() {
        assert_eq!(method_token(&rtsp_types::Method::GetParameter), "GET_PARAMETER");
        assert_eq!(method_token(&rtsp_types::Method::SetParameter), "SET_PARAMETER");
        assert_eq!(method_token(&rtsp_types::Method::Describe), "DESCRIBE");
    }

    #[test]
    fn default_options_are_sane() {
        let o = ServerOptions::default();
        assert!(!o.require_auth);
        assert_eq!(o.fanout_queue_depth, 512);
        assert_eq!(o.session_timeout_secs, crate::headers::session::DEFAULT_TIMEOUT_SECS);
    }

    /// Exercises `handle_setup`/`handle_play`/`handle_record`/`handle_teardown`
    /// directly against a `ConnHandler`, without a real socket: these are the
    /// dispatch methods `dispatch()` routes every request through.
    struct NullHandler;

    impl ServerHandler for NullHandler {
        fn describe(&self, _url: &Url) -> Result<sdp::session_description::SessionDescription, Error> {
            Err(wrap!(ErrorInt::DecodeError {
                description: "no resource published".to_string(),
            }))
        }
    }

    fn two_media_sdp() -> sdp::session_description::SessionDescription {
        let text = b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
a=control:*\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=control:trackID=0\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=rtpmap:97 L16/8000/1\r\n\
a=control:trackID=1\r\n";
        let mut cursor = std::io::Cursor::new(&text[..]);
        sdp::session_description::SessionDescription::unmarshal(&mut cursor).unwrap()
    }

    fn test_conn(options: ServerOptions) -> ConnHandler<NullHandler> {
        let server = Arc::new(Server::new(options, NullHandler));
        server
            .publish_internal(
                "/cam".to_string(),
                two_media_sdp(),
                Url::parse("rtsp://127.0.0.1/cam/").unwrap(),
                None,
            )
            .unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        ConnHandler {
            server,
            conn_ctx: ConnectionContext::dummy(),
            writer: ConnectionWriter::new(tx),
            demux: Demuxer::new(),
            next_channel: 0,
        }
    }

    fn req(
        method: rtsp_types::Method,
        url: &str,
        headers: Vec<(rtsp_types::HeaderName, String)>,
    ) -> rtsp_types::Request<Bytes> {
        let mut builder = rtsp_types::Request::builder(method, Version::V1_0)
            .request_uri(rtsp_types::Url::parse(url).unwrap());
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder.empty()
    }

    fn session_id_of(resp: &Response<Bytes>) -> String {
        let value = resp
            .header(&rtsp_types::headers::SESSION)
            .expect("Session header")
            .as_str();
        crate::headers::session::SessionHeader::parse(value).unwrap().id
    }

    #[tokio::test]
    async fn handle_setup_then_play_roundtrip() {
        let mut conn = test_conn(ServerOptions::default());

        let setup = req(
            rtsp_types::Method::Setup,
            "rtsp://127.0.0.1/cam/trackID=0",
            vec![
                (rtsp_types::headers::CSEQ, "1".to_string()),
                (
                    rtsp_types::headers::TRANSPORT,
                    "RTP/AVP;unicast;client_port=4000-4001".to_string(),
                ),
            ],
        );
        let resp = conn.handle_setup(&setup).await;
        assert_eq!(u16::from(resp.status()), 200);
        assert!(resp.header(&rtsp_types::headers::TRANSPORT).is_some());
        let session_id = session_id_of(&resp);

        let play = req(
            rtsp_types::Method::Play,
            "rtsp://127.0.0.1/cam/",
            vec![
                (rtsp_types::headers::CSEQ, "2".to_string()),
                (rtsp_types::headers::SESSION, session_id),
            ],
        );
        let resp = conn.handle_play(&play).await;
        assert_eq!(u16::from(resp.status()), 200);
    }

    #[tokio::test]
    async fn handle_setup_rejects_incompatible_transport_for_a_second_stream() {
        let mut conn = test_conn(ServerOptions::default());

        let first = req(
            rtsp_types::Method::Setup,
            "rtsp://127.0.0.1/cam/trackID=0",
            vec![
                (rtsp_types::headers::CSEQ, "1".to_string()),
                (
                    rtsp_types::headers::TRANSPORT,
                    "RTP/AVP;unicast;client_port=4000-4001".to_string(),
                ),
            ],
        );
        let resp = conn.handle_setup(&first).await;
        assert_eq!(u16::from(resp.status()), 200);
        let session_id = session_id_of(&resp);

        let second = req(
            rtsp_types::Method::Setup,
            "rtsp://127.0.0.1/cam/trackID=1",
            vec![
                (rtsp_types::headers::CSEQ, "2".to_string()),
                (rtsp_types::headers::SESSION, session_id),
                (
                    rtsp_types::headers::TRANSPORT,
                    "RTP/AVP/TCP;unicast;interleaved=2-3".to_string(),
                ),
            ],
        );
        let resp = conn.handle_setup(&second).await;
        assert_eq!(u16::from(resp.status()), 459);
    }

    /// The fix for the bug above: a re-`SETUP` of the *same* stream (a
    /// UDP->TCP fallback retry) must not be rejected as incompatible with
    /// itself.
    #[tokio::test]
    async fn handle_setup_allows_resetup_of_the_same_stream_over_tcp() {
        let mut conn = test_conn(ServerOptions::default());

        let first = req(
            rtsp_types::Method::Setup,
            "rtsp://127.0.0.1/cam/trackID=0",
            vec![
                (rtsp_types::headers::CSEQ, "1".to_string()),
                (
                    rtsp_types::headers::TRANSPORT,
                    "RTP/AVP;unicast;client_port=4000-4001".to_string(),
                ),
            ],
        );
        let resp = conn.handle_setup(&first).await;
        assert_eq!(u16::from(resp.status()), 200);
        let session_id = session_id_of(&resp);

        let retry = req(
            rtsp_types::Method::Setup,
            "rtsp://127.0.0.1/cam/trackID=0",
            vec![
                (rtsp_types::headers::CSEQ, "2".to_string()),
                (rtsp_types::headers::SESSION, session_id),
                (
                    rtsp_types::headers::TRANSPORT,
                    "RTP/AVP/TCP;unicast;interleaved=0-1".to_string(),
                ),
            ],
        );
        let resp = conn.handle_setup(&retry).await;
        assert_eq!(u16::from(resp.status()), 200);
    }

    #[tokio::test]
    async fn handle_record_is_rejected_once_the_session_is_already_playing() {
        let mut conn = test_conn(ServerOptions::default());

        let setup = req(
            rtsp_types::Method::Setup,
            "rtsp://127.0.0.1/cam/trackID=0",
            vec![
                (rtsp_types::headers::CSEQ, "1".to_string()),
                (
                    rtsp_types::headers::TRANSPORT,
                    "RTP/AVP;unicast;client_port=4000-4001".to_string(),
                ),
            ],
        );
        let resp = conn.handle_setup(&setup).await;
        let session_id = session_id_of(&resp);

        let play = req(
            rtsp_types::Method::Play,
            "rtsp://127.0.0.1/cam/",
            vec![
                (rtsp_types::headers::CSEQ, "2".to_string()),
                (rtsp_types::headers::SESSION, session_id.clone()),
            ],
        );
        assert_eq!(u16::from(conn.handle_play(&play).await.status()), 200);

        let record = req(
            rtsp_types::Method::Record,
            "rtsp://127.0.0.1/cam/",
            vec![
                (rtsp_types::headers::CSEQ, "3".to_string()),
                (rtsp_types::headers::SESSION, session_id),
            ],
        );
        assert_eq!(u16::from(conn.handle_record(&record).await.status()), 455);
    }

    #[tokio::test]
    async fn handle_teardown_makes_the_session_unresolvable_after_the_linger() {
        let mut options = ServerOptions::default();
        options.teardown_linger = Duration::from_millis(1);
        let mut conn = test_conn(options);

        let setup = req(
            rtsp_types::Method::Setup,
            "rtsp://127.0.0.1/cam/trackID=0",
            vec![
                (rtsp_types::headers::CSEQ, "1".to_string()),
                (
                    rtsp_types::headers::TRANSPORT,
                    "RTP/AVP;unicast;client_port=4000-4001".to_string(),
                ),
            ],
        );
        let resp = conn.handle_setup(&setup).await;
        let session_id = session_id_of(&resp);

        let teardown = req(
            rtsp_types::Method::Teardown,
            "rtsp://127.0.0.1/cam/",
            vec![
                (rtsp_types::headers::CSEQ, "2".to_string()),
                (rtsp_types::headers::SESSION, session_id.clone()),
            ],
        );
        assert_eq!(u16::from(conn.handle_teardown(&teardown).await.status()), 200);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let play = req(
            rtsp_types::Method::Play,
            "rtsp://127.0.0.1/cam/",
            vec![
                (rtsp_types::headers::CSEQ, "3".to_string()),
                (rtsp_types::headers::SESSION, session_id),
            ],
        );
        assert_eq!(u16::from(conn.handle_play(&play).await.status()), 454);
    }
}
