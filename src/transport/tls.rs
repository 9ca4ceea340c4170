// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `rtsps` support: wraps the control connection's
//! `TcpStream` in TLS before the wire codec ever sees it, so everything
//! above this module (`Framed<_, Codec>`, the client/server state machines)
//! stays oblivious to whether it's talking `rtsp` or `rtsps`.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::rustls::{self, Certificate, OwnedTrustAnchor, PrivateKey};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{wrap, Error, ErrorInt};

/// The `tls_config` configuration option: certificate/key material
/// for `rtsps`. Client and server use different subsets: a client needs at
/// most `ca_cert_pem` (or `danger_accept_invalid_certs`, for talking to a
/// camera with a self-signed cert); a server needs `cert_chain_pem` and
/// `private_key_pem`.
#[derive(Clone, Default)]
pub struct TlsConfig {
    pub cert_chain_pem: Option<Vec<u8>>,
    pub private_key_pem: Option<Vec<u8>>,
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Skips server certificate verification entirely. Only meant for
    /// talking to devices with self-signed certs on a trusted network;
    /// never enabled by default.
    pub danger_accept_invalid_certs: bool,
}

impl TlsConfig {
    pub fn client_connector(&self) -> Result<TlsConnector, Error> {
        let builder = rustls::ClientConfig::builder().with_safe_default_cipher_suites();
        let builder = builder
            .with_safe_default_kx_groups()
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_err(format!("building client config: {}", e)))?;
        let config = if self.danger_accept_invalid_certs {
            builder
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            if let Some(ca) = &self.ca_cert_pem {
                let mut reader = io::BufReader::new(ca.as_slice());
                for cert in
                    rustls_pemfile::certs(&mut reader).map_err(|e| tls_err(e.to_string()))?
                {
                    roots
                        .add(&Certificate(cert))
                        .map_err(|e| tls_err(format!("invalid ca_cert_pem: {}", e)))?;
                }
            } else {
                roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
                    OwnedTrustAnchor::from_subject_spki_name_constraints(
                        ta.subject,
                        ta.spki,
                        ta.name_constraints,
                    )
                }));
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        Ok(TlsConnector::from(Arc::new(config)))
    }

    pub fn server_acceptor(&self) -> Result<TlsAcceptor, Error> {
        let cert_pem = self
            .cert_chain_pem
            .as_ref()
            .ok_or_else(|| tls_err("tls_config missing cert_chain_pem"))?;
        let key_pem = self
            .private_key_pem
            .as_ref()
            .ok_or_else(|| tls_err("tls_config missing private_key_pem"))?;
        let certs = rustls_pemfile::certs(&mut io::BufReader::new(cert_pem.as_slice()))
            .map_err(|e| tls_err(e.to_string()))?
            .into_iter()
            .map(Certificate)
            .collect::<Vec<_>>();
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut io::BufReader::new(key_pem.as_slice()))
            .map_err(|e| tls_err(e.to_string()))?;
        let key = PrivateKey(
            keys.pop()
                .ok_or_else(|| tls_err("private_key_pem contained no PKCS#8 key"))?,
        );
        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| tls_err(format!("building server config: {}", e)))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Accepts any server certificate without verification. Only reachable via
/// the explicit `danger_accept_invalid_certs` opt-in.
struct NoVerifier;

impl rustls::client::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn tls_err(description: impl Into<String>) -> Error {
    wrap!(ErrorInt::TransportError {
        conn_ctx: None,
        description: format!("tls: {}", description.into()),
    })
}

/// Either a bare byte stream or one wrapped in TLS. The wire codec's
/// `Framed<MaybeTlsStream<IO>, Codec>` doesn't need a second code path.
pub enum MaybeTlsStream<IO> {
    Plain(IO),
    Client(Box<tokio_rustls::client::TlsStream<IO>>),
    Server(Box<tokio_rustls::server::TlsStream<IO>>),
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Client(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            MaybeTlsStream::Server(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Client(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            MaybeTlsStream::Server(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Client(s) => Pin::new(s.as_mut()).poll_flush(cx),
            MaybeTlsStream::Server(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Client(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            MaybeTlsStream::Server(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_server_material_is_rejected() {
        let cfg = TlsConfig::default();
        assert!(cfg.server_acceptor().is_err());
    }

    #[test]
    fn plain_client_config_builds_without_ca_material() {
        let cfg = TlsConfig::default();
        assert!(cfg.client_connector().is_ok());
    }

    #[test]
    fn danger_accept_invalid_certs_builds() {
        let cfg = TlsConfig {
            danger_accept_invalid_certs: true,
            ..Default::default()
        };
        assert!(cfg.client_connector().is_ok());
    }
}
