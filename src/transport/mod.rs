// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The transport abstraction: a uniform interface over UDP
//! unicast, UDP multicast, TCP-interleaved, and (rtsps) TLS-wrapped
//! TCP-interleaved.
//!
//! Polymorphism over transports and codecs is expressed as a small
//! tagged-union capability surface, not a trait-object hierarchy: adding a
//! new transport kind means adding an enum arm, not implementing a deep
//! inheritance chain.

pub mod pool;
pub mod tcp;
pub mod tls;
pub mod udp;

use bytes::Bytes;

use crate::{ConnectionContext, Error};

/// One received packet, still tagged by which of a media's two sub-streams
/// (RTP or RTCP) it arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Rtp,
    Rtcp,
}

/// The capability surface every transport variant implements:
/// `read_packet`, `write_packet`, `close`, `local_addrs`.
pub enum MediaTransport {
    Udp(udp::UdpTransport),
    TcpInterleaved(tcp::InterleavedTransport),
}

impl MediaTransport {
    pub async fn read_packet(&mut self) -> Result<(Channel, Bytes), Error> {
        match self {
            MediaTransport::Udp(t) => t.read_packet().await,
            MediaTransport::TcpInterleaved(t) => t.read_packet().await,
        }
    }

    pub async fn write_packet(&mut self, channel: Channel, data: &[u8]) -> Result<(), Error> {
        match self {
            MediaTransport::Udp(t) => t.write_packet(channel, data).await,
            MediaTransport::TcpInterleaved(t) => t.write_packet(channel, data).await,
        }
    }

    pub fn close(&mut self) {
        match self {
            MediaTransport::Udp(t) => t.close(),
            MediaTransport::TcpInterleaved(_) => {
                // The interleaved transport shares the control connection;
                // closing it is the connection's job, not this handle's.
            }
        }
    }

    pub fn local_addrs(&self) -> Option<(std::net::SocketAddr, std::net::SocketAddr)> {
        match self {
            MediaTransport::Udp(t) => Some(t.local_addrs()),
            MediaTransport::TcpInterleaved(_) => None,
        }
    }
}

/// Configuration shared by every transport kind.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub read_timeout: std::time::Duration,
    pub write_timeout: std::time::Duration,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub multicast_ttl: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            read_timeout: std::time::Duration::from_secs(10),
            write_timeout: std::time::Duration::from_secs(10),
            read_buffer_size: 2 * 1024 * 1024,
            write_buffer_size: 2 * 1024 * 1024,
            multicast_ttl: 16,
        }
    }
}

pub(crate) fn timeout_err(conn_ctx: &ConnectionContext, what: &str) -> Error {
    crate::wrap!(crate::ErrorInt::TimeoutError {
        description: format!("{} at {:?}", what, conn_ctx),
    })
}
