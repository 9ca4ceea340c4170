// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! UDP unicast and UDP multicast transports.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::Bytes;
use tokio::net::UdpSocket;

use super::Channel;
use crate::Error;

/// Two UDP sockets (RTP, RTCP) on adjacent local ports, either unicast
/// (optionally NAT-latched to the first observed remote peer) or multicast
/// (joined to a group with a configured TTL).
pub struct UdpTransport {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    /// The peer this transport exchanges packets with. For a freshly-created
    /// unicast receiver this starts `None` and is latched onto the first
    /// packet's source address, permitting NAT symmetric-traversal by
    /// latching onto the first remote address observed.
    peer: Option<SocketAddr>,
    multicast: bool,
}

impl UdpTransport {
    /// Binds an adjacent RTP/RTCP port pair on `local_ip`, starting from
    /// `first_port` if given, else ephemeral. Used by both client SETUP
    /// (`client_port_hint`) and server SETUP (port-range allocation).
    pub async fn bind_pair(
        local_ip: IpAddr,
        first_port: Option<u16>,
        reuse: bool,
    ) -> Result<Self, Error> {
        let (rtp, rtcp) = match first_port {
            Some(p) => {
                let rtp = bind_socket(SocketAddr::new(local_ip, p), reuse).await?;
                let rtcp = bind_socket(SocketAddr::new(local_ip, p + 1), reuse).await?;
                (rtp, rtcp)
            }
            None => {
                // Probe for an ephemeral even port so RTP/RTCP land on an
                // adjacent pair, per the invariant.
                loop {
                    let probe = bind_socket(SocketAddr::new(local_ip, 0), reuse).await?;
                    let port = probe.local_addr().map_err(bind_err)?.port();
                    if port % 2 != 0 {
                        continue;
                    }
                    match bind_socket(SocketAddr::new(local_ip, port + 1), reuse).await {
                        Ok(rtcp) => break (probe, rtcp),
                        Err(_) => continue,
                    }
                }
            }
        };
        Ok(Self {
            rtp,
            rtcp,
            peer: None,
            multicast: false,
        })
    }

    /// Joins an RTP/RTCP port pair to an IPv4 multicast `group`, per spec
    /// §4.3 ("two sockets on adjacent ports joined to a multicast group;
    /// TTL configurable; SO_REUSEADDR/SO_REUSEPORT so multiple readers on
    /// the same host can receive").
    pub async fn join_multicast(
        group: Ipv4Addr,
        port: u16,
        ttl: u32,
    ) -> Result<Self, Error> {
        let rtp = bind_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port), true)
            .await?;
        let rtcp = bind_socket(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port + 1),
            true,
        )
        .await?;
        rtp.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .map_err(bind_err)?;
        rtcp.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
            .map_err(bind_err)?;
        rtp.set_multicast_ttl_v4(ttl).map_err(bind_err)?;
        Ok(Self {
            rtp,
            rtcp,
            peer: Some(SocketAddr::new(IpAddr::V4(group), port)),
            multicast: true,
        })
    }

    /// Fixes the remote peer for a unicast transport without waiting for the
    /// first observed packet, e.g. once a server's SETUP response names
    /// `server_port=`.
    pub fn connect_to(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    pub fn local_addrs(&self) -> (SocketAddr, SocketAddr) {
        (
            self.rtp.local_addr().unwrap(),
            self.rtcp.local_addr().unwrap(),
        )
    }

    pub fn local_ports(&self) -> (u16, u16) {
        let (rtp, rtcp) = self.local_addrs();
        (rtp.port(), rtcp.port())
    }

    pub async fn read_packet(&mut self) -> Result<(Channel, Bytes), Error> {
        let mut buf = [0u8; 65536];
        tokio::select! {
            res = self.rtp.recv_from(&mut buf) => {
                let (n, from) = res.map_err(bind_err)?;
                self.accept_from(from)?;
                Ok((Channel::Rtp, Bytes::copy_from_slice(&buf[..n])))
            }
            res = self.rtcp.recv_from(&mut buf) => {
                let (n, from) = res.map_err(bind_err)?;
                self.accept_from(from)?;
                Ok((Channel::Rtcp, Bytes::copy_from_slice(&buf[..n])))
            }
        }
    }

    /// Filters on source address once a peer is known; the
    /// very first packet latches the peer if none was set explicitly
    /// (NAT traversal), matching multicast's "any member may send" model.
    fn accept_from(&mut self, from: SocketAddr) -> Result<(), Error> {
        match self.peer {
            None if !self.multicast => {
                self.peer = Some(from);
                Ok(())
            }
            Some(peer) if peer.ip() == from.ip() => Ok(()),
            Some(_) if self.multicast => Ok(()),
            Some(peer) => Err(crate::wrap!(crate::ErrorInt::TransportError {
                conn_ctx: None,
                description: format!("dropping datagram from unexpected peer {} (expected {})", from, peer),
            })),
            None => Ok(()),
        }
    }

    pub async fn write_packet(&mut self, channel: Channel, data: &[u8]) -> Result<(), Error> {
        let peer = self.peer.ok_or_else(|| {
            crate::wrap!(crate::ErrorInt::TransportError {
                conn_ctx: None,
                description: "no peer address known for UDP write".to_string(),
            })
        })?;
        let sock = match channel {
            Channel::Rtp => &self.rtp,
            Channel::Rtcp => &self.rtcp,
        };
        sock.send_to(data, peer).await.map_err(bind_err)?;
        Ok(())
    }

    pub fn close(&mut self) {
        // Dropping the sockets on transport teardown is sufficient; tokio's
        // UdpSocket has no explicit close beyond Drop.
    }
}

async fn bind_socket(addr: SocketAddr, reuse: bool) -> Result<UdpSocket, Error> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
        .map_err(bind_err)?;
    if reuse {
        sock.set_reuse_address(true).map_err(bind_err)?;
        #[cfg(unix)]
        sock.set_reuse_port(true).map_err(bind_err)?;
    }
    sock.set_nonblocking(true).map_err(bind_err)?;
    sock.bind(&addr.into()).map_err(bind_err)?;
    let std_sock: std::net::UdpSocket = sock.into();
    UdpSocket::from_std(std_sock).map_err(bind_err)
}

fn bind_err(e: std::io::Error) -> Error {
    crate::wrap!(crate::ErrorInt::TransportError {
        conn_ctx: None,
        description: e.to_string(),
    })
}

/// Picks the first free even port in `range` for a server's ephemeral UDP
/// allocation (`udp_rtp_port_range`), binding a probe pair to confirm
/// adjacency is actually available before returning it.
pub async fn bind_in_range(
    local_ip: IpAddr,
    range: Option<(u16, u16)>,
) -> Result<UdpTransport, Error> {
    match range {
        None => UdpTransport::bind_pair(local_ip, None, false).await,
        Some((lo, hi)) => {
            let mut port = lo;
            loop {
                if port >= hi {
                    return Err(crate::wrap!(crate::ErrorInt::TransportError {
                        conn_ctx: None,
                        description: format!("no free adjacent port pair in {}-{}", lo, hi),
                    }));
                }
                if port % 2 != 0 {
                    port += 1;
                    continue;
                }
                match UdpTransport::bind_pair(local_ip, Some(port), false).await {
                    Ok(t) => return Ok(t),
                    Err(_) => port += 2,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_pair_allocates_adjacent_ports() {
        let t = UdpTransport::bind_pair(IpAddr::V4(Ipv4Addr::LOCALHOST), None, false)
            .await
            .unwrap();
        let (rtp, rtcp) = t.local_ports();
        assert_eq!(rtcp, rtp + 1);
        assert_eq!(rtp % 2, 0);
    }

    #[tokio::test]
    async fn unicast_round_trip() {
        let mut a = UdpTransport::bind_pair(IpAddr::V4(Ipv4Addr::LOCALHOST), None, false)
            .await
            .unwrap();
        let mut b = UdpTransport::bind_pair(IpAddr::V4(Ipv4Addr::LOCALHOST), None, false)
            .await
            .unwrap();
        let (a_rtp, a_rtcp) = a.local_addrs();
        let (b_rtp, _b_rtcp) = b.local_addrs();
        a.connect_to(b_rtp);
        b.connect_to(a_rtp);
        let _ = a_rtcp;

        a.write_packet(Channel::Rtp, b"hello").await.unwrap();
        let (chan, data) = b.read_packet().await.unwrap();
        assert_eq!(chan, Channel::Rtp);
        assert_eq!(&data[..], b"hello");
    }
}
