// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The wire codec: turns a byte stream into typed
//! [rtsp_types::Message]s, multiplexing RTSP requests/responses with
//! TCP-interleaved RTP/RTCP data per [RFC 2326 §10.12]/[RFC 7826 §14].
//!
//! Message grammar itself (start line, header-value splitting, body
//! extraction) is handled by the `rtsp-types` crate; this module supplies
//! the framing discipline on top: one-byte lookahead to distinguish an
//! interleaved frame from a textual message, and the size limits that
//! grammar-correct-but-hostile input must still be rejected by.
//!
//! [RFC 2326 §10.12]: https://datatracker.ietf.org/doc/html/rfc2326#section-10.12
//! [RFC 7826 §14]: https://datatracker.ietf.org/doc/html/rfc7826#section-14

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{ConnectionContext, Error, ErrorInt, RtspMessageContext};

/// Size limits enforced while decoding.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_method_len: usize,
    pub max_url_len: usize,
    pub max_header_line_len: usize,
    pub max_header_block_len: usize,
    pub max_body_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_method_len: 128,
            max_url_len: 1024,
            max_header_line_len: 2048,
            max_header_block_len: 20 * 1024,
            max_body_len: 4 * 1024 * 1024,
        }
    }
}

const INTERLEAVED_MAGIC: u8 = 0x24; // '$'

/// One decoded unit from the control stream: either a full RTSP message
/// (request or response) or an interleaved binary frame.
#[derive(Debug)]
pub enum CodecItem {
    Message(rtsp_types::Message<Bytes>),
    Data { channel_id: u8, payload: Bytes },
}

/// A [Decoder]/[Encoder] over a TCP control connection, producing
/// [CodecItem]s. One instance is owned per connection (client or server
/// side); `ctx` and `limits` are fixed at construction.
pub struct Codec {
    conn_ctx: ConnectionContext,
    limits: Limits,
    next_msg_pos: u64,
}

impl Codec {
    pub fn new(conn_ctx: ConnectionContext, limits: Limits) -> Self {
        Self {
            conn_ctx,
            limits,
            next_msg_pos: 0,
        }
    }

    fn malformed(&self, msg_ctx: RtspMessageContext, description: String) -> Error {
        crate::wrap!(ErrorInt::RtspFramingError {
            conn_ctx: self.conn_ctx,
            msg_ctx,
            description,
        })
    }

    fn too_large(&self, description: String) -> Error {
        crate::wrap!(ErrorInt::RtspTooLargeError {
            conn_ctx: self.conn_ctx,
            description,
        })
    }

    fn msg_ctx(&self) -> RtspMessageContext {
        RtspMessageContext {
            pos: self.next_msg_pos,
            received_wall: Some(std::time::SystemTime::now()),
        }
    }
}

impl Decoder for Codec {
    type Item = CodecItem;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] == INTERLEAVED_MAGIC {
            if src.len() < 4 {
                return Ok(None);
            }
            let channel_id = src[1];
            let length = u16::from_be_bytes([src[2], src[3]]) as usize;
            if length > 65536 - 4 {
                return Err(self.too_large(format!(
                    "interleaved frame length {} exceeds maximum",
                    length
                )));
            }
            if src.len() < 4 + length {
                src.reserve(4 + length - src.len());
                return Ok(None);
            }
            src.advance(4);
            let payload = src.split_to(length).freeze();
            self.next_msg_pos += (4 + length) as u64;
            return Ok(Some(CodecItem::Data {
                channel_id,
                payload,
            }));
        }

        // Textual RTSP message: find the method/status line to enforce the
        // method/URL length limit before we even try a full parse, so a
        // client can't force unbounded buffering with a line that never
        // terminates.
        let first_line_end = match find_crlf(src) {
            Some(i) => i,
            None => {
                if src.len() > self.limits.max_method_len + self.limits.max_url_len + 32 {
                    return Err(self.too_large("start line too long".into()));
                }
                return Ok(None);
            }
        };
        if first_line_end > self.limits.max_method_len + self.limits.max_url_len + 32 {
            return Err(self.too_large("start line too long".into()));
        }

        // Find the blank line ending the header block.
        let header_block_end = match find_double_crlf(src) {
            Some(i) => i,
            None => {
                if src.len() > self.limits.max_header_block_len {
                    return Err(self.too_large("header block too long".into()));
                }
                return Ok(None);
            }
        };
        if header_block_end > self.limits.max_header_block_len {
            return Err(self.too_large("header block too long".into()));
        }
        for line in src[..header_block_end].split(|&b| b == b'\n') {
            if line.len() > self.limits.max_header_line_len {
                return Err(self.too_large("header line too long".into()));
            }
        }

        let content_length = parse_content_length(&src[..header_block_end]).map_err(|d| {
            self.malformed(self.msg_ctx(), d)
        })?;
        if content_length > self.limits.max_body_len {
            return Err(self.too_large(format!(
                "body of {} bytes exceeds configured maximum",
                content_length
            )));
        }
        let total_len = header_block_end + 4 + content_length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let raw = src.split_to(total_len).freeze();
        let msg_ctx = self.msg_ctx();
        self.next_msg_pos += total_len as u64;

        let (message, _rest): (rtsp_types::Message<Bytes>, &[u8]) =
            rtsp_types::Message::parse(&raw).map_err(|e| {
                self.malformed(msg_ctx, format!("rtsp-types parse error: {:?}", e))
            })?;
        Ok(Some(CodecItem::Message(message)))
    }
}

impl Encoder<CodecItem> for Codec {
    type Error = Error;

    fn encode(&mut self, item: CodecItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            CodecItem::Message(msg) => {
                msg.write(&mut dst.writer()).map_err(|e| {
                    crate::wrap!(ErrorInt::RtspFramingError {
                        conn_ctx: self.conn_ctx,
                        msg_ctx: self.msg_ctx(),
                        description: format!("failed to serialize message: {:?}", e),
                    })
                })?;
            }
            CodecItem::Data {
                channel_id,
                payload,
            } => {
                if payload.len() > u16::MAX as usize {
                    return Err(self.too_large("interleaved frame too large to encode".into()));
                }
                dst.extend_from_slice(&[
                    INTERLEAVED_MAGIC,
                    channel_id,
                    (payload.len() >> 8) as u8,
                    payload.len() as u8,
                ]);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

/// A handle onto a connection's single outbound queue, serialized by one
/// control-write task. Both RTSP messages and TCP-interleaved data frames
/// are pushed through the same queue so they never interleave mid-frame on
/// the wire.
#[derive(Clone)]
pub struct ConnectionWriter {
    tx: tokio::sync::mpsc::UnboundedSender<CodecItem>,
}

impl ConnectionWriter {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<CodecItem>) -> Self {
        Self { tx }
    }

    pub fn send(&self, item: CodecItem) -> Result<(), Error> {
        self.tx.send(item).map_err(|_| {
            crate::wrap!(ErrorInt::TransportError {
                conn_ctx: None,
                description: "connection write queue closed".to_string(),
            })
        })
    }
}

/// Drives a connection's outbound queue: pulls [CodecItem]s and writes them
/// through `codec`/`sink` until the queue closes or a write fails. Run as
/// the dedicated control-write task.
pub async fn run_writer<W>(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<CodecItem>,
    mut sink: futures::stream::SplitSink<tokio_util::codec::Framed<W, Codec>, CodecItem>,
) where
    W: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    use futures::SinkExt;
    while let Some(item) = rx.recv().await {
        if sink.send(item).await.is_err() {
            break;
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n").map(|i| i + 2)
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_content_length(header_block: &[u8]) -> Result<usize, String> {
    let text = std::str::from_utf8(header_block)
        .map_err(|_| "header block is not valid UTF-8".to_string())?;
    for line in text.split("\r\n") {
        if let Some(v) = line
            .strip_prefix("Content-Length:")
            .or_else(|| line.strip_prefix("content-length:"))
        {
            return v
                .trim()
                .parse()
                .map_err(|_| format!("bad Content-Length value {:?}", v));
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::new(ConnectionContext::dummy(), Limits::default())
    }

    #[test]
    fn decodes_interleaved_frame() {
        let mut c = codec();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x24, 0x00, 0x00, 0x03, b'a', b'b', b'c']);
        let item = c.decode(&mut buf).unwrap().unwrap();
        match item {
            CodecItem::Data {
                channel_id,
                payload,
            } => {
                assert_eq!(channel_id, 0);
                assert_eq!(&payload[..], b"abc");
            }
            _ => panic!("expected data frame"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn interleaved_frame_waits_for_more_data() {
        let mut c = codec();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x24, 0x00, 0x00, 0x05, b'a', b'b']);
        assert!(c.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decodes_request_with_no_body() {
        let mut c = codec();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"OPTIONS rtsp://example.com/s RTSP/1.0\r\nCSeq: 1\r\n\r\n");
        let item = c.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(item, CodecItem::Message(rtsp_types::Message::Request(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_response_with_body() {
        let mut c = codec();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(
            b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 5\r\nContent-Type: application/sdp\r\n\r\nhello",
        );
        let item = c.decode(&mut buf).unwrap().unwrap();
        match item {
            CodecItem::Message(rtsp_types::Message::Response(r)) => {
                assert_eq!(r.body().as_ref(), b"hello");
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn rejects_start_line_exceeding_limit() {
        let mut c = codec();
        let mut buf = BytesMut::new();
        let huge_url = "x".repeat(4000);
        buf.extend_from_slice(format!("OPTIONS rtsp://h/{} RTSP/1.0\r\n\r\n", huge_url).as_bytes());
        assert!(c.decode(&mut buf).is_err());
    }

    #[test]
    fn waits_for_full_body() {
        let mut c = codec();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"RTSP/1.0 200 OK\r\nContent-Length: 10\r\n\r\nhel");
        assert!(c.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_declared_body() {
        let mut c = Codec::new(
            ConnectionContext::dummy(),
            Limits {
                max_body_len: 4,
                ..Limits::default()
            },
        );
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"RTSP/1.0 200 OK\r\nContent-Length: 1000\r\n\r\n");
        assert!(c.decode(&mut buf).is_err());
    }
}
