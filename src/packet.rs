//! Packet framing and payload parsing for the client-server protocol.
//!
//! Every message travels in frames of a 3-byte little-endian payload length
//! plus a 1-byte sequence id. Payloads of 2^24-1 bytes or more span several
//! frames with contiguous sequence ids; the reader reassembles them and
//! treats any sequence gap as a fatal desynchronization.

use crate::constants::MAX_PAYLOAD_LEN;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Writer used to compose and send packets.
pub(crate) struct PacketWriter<W> {
    write: W,
    payload: BytesMut,
    frame: BytesMut,
    /// Sequence id of the next frame to send
    pub(crate) seq: u8,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub(crate) fn new(write: W) -> Self {
        Self {
            write,
            payload: BytesMut::with_capacity(1024),
            frame: BytesMut::with_capacity(1024),
            seq: 0,
        }
    }

    /// Begin a new command; sequence ids restart at zero.
    pub(crate) fn reset_seq(&mut self) {
        self.seq = 0;
    }

    /// Start composing a packet, discarding any unsent payload.
    pub(crate) fn begin(&mut self) -> &mut Self {
        self.payload.clear();
        self
    }

    pub(crate) fn put_u8(&mut self, v: u8) -> &mut Self {
        self.payload.put_u8(v);
        self
    }

    pub(crate) fn put_u32(&mut self, v: u32) -> &mut Self {
        self.payload.put_u32_le(v);
        self
    }

    pub(crate) fn put_bytes(&mut self, s: &[u8]) -> &mut Self {
        self.payload.put(s);
        self
    }

    /// Write a null terminated string.
    pub(crate) fn put_str_null(&mut self, s: &str) -> &mut Self {
        self.payload.put(s.as_bytes());
        self.payload.put_u8(0);
        self
    }

    /// Write a length-encoded integer.
    pub(crate) fn put_lenenc(&mut self, v: u64) -> &mut Self {
        match v {
            0..=250 => self.payload.put_u8(v as u8),
            251..=0xFFFF => {
                self.payload.put_u8(0xFC);
                self.payload.put_u16_le(v as u16);
            }
            0x1_0000..=0xFF_FFFF => {
                self.payload.put_u8(0xFD);
                self.payload.put_uint_le(v, 3);
            }
            _ => {
                self.payload.put_u8(0xFE);
                self.payload.put_u64_le(v);
            }
        }
        self
    }

    /// Direct access to the payload buffer.
    pub(crate) fn payload_mut(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    /// Frame the composed payload and write it out.
    ///
    /// Payloads of [`MAX_PAYLOAD_LEN`] bytes or more are split across
    /// consecutive frames; a payload that is an exact multiple of the frame
    /// size is terminated by an empty frame so the peer can detect the end.
    pub(crate) async fn send(&mut self) -> Result<()> {
        self.frame.clear();
        let mut offset = 0;
        loop {
            let chunk = (self.payload.len() - offset).min(MAX_PAYLOAD_LEN);
            self.frame.put_uint_le(chunk as u64, 3);
            self.frame.put_u8(self.seq);
            self.seq = self.seq.wrapping_add(1);
            self.frame.put(&self.payload[offset..offset + chunk]);
            offset += chunk;
            if chunk < MAX_PAYLOAD_LEN {
                break;
            }
        }
        self.payload.clear();
        self.write.write_all_buf(&mut self.frame).await?;
        self.write.flush().await?;
        Ok(())
    }
}

/// Reader used to receive and reassemble packets.
pub(crate) struct PacketReader<R> {
    read: R,
    buff: BytesMut,
    /// Sequence id expected on the next frame
    pub(crate) seq: u8,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub(crate) fn new(read: R) -> Self {
        Self {
            read,
            buff: BytesMut::with_capacity(4096),
            seq: 0,
        }
    }

    /// Give back the underlying stream and any bytes read past the last
    /// packet boundary.
    pub(crate) fn into_parts(self) -> (R, BytesMut) {
        (self.read, self.buff)
    }

    async fn fill_to(&mut self, len: usize) -> Result<()> {
        while self.buff.len() < len {
            let n = self.read.read_buf(&mut self.buff).await?;
            if n == 0 {
                return Err(Error::ConnectionLost(
                    "server closed the connection".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Read one complete payload, reassembling split packets.
    pub(crate) async fn read_packet(&mut self) -> Result<Bytes> {
        let mut payload = BytesMut::new();
        loop {
            self.fill_to(4).await?;
            let header = u32::from_le_bytes([self.buff[0], self.buff[1], self.buff[2], 0]);
            let len = header as usize;
            let frame_seq = self.buff[3];
            if frame_seq != self.seq {
                return Err(Error::ProtocolDesync {
                    expected: self.seq,
                    actual: frame_seq,
                });
            }
            self.seq = self.seq.wrapping_add(1);
            self.fill_to(4 + len).await?;
            self.buff.advance(4);
            payload.put(self.buff.split_to(len));
            if len < MAX_PAYLOAD_LEN {
                break;
            }
        }
        Ok(payload.freeze())
    }
}

/// Cursor over one packet payload.
pub(crate) struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub(crate) fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Protocol(format!(
                "truncated packet: wanted {n} bytes, {} left",
                self.remaining()
            )));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        self.get_bytes(n).map(|_| ())
    }

    pub(crate) fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    pub(crate) fn get_u16(&mut self) -> Result<u16> {
        let b = self.get_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn get_u24(&mut self) -> Result<u32> {
        let b = self.get_bytes(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    pub(crate) fn get_u32(&mut self) -> Result<u32> {
        let b = self.get_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn get_u64(&mut self) -> Result<u64> {
        let b = self.get_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read a length-encoded integer; the NULL marker is a protocol error here.
    pub(crate) fn get_lenenc(&mut self) -> Result<u64> {
        match self.get_lenenc_opt()? {
            Some(v) => Ok(v),
            None => Err(Error::Protocol(
                "unexpected NULL length-encoded integer".to_string(),
            )),
        }
    }

    /// Read a length-encoded integer, `None` for the 0xFB NULL marker.
    pub(crate) fn get_lenenc_opt(&mut self) -> Result<Option<u64>> {
        let first = self.get_u8()?;
        match first {
            0..=250 => Ok(Some(u64::from(first))),
            0xFB => Ok(None),
            0xFC => Ok(Some(u64::from(self.get_u16()?))),
            0xFD => Ok(Some(u64::from(self.get_u24()?))),
            0xFE => Ok(Some(self.get_u64()?)),
            v => Err(Error::Protocol(format!(
                "invalid length-encoded integer prefix {v:#04x}"
            ))),
        }
    }

    pub(crate) fn get_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_lenenc()? as usize;
        self.get_bytes(len)
    }

    pub(crate) fn get_lenenc_str(&mut self) -> Result<&'a str> {
        let b = self.get_lenenc_bytes()?;
        std::str::from_utf8(b).map_err(|e| Error::Protocol(format!("invalid UTF-8: {e}")))
    }

    pub(crate) fn skip_lenenc_str(&mut self) -> Result<()> {
        self.get_lenenc_bytes().map(|_| ())
    }

    pub(crate) fn get_null_str(&mut self) -> Result<&'a str> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            return Err(Error::Protocol("unterminated string".to_string()));
        }
        let s = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|e| Error::Protocol(format!("invalid UTF-8: {e}")))?;
        self.pos += 1;
        Ok(s)
    }

    /// Remaining payload as bytes.
    pub(crate) fn get_eof_bytes(&mut self) -> &'a [u8] {
        let s = &self.data[self.pos..];
        self.pos = self.data.len();
        s
    }

    /// Remaining payload as a string.
    pub(crate) fn get_eof_str(&mut self) -> Result<&'a str> {
        let b = self.get_eof_bytes();
        std::str::from_utf8(b).map_err(|e| Error::Protocol(format!("invalid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(payload: &[u8]) -> Vec<u8> {
        let (client, server) = tokio::io::duplex(64 * 1024 * 1024);
        let mut w = PacketWriter::new(client);
        w.begin().put_bytes(payload);
        w.send().await.unwrap();
        drop(w);
        let mut r = PacketReader::new(server);
        r.read_packet().await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn small_packet_roundtrip() {
        assert_eq!(roundtrip(b"hello").await, b"hello");
        assert_eq!(roundtrip(b"").await, b"");
    }

    #[tokio::test]
    async fn split_packet_roundtrip() {
        let payload = vec![0xAB; MAX_PAYLOAD_LEN + 17];
        assert_eq!(roundtrip(&payload).await, payload);
    }

    #[tokio::test]
    async fn exact_multiple_gets_empty_terminator() {
        let payload = vec![7u8; MAX_PAYLOAD_LEN];
        let (client, server) = tokio::io::duplex(64 * 1024 * 1024);
        let mut w = PacketWriter::new(client);
        w.begin().put_bytes(&payload);
        w.send().await.unwrap();
        // two frames on the wire: a full one and an empty terminator
        assert_eq!(w.seq, 2);
        drop(w);
        let mut r = PacketReader::new(server);
        let got = r.read_packet().await.unwrap();
        assert_eq!(got.len(), MAX_PAYLOAD_LEN);
        assert_eq!(r.seq, 2);
    }

    #[tokio::test]
    async fn sequence_gap_is_desync() {
        let (client, server) = tokio::io::duplex(1024);
        let mut half: tokio::io::DuplexStream = client;
        // length 1, sequence 5, payload 0x00
        half.write_all(&[1, 0, 0, 5, 0]).await.unwrap();
        let mut r = PacketReader::new(server);
        match r.read_packet().await {
            Err(Error::ProtocolDesync {
                expected: 0,
                actual: 5,
            }) => {}
            other => panic!("expected desync, got {other:?}"),
        }
    }

    #[test]
    fn lenenc_integers() {
        let mut buf = BytesMut::new();
        {
            // reuse the writer's encoding through a throwaway instance
            let mut w = PacketWriter::new(tokio::io::sink());
            w.begin()
                .put_lenenc(250)
                .put_lenenc(251)
                .put_lenenc(0xFFFF)
                .put_lenenc(0x10000)
                .put_lenenc(0x1_0000_0000);
            buf.extend_from_slice(w.payload_mut());
        }
        let mut p = Parser::new(&buf);
        assert_eq!(p.get_lenenc().unwrap(), 250);
        assert_eq!(p.get_lenenc().unwrap(), 251);
        assert_eq!(p.get_lenenc().unwrap(), 0xFFFF);
        assert_eq!(p.get_lenenc().unwrap(), 0x10000);
        assert_eq!(p.get_lenenc().unwrap(), 0x1_0000_0000);
        assert_eq!(p.remaining(), 0);
    }

    #[test]
    fn lenenc_null_marker() {
        let mut p = Parser::new(&[0xFB]);
        assert_eq!(p.get_lenenc_opt().unwrap(), None);
    }

    #[test]
    fn truncated_read_is_protocol_error() {
        let mut p = Parser::new(&[1, 2]);
        assert!(matches!(p.get_u32(), Err(Error::Protocol(_))));
    }
}
