use bytes::Buf;
#[cfg(test)]
use bytes::BufMut;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Source id truncated: want {want} bytes, have {have}")]
    TruncatedSource { want: usize, have: usize },
    #[error("Source id is not valid UTF-8")]
    InvalidSource,
}

/// One probe datagram as written by the paired sender.
///
/// Layout (big-endian):
/// - magic: u32 (4 bytes)
/// - seq: u64 (8 bytes)
/// - send_ts: u64, nanoseconds since the UNIX epoch (8 bytes)
/// - src_len: u8 (1 byte)
/// - src: `src_len` bytes of UTF-8
///
/// Anything after the source id is padding and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    pub source: &'a str,
    pub seq: u64,
    pub send_ts: SystemTime,
}

impl<'a> Message<'a> {
    pub const MAGIC: u32 = 0x5544_504c; // "UDPL"
    pub const HEADER_SIZE: usize = 21;

    /// Decodes a datagram, borrowing the source id from `packet`.
    pub fn decode(packet: &'a [u8]) -> Result<Self, ProtocolError> {
        if packet.len() < Self::HEADER_SIZE {
            return Err(ProtocolError::PacketTooShort(packet.len()));
        }

        let mut buf = packet;
        let magic = buf.get_u32();
        if magic != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }
        let seq = buf.get_u64();
        let send_ts_ns = buf.get_u64();
        let src_len = buf.get_u8() as usize;

        if buf.remaining() < src_len {
            return Err(ProtocolError::TruncatedSource {
                want: src_len,
                have: buf.remaining(),
            });
        }
        let source =
            std::str::from_utf8(&buf[..src_len]).map_err(|_| ProtocolError::InvalidSource)?;

        Ok(Self {
            source,
            seq,
            send_ts: UNIX_EPOCH + Duration::from_nanos(send_ts_ns),
        })
    }

    /// Writes the datagram the way the sender does. Source ids longer than
    /// 255 bytes are cut at the limit.
    #[cfg(test)]
    pub fn encode(&self, buf: &mut impl BufMut) {
        let src = self.source.as_bytes();
        let src = &src[..src.len().min(u8::MAX as usize)];
        let send_ts_ns = self
            .send_ts
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        buf.put_u32(Self::MAGIC);
        buf.put_u64(self.seq);
        buf.put_u64(send_ts_ns);
        buf.put_u8(src.len() as u8);
        buf.put_slice(src);
    }

    #[cfg(test)]
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.source.len().min(u8::MAX as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn packet(source: &str, seq: u64) -> BytesMut {
        let msg = Message {
            source,
            seq,
            send_ts: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        };
        let mut buf = BytesMut::with_capacity(msg.encoded_len());
        msg.encode(&mut buf);
        buf
    }

    #[test]
    fn test_decode_sender_packet() {
        let buf = packet("sender-a", 42);
        assert_eq!(buf.len(), Message::HEADER_SIZE + "sender-a".len());

        let msg = Message::decode(&buf).expect("decode");
        assert_eq!(msg.source, "sender-a");
        assert_eq!(msg.seq, 42);
        assert_eq!(
            msg.send_ts,
            UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let mut buf = packet("a", 7);
        buf.put_slice(&[0u8; 64]);
        let msg = Message::decode(&buf).unwrap();
        assert_eq!(msg.source, "a");
        assert_eq!(msg.seq, 7);
    }

    #[test]
    fn test_truncated_buffers_fail() {
        let buf = packet("sender-a", 1);
        for len in 0..buf.len() {
            let res = Message::decode(&buf[..len]);
            assert!(res.is_err(), "len {} decoded", len);
        }
        assert_eq!(
            Message::decode(&buf[..3]),
            Err(ProtocolError::PacketTooShort(3))
        );
        assert_eq!(
            Message::decode(&buf[..Message::HEADER_SIZE + 2]),
            Err(ProtocolError::TruncatedSource { want: 8, have: 2 })
        );
    }

    #[test]
    fn test_bad_magic_and_source() {
        let mut buf = packet("ok", 1);
        buf[0] ^= 0xff;
        assert!(matches!(
            Message::decode(&buf),
            Err(ProtocolError::InvalidMagic(_))
        ));

        let mut buf = packet("ok", 1);
        let last = buf.len() - 1;
        buf[last] = 0xff;
        assert_eq!(Message::decode(&buf), Err(ProtocolError::InvalidSource));
    }
}
