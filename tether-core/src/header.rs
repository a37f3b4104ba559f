//! Header carried by every reliable-UDP datagram.
//!
//! ```text
//!  0               4               8               12
//! +---------------+---------------+---------------+-------------
//! |  id (i32)     |  ack (i32)    | ack bits (u32)|  payload ...
//! +---------------+---------------+---------------+-------------
//! ```
//!
//! `ack` is the highest id the sender has seen from its peer (-1 before any
//! datagram arrived). Bit `i` of `ack_bits` acknowledges id `ack - i - 1`.
//!
//! Integers are written in host-native byte order, so both peers must share
//! endianness. Keepalive datagrams carry the header and no payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Result, TetherError};

/// Serialized header length in bytes.
pub const HEADER_LEN: usize = 3 * std::mem::size_of::<u32>();

/// Number of ids preceding `ack` that the bitmap can acknowledge.
pub const ACK_WINDOW: i32 = 32;

/// `ack` value meaning "nothing received yet".
pub const NO_ACK: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub id: i32,
    pub ack: i32,
    pub ack_bits: u32,
}

impl DatagramHeader {
    pub fn new(id: i32, ack: i32, ack_bits: u32) -> Self {
        Self { id, ack, ack_bits }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32_ne(self.id);
        buf.put_i32_ne(self.ack);
        buf.put_u32_ne(self.ack_bits);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        self.ser(&mut buf);
        out
    }

    /// Split a received datagram into its header and payload.
    pub fn deser(datagram: &[u8]) -> Result<(Self, &[u8])> {
        if datagram.len() < HEADER_LEN {
            return Err(TetherError::MalformedDatagram {
                len: datagram.len(),
            });
        }

        let mut buf = &datagram[..HEADER_LEN];
        let header = DatagramHeader {
            id: buf.get_i32_ne(),
            ack: buf.get_i32_ne(),
            ack_bits: buf.get_u32_ne(),
        };
        Ok((header, &datagram[HEADER_LEN..]))
    }

    /// Header followed by `payload`, ready for `send_to`.
    pub fn frame(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.ser(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Every id this header confirms as delivered: `ack` itself plus one id
    /// per set bitmap bit. Negative ids are never yielded.
    pub fn acknowledged_ids(&self) -> impl Iterator<Item = i32> + '_ {
        let direct = (self.ack >= 0).then_some(self.ack);
        let bits = (0..ACK_WINDOW).filter_map(move |bit| {
            if self.ack_bits & (1u32 << bit) == 0 {
                return None;
            }
            let id = i64::from(self.ack) - i64::from(bit) - 1;
            (id >= 0).then_some(id as i32)
        });
        direct.into_iter().chain(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_native_order() {
        let header = DatagramHeader::new(7, 3, 0b101);
        let bytes = header.to_bytes();

        assert_eq!(&bytes[0..4], &7i32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &3i32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &0b101u32.to_ne_bytes());
    }

    #[test]
    fn test_deser_splits_payload() {
        let header = DatagramHeader::new(42, NO_ACK, 0);
        let datagram = header.frame(b"hello");

        let (parsed, payload) = DatagramHeader::deser(&datagram).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_keepalive_has_empty_payload() {
        let datagram = DatagramHeader::new(1, 0, 0).frame(&[]);
        assert_eq!(datagram.len(), HEADER_LEN);

        let (_, payload) = DatagramHeader::deser(&datagram).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_short_datagram_rejected() {
        let result = DatagramHeader::deser(&[1, 2, 3, 4, 5]);
        assert!(matches!(result, Err(TetherError::MalformedDatagram { len: 5 })));
    }

    #[test]
    fn test_acknowledged_ids() {
        let header = DatagramHeader::new(0, 3, 0b101);
        let ids: Vec<i32> = header.acknowledged_ids().collect();
        assert_eq!(ids, vec![3, 2, 0]);
    }

    #[test]
    fn test_acknowledged_ids_ignore_negative() {
        // bits reaching below id 0 are meaningless
        let header = DatagramHeader::new(0, 1, u32::MAX);
        let ids: Vec<i32> = header.acknowledged_ids().collect();
        assert_eq!(ids, vec![1, 0]);

        let nothing = DatagramHeader::new(0, NO_ACK, u32::MAX);
        assert_eq!(nothing.acknowledged_ids().count(), 0);
    }
}
