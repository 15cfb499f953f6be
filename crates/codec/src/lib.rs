//! ## Relay frame codec
//!
//! Every datagram on the relay port carries a fixed 6-byte preamble in
//! front of an opaque payload:
//!
//! ```text
//! offset 0: uint16 big-endian prefix = 0x00AA
//! offset 2: uint32 big-endian peer id
//! offset 6: payload (0..MTU-6 bytes)
//! ```
//!
//! A frame with an empty payload is a registration (or keep-alive), and a
//! frame with a non-empty payload is data. The prefix doubles as a cheap
//! sentinel: datagrams that do not start with `0x00AA` are not frames at
//! all and can be treated as opaque traffic on the same socket.

use bytes::{BufMut, BytesMut};

/// The tag every frame starts with.
pub const PREFIX: u16 = 0x00AA;

/// Prefix plus peer id.
pub const PREAMBLE_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidLength,
    InvalidPrefix,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single frame, borrowing its payload from the receive buffer.
///
/// The peer id field is read in two different directions: in a frame
/// travelling toward the relay it names the receiver, while in a frame
/// coming back from the relay it names the sender. Registrations are the
/// exception on both paths and always carry the sender's own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub peer_id: u32,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// An empty-payload frame announcing `peer_id` to the relay.
    pub fn registration(peer_id: u32) -> Self {
        Self {
            peer_id,
            payload: &[],
        }
    }

    /// An empty payload marks a registration or keep-alive.
    pub fn is_registration(&self) -> bool {
        self.payload.is_empty()
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use uturn_codec::Frame;
    ///
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// Frame {
    ///     peer_id: 42,
    ///     payload: &[0xDE, 0xAD, 0xBE, 0xEF],
    /// }
    /// .encode(&mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     &[0x00, 0xAA, 0x00, 0x00, 0x00, 0x2A, 0xDE, 0xAD, 0xBE, 0xEF]
    /// );
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.put_u16(PREFIX);
        bytes.put_u32(self.peer_id);
        bytes.extend_from_slice(self.payload);
    }

    /// # Test
    ///
    /// ```
    /// use uturn_codec::Frame;
    ///
    /// let bytes = [0x00, 0xAA, 0x00, 0x00, 0x00, 0x01];
    /// let frame = Frame::decode(&bytes).unwrap();
    ///
    /// assert_eq!(frame.peer_id, 1);
    /// assert!(frame.is_registration());
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < PREAMBLE_LEN {
            return Err(Error::InvalidLength);
        }

        // No allocation here, the prefix and id are read straight off the
        // datagram. There is no upper length check, callers are bounded by
        // the UDP MTU.
        if u16::from_be_bytes([bytes[0], bytes[1]]) != PREFIX {
            return Err(Error::InvalidPrefix);
        }

        Ok(Self {
            peer_id: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            payload: &bytes[PREAMBLE_LEN..],
        })
    }
}
