mod error;
mod message;
pub mod queue;

pub use error::UnderflowError;
pub use message::{ByteCopy, Message, MessageHeader, MessageKind};
pub use queue::BlockingQueue;

/// Bytes transmitted for a header on the wire: a `u32` kind tag followed
/// by a `u32` body length, both little-endian.
pub const HEADER_WIRE_SIZE: usize = 8;

/// Encodes `header` as its 8-byte little-endian wire representation.
pub fn encode_header<T: MessageKind>(header: &MessageHeader<T>) -> [u8; HEADER_WIRE_SIZE] {
    let mut buf = [0_u8; HEADER_WIRE_SIZE];
    buf[..4].copy_from_slice(&header.id.to_u32().to_le_bytes());
    buf[4..].copy_from_slice(&header.size.to_le_bytes());
    buf
}

/// Decodes an 8-byte wire header. Returns `None` if the kind tag isn't
/// recognised by `T`.
pub fn decode_header<T: MessageKind>(buf: &[u8; HEADER_WIRE_SIZE]) -> Option<MessageHeader<T>> {
    let id = u32::from_le_bytes(buf[..4].try_into().unwrap());
    let size = u32::from_le_bytes(buf[4..].try_into().unwrap());
    Some(MessageHeader { id: T::from_u32(id)?, size })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trips_through_wire_encoding() {
        let header = MessageHeader { id: 42_u32, size: 17 };
        let wire = encode_header(&header);
        assert_eq!(decode_header::<u32>(&wire), Some(header));
    }
}
