//! Frame codec: 24-byte message header followed by the payload.

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::NetworkError;
use crate::message::{
    MAX_PAYLOAD_SIZE, MESSAGE_HEADER_SIZE, Message, MessageHeader, checksum,
};
use crate::params::Network;

#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    magic: [u8; 4],
    max_payload: u32,
}

impl WireCodec {
    pub fn new(network: Network) -> Self {
        Self {
            magic: network.magic(),
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, NetworkError> {
        if src.len() < MESSAGE_HEADER_SIZE {
            src.reserve(MESSAGE_HEADER_SIZE - src.len());
            return Ok(None);
        }

        let mut raw = [0u8; MESSAGE_HEADER_SIZE];
        raw.copy_from_slice(&src[..MESSAGE_HEADER_SIZE]);
        let header = MessageHeader::decode(&raw);
        if header.magic != self.magic {
            return Err(NetworkError::InvalidMagic(hex::encode(header.magic)));
        }
        if header.length > self.max_payload {
            return Err(NetworkError::PayloadTooLarge(header.length));
        }

        let frame_len = MESSAGE_HEADER_SIZE + header.length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(MESSAGE_HEADER_SIZE);
        let payload = src.split_to(header.length as usize);
        if checksum(&payload) != header.checksum {
            return Err(NetworkError::InvalidChecksum(header.command.name()));
        }
        debug!(command = %header.command, len = header.length, "decoded frame");
        Ok(Some(Message::decode(header.command, &payload)?))
    }
}

impl Encoder<Message> for WireCodec {
    type Error = NetworkError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), NetworkError> {
        let payload = message.encode_payload();
        if payload.len() > self.max_payload as usize {
            return Err(NetworkError::PayloadTooLarge(payload.len() as u32));
        }
        let header = MessageHeader::for_payload(self.magic, message.command(), &payload);
        let mut head = Vec::with_capacity(MESSAGE_HEADER_SIZE);
        header.encode(&mut head);
        dst.reserve(head.len() + payload.len());
        dst.extend_from_slice(&head);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(codec: &mut WireCodec, message: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(message, &mut buf).expect("encode");
        buf
    }

    #[test]
    fn verack_frame_is_header_only() {
        let mut codec = WireCodec::new(Network::Mainnet);
        let buf = encode(&mut codec, Message::Verack);
        assert_eq!(buf.len(), MESSAGE_HEADER_SIZE);
        assert_eq!(&buf[..4], &[0xf9, 0xbe, 0xb4, 0xd9]);
        assert_eq!(&buf[4..16], b"verack\0\0\0\0\0\0");
        assert_eq!(&buf[16..20], &[0, 0, 0, 0]);
        assert_eq!(&buf[20..24], &[0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = WireCodec::new(Network::Simnet);
        let full = encode(&mut codec, Message::Ping(99));
        let mut partial = BytesMut::from(&full[..MESSAGE_HEADER_SIZE + 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[MESSAGE_HEADER_SIZE + 3..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Message::Ping(99)));
        assert!(partial.is_empty());
    }

    #[test]
    fn rejects_foreign_magic_and_bad_checksum() {
        let mut mainnet = WireCodec::new(Network::Mainnet);
        let mut simnet = WireCodec::new(Network::Simnet);

        let mut foreign = encode(&mut mainnet, Message::Pong(1));
        assert!(matches!(
            simnet.decode(&mut foreign),
            Err(NetworkError::InvalidMagic(_))
        ));

        let mut corrupted = encode(&mut mainnet, Message::Pong(1));
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        assert!(matches!(
            mainnet.decode(&mut corrupted),
            Err(NetworkError::InvalidChecksum(_))
        ));
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut codec = WireCodec::new(Network::Mainnet).with_max_payload(16);
        let mut buf = encode(&mut WireCodec::new(Network::Mainnet), Message::Ping(5));
        buf[16..20].copy_from_slice(&1024u32.to_le_bytes());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetworkError::PayloadTooLarge(1024))
        ));
    }
}
