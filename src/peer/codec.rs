use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::PeerError, Bitfield, BlockInfo, PeerId, PieceIndex};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Handshake message exchanged once at connection start.
///
/// On the wire it is exactly 68 bytes: the length-prefixed protocol literal,
/// 8 reserved bytes, the 20-byte info hash and the 20-byte peer id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Codec for the handshake.
///
/// Decoding consumes exactly the 68 handshake bytes; anything the peer
/// piggy-backs after its handshake (typically its bitfield) stays in the
/// buffer for the message codec that replaces this one.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = PeerError;

    fn encode(&mut self, h: Handshake, buf: &mut BytesMut) -> Result<(), PeerError> {
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.extend_from_slice(PROTOCOL_STRING.as_bytes());
        buf.extend_from_slice(&h.reserved);
        buf.extend_from_slice(&h.info_hash);
        buf.extend_from_slice(&h.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, PeerError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(PeerError::InvalidHandshake);
        }

        let needed = 1 + prot_len + 8 + 20 + 20;
        if buf.len() < needed {
            return Ok(None);
        }

        if &buf[1..1 + prot_len] != PROTOCOL_STRING.as_bytes() {
            return Err(PeerError::InvalidHandshake);
        }
        buf.advance(1 + prot_len);

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// IDs for peer wire messages (all but keep-alive, which has no id).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(v: u8) -> Result<Self, PeerError> {
        use MessageId::*;
        match v {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Block),
            8 => Ok(Cancel),
            9 => Ok(Port),
            id => Err(PeerError::UnknownMessageId(id)),
        }
    }
}

/// All peer wire messages after the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    /// DHT port advert; accepted and otherwise ignored.
    Port(u32),
}

/// Codec for all peer wire messages after the handshake.
///
/// Frames are `length prefix (4 bytes, big endian) + id (1 byte) + payload`,
/// where a zero length denotes a keep-alive. The buffer accumulates partial
/// frames across reads, so a message split over several reads, or several
/// messages arriving in one read, both decode correctly.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = PeerError;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), PeerError> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index_to_u32(piece_index)?);
            }
            Bitfield(bitfield) => {
                let bytes = bitfield.as_raw_slice();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bytes);
            }
            Request(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Request as u8);
                encode_block_info(&block, buf)?;
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(1 + 2 * 4 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index_to_u32(piece_index)?);
                buf.put_u32(offset);
                buf.extend_from_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(1 + 3 * 4);
                buf.put_u8(MessageId::Cancel as u8);
                encode_block_info(&block, buf)?;
            }
            Port(advert) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u32(advert);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, PeerError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let mut tmp = Cursor::new(&buf[..]);
        let msg_len = tmp.get_u32() as usize;
        if buf.len() < 4 + msg_len {
            return Ok(None);
        }
        buf.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(buf.get_u8())?;
        let expected = match id {
            MessageId::Choke
            | MessageId::Unchoke
            | MessageId::Interested
            | MessageId::NotInterested => Some(1),
            MessageId::Have | MessageId::Port => Some(1 + 4),
            MessageId::Request | MessageId::Cancel => Some(1 + 3 * 4),
            // bitfield and block lengths depend on the payload
            MessageId::Bitfield | MessageId::Block => None,
        };
        if let Some(expected) = expected {
            if msg_len != expected {
                return Err(PeerError::Protocol("bad message length"));
            }
        }

        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: buf.get_u32() as PieceIndex,
            },
            MessageId::Bitfield => {
                let mut raw = vec![0; msg_len - 1];
                buf.copy_to_slice(&mut raw);
                Message::Bitfield(Bitfield::from_vec(raw))
            }
            MessageId::Request => Message::Request(decode_block_info(buf)),
            MessageId::Block => {
                if msg_len < 1 + 2 * 4 {
                    return Err(PeerError::Protocol("bad message length"));
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let mut data = vec![0; msg_len - 1 - 2 * 4];
                buf.copy_to_slice(&mut data);
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Cancel => Message::Cancel(decode_block_info(buf)),
            MessageId::Port => Message::Port(buf.get_u32()),
        };

        Ok(Some(msg))
    }
}

fn piece_index_to_u32(index: PieceIndex) -> Result<u32, PeerError> {
    u32::try_from(index).map_err(|_| PeerError::Protocol("piece index out of range"))
}

fn encode_block_info(block: &BlockInfo, buf: &mut BytesMut) -> Result<(), PeerError> {
    buf.put_u32(piece_index_to_u32(block.piece_index)?);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
    Ok(())
}

fn decode_block_info(buf: &mut BytesMut) -> BlockInfo {
    BlockInfo {
        piece_index: buf.get_u32() as PieceIndex,
        offset: buf.get_u32(),
        len: buf.get_u32(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_handshake(h: Handshake) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(h, &mut buf).unwrap();
        buf
    }

    fn encode_msg(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn should_round_trip_handshake() {
        let handshake = Handshake::new([0xab; 20], *b"-st0100-000000000001");
        let mut buf = encode_handshake(handshake);
        assert_eq!(buf.len(), 68);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, handshake.info_hash);
        assert_eq!(decoded.peer_id, handshake.peer_id);
        assert!(buf.is_empty());
    }

    #[test]
    fn should_keep_piggybacked_bytes_after_handshake() {
        let mut buf = encode_handshake(Handshake::new([1; 20], [2; 20]));
        // the peer's bitfield follows in the same read
        buf.extend_from_slice(&encode_msg(Message::Bitfield(Bitfield::from_vec(vec![
            0b1010_0000,
        ]))));

        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_some());
        let msg = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(msg, Message::Bitfield(_)));
    }

    #[test]
    fn should_reject_wrong_protocol_string() {
        let mut buf = encode_handshake(Handshake::new([1; 20], [2; 20]));
        buf[1] = b'x';
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(PeerError::InvalidHandshake)
        ));
    }

    #[test]
    fn should_round_trip_messages() {
        let block = BlockInfo {
            piece_index: 7,
            offset: 0x4000,
            len: 0x4000,
        };
        let messages = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 42 },
            Message::Bitfield(Bitfield::from_vec(vec![0b1100_0001, 0b0000_0001])),
            Message::Request(block),
            Message::Block {
                piece_index: 7,
                offset: 0x4000,
                data: vec![0xfe; 100],
            },
            Message::Cancel(block),
            Message::Port(6881),
        ];

        for msg in messages {
            let mut buf = encode_msg(msg.clone());
            let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn should_wait_for_a_complete_frame() {
        let full = encode_msg(Message::Have { piece_index: 3 });

        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let decoded = PeerCodec.decode(&mut buf).unwrap();
            if i + 1 < full.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(decoded, Some(Message::Have { piece_index: 3 }));
            }
        }
    }

    #[test]
    fn should_decode_pipelined_messages() {
        let mut buf = encode_msg(Message::Unchoke);
        buf.extend_from_slice(&encode_msg(Message::Have { piece_index: 1 }));
        buf.extend_from_slice(&encode_msg(Message::KeepAlive));

        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert_eq!(
            PeerCodec.decode(&mut buf).unwrap(),
            Some(Message::Have { piece_index: 1 })
        );
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn should_reject_unknown_ids_and_bad_lengths() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(17);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(PeerError::UnknownMessageId(17))
        ));

        // have with a truncated payload
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u16(0);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(PeerError::Protocol(_))
        ));
    }

    /// Bit k of byte b, MSB first, represents piece 8*b + k.
    #[test]
    fn should_use_msb_first_bit_order() {
        let mut bitfield = Bitfield::repeat(false, 16);
        bitfield.set(0, true);
        bitfield.set(9, true);

        let mut buf = encode_msg(Message::Bitfield(bitfield.clone()));
        // skip length prefix and id
        assert_eq!(&buf[5..], &[0b1000_0000, 0b0100_0000]);

        match PeerCodec.decode(&mut buf).unwrap().unwrap() {
            Message::Bitfield(decoded) => {
                assert_eq!(decoded[..16], bitfield[..]);
            }
            other => panic!("expected bitfield, got {:?}", other),
        }
    }
}
