//! Typed messages and their byte-exact encoding
//!
//! Every datagram is an 8-byte [`Header`] followed by a packed, little-endian
//! payload whose layout depends on the type tag. Decoding validates the
//! header, then a per-type minimum length, and only then reads fields; a
//! message that fails any check is rejected whole.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use modal_core::{
    AckStatus, LinkAddr, ModalError, ModalResult, NodeId, PhaseHint, PokeEvent, CHUNK_SIZE,
    MAX_MODES, MAX_PACKET_SIZE,
};

use crate::{Header, HEADER_SIZE};

/// Width of the NUL-padded name field in `Hello`
pub const NAME_LEN: usize = 16;

/// Width of the NUL-padded session id field in `Offer`
pub const SESSION_ID_FIELD_LEN: usize = 32;

/// Capability bit advertised by every node that can render audio
pub const CAP_AUDIO: u8 = 0x01;

/// Message type tags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Discovery
    Hello = 0x01,
    Offer = 0x02,
    Join = 0x03,

    // Configuration
    CfgBegin = 0x10,
    CfgChunk = 0x11,
    CfgEnd = 0x12,
    CfgAck = 0x13,
    CfgNack = 0x14,

    // Session control
    Start = 0x20,
    Stop = 0x21,
    Reset = 0x22,

    // Runtime
    Poke = 0x30,
    State = 0x31,
    Heartbeat = 0x32,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => MessageType::Hello,
            0x02 => MessageType::Offer,
            0x03 => MessageType::Join,
            0x10 => MessageType::CfgBegin,
            0x11 => MessageType::CfgChunk,
            0x12 => MessageType::CfgEnd,
            0x13 => MessageType::CfgAck,
            0x14 => MessageType::CfgNack,
            0x20 => MessageType::Start,
            0x21 => MessageType::Stop,
            0x22 => MessageType::Reset,
            0x30 => MessageType::Poke,
            0x31 => MessageType::State,
            0x32 => MessageType::Heartbeat,
            _ => return None,
        })
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Payload bytes following the header for this type
    ///
    /// `CfgChunk` is encoded at full width but may be decoded from a
    /// datagram truncated to its declared chunk length.
    pub const fn payload_len(self) -> usize {
        match self {
            MessageType::Hello => 6 + 1 + NAME_LEN,
            MessageType::Offer => SESSION_ID_FIELD_LEN + 2 + 1,
            MessageType::Join => 1 + 6,
            MessageType::CfgBegin => 2 + 1 + 4,
            MessageType::CfgChunk => 2 + CHUNK_SIZE,
            MessageType::CfgEnd => 4,
            MessageType::CfgAck | MessageType::CfgNack => 1,
            MessageType::Start => 4,
            MessageType::Stop | MessageType::Reset => 0,
            MessageType::Poke => 4 + 4 + 4 * MAX_MODES,
            MessageType::State => 12,
            MessageType::Heartbeat => 5,
        }
    }

    /// Smallest datagram that can hold this type
    pub const fn min_len(self) -> usize {
        match self {
            MessageType::CfgChunk => HEADER_SIZE + 2,
            other => HEADER_SIZE + other.payload_len(),
        }
    }
}

/// Type-specific message body
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Hello {
        addr: LinkAddr,
        capabilities: u8,
        name: String,
    },
    Offer {
        session_id: String,
        config_size: u16,
        num_nodes: u8,
    },
    Join {
        /// `None` asks the hub to pick an id
        requested_id: Option<NodeId>,
        addr: LinkAddr,
    },
    CfgBegin {
        total_size: u16,
        num_chunks: u8,
        checksum: u32,
    },
    CfgChunk {
        index: u8,
        data: Bytes,
    },
    CfgEnd {
        checksum: u32,
    },
    CfgAck {
        status: AckStatus,
    },
    CfgNack {
        status: AckStatus,
    },
    Start {
        start_time_ms: u32,
    },
    Stop,
    Reset,
    Poke {
        strength: f32,
        phase_hint: PhaseHint,
        mode_weights: [f32; MAX_MODES],
    },
    State {
        mode0_re: f32,
        mode0_im: f32,
        amplitude: f32,
    },
    Heartbeat {
        uptime_ms: u32,
        load: u8,
    },
}

impl Payload {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Payload::Hello { .. } => MessageType::Hello,
            Payload::Offer { .. } => MessageType::Offer,
            Payload::Join { .. } => MessageType::Join,
            Payload::CfgBegin { .. } => MessageType::CfgBegin,
            Payload::CfgChunk { .. } => MessageType::CfgChunk,
            Payload::CfgEnd { .. } => MessageType::CfgEnd,
            Payload::CfgAck { .. } => MessageType::CfgAck,
            Payload::CfgNack { .. } => MessageType::CfgNack,
            Payload::Start { .. } => MessageType::Start,
            Payload::Stop => MessageType::Stop,
            Payload::Reset => MessageType::Reset,
            Payload::Poke { .. } => MessageType::Poke,
            Payload::State { .. } => MessageType::State,
            Payload::Heartbeat { .. } => MessageType::Heartbeat,
        }
    }

    /// Wire body of a poke event
    pub fn poke(event: &PokeEvent) -> Self {
        Payload::Poke {
            strength: event.strength,
            phase_hint: event.phase_hint,
            mode_weights: event.mode_weights,
        }
    }
}

/// A decoded or to-be-encoded message
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

impl Message {
    /// Build a message with a zero sequence number and timestamp
    pub fn new(source: NodeId, dest: NodeId, payload: Payload) -> Self {
        Message {
            header: Header::new(payload.msg_type(), source, dest),
            payload,
        }
    }

    pub fn broadcast(source: NodeId, payload: Payload) -> Self {
        Self::new(source, NodeId::BROADCAST, payload)
    }

    #[inline]
    pub fn msg_type(&self) -> MessageType {
        self.payload.msg_type()
    }

    #[inline]
    pub fn source(&self) -> NodeId {
        self.header.source
    }

    #[inline]
    pub fn dest(&self) -> NodeId {
        self.header.dest
    }

    /// Poke event carried by this message, stamped with its sender
    pub fn poke_event(&self) -> Option<PokeEvent> {
        match self.payload {
            Payload::Poke {
                strength,
                phase_hint,
                mode_weights,
            } => Some(
                PokeEvent::new(self.header.source, strength)
                    .with_phase(phase_hint)
                    .with_weights(mode_weights),
            ),
            _ => None,
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.msg_type().payload_len()
    }

    /// Serialize to a datagram
    pub fn encode(&self) -> ModalResult<Bytes> {
        let size = self.encoded_len();
        if size > MAX_PACKET_SIZE {
            return Err(ModalError::MessageTooLarge {
                size,
                max: MAX_PACKET_SIZE,
            });
        }

        let mut header = self.header;
        header.msg_type = self.msg_type();

        let mut buf = BytesMut::with_capacity(size);
        buf.put_slice(&header.to_bytes());

        match &self.payload {
            Payload::Hello {
                addr,
                capabilities,
                name,
            } => {
                buf.put_slice(&addr.to_bytes());
                buf.put_u8(*capabilities);
                put_padded_str(&mut buf, name, NAME_LEN);
            }
            Payload::Offer {
                session_id,
                config_size,
                num_nodes,
            } => {
                put_padded_str(&mut buf, session_id, SESSION_ID_FIELD_LEN);
                buf.put_u16_le(*config_size);
                buf.put_u8(*num_nodes);
            }
            Payload::Join { requested_id, addr } => {
                buf.put_u8(requested_id.map_or(0xFF, NodeId::to_byte));
                buf.put_slice(&addr.to_bytes());
            }
            Payload::CfgBegin {
                total_size,
                num_chunks,
                checksum,
            } => {
                buf.put_u16_le(*total_size);
                buf.put_u8(*num_chunks);
                buf.put_u32_le(*checksum);
            }
            Payload::CfgChunk { index, data } => {
                if data.len() > CHUNK_SIZE {
                    return Err(ModalError::MessageTooLarge {
                        size: data.len(),
                        max: CHUNK_SIZE,
                    });
                }
                buf.put_u8(*index);
                buf.put_u8(data.len() as u8);
                buf.put_slice(data);
                buf.put_bytes(0, CHUNK_SIZE - data.len());
            }
            Payload::CfgEnd { checksum } => buf.put_u32_le(*checksum),
            Payload::CfgAck { status } | Payload::CfgNack { status } => {
                buf.put_u8(status.to_byte())
            }
            Payload::Start { start_time_ms } => buf.put_u32_le(*start_time_ms),
            Payload::Stop | Payload::Reset => {}
            Payload::Poke {
                strength,
                phase_hint,
                mode_weights,
            } => {
                buf.put_f32_le(*strength);
                buf.put_f32_le(phase_hint.to_wire());
                for w in mode_weights {
                    buf.put_f32_le(*w);
                }
            }
            Payload::State {
                mode0_re,
                mode0_im,
                amplitude,
            } => {
                buf.put_f32_le(*mode0_re);
                buf.put_f32_le(*mode0_im);
                buf.put_f32_le(*amplitude);
            }
            Payload::Heartbeat { uptime_ms, load } => {
                buf.put_u32_le(*uptime_ms);
                buf.put_u8(*load);
            }
        }

        debug_assert_eq!(buf.len(), size);
        Ok(buf.freeze())
    }

    /// Parse a datagram
    pub fn decode(buf: &[u8]) -> ModalResult<Self> {
        if buf.len() > MAX_PACKET_SIZE {
            return Err(ModalError::MessageTooLarge {
                size: buf.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let header = Header::parse(buf)?;
        let msg_type = header.msg_type;
        if buf.len() < msg_type.min_len() {
            return Err(ModalError::BufferTooShort {
                expected: msg_type.min_len(),
                actual: buf.len(),
            });
        }

        let mut body = &buf[HEADER_SIZE..];
        let payload = match msg_type {
            MessageType::Hello => Payload::Hello {
                addr: get_addr(&mut body),
                capabilities: body.get_u8(),
                name: get_padded_str(&mut body, NAME_LEN),
            },
            MessageType::Offer => Payload::Offer {
                session_id: get_padded_str(&mut body, SESSION_ID_FIELD_LEN),
                config_size: body.get_u16_le(),
                num_nodes: body.get_u8(),
            },
            MessageType::Join => {
                let requested = body.get_u8();
                Payload::Join {
                    requested_id: (requested != 0xFF).then_some(NodeId(requested)),
                    addr: get_addr(&mut body),
                }
            }
            MessageType::CfgBegin => Payload::CfgBegin {
                total_size: body.get_u16_le(),
                num_chunks: body.get_u8(),
                checksum: body.get_u32_le(),
            },
            MessageType::CfgChunk => {
                let index = body.get_u8();
                let len = body.get_u8() as usize;
                if len > CHUNK_SIZE {
                    return Err(ModalError::InvalidWireFormat(format!(
                        "chunk length {len} exceeds {CHUNK_SIZE}"
                    )));
                }
                if body.remaining() < len {
                    return Err(ModalError::BufferTooShort {
                        expected: HEADER_SIZE + 2 + len,
                        actual: buf.len(),
                    });
                }
                Payload::CfgChunk {
                    index,
                    data: Bytes::copy_from_slice(&body[..len]),
                }
            }
            MessageType::CfgEnd => Payload::CfgEnd {
                checksum: body.get_u32_le(),
            },
            MessageType::CfgAck => Payload::CfgAck {
                status: get_status(&mut body)?,
            },
            MessageType::CfgNack => Payload::CfgNack {
                status: get_status(&mut body)?,
            },
            MessageType::Start => Payload::Start {
                start_time_ms: body.get_u32_le(),
            },
            MessageType::Stop => Payload::Stop,
            MessageType::Reset => Payload::Reset,
            MessageType::Poke => {
                let strength = body.get_f32_le();
                let phase_hint = PhaseHint::from_wire(body.get_f32_le());
                let mut mode_weights = [0.0; MAX_MODES];
                for w in &mut mode_weights {
                    *w = body.get_f32_le();
                }
                if !strength.is_finite() || mode_weights.iter().any(|w| !w.is_finite()) {
                    return Err(ModalError::InvalidWireFormat(
                        "non-finite poke field".into(),
                    ));
                }
                Payload::Poke {
                    strength,
                    phase_hint,
                    mode_weights,
                }
            }
            MessageType::State => Payload::State {
                mode0_re: body.get_f32_le(),
                mode0_im: body.get_f32_le(),
                amplitude: body.get_f32_le(),
            },
            MessageType::Heartbeat => Payload::Heartbeat {
                uptime_ms: body.get_u32_le(),
                load: body.get_u8(),
            },
        };

        Ok(Message { header, payload })
    }
}

fn put_padded_str(buf: &mut BytesMut, s: &str, width: usize) {
    // Leave room for the terminating NUL, cutting on a char boundary
    let mut end = s.len().min(width - 1);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_slice(&s.as_bytes()[..end]);
    buf.put_bytes(0, width - end);
}

fn get_padded_str(body: &mut &[u8], width: usize) -> String {
    let field = &body[..width];
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    let s = String::from_utf8_lossy(&field[..end]).into_owned();
    body.advance(width);
    s
}

fn get_addr(body: &mut &[u8]) -> LinkAddr {
    let mut addr = [0u8; 6];
    body.copy_to_slice(&mut addr);
    LinkAddr::from_bytes(addr)
}

fn get_status(body: &mut &[u8]) -> ModalResult<AckStatus> {
    let b = body.get_u8();
    AckStatus::from_byte(b)
        .ok_or_else(|| ModalError::InvalidWireFormat(format!("unknown ack status {b}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use modal_core::DEFAULT_POKE_WEIGHTS;
    use proptest::prelude::*;

    fn roundtrip(msg: &Message) -> Message {
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), msg.encoded_len());
        Message::decode(&bytes).unwrap()
    }

    #[test]
    fn test_wire_sizes() {
        assert_eq!(MessageType::Hello.min_len(), 31);
        assert_eq!(MessageType::Offer.min_len(), 43);
        assert_eq!(MessageType::CfgBegin.min_len(), 15);
        assert_eq!(HEADER_SIZE + MessageType::CfgChunk.payload_len(), 210);
        assert_eq!(MessageType::Poke.min_len(), 32);
        assert_eq!(MessageType::Heartbeat.min_len(), 13);
    }

    #[test]
    fn test_poke_layout() {
        let event = PokeEvent::new(NodeId::HUB, 0.5).with_phase(PhaseHint::Fixed(1.25));
        let msg = Message::new(NodeId::HUB, NodeId(2), Payload::poke(&event));
        let bytes = msg.encode().unwrap();

        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[1], 0x30);
        assert_eq!(&bytes[8..12], &0.5f32.to_le_bytes());
        assert_eq!(&bytes[12..16], &1.25f32.to_le_bytes());

        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.poke_event(), Some(event));
    }

    #[test]
    fn test_random_phase_sentinel_on_wire() {
        let msg = Message::new(
            NodeId::HUB,
            NodeId(0),
            Payload::poke(&PokeEvent::new(NodeId::HUB, 1.0)),
        );
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[12..16], &(-1.0f32).to_le_bytes());
    }

    #[test]
    fn test_cfg_begin_layout() {
        let msg = Message::broadcast(
            NodeId::HUB,
            Payload::CfgBegin {
                total_size: 600,
                num_chunks: 3,
                checksum: 0xDEADBEEF,
            },
        );
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 15);
        assert_eq!(&bytes[8..10], &600u16.to_le_bytes());
        assert_eq!(bytes[10], 3);
        assert_eq!(&bytes[11..15], &0xDEADBEEFu32.to_le_bytes());
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_chunk_full_width_and_truncated_decode() {
        let data = Bytes::from(vec![0xAB; 40]);
        let msg = Message::broadcast(
            NodeId::HUB,
            Payload::CfgChunk {
                index: 2,
                data: data.clone(),
            },
        );
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 210);
        assert!(bytes[50..].iter().all(|&b| b == 0));

        // A sender that truncates to the used length is still accepted
        let decoded = Message::decode(&bytes[..HEADER_SIZE + 2 + 40]).unwrap();
        assert_eq!(decoded.payload, Payload::CfgChunk { index: 2, data });

        // ...but not one that cuts into the declared data
        assert!(matches!(
            Message::decode(&bytes[..HEADER_SIZE + 2 + 39]),
            Err(ModalError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_chunk_length_over_limit() {
        let mut bytes = Message::broadcast(
            NodeId::HUB,
            Payload::CfgChunk {
                index: 0,
                data: Bytes::new(),
            },
        )
        .encode()
        .unwrap()
        .to_vec();
        bytes[9] = 201;
        assert!(matches!(
            Message::decode(&bytes),
            Err(ModalError::InvalidWireFormat(_))
        ));
    }

    #[test]
    fn test_discovery_messages() {
        let hello = Message::broadcast(
            NodeId::UNASSIGNED,
            Payload::Hello {
                addr: LinkAddr::new([1, 2, 3, 4, 5, 6]),
                capabilities: CAP_AUDIO,
                name: "node-a".into(),
            },
        );
        assert_eq!(roundtrip(&hello), hello);

        let offer = Message::new(
            NodeId::HUB,
            NodeId(1),
            Payload::Offer {
                session_id: "ring_16_resonator".into(),
                config_size: 0,
                num_nodes: 4,
            },
        );
        assert_eq!(roundtrip(&offer), offer);

        let join = Message::new(
            NodeId(1),
            NodeId::HUB,
            Payload::Join {
                requested_id: None,
                addr: LinkAddr::ZERO,
            },
        );
        let bytes = join.encode().unwrap();
        assert_eq!(bytes[8], 0xFF);
        assert_eq!(roundtrip(&join), join);
    }

    #[test]
    fn test_long_name_truncated() {
        let hello = Message::broadcast(
            NodeId(0),
            Payload::Hello {
                addr: LinkAddr::ZERO,
                capabilities: 0,
                name: "a-very-long-node-name".into(),
            },
        );
        match roundtrip(&hello).payload {
            Payload::Hello { name, .. } => assert_eq!(name, "a-very-long-nod"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_truncated_poke_rejected() {
        let bytes = Message::new(
            NodeId::HUB,
            NodeId(0),
            Payload::poke(&PokeEvent::new(NodeId::HUB, 1.0)),
        )
        .encode()
        .unwrap();
        assert!(matches!(
            Message::decode(&bytes[..20]),
            Err(ModalError::BufferTooShort {
                expected: 32,
                actual: 20
            })
        ));
    }

    fn poke_bytes_with_weight(weight: f32) -> Vec<u8> {
        let mut bytes = Message::new(
            NodeId::HUB,
            NodeId(0),
            Payload::poke(&PokeEvent::new(NodeId::HUB, 1.0)),
        )
        .encode()
        .unwrap()
        .to_vec();
        bytes[16..20].copy_from_slice(&weight.to_le_bytes());
        bytes
    }

    #[test]
    fn test_poke_weights_clamped_on_decode() {
        let decoded = Message::decode(&poke_bytes_with_weight(1e30)).unwrap();
        let event = decoded.poke_event().unwrap();
        assert_eq!(event.mode_weights[0], 1.0);
        assert_eq!(&event.mode_weights[1..], &DEFAULT_POKE_WEIGHTS[1..]);
    }

    #[test]
    fn test_non_finite_poke_rejected() {
        for weight in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            assert!(matches!(
                Message::decode(&poke_bytes_with_weight(weight)),
                Err(ModalError::InvalidWireFormat(_))
            ));
        }

        let mut bytes = poke_bytes_with_weight(1.0);
        bytes[8..12].copy_from_slice(&f32::NAN.to_le_bytes());
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn test_unknown_ack_status() {
        let mut bytes = Message::new(
            NodeId(0),
            NodeId::HUB,
            Payload::CfgNack {
                status: AckStatus::MissingChunks,
            },
        )
        .encode()
        .unwrap()
        .to_vec();
        assert_eq!(bytes[8], 1);
        bytes[8] = 42;
        assert!(Message::decode(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..300)) {
            let _ = Message::decode(&data);
        }

        #[test]
        fn decode_arbitrary_body_with_valid_header(
            ty in prop::sample::select(vec![
                0x01u8, 0x02, 0x03, 0x10, 0x11, 0x12, 0x13, 0x14,
                0x20, 0x21, 0x22, 0x30, 0x31, 0x32,
            ]),
            body in proptest::collection::vec(any::<u8>(), 0..242),
        ) {
            let mut data = vec![1, ty, 0, 0xFF, 0, 0, 0, 0];
            data.extend_from_slice(&body);
            if let Ok(msg) = Message::decode(&data) {
                prop_assert_eq!(msg.msg_type().to_byte(), ty);
            }
        }
    }
}
