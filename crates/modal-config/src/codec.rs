//! Binary session configuration format
//!
//! All integers and floats are little-endian. Layout:
//!
//! ```text
//! format:u8  id_len:u8  session_id:[u8; id_len]
//! topology:u8  node_count:u8  global_coupling:f32
//! control_rate_hz:u16  max_duration_ms:u32  flags:u8
//! node_count x {
//!     id:u8  personality:u8  mode_mask:u8
//!     4 x { omega:f32  gamma:f32  weight:f32 }
//!     neighbor_count:u8  neighbors:[u8; neighbor_count]
//!     coupling:f32  carrier_hz:f32  gain:f32
//! }
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use modal_core::{
    ModalError, ModalResult, ModeParams, NodeConfig, NodeId, Personality, SessionConfig,
    TopologyKind, MAX_CONFIG_SIZE, MAX_MODES,
};

/// Current configuration format revision
pub const CONFIG_FORMAT: u8 = 1;

const FLAG_AUTO_RESTART: u8 = 0x01;

const SESSION_FIXED_LEN: usize = 1 + 1 + 1 + 1 + 4 + 2 + 4 + 1;
const NODE_FIXED_LEN: usize = 3 + MAX_MODES * 12 + 1 + 12;

/// Exact encoded size of `config`
pub fn encoded_size(config: &SessionConfig) -> usize {
    SESSION_FIXED_LEN
        + config.session_id.len()
        + config
            .nodes
            .iter()
            .map(|n| NODE_FIXED_LEN + n.neighbors.len())
            .sum::<usize>()
}

/// Serialize a validated configuration
pub fn encode_session(config: &SessionConfig) -> ModalResult<Bytes> {
    config.validate()?;

    let size = encoded_size(config);
    if size > MAX_CONFIG_SIZE {
        return Err(ModalError::ConfigTooLarge {
            size,
            max: MAX_CONFIG_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(size);
    buf.put_u8(CONFIG_FORMAT);
    buf.put_u8(config.session_id.len() as u8);
    buf.put_slice(config.session_id.as_bytes());
    buf.put_u8(config.topology.to_byte());
    buf.put_u8(config.nodes.len() as u8);
    buf.put_f32_le(config.global_coupling);
    buf.put_u16_le(config.control_rate_hz);
    buf.put_u32_le(config.max_duration_ms);
    buf.put_u8(if config.auto_restart { FLAG_AUTO_RESTART } else { 0 });

    for node in &config.nodes {
        encode_node(node, &mut buf);
    }

    debug_assert_eq!(buf.len(), size);
    Ok(buf.freeze())
}

fn encode_node(node: &NodeConfig, buf: &mut BytesMut) {
    buf.put_u8(node.id.to_byte());
    buf.put_u8(node.personality.to_byte());

    let mask = node
        .modes
        .iter()
        .enumerate()
        .filter(|(_, m)| m.active)
        .fold(0u8, |mask, (k, _)| mask | (1 << k));
    buf.put_u8(mask);

    for mode in &node.modes {
        buf.put_f32_le(mode.omega);
        buf.put_f32_le(mode.gamma);
        buf.put_f32_le(mode.weight);
    }

    buf.put_u8(node.neighbors.len() as u8);
    for neighbor in &node.neighbors {
        buf.put_u8(neighbor.to_byte());
    }

    buf.put_f32_le(node.coupling_strength);
    buf.put_f32_le(node.carrier_freq_hz);
    buf.put_f32_le(node.gain);
}

/// Parse and validate a configuration blob
pub fn decode_session(data: &[u8]) -> ModalResult<SessionConfig> {
    if data.len() > MAX_CONFIG_SIZE {
        return Err(ModalError::ConfigTooLarge {
            size: data.len(),
            max: MAX_CONFIG_SIZE,
        });
    }

    let mut buf = data;
    need(buf, 2)?;
    let format = buf.get_u8();
    if format != CONFIG_FORMAT {
        return Err(ModalError::InvalidConfig(format!(
            "unsupported configuration format {format}"
        )));
    }

    let id_len = buf.get_u8() as usize;
    need(buf, id_len)?;
    let session_id = String::from_utf8(buf[..id_len].to_vec())
        .map_err(|_| ModalError::InvalidConfig("session id is not UTF-8".into()))?;
    buf.advance(id_len);

    need(buf, SESSION_FIXED_LEN - 2)?;
    let topology = TopologyKind::from_byte(buf.get_u8())?;
    let node_count = buf.get_u8() as usize;

    let mut config = SessionConfig::new(session_id, topology);
    config.global_coupling = buf.get_f32_le();
    config.control_rate_hz = buf.get_u16_le();
    config.max_duration_ms = buf.get_u32_le();
    config.auto_restart = buf.get_u8() & FLAG_AUTO_RESTART != 0;

    for _ in 0..node_count {
        config.push_node(decode_node(&mut buf)?)?;
    }

    if buf.has_remaining() {
        return Err(ModalError::InvalidConfig(format!(
            "{} trailing bytes after configuration",
            buf.remaining()
        )));
    }

    config.validate()?;
    Ok(config)
}

fn decode_node(buf: &mut &[u8]) -> ModalResult<NodeConfig> {
    need(buf, 3 + MAX_MODES * 12 + 1)?;
    let mut node = NodeConfig::new(NodeId::from_byte(buf.get_u8()));
    node.personality = Personality::from_byte(buf.get_u8())?;
    let mask = buf.get_u8();

    for (k, mode) in node.modes.iter_mut().enumerate() {
        *mode = ModeParams {
            omega: buf.get_f32_le(),
            gamma: buf.get_f32_le(),
            weight: buf.get_f32_le(),
            active: mask & (1 << k) != 0,
        };
    }

    let neighbor_count = buf.get_u8() as usize;
    need(buf, neighbor_count + 12)?;
    for _ in 0..neighbor_count {
        node.neighbors.try_push(NodeId::from_byte(buf.get_u8()))?;
    }

    node.coupling_strength = buf.get_f32_le();
    node.carrier_freq_hz = buf.get_f32_le();
    node.gain = buf.get_f32_le();
    Ok(node)
}

#[inline]
fn need(buf: &[u8], n: usize) -> ModalResult<()> {
    if buf.len() < n {
        return Err(ModalError::BufferTooShort {
            expected: n,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use modal_topology::{clusters, hub_spoke, ring_resonator, small_world_oscillator};
    use modal_wire::crc32;
    use proptest::prelude::*;

    #[test]
    fn test_roundtrip_presets() {
        for config in [
            ring_resonator(16).unwrap(),
            small_world_oscillator(8).unwrap(),
            clusters(16).unwrap(),
            hub_spoke(16).unwrap(),
        ] {
            let bytes = encode_session(&config).unwrap();
            assert_eq!(bytes.len(), encoded_size(&config));
            assert!(bytes.len() <= MAX_CONFIG_SIZE);
            assert_eq!(decode_session(&bytes).unwrap(), config);
        }
    }

    #[test]
    fn test_inactive_mode_and_flags() {
        let mut config = ring_resonator(3).unwrap();
        config.nodes[1].modes[3] = ModeParams::inactive();
        config.auto_restart = true;
        config.max_duration_ms = 60_000;

        let decoded = decode_session(&encode_session(&config).unwrap()).unwrap();
        assert!(!decoded.nodes[1].modes[3].active);
        assert_eq!(decoded.nodes[1].active_modes().count(), 3);
        assert!(decoded.auto_restart);
        assert_eq!(decoded.max_duration_ms, 60_000);
    }

    #[test]
    fn test_rejects_invalid_before_encoding() {
        let mut config = ring_resonator(4).unwrap();
        config.nodes[0].neighbors.try_push(NodeId(9)).unwrap();
        assert!(matches!(
            encode_session(&config),
            Err(ModalError::UnknownNeighbor { .. })
        ));
    }

    #[test]
    fn test_truncated() {
        let bytes = encode_session(&ring_resonator(4).unwrap()).unwrap();
        for len in [0, 1, 10, bytes.len() - 1] {
            assert!(decode_session(&bytes[..len]).is_err(), "len {len}");
        }
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = encode_session(&ring_resonator(2).unwrap()).unwrap().to_vec();
        bytes.push(0);
        assert!(matches!(
            decode_session(&bytes),
            Err(ModalError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unknown_format() {
        let mut bytes = encode_session(&ring_resonator(2).unwrap()).unwrap().to_vec();
        bytes[0] = 9;
        assert!(decode_session(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn prop_checksum_sensitive(
            n in 1usize..=16,
            coupling in 0.0f32..1.0,
            pos in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut config = ring_resonator(n).unwrap();
            config.global_coupling = coupling;
            let bytes = encode_session(&config).unwrap();
            prop_assert_eq!(crc32(&bytes), crc32(&encode_session(&config).unwrap()));

            let mut mutated = bytes.to_vec();
            let i = pos.index(mutated.len());
            mutated[i] ^= flip;
            prop_assert_ne!(crc32(&bytes), crc32(&mutated));
        }

        #[test]
        fn prop_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode_session(&data);
        }
    }
}
