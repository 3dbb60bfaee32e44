//! Excitation events and node personalities

use std::fmt;

use crate::{ModalError, ModalResult, NodeId, MAX_MODES};

/// Behavioral policy of a node's modes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Personality {
    /// Decays to silence without input
    #[default]
    Resonator = 0,
    /// Sustains a soft limit cycle
    SelfOscillator = 1,
}

impl Personality {
    pub fn from_byte(b: u8) -> ModalResult<Self> {
        match b {
            0 => Ok(Personality::Resonator),
            1 => Ok(Personality::SelfOscillator),
            _ => Err(ModalError::InvalidConfig(format!("unknown personality {b}"))),
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Personality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Personality::Resonator => write!(f, "resonator"),
            Personality::SelfOscillator => write!(f, "self-oscillator"),
        }
    }
}

impl std::str::FromStr for Personality {
    type Err = ModalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resonator" | "res" => Ok(Personality::Resonator),
            "self-oscillator" | "self" | "osc" => Ok(Personality::SelfOscillator),
            other => Err(ModalError::InvalidConfig(format!(
                "unknown personality '{other}'"
            ))),
        }
    }
}

/// Phase of an excitation
///
/// On the wire any negative phase means "pick one at random".
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum PhaseHint {
    #[default]
    Random,
    Fixed(f32),
}

impl PhaseHint {
    pub const RANDOM_SENTINEL: f32 = -1.0;

    pub fn from_wire(v: f32) -> Self {
        if v < 0.0 || !v.is_finite() {
            PhaseHint::Random
        } else {
            PhaseHint::Fixed(v)
        }
    }

    pub fn to_wire(self) -> f32 {
        match self {
            PhaseHint::Random => Self::RANDOM_SENTINEL,
            PhaseHint::Fixed(p) => p,
        }
    }
}

/// Default per-mode weights applied by a hub poke
pub const DEFAULT_POKE_WEIGHTS: [f32; MAX_MODES] = [1.0, 0.8, 0.3, 0.5];

/// A bounded excitation injected into a node's modes
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PokeEvent {
    pub source: NodeId,
    /// Strength in [0, 1]
    pub strength: f32,
    pub phase_hint: PhaseHint,
    pub mode_weights: [f32; MAX_MODES],
}

impl PokeEvent {
    pub fn new(source: NodeId, strength: f32) -> Self {
        PokeEvent {
            source,
            strength: clamp_unit(strength),
            phase_hint: PhaseHint::Random,
            mode_weights: DEFAULT_POKE_WEIGHTS,
        }
    }

    /// Poke derived from a 7-bit note velocity
    pub fn from_velocity(source: NodeId, velocity: u8) -> Self {
        Self::new(source, f32::from(velocity.min(127)) / 127.0)
    }

    pub fn with_phase(mut self, phase: PhaseHint) -> Self {
        self.phase_hint = phase;
        self
    }

    /// Per-mode weights, each clamped to [0, 1]
    pub fn with_weights(mut self, weights: [f32; MAX_MODES]) -> Self {
        self.mode_weights = weights.map(clamp_unit);
        self
    }
}

#[inline]
fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}
