//! Poke excitation envelope

use std::f32::consts::TAU;

use modal_core::{PhaseHint, PokeEvent, MAX_MODES};
use num_complex::Complex32;
use rand::Rng;

/// Default envelope duration in seconds
pub const DEFAULT_ENVELOPE_SECS: f32 = 0.010;

/// Raised-cosine drive applied after a poke
///
/// Phases are resolved once when the poke lands, so a random-phase poke
/// drives each mode coherently for its whole duration.
#[derive(Clone, Debug, PartialEq)]
pub struct ExcitationEnvelope {
    strength: f32,
    phases: [f32; MAX_MODES],
    elapsed: f32,
    duration: f32,
}

impl ExcitationEnvelope {
    pub fn new<R: Rng + ?Sized>(event: &PokeEvent, duration: f32, rng: &mut R) -> Self {
        let mut phases = [0.0; MAX_MODES];
        for phase in &mut phases {
            *phase = resolve_phase(event.phase_hint, rng);
        }
        ExcitationEnvelope {
            strength: event.strength,
            phases,
            elapsed: 0.0,
            duration: duration.max(f32::EPSILON),
        }
    }

    /// Hann window value at the current position, in [0, 1]
    pub fn shape(&self) -> f32 {
        let t = (self.elapsed / self.duration).clamp(0.0, 1.0);
        0.5 * (1.0 - (TAU * t).cos())
    }

    /// Drive term `u(t)` for mode `k` with audio weight `weight`
    pub fn drive(&self, k: usize, weight: f32) -> Complex32 {
        let phase = self.phases.get(k).copied().unwrap_or(0.0);
        Complex32::from_polar(self.strength * weight * self.shape(), phase)
    }

    /// Phase chosen for mode `k`
    pub fn phase(&self, k: usize) -> f32 {
        self.phases.get(k).copied().unwrap_or(0.0)
    }

    /// Move the window forward; returns false once it has run out
    pub fn advance(&mut self, dt: f32) -> bool {
        self.elapsed += dt;
        self.elapsed < self.duration
    }

    pub fn is_finished(&self) -> bool {
        self.elapsed >= self.duration
    }
}

/// Concrete phase for a hint, drawing uniformly from [0, 2π) when random
pub fn resolve_phase<R: Rng + ?Sized>(hint: PhaseHint, rng: &mut R) -> f32 {
    match hint {
        PhaseHint::Fixed(p) => p,
        PhaseHint::Random => rng.gen_range(0.0..TAU),
    }
}
