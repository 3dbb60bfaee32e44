//! A single complex modal oscillator

use modal_core::{ModeParams, Personality};
use num_complex::Complex32;

/// Saturation amplitude of the self-oscillating limit cycle
pub const SATURATION_AMPLITUDE: f32 = 1.0;

/// One complex oscillator: state `a` plus its parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mode {
    pub a: Complex32,
    pub params: ModeParams,
}

impl Mode {
    pub fn new(params: ModeParams) -> Self {
        Mode {
            a: Complex32::new(0.0, 0.0),
            params,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.params.active
    }

    /// Damping actually applied this step
    ///
    /// A self-oscillator has negative damping at low energy and positive
    /// damping above `|a|² = A_sat² / 3`, which pins it to a limit cycle.
    pub fn effective_gamma(&self, personality: Personality) -> f32 {
        let gamma = self.params.gamma;
        match personality {
            Personality::Resonator => gamma,
            Personality::SelfOscillator => {
                let ratio = self.a.norm_sqr() / (SATURATION_AMPLITUDE * SATURATION_AMPLITUDE);
                -gamma + 3.0 * gamma * ratio
            }
        }
    }

    /// Exact propagator `exp(λ·dt)` with `λ = −γ_eff + iω`
    pub fn propagator(&self, personality: Personality, dt: f32) -> Complex32 {
        let lambda = Complex32::new(-self.effective_gamma(personality), self.params.omega);
        (lambda * dt).exp()
    }

    /// Advance by `dt`: `a ← a·exp(λ·dt) + u·dt`
    pub fn advance(&mut self, personality: Personality, dt: f32, drive: Complex32) {
        let next = self.a * self.propagator(personality, dt) + drive * dt;
        // Non-finite state never recovers; restart from rest
        self.a = if next.is_finite() {
            next
        } else {
            Complex32::new(0.0, 0.0)
        };
    }

    /// Add an instantaneous kick to the state
    pub fn kick(&mut self, magnitude: f32, phase: f32) {
        self.a += Complex32::from_polar(magnitude, phase);
    }

    #[inline]
    pub fn magnitude(&self) -> f32 {
        self.a.norm()
    }

    #[inline]
    pub fn phase(&self) -> f32 {
        self.a.arg()
    }

    pub fn clear(&mut self) {
        self.a = Complex32::new(0.0, 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn resonator(gamma: f32, omega: f32) -> Mode {
        let mut mode = Mode::new(ModeParams {
            omega,
            gamma,
            weight: 1.0,
            active: true,
        });
        mode.a = Complex32::new(0.8, -0.3);
        mode
    }

    #[test]
    fn test_self_oscillator_damping_sign() {
        let mut mode = resonator(0.5, 100.0);
        mode.a = Complex32::new(0.1, 0.0);
        assert!(mode.effective_gamma(Personality::SelfOscillator) < 0.0);

        mode.a = Complex32::new(0.9, 0.0);
        assert!(mode.effective_gamma(Personality::SelfOscillator) > 0.0);
    }

    #[test]
    fn test_large_step_stays_bounded() {
        // Forward Euler would blow up here: |1 + λ·dt| >> 1
        let mut mode = resonator(0.5, 2.0 * std::f32::consts::PI * 880.0);
        let start = mode.magnitude();
        for _ in 0..100 {
            mode.advance(Personality::Resonator, 0.05, Complex32::new(0.0, 0.0));
        }
        assert!(mode.magnitude() < start);
    }

    proptest! {
        #[test]
        fn resonator_never_grows(
            gamma in 0.0f32..20.0,
            omega in 0.0f32..6000.0,
            dt in 1e-5f32..0.5,
        ) {
            let mut mode = resonator(gamma, omega);
            let mut prev = mode.magnitude();
            for _ in 0..200 {
                mode.advance(Personality::Resonator, dt, Complex32::new(0.0, 0.0));
                let now = mode.magnitude();
                prop_assert!(now <= prev * (1.0 + 1e-5));
                prev = now;
            }
        }

        #[test]
        fn exact_decay_law_independent_of_step(
            gamma in 0.01f32..5.0,
            omega in 0.0f32..6000.0,
            steps in prop::sample::select(vec![1u32, 10, 100, 1000]),
        ) {
            let total = 0.5f32;
            let dt = total / steps as f32;
            let mut mode = resonator(gamma, omega);
            let start = mode.magnitude();
            for _ in 0..steps {
                mode.advance(Personality::Resonator, dt, Complex32::new(0.0, 0.0));
            }
            let ratio = mode.magnitude() / start;
            let expected = (-gamma * total).exp();
            prop_assert!((ratio - expected).abs() <= 1e-3 * expected.max(1e-3));
        }
    }
}
