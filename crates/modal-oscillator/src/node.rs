//! Per-node modal resonator
//!
//! Each active mode evolves as `ȧ = (−γ_eff + iω)a + u(t)` and is integrated
//! with the exact exponential propagator, which stays stable for any step
//! size, tiny damping and the momentarily negative damping of a
//! self-oscillator.

use std::time::Duration;

use modal_core::{
    BoundedVec, ModalError, ModalResult, ModeParams, NodeConfig, NodeId, Personality, PokeEvent,
    MAX_MODES, MAX_NEIGHBORS, TIMBRE_MODE,
};
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{ExcitationEnvelope, Mode, NodeSnapshot, DEFAULT_ENVELOPE_SECS};

/// Fraction of a poke's strength added to each mode immediately
pub const KICK_FRACTION: f32 = 0.1;

/// Half-width of the initial state noise on each component
pub const INIT_NOISE: f32 = 0.005;

/// Amplitude sum that maps to full scale
const AMPLITUDE_NORM: f32 = 2.0;

/// Scale applied to the timbre mode's phase
const PHASE_MOD_DEPTH: f32 = 0.1;

/// Bank of up to four modes plus the node's run state
#[derive(Debug)]
pub struct ModalNode {
    id: NodeId,
    personality: Personality,
    modes: [Mode; MAX_MODES],
    envelope: Option<ExcitationEnvelope>,
    envelope_secs: f32,
    running: bool,
    steps: u64,
    elapsed_secs: f64,
    neighbors: BoundedVec<NodeId, MAX_NEIGHBORS>,
    coupling_strength: f32,
    carrier_freq_hz: f32,
    gain: f32,
    rng: StdRng,
}

impl ModalNode {
    /// Create a stopped node with all modes inactive
    pub fn new(id: NodeId, personality: Personality) -> Self {
        Self::from_rng(id, personality, StdRng::from_entropy())
    }

    /// Deterministic node for tests and simulation
    pub fn with_seed(id: NodeId, personality: Personality, seed: u64) -> Self {
        Self::from_rng(id, personality, StdRng::seed_from_u64(seed))
    }

    fn from_rng(id: NodeId, personality: Personality, mut rng: StdRng) -> Self {
        let modes = std::array::from_fn(|_| {
            let mut mode = Mode::new(ModeParams::inactive());
            mode.a = Complex32::new(
                rng.gen_range(-INIT_NOISE..INIT_NOISE),
                rng.gen_range(-INIT_NOISE..INIT_NOISE),
            );
            mode
        });

        ModalNode {
            id,
            personality,
            modes,
            envelope: None,
            envelope_secs: DEFAULT_ENVELOPE_SECS,
            running: false,
            steps: 0,
            elapsed_secs: 0.0,
            neighbors: BoundedVec::new(),
            coupling_strength: 0.3,
            carrier_freq_hz: 440.0,
            gain: 0.7,
            rng,
        }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn personality(&self) -> Personality {
        self.personality
    }

    pub fn set_personality(&mut self, personality: Personality) {
        self.personality = personality;
    }

    /// Set parameters of mode `index` and mark it active
    pub fn configure_mode(
        &mut self,
        index: usize,
        omega: f32,
        gamma: f32,
        weight: f32,
    ) -> ModalResult<()> {
        let mode = self.modes.get_mut(index).ok_or_else(|| {
            ModalError::InvalidConfig(format!("mode index {index} out of range"))
        })?;
        if !omega.is_finite() || !gamma.is_finite() || !weight.is_finite() {
            return Err(ModalError::InvalidConfig(format!(
                "mode {index} has a non-finite parameter"
            )));
        }
        mode.params = ModeParams {
            omega,
            gamma,
            weight: weight.clamp(0.0, 1.0),
            active: true,
        };
        Ok(())
    }

    /// Apply a validated node configuration
    ///
    /// Modal state and the running flag are left untouched.
    pub fn apply_config(&mut self, config: &NodeConfig) -> ModalResult<()> {
        self.id = config.id;
        self.personality = config.personality;
        for (k, params) in config.modes.iter().enumerate() {
            if params.active {
                self.configure_mode(k, params.omega, params.gamma, params.weight)?;
            } else {
                self.modes[k].params = ModeParams::inactive();
            }
        }
        self.neighbors = config.neighbors.clone();
        self.coupling_strength = config.coupling_strength;
        self.carrier_freq_hz = config.carrier_freq_hz;
        self.gain = config.gain;
        Ok(())
    }

    pub fn set_envelope_duration(&mut self, duration: Duration) {
        self.envelope_secs = duration.as_secs_f32().max(f32::EPSILON);
    }

    /// Start a new excitation envelope and kick every active mode
    ///
    /// A new poke replaces any envelope still in flight.
    pub fn apply_excitation(&mut self, event: &PokeEvent) {
        let envelope = ExcitationEnvelope::new(event, self.envelope_secs, &mut self.rng);

        for (k, mode) in self.modes.iter_mut().enumerate() {
            if !mode.is_active() {
                continue;
            }
            let kick = event.strength * event.mode_weights[k] * KICK_FRACTION;
            mode.kick(kick, envelope.phase(k));
        }

        self.envelope = Some(envelope);
    }

    /// Advance every active mode by `dt` seconds; no-op while stopped
    pub fn step(&mut self, dt: f32) {
        if !self.running || dt.is_nan() || dt <= 0.0 {
            return;
        }

        let envelope = self.envelope.as_ref();
        for (k, mode) in self.modes.iter_mut().enumerate() {
            if !mode.is_active() {
                continue;
            }
            let drive = envelope
                .map(|env| env.drive(k, mode.params.weight))
                .unwrap_or_default();
            mode.advance(self.personality, dt, drive);
        }

        if let Some(env) = self.envelope.as_mut() {
            if !env.advance(dt) {
                self.envelope = None;
            }
        }

        self.steps += 1;
        self.elapsed_secs += dt as f64;
    }

    /// Weighted amplitude of the active modes, in [0, 1]
    pub fn amplitude(&self) -> f32 {
        let total: f32 = self
            .modes
            .iter()
            .filter(|m| m.is_active())
            .map(|m| m.magnitude() * m.params.weight)
            .sum();
        (total / AMPLITUDE_NORM).clamp(0.0, 1.0)
    }

    /// Timbre modulation derived from the timbre mode's phase and magnitude
    pub fn phase_modulation(&self) -> f32 {
        let mode = &self.modes[TIMBRE_MODE];
        if !mode.is_active() {
            return 0.0;
        }
        mode.phase() * mode.magnitude() * PHASE_MOD_DEPTH
    }

    pub fn mode0(&self) -> Complex32 {
        self.modes[0].a
    }

    pub fn mode(&self, index: usize) -> Option<&Mode> {
        self.modes.get(index)
    }

    pub fn modes(&self) -> &[Mode; MAX_MODES] {
        &self.modes
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Zero modal state and drop any pending excitation; parameters stay
    pub fn reset(&mut self) {
        for mode in &mut self.modes {
            mode.clear();
        }
        self.envelope = None;
        self.steps = 0;
        self.elapsed_secs = 0.0;
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[inline]
    pub fn is_exciting(&self) -> bool {
        self.envelope.is_some()
    }

    #[inline]
    pub fn step_count(&self) -> u64 {
        self.steps
    }

    /// Integrated time since start or the last reset
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_secs)
    }

    pub fn neighbors(&self) -> &[NodeId] {
        &self.neighbors
    }

    pub fn coupling_strength(&self) -> f32 {
        self.coupling_strength
    }

    pub fn carrier_freq_hz(&self) -> f32 {
        self.carrier_freq_hz
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            amplitude: self.amplitude(),
            phase_modulation: self.phase_modulation(),
            mode0: self.mode0(),
            carrier_freq_hz: self.carrier_freq_hz,
            gain: self.gain,
            running: self.running,
            step: self.steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modal_core::{PhaseHint, DEFAULT_POKE_WEIGHTS};

    const DT: f32 = 0.002;

    fn configured(personality: Personality) -> ModalNode {
        let mut node = ModalNode::with_seed(NodeId(0), personality, 11);
        for (k, p) in ModeParams::default_bank().iter().enumerate() {
            node.configure_mode(k, p.omega, p.gamma, p.weight).unwrap();
        }
        node
    }

    #[test]
    fn test_initial_noise_is_small() {
        let node = ModalNode::with_seed(NodeId(1), Personality::Resonator, 3);
        for mode in node.modes() {
            assert!(mode.a.re.abs() <= INIT_NOISE && mode.a.im.abs() <= INIT_NOISE);
            assert!(!mode.is_active());
        }
        assert_eq!(node.amplitude(), 0.0);
    }

    #[test]
    fn test_configure_mode_bounds() {
        let mut node = ModalNode::with_seed(NodeId(0), Personality::Resonator, 0);
        assert!(node.configure_mode(MAX_MODES, 1.0, 1.0, 1.0).is_err());
        assert!(node.configure_mode(0, f32::NAN, 1.0, 1.0).is_err());
        node.configure_mode(3, 100.0, 0.2, 0.5).unwrap();
        assert!(node.mode(3).unwrap().is_active());
    }

    #[test]
    fn test_step_is_noop_when_stopped() {
        let mut node = configured(Personality::Resonator);
        let before = node.mode0();
        node.step(DT);
        assert_eq!(node.mode0(), before);
        assert_eq!(node.step_count(), 0);
    }

    #[test]
    fn test_poke_excites_then_decays() {
        let mut node = configured(Personality::Resonator);
        node.reset();
        node.start();
        node.apply_excitation(
            &PokeEvent::new(NodeId::HUB, 1.0).with_phase(PhaseHint::Fixed(0.0)),
        );

        // Kick is audible before the envelope has done anything
        let kicked = node.amplitude();
        assert!(kicked > 0.0);

        for _ in 0..6 {
            node.step(DT);
        }
        assert!(!node.is_exciting());
        let peak = node.amplitude();
        assert!(peak >= kicked * 0.9);

        // 10 s of free decay with the slowest mode at γ = 0.1
        for _ in 0..5000 {
            node.step(DT);
        }
        assert!(node.amplitude() < peak * 0.5);
        assert_eq!(node.step_count(), 5006);
    }

    #[test]
    fn test_kick_uses_poke_weights() {
        let mut node = configured(Personality::Resonator);
        node.reset();
        node.apply_excitation(
            &PokeEvent::new(NodeId::HUB, 1.0)
                .with_phase(PhaseHint::Fixed(0.0))
                .with_weights(DEFAULT_POKE_WEIGHTS),
        );
        for (k, w) in DEFAULT_POKE_WEIGHTS.iter().enumerate() {
            let a = node.mode(k).unwrap().a;
            assert!((a.re - w * KICK_FRACTION).abs() < 1e-6);
        }
    }

    #[test]
    fn test_self_oscillator_reaches_limit_cycle() {
        let mut node = ModalNode::with_seed(NodeId(0), Personality::SelfOscillator, 5);
        node.configure_mode(0, 2.0 * std::f32::consts::PI * 220.0, 1.0, 1.0)
            .unwrap();
        node.start();
        node.apply_excitation(
            &PokeEvent::new(NodeId::HUB, 0.2).with_phase(PhaseHint::Fixed(0.0)),
        );

        for _ in 0..10_000 {
            node.step(DT);
        }
        // Stable orbit where −γ + 3γ|a|² = 0
        let expected = (1.0f32 / 3.0).sqrt();
        assert!((node.mode0().norm() - expected).abs() < 0.01);
    }

    #[test]
    fn test_amplitude_clamped() {
        let mut node = configured(Personality::Resonator);
        for _ in 0..200 {
            node.apply_excitation(
                &PokeEvent::new(NodeId::HUB, 1.0).with_phase(PhaseHint::Fixed(0.0)),
            );
        }
        assert_eq!(node.amplitude(), 1.0);
    }

    #[test]
    fn test_reset_keeps_parameters() {
        let mut node = configured(Personality::Resonator);
        node.start();
        node.apply_excitation(&PokeEvent::new(NodeId::HUB, 1.0));
        node.step(DT);
        node.reset();

        assert_eq!(node.mode0(), Complex32::new(0.0, 0.0));
        assert!(!node.is_exciting());
        assert!(node.mode(0).unwrap().is_active());
        assert_eq!(node.step_count(), 0);
    }

    #[test]
    fn test_apply_config() {
        let mut node = ModalNode::with_seed(NodeId::UNASSIGNED, Personality::Resonator, 0);
        let mut cfg = NodeConfig::new(NodeId(4));
        cfg.personality = Personality::SelfOscillator;
        cfg.modes[3] = ModeParams::inactive();
        cfg.add_neighbor(NodeId(3)).unwrap();
        cfg.carrier_freq_hz = 520.0;

        node.apply_config(&cfg).unwrap();
        assert_eq!(node.id(), NodeId(4));
        assert_eq!(node.personality(), Personality::SelfOscillator);
        assert!(node.mode(0).unwrap().is_active());
        assert!(!node.mode(3).unwrap().is_active());
        assert_eq!(node.neighbors(), &[NodeId(3)]);
        assert_eq!(node.snapshot().carrier_freq_hz, 520.0);
    }

    #[test]
    fn test_phase_modulation_zero_without_timbre_mode() {
        let node = ModalNode::with_seed(NodeId(0), Personality::Resonator, 1);
        assert_eq!(node.phase_modulation(), 0.0);
    }
}
