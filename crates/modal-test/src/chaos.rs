//! Chaos link for mesh testing
//!
//! Wraps any [`Link`] and degrades its outbound traffic:
//! - Jitter (which also reorders datagrams)
//! - Random and burst loss
//! - Duplication
//!
//! All randomness comes from a seeded [`StdRng`], so a run is reproducible
//! up to scheduler timing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use modal_core::{LinkAddr, ModalResult};
use modal_transport::{Destination, Link};

/// Jitter distribution type
#[derive(Clone, Debug, PartialEq)]
pub enum JitterDistribution {
    None,
    Uniform { min_ms: u32, max_ms: u32 },
    /// Normal distribution (mean, stddev)
    Normal { mean_ms: f64, stddev_ms: f64 },
    /// Heavy tail
    Pareto { scale_ms: f64, shape: f64 },
}

impl JitterDistribution {
    pub fn sample(&self, rng: &mut StdRng) -> Duration {
        match self {
            JitterDistribution::None => Duration::ZERO,
            JitterDistribution::Uniform { min_ms, max_ms } => {
                if max_ms <= min_ms {
                    return Duration::from_millis(u64::from(*min_ms));
                }
                let dist = Uniform::new(*min_ms, *max_ms);
                Duration::from_millis(u64::from(dist.sample(rng)))
            }
            JitterDistribution::Normal { mean_ms, stddev_ms } => {
                // Box-Muller
                let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
                let u2: f64 = rng.gen();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                let value = mean_ms + stddev_ms * z;
                Duration::from_millis(value.max(0.0) as u64)
            }
            JitterDistribution::Pareto { scale_ms, shape } => {
                let u: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
                let value = scale_ms / u.powf(1.0 / shape);
                Duration::from_millis(value.min(1000.0) as u64)
            }
        }
    }
}

/// Link degradation settings
#[derive(Clone, Debug, PartialEq)]
pub struct ChaosConfig {
    pub jitter: JitterDistribution,
    /// Independent loss probability (0.0 - 1.0)
    pub loss_rate: f64,
    /// Probability that a loss starts a burst
    pub burst_loss_prob: f64,
    /// Burst length range, in datagrams
    pub burst_length: (u32, u32),
    pub duplicate_prob: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl ChaosConfig {
    /// Pass-through
    pub fn none() -> Self {
        ChaosConfig {
            jitter: JitterDistribution::None,
            loss_rate: 0.0,
            burst_loss_prob: 0.0,
            burst_length: (1, 1),
            duplicate_prob: 0.0,
        }
    }

    /// Quiet wired LAN
    pub fn good() -> Self {
        ChaosConfig {
            jitter: JitterDistribution::Uniform {
                min_ms: 0,
                max_ms: 2,
            },
            loss_rate: 0.001,
            burst_loss_prob: 0.0,
            burst_length: (1, 1),
            duplicate_prob: 0.001,
        }
    }

    /// Busy radio channel
    pub fn lossy() -> Self {
        ChaosConfig {
            jitter: JitterDistribution::Normal {
                mean_ms: 3.0,
                stddev_ms: 2.0,
            },
            loss_rate: 0.05,
            burst_loss_prob: 0.2,
            burst_length: (2, 4),
            duplicate_prob: 0.05,
        }
    }

    /// Congested radio channel with heavy-tailed delay
    pub fn hostile() -> Self {
        ChaosConfig {
            jitter: JitterDistribution::Pareto {
                scale_ms: 5.0,
                shape: 1.5,
            },
            loss_rate: 0.15,
            burst_loss_prob: 0.3,
            burst_length: (3, 8),
            duplicate_prob: 0.1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub sent: u64,
    pub delivered: u64,
    pub lost: u64,
    pub duplicated: u64,
    pub delayed: u64,
    pub max_delay_ms: u64,
}

impl ChaosStats {
    pub fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.sent as f64
        }
    }
}

/// Fate of one outbound datagram
#[derive(Clone, Debug, PartialEq, Eq)]
enum Fate {
    Lost,
    /// Delays of each delivered copy
    Deliver(Vec<Duration>),
}

struct ChaosState {
    config: ChaosConfig,
    rng: StdRng,
    burst_remaining: u32,
    stats: ChaosStats,
}

impl ChaosState {
    fn should_drop(&mut self) -> bool {
        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
            return true;
        }
        if self.rng.gen::<f64>() < self.config.loss_rate {
            if self.rng.gen::<f64>() < self.config.burst_loss_prob {
                let (min, max) = self.config.burst_length;
                self.burst_remaining = self.rng.gen_range(min..=max.max(min)).saturating_sub(1);
            }
            return true;
        }
        false
    }

    fn decide(&mut self) -> Fate {
        self.stats.sent += 1;
        if self.should_drop() {
            self.stats.lost += 1;
            return Fate::Lost;
        }

        let mut delays = vec![self.config.jitter.sample(&mut self.rng)];
        if self.rng.gen::<f64>() < self.config.duplicate_prob {
            let extra = self.config.jitter.sample(&mut self.rng);
            delays.push(delays[0] + extra);
            self.stats.duplicated += 1;
        }
        for delay in &delays {
            self.stats.delivered += 1;
            if !delay.is_zero() {
                self.stats.delayed += 1;
                self.stats.max_delay_ms = self.stats.max_delay_ms.max(delay.as_millis() as u64);
            }
        }
        Fate::Deliver(delays)
    }
}

/// A [`Link`] whose sends pass through a seeded loss/jitter model
///
/// Delayed copies are sent from spawned tasks, so a send never waits for
/// its own jitter and later datagrams can overtake earlier ones.
pub struct ChaosLink<L: Link> {
    inner: Arc<L>,
    state: Mutex<ChaosState>,
}

impl<L: Link> ChaosLink<L> {
    pub fn new(inner: L, config: ChaosConfig, seed: u64) -> Self {
        ChaosLink {
            inner: Arc::new(inner),
            state: Mutex::new(ChaosState {
                config,
                rng: StdRng::seed_from_u64(seed),
                burst_remaining: 0,
                stats: ChaosStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> ChaosStats {
        self.state.lock().stats.clone()
    }

    /// Change conditions mid-run
    pub fn set_config(&self, config: ChaosConfig) {
        let mut state = self.state.lock();
        state.config = config;
        state.burst_remaining = 0;
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

impl<L: Link> Link for ChaosLink<L> {
    async fn send(&self, dest: Destination, bytes: &[u8]) -> ModalResult<()> {
        let fate = self.state.lock().decide();
        let Fate::Deliver(delays) = fate else {
            return Ok(());
        };

        for delay in delays {
            if delay.is_zero() {
                self.inner.send(dest, bytes).await?;
            } else {
                let inner = self.inner.clone();
                let bytes = bytes.to_vec();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inner.send(dest, &bytes).await;
                });
            }
        }
        Ok(())
    }

    async fn recv(&self) -> ModalResult<(Vec<u8>, LinkAddr)> {
        self.inner.recv().await
    }

    fn local_addr(&self) -> LinkAddr {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modal_transport::MemoryMesh;
    use proptest::prelude::*;

    fn state(config: ChaosConfig, seed: u64) -> ChaosState {
        ChaosState {
            config,
            rng: StdRng::seed_from_u64(seed),
            burst_remaining: 0,
            stats: ChaosStats::default(),
        }
    }

    #[test]
    fn test_none_is_passthrough() {
        let mut s = state(ChaosConfig::none(), 1);
        for _ in 0..1000 {
            assert_eq!(s.decide(), Fate::Deliver(vec![Duration::ZERO]));
        }
        assert_eq!(s.stats.delivered, 1000);
        assert_eq!(s.stats.loss_rate(), 0.0);
    }

    #[test]
    fn test_hostile_loses_packets() {
        let mut s = state(ChaosConfig::hostile(), 12345);
        for _ in 0..2000 {
            s.decide();
        }
        assert!(s.stats.loss_rate() > 0.1);
        assert!(s.stats.duplicated > 0);
        assert!(s.stats.max_delay_ms >= 5);
    }

    #[test]
    fn test_seed_is_reproducible() {
        let mut a = state(ChaosConfig::lossy(), 7);
        let mut b = state(ChaosConfig::lossy(), 7);
        for _ in 0..500 {
            assert_eq!(a.decide(), b.decide());
        }
    }

    #[test]
    fn test_pareto_heavy_tail() {
        let mut rng = StdRng::seed_from_u64(42);
        let pareto = JitterDistribution::Pareto {
            scale_ms: 50.0,
            shape: 1.5,
        };
        let samples: Vec<u128> = (0..1000).map(|_| pareto.sample(&mut rng).as_millis()).collect();
        let avg = samples.iter().sum::<u128>() / 1000;
        let max = samples.iter().copied().max().unwrap_or(0);
        assert!(max > avg * 2);
    }

    proptest! {
        #[test]
        fn prop_every_send_is_accounted(
            seed in any::<u64>(),
            loss in 0.0f64..1.0,
            burst in 0.0f64..1.0,
            dup in 0.0f64..1.0,
        ) {
            let config = ChaosConfig {
                jitter: JitterDistribution::Uniform { min_ms: 0, max_ms: 10 },
                loss_rate: loss,
                burst_loss_prob: burst,
                burst_length: (2, 5),
                duplicate_prob: dup,
            };
            let mut s = state(config, seed);
            for _ in 0..200 {
                s.decide();
            }
            let stats = &s.stats;
            prop_assert_eq!(stats.sent, 200);
            prop_assert_eq!(stats.lost + stats.delivered - stats.duplicated, stats.sent);
            prop_assert!(stats.delayed <= stats.delivered);
            prop_assert!(stats.max_delay_ms <= 20);
        }
    }

    #[tokio::test]
    async fn test_total_loss_delivers_nothing() {
        let mesh = MemoryMesh::new();
        let config = ChaosConfig {
            loss_rate: 1.0,
            ..ChaosConfig::none()
        };
        let sender = ChaosLink::new(mesh.link(), config, 3);
        let receiver = mesh.link();

        for _ in 0..10 {
            sender.send(Destination::Broadcast, &[1, 2, 3]).await.unwrap();
        }
        sender.set_config(ChaosConfig::none());
        sender.send(Destination::Broadcast, &[9]).await.unwrap();

        let (bytes, from) = receiver.recv().await.unwrap();
        assert_eq!(bytes, vec![9]);
        assert_eq!(from, sender.local_addr());
        assert_eq!(sender.stats().lost, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_delays_delivery() {
        let mesh = MemoryMesh::new();
        let config = ChaosConfig {
            jitter: JitterDistribution::Uniform {
                min_ms: 30,
                max_ms: 30,
            },
            ..ChaosConfig::none()
        };
        let sender = ChaosLink::new(mesh.link(), config, 3);
        let receiver = mesh.link();

        let start = tokio::time::Instant::now();
        sender.send(Destination::Broadcast, &[7]).await.unwrap();
        let (bytes, _) = receiver.recv().await.unwrap();
        assert_eq!(bytes, vec![7]);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
