//! Lossy links between simulated replicas
//!
//! A `ChaosLink` carries any cloneable message and misbehaves the way a
//! real session transport does:
//! - Jitter
//! - Loss, including bursts
//! - Reordering
//! - Duplication

use std::collections::VecDeque;
use std::time::Duration;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Jitter distribution type
#[derive(Clone, Debug)]
pub enum JitterDistribution {
    /// Uniform distribution
    Uniform { min_ms: u32, max_ms: u32 },
    /// Normal distribution (mean, stddev)
    Normal { mean_ms: f64, stddev_ms: f64 },
    /// Pareto distribution (heavy tail)
    Pareto { scale_ms: f64, shape: f64 },
}

impl JitterDistribution {
    /// Sample a jitter value
    pub fn sample(&self, rng: &mut StdRng) -> Duration {
        match self {
            JitterDistribution::Uniform { min_ms, max_ms } => {
                if min_ms >= max_ms {
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
                // Cap at 1 second
                Duration::from_millis(value.min(1000.0) as u64)
            }
        }
    }
}

/// Link misbehaviour configuration
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Base latency
    pub base_latency: Duration,
    /// Jitter distribution
    pub jitter: JitterDistribution,
    /// Message loss rate (0.0 - 1.0)
    pub loss_rate: f64,
    /// Burst loss probability
    pub burst_loss_prob: f64,
    /// Burst loss length range
    pub burst_length: (u32, u32),
    /// Reorder probability
    pub reorder_prob: f64,
    /// Reorder depth (max messages jumped)
    pub reorder_depth: u32,
    /// Duplicate probability
    pub duplicate_prob: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosConfig {
            base_latency: Duration::from_millis(50),
            jitter: JitterDistribution::Uniform {
                min_ms: 0,
                max_ms: 50,
            },
            loss_rate: 0.01,
            burst_loss_prob: 0.01,
            burst_length: (2, 5),
            reorder_prob: 0.05,
            reorder_depth: 3,
            duplicate_prob: 0.01,
        }
    }
}

impl ChaosConfig {
    /// Perfect link: fixed latency, nothing lost, reordered or duplicated
    pub fn reliable() -> Self {
        ChaosConfig {
            base_latency: Duration::from_millis(10),
            jitter: JitterDistribution::Uniform {
                min_ms: 0,
                max_ms: 0,
            },
            loss_rate: 0.0,
            burst_loss_prob: 0.0,
            burst_length: (0, 0),
            reorder_prob: 0.0,
            reorder_depth: 0,
            duplicate_prob: 0.0,
        }
    }

    /// Good home connection
    pub fn good() -> Self {
        ChaosConfig {
            base_latency: Duration::from_millis(20),
            jitter: JitterDistribution::Uniform {
                min_ms: 0,
                max_ms: 10,
            },
            loss_rate: 0.001,
            burst_loss_prob: 0.001,
            burst_length: (1, 2),
            reorder_prob: 0.01,
            reorder_depth: 2,
            duplicate_prob: 0.001,
        }
    }

    /// Congested connection
    pub fn poor() -> Self {
        ChaosConfig {
            base_latency: Duration::from_millis(100),
            jitter: JitterDistribution::Normal {
                mean_ms: 60.0,
                stddev_ms: 40.0,
            },
            loss_rate: 0.05,
            burst_loss_prob: 0.02,
            burst_length: (3, 8),
            reorder_prob: 0.1,
            reorder_depth: 5,
            duplicate_prob: 0.02,
        }
    }

    /// Mobile connection that keeps dropping out
    pub fn hostile() -> Self {
        ChaosConfig {
            base_latency: Duration::from_millis(200),
            jitter: JitterDistribution::Pareto {
                scale_ms: 100.0,
                shape: 1.2,
            },
            loss_rate: 0.15,
            burst_loss_prob: 0.05,
            burst_length: (5, 15),
            reorder_prob: 0.2,
            reorder_depth: 10,
            duplicate_prob: 0.05,
        }
    }
}

/// Message in flight
#[derive(Clone, Debug)]
struct InFlight<T> {
    message: T,
    /// Scheduled delivery time (relative to start)
    delivery_time: Duration,
    send_time: Duration,
}

/// Link statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub sent: u64,
    pub delivered: u64,
    pub lost: u64,
    pub reordered: u64,
    pub duplicated: u64,
    pub total_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl ChaosStats {
    pub fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.sent as f64
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.delivered == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.delivered as f64
        }
    }

    /// Accumulate another link's counters
    pub fn absorb(&mut self, other: &ChaosStats) {
        self.sent += other.sent;
        self.delivered += other.delivered;
        self.lost += other.lost;
        self.reordered += other.reordered;
        self.duplicated += other.duplicated;
        self.total_latency_ms += other.total_latency_ms;
        self.max_latency_ms = self.max_latency_ms.max(other.max_latency_ms);
    }
}

/// One-way lossy link
pub struct ChaosLink<T> {
    config: ChaosConfig,
    rng: StdRng,
    in_flight: VecDeque<InFlight<T>>,
    current_time: Duration,
    burst_remaining: u32,
    stats: ChaosStats,
}

impl<T: Clone> ChaosLink<T> {
    /// Create a link with a fixed seed
    pub fn new(config: ChaosConfig, seed: u64) -> Self {
        ChaosLink {
            config,
            rng: StdRng::seed_from_u64(seed),
            in_flight: VecDeque::new(),
            current_time: Duration::ZERO,
            burst_remaining: 0,
            stats: ChaosStats::default(),
        }
    }

    /// Put a message on the link
    pub fn send(&mut self, message: T) {
        self.stats.sent += 1;

        if self.should_drop() {
            self.stats.lost += 1;
            return;
        }

        let jitter = self.config.jitter.sample(&mut self.rng);
        let delivery_time = self.current_time + self.config.base_latency + jitter;

        if self.rng.gen::<f64>() < self.config.duplicate_prob {
            let extra = self.config.jitter.sample(&mut self.rng);
            self.in_flight.push_back(InFlight {
                message: message.clone(),
                delivery_time: delivery_time + extra,
                send_time: self.current_time,
            });
            self.stats.duplicated += 1;
        }

        let packet = InFlight {
            message,
            delivery_time,
            send_time: self.current_time,
        };

        if self.rng.gen::<f64>() < self.config.reorder_prob && !self.in_flight.is_empty() {
            // Jump ahead of up to `reorder_depth` queued messages
            let depth = self.config.reorder_depth.min(self.in_flight.len() as u32);
            let pos = self.rng.gen_range(0..=depth) as usize;
            let insert_at = self.in_flight.len().saturating_sub(pos);
            let earliest = self
                .in_flight
                .get(insert_at)
                .map_or(packet.delivery_time, |p| p.delivery_time.min(packet.delivery_time));
            self.in_flight.insert(
                insert_at,
                InFlight {
                    delivery_time: earliest,
                    ..packet
                },
            );
            self.stats.reordered += 1;
        } else {
            self.in_flight.push_back(packet);
        }
    }

    fn should_drop(&mut self) -> bool {
        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
            return true;
        }

        if self.rng.gen::<f64>() < self.config.burst_loss_prob {
            let (min, max) = self.config.burst_length;
            self.burst_remaining = self.rng.gen_range(min..=max.max(min));
            return true;
        }

        self.rng.gen::<f64>() < self.config.loss_rate
    }

    /// Advance time and collect delivered messages, in link order
    pub fn tick(&mut self, dt: Duration) -> Vec<T> {
        self.current_time += dt;
        let now = self.current_time;

        let mut delivered = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.in_flight.len());
        for packet in self.in_flight.drain(..) {
            if packet.delivery_time <= now {
                let latency = (packet.delivery_time.saturating_sub(packet.send_time)).as_millis() as u64;
                self.stats.delivered += 1;
                self.stats.total_latency_ms += latency;
                self.stats.max_latency_ms = self.stats.max_latency_ms.max(latency);
                delivered.push(packet.message);
            } else {
                waiting.push_back(packet);
            }
        }
        self.in_flight = waiting;

        delivered
    }

    /// Deliver everything still in flight
    pub fn flush(&mut self) -> Vec<T> {
        let horizon = self
            .in_flight
            .iter()
            .map(|p| p.delivery_time.saturating_sub(self.current_time))
            .max()
            .unwrap_or(Duration::ZERO);
        self.tick(horizon)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &ChaosStats {
        &self.stats
    }

    pub fn current_time(&self) -> Duration {
        self.current_time
    }
}
