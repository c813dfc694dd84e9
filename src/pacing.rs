//! Adaptive inter-batch pacing.
//!
//! Backs off multiplicatively after a block and recovers gradually over
//! clean batches, never going below the configured base delay.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Delay between batches at normal pace.
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
    /// Delay between task starts within a wave, per position.
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_recovery_multiplier")]
    pub recovery_multiplier: f64,
    #[serde(default = "default_max_multiplier")]
    pub max_multiplier: f64,
}

fn default_inter_batch_delay_ms() -> u64 {
    3000
}

fn default_stagger_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_recovery_multiplier() -> f64 {
    0.75
}

fn default_max_multiplier() -> f64 {
    8.0
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            stagger_ms: default_stagger_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            recovery_multiplier: default_recovery_multiplier(),
            max_multiplier: default_max_multiplier(),
        }
    }
}

/// Pacing state owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct Pacing {
    config: PacingConfig,
    multiplier: f64,
    blocks: u32,
}

impl Pacing {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            multiplier: 1.0,
            blocks: 0,
        }
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Blocks seen this run.
    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    fn scale(&self, base_ms: u64) -> Duration {
        Duration::from_millis((base_ms as f64 * self.multiplier).round() as u64)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        self.scale(self.config.inter_batch_delay_ms)
    }

    /// Start offset of the `index`-th task of a wave.
    pub fn stagger(&self, index: usize) -> Duration {
        self.scale(self.config.stagger_ms) * index as u32
    }

    pub fn on_block(&mut self) {
        self.blocks += 1;
        let max = self.config.max_multiplier.max(1.0);
        self.multiplier = (self.multiplier * self.config.backoff_multiplier.max(1.0)).min(max);
        warn!("Blocked; pacing multiplier now {:.2}", self.multiplier);
    }

    /// A batch finished without any block.
    pub fn on_clean_batch(&mut self) {
        if self.multiplier <= 1.0 {
            return;
        }
        let recovery = self.config.recovery_multiplier.clamp(0.0, 1.0);
        self.multiplier = (self.multiplier * recovery).max(1.0);
        if self.multiplier <= 1.0 {
            info!("Pacing recovered to normal");
        } else {
            debug!("Pacing multiplier reduced to {:.2}", self.multiplier);
        }
    }

    /// Random cooldown within `(min, max)`.
    pub fn cooldown(range: (Duration, Duration)) -> Duration {
        let (min, max) = range;
        if max <= min {
            return min;
        }
        let ms = rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(ms)
    }

    pub async fn wait_between_batches(&self) {
        let delay = self.inter_batch_delay();
        if !delay.is_zero() {
            debug!("Waiting {:?} before next batch", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacing() -> Pacing {
        Pacing::new(PacingConfig {
            inter_batch_delay_ms: 1000,
            stagger_ms: 100,
            backoff_multiplier: 2.0,
            recovery_multiplier: 0.5,
            max_multiplier: 4.0,
        })
    }

    #[test]
    fn blocks_back_off_up_to_the_cap() {
        let mut pacing = pacing();
        pacing.on_block();
        assert_eq!(pacing.inter_batch_delay(), Duration::from_secs(2));
        pacing.on_block();
        pacing.on_block();
        assert_eq!(pacing.multiplier(), 4.0);
        assert_eq!(pacing.blocks(), 3);
        assert_eq!(pacing.stagger(2), Duration::from_millis(800));
    }

    #[test]
    fn clean_batches_recover_to_base() {
        let mut pacing = pacing();
        pacing.on_block();
        pacing.on_block();
        pacing.on_clean_batch();
        assert_eq!(pacing.multiplier(), 2.0);
        pacing.on_clean_batch();
        pacing.on_clean_batch();
        assert_eq!(pacing.multiplier(), 1.0);
        assert_eq!(pacing.inter_batch_delay(), Duration::from_secs(1));
    }

    #[test]
    fn cooldown_stays_in_range() {
        let range = (Duration::from_secs(30), Duration::from_secs(120));
        for _ in 0..50 {
            let d = Pacing::cooldown(range);
            assert!(d >= range.0 && d <= range.1);
        }
        assert_eq!(
            Pacing::cooldown((Duration::from_secs(5), Duration::from_secs(5))),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waits_the_scaled_delay() {
        let mut pacing = pacing();
        pacing.on_block();
        let start = tokio::time::Instant::now();
        pacing.wait_between_batches().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
