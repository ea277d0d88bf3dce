use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Per-peer source of randomized election timeouts.
///
/// Each peer owns one, so no generator is shared between tasks or peers.
#[derive(Debug)]
pub struct ElectionTimer {
    base_ms: u64,
    rng: StdRng,
}

impl ElectionTimer {
    pub fn new(base_ms: u64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { base_ms, rng }
    }

    /// Draws a timeout in `[T, 2T)` where `T` is the base timeout
    pub fn next_timeout(&mut self) -> Duration {
        let timeout_ms = self.rng.gen_range(self.base_ms..self.base_ms * 2);
        Duration::from_millis(timeout_ms)
    }
}
