//! Uniform random draws used by the scheduling rules.
//!
//! `U[0, X)` is a uniform integer draw in microseconds; `X = 0` means no
//! randomization is added. Behind a trait so tests can pin the draw
//! instead of depending on `rand`.

use rand::Rng;
use std::time::Duration;

pub trait Jitter {
    /// Draws a uniform random duration in `[0, bound)`. `bound == 0` must
    /// return `Duration::ZERO`.
    fn uniform(&mut self, bound: Duration) -> Duration;
}

/// The real source, backed by the thread-local RNG.
#[derive(Debug, Default)]
pub struct SystemJitter;

impl Jitter for SystemJitter {
    fn uniform(&mut self, bound: Duration) -> Duration {
        if bound.is_zero() {
            return Duration::ZERO;
        }
        let micros = bound.as_micros();
        let draw = rand::rng().random_range(0..micros);
        Duration::from_micros(draw as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_bound_is_never_random() {
        let mut j = SystemJitter;
        assert_eq!(j.uniform(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn draw_is_within_bound() {
        let mut j = SystemJitter;
        let bound = Duration::from_millis(500);
        for _ in 0..100 {
            let d = j.uniform(bound);
            assert!(d < bound);
        }
    }
}
