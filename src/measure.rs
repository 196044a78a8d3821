//! Measurement acquisition seam.
//!
//! The scan does not care what is being measured at each grid cell; it asks
//! a [`MeasurementSource`] for one scalar per cell. Photodiode, lock-in or
//! counter frontends plug in here.

use crate::error::AptResult;
use async_trait::async_trait;
use rand::Rng;

/// Supplies one measurement value per grid cell.
#[async_trait]
pub trait MeasurementSource: Send {
    async fn acquire(&mut self) -> AptResult<f64>;
}

/// Uniform random values, for demos and tests without a detector attached.
pub struct SimulatedSource {
    lo: f64,
    hi: f64,
}

impl SimulatedSource {
    /// Source drawing uniformly from `[lo, hi)`. Requires `lo < hi`.
    pub fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new(0.0, 100.0)
    }
}

#[async_trait]
impl MeasurementSource for SimulatedSource {
    async fn acquire(&mut self) -> AptResult<f64> {
        Ok(rand::thread_rng().gen_range(self.lo..self.hi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_source_stays_in_range() {
        let mut source = SimulatedSource::new(1.0, 2.0);
        for _ in 0..100 {
            let value = source.acquire().await.unwrap();
            assert!((1.0..2.0).contains(&value));
        }
    }
}
