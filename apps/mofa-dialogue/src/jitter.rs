//! Seedable randomness for prosody jitter and conversational overlap

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::error::ConfigError;

/// Closed interval a value is drawn from uniformly
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

impl Band {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// A band that always yields `value`
    pub const fn fixed(value: f64) -> Self {
        Self::new(value, value)
    }

    pub fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        if !(self.min <= self.max) {
            return Err(ConfigError::InvalidBand {
                name,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Shared random source; a fixed seed makes every draw reproducible
pub struct Jitter {
    rng: Mutex<StdRng>,
}

impl Jitter {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }

    /// Draw uniformly from `band` (inclusive)
    pub fn sample(&self, band: Band) -> f64 {
        if band.min >= band.max {
            return band.min;
        }
        self.rng.lock().gen_range(band.min..=band.max)
    }
}

impl std::fmt::Debug for Jitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jitter").finish_non_exhaustive()
    }
}
