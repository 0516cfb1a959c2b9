//! # Noise schedules
//!
//! The schedule fixes how much noise gets mixed with the data at each
//! diffusion step. It is computed once and then shared, read-only, by the
//! training objective and the sampling loop.
use crate::error::{Error, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub mod ddpm;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear interpolation.
    #[default]
    Linear,
    /// Linear interpolation of the square root of beta.
    ScaledLinear,
}

/// The configuration for a [`ddpm::NoiseSchedule`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NoiseScheduleConfig {
    /// Number of diffusion steps, `T`.
    pub train_timesteps: usize,
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
}

impl Default for NoiseScheduleConfig {
    fn default() -> Self {
        Self {
            train_timesteps: 400,
            beta_start: 1e-4,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::Linear,
        }
    }
}

impl NoiseScheduleConfig {
    /// Reads a TOML configuration file, missing keys take their default value
    /// and unknown keys are rejected.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = crate::utils::read_to_string(path)?;
        Self::from_toml_str(&content)
            .with_context(|| format!("error parsing {:?}", path.to_string_lossy()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Checks `T >= 1` and `0 < beta_start < beta_end < 1`.
    pub fn validate(&self) -> Result<()> {
        if self.train_timesteps < 1 {
            return Err(Error::InvalidConfiguration(
                "the number of diffusion steps must be at least 1".to_string(),
            ));
        }
        // T + 1 values are indexed with i64 tensors.
        if i64::try_from(self.train_timesteps).ok().and_then(|t| t.checked_add(1)).is_none() {
            return Err(Error::InvalidConfiguration(format!(
                "too many diffusion steps, got {}",
                self.train_timesteps
            )));
        }
        for (name, beta) in [("beta_start", self.beta_start), ("beta_end", self.beta_end)] {
            // also rejects NaN
            if !(beta > 0. && beta < 1.) {
                return Err(Error::InvalidConfiguration(format!(
                    "{name} must be in (0, 1), got {beta}"
                )));
            }
        }
        if self.beta_start >= self.beta_end {
            return Err(Error::InvalidConfiguration(format!(
                "beta_start ({}) must be lower than beta_end ({})",
                self.beta_start, self.beta_end
            )));
        }
        Ok(())
    }
}
