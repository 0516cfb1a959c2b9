//! Exact noise predictor for gaussian data.
//!
//! When every element of the data is drawn from `N(mean, std²)`, the optimal
//! noise prediction has a closed form. For `x_t = sqrt(ab) x0 + sqrt(1 - ab) eps`:
//!
//! `E[eps | x_t] = sqrt(1 - ab) (x_t - sqrt(ab) mean) / (ab std² + 1 - ab)`
//!
//! Running the reverse process with this predictor reproduces the data
//! distribution, which makes it a convenient stand-in for a trained network.
use super::Denoiser;
use crate::error::{Error, Result};
use crate::schedulers::ddpm::{batch_size, gather, NoiseSchedule};
use tch::{Kind, Tensor};

#[derive(Debug, Clone)]
pub struct GaussianDenoiser<'a> {
    schedule: &'a NoiseSchedule,
    means: Vec<f64>,
    std: f64,
}

impl<'a> GaussianDenoiser<'a> {
    /// A single gaussian, the condition is ignored.
    pub fn new(schedule: &'a NoiseSchedule, mean: f64, std: f64) -> Result<Self> {
        Self::with_class_means(schedule, vec![mean], std)
    }

    /// One gaussian per class, all sharing the same standard deviation. The
    /// condition passed at prediction time holds the class index of each
    /// sample.
    ///
    /// Without a condition, the data is approximated by a single gaussian
    /// centered on the average of the class means.
    pub fn with_class_means(
        schedule: &'a NoiseSchedule,
        means: Vec<f64>,
        std: f64,
    ) -> Result<Self> {
        if means.is_empty() {
            return Err(Error::InvalidConfiguration("at least one mean is required".to_string()));
        }
        if !(std > 0.) || !std.is_finite() {
            return Err(Error::InvalidConfiguration(format!(
                "the standard deviation must be positive, got {std}"
            )));
        }
        Ok(Self { schedule, means, std })
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    pub fn std(&self) -> f64 {
        self.std
    }

    pub fn unconditional_mean(&self) -> f64 {
        self.means.iter().sum::<f64>() / self.means.len() as f64
    }

    fn class_means(&self, condition: &Tensor, xs: &Tensor, batch: i64) -> anyhow::Result<Tensor> {
        crate::error::check_shape("condition", &[batch], &condition.size())?;
        let classes = condition.to_kind(Kind::Int64);
        if batch > 0 {
            let n_classes = self.means.len() as i64;
            for class in [classes.min().int64_value(&[]), classes.max().int64_value(&[])] {
                if class < 0 || class >= n_classes {
                    anyhow::bail!("class index {class} is out of range for {n_classes} classes")
                }
            }
        }
        Ok(gather(&self.means, &classes, xs))
    }
}

impl Denoiser for GaussianDenoiser<'_> {
    fn predict_noise(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        condition: Option<&Tensor>,
    ) -> anyhow::Result<Tensor> {
        let batch = batch_size("xs", xs)?;
        self.schedule.check_timesteps(timesteps, batch, 0)?;
        let alpha_prod = gather(self.schedule.alphas_cumprod(), timesteps, xs);
        let signal = match condition {
            Some(condition) if self.means.len() > 1 => {
                alpha_prod.sqrt() * self.class_means(condition, xs, batch)?
            }
            _ => alpha_prod.sqrt() * self.unconditional_mean(),
        };
        let one_minus_alpha_prod: Tensor = 1. - &alpha_prod;
        let denominator = &alpha_prod * (self.std * self.std) + &one_minus_alpha_prod;
        Ok(one_minus_alpha_prod.sqrt() * (xs - signal) / denominator)
    }
}
