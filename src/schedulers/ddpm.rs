//! # Denoising Diffusion Probabilistic Models
//!
//! The forward process gradually corrupts a clean sample with gaussian noise
//! over `T` steps, the reverse process learns to undo it one step at a time.
//! Both are parameterized by the fixed schedule defined here.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
use super::{BetaSchedule, NoiseScheduleConfig};
use crate::error::{check_shape, Error, Result};
use tch::{Device, Kind, Tensor};

/// A precomputed DDPM noise schedule.
///
/// Every sequence is indexed by the timestep and holds `T + 1` values, index
/// `0` standing for the clean data. The schedule never changes after
/// construction and can be shared freely between threads.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    log_alphas_cumsum: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    one_over_sqrt_alphas: Vec<f64>,
    eps_coeffs: Vec<f64>,
    sigmas: Vec<f64>,
    timesteps: Vec<usize>,
    config: NoiseScheduleConfig,
}

impl NoiseSchedule {
    /// Creates a linear schedule with `train_timesteps` steps, beta going from
    /// `beta_start` to `beta_end`.
    pub fn new(train_timesteps: usize, beta_start: f64, beta_end: f64) -> Result<Self> {
        let config = NoiseScheduleConfig {
            train_timesteps,
            beta_start,
            beta_end,
            beta_schedule: BetaSchedule::Linear,
        };
        Self::from_config(&config)
    }

    pub fn from_config(config: &NoiseScheduleConfig) -> Result<Self> {
        config.validate()?;
        let steps = config.train_timesteps as i64 + 1;
        let options = (Kind::Double, Device::Cpu);
        let betas = match config.beta_schedule {
            BetaSchedule::Linear => {
                Tensor::linspace(config.beta_start, config.beta_end, steps, options)
            }
            BetaSchedule::ScaledLinear => Tensor::linspace(
                config.beta_start.sqrt(),
                config.beta_end.sqrt(),
                steps,
                options,
            )
            .square(),
        };
        let alphas: Tensor = 1. - &betas;
        // alpha-bar = exp(cumsum(ln(alpha))), index 0 is the clean sample.
        let log_alphas_cumsum = alphas.log().cumsum(0, Kind::Double);
        let mut alphas_cumprod = Vec::<f64>::try_from(&log_alphas_cumsum.exp())?;
        alphas_cumprod[0] = 1.;

        let betas = Vec::<f64>::try_from(&betas)?;
        let alphas = Vec::<f64>::try_from(&alphas)?;
        let log_alphas_cumsum = Vec::<f64>::try_from(&log_alphas_cumsum)?;

        let sqrt_alphas_cumprod: Vec<f64> = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod: Vec<f64> =
            alphas_cumprod.iter().map(|a| (1. - a).sqrt()).collect();
        let one_over_sqrt_alphas: Vec<f64> = alphas.iter().map(|a| 1. / a.sqrt()).collect();
        let eps_coeffs = alphas
            .iter()
            .zip(sqrt_one_minus_alphas_cumprod.iter())
            .enumerate()
            .map(|(t, (a, s))| if t == 0 { 0. } else { (1. - a) / s })
            .collect();
        let sigmas = betas.iter().map(|b| b.sqrt()).collect();
        let timesteps = (1..=config.train_timesteps).rev().collect();

        tracing::debug!(
            train_timesteps = config.train_timesteps,
            beta_start = config.beta_start,
            beta_end = config.beta_end,
            beta_schedule = ?config.beta_schedule,
            final_alpha_cumprod = alphas_cumprod[config.train_timesteps],
            "built noise schedule"
        );

        Ok(Self {
            betas,
            alphas,
            log_alphas_cumsum,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            one_over_sqrt_alphas,
            eps_coeffs,
            sigmas,
            timesteps,
            config: *config,
        })
    }

    pub fn config(&self) -> &NoiseScheduleConfig {
        &self.config
    }

    /// The number of diffusion steps `T`.
    pub fn train_timesteps(&self) -> usize {
        self.config.train_timesteps
    }

    /// The reverse process countdown, `T, T - 1, ..., 1`.
    pub fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    /// Cumulative sum of `ln(alpha)`, not affected by the pinning of
    /// `alphas_cumprod[0]`.
    pub fn log_alphas_cumsum(&self) -> &[f64] {
        &self.log_alphas_cumsum
    }

    /// Alpha-bar, with `alphas_cumprod()[0] == 1`.
    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn sqrt_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_alphas_cumprod
    }

    pub fn sqrt_one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_one_minus_alphas_cumprod
    }

    pub fn one_over_sqrt_alphas(&self) -> &[f64] {
        &self.one_over_sqrt_alphas
    }

    /// `(1 - alpha) / sqrt(1 - alpha-bar)`, the weight of the predicted noise
    /// in a reverse step. Zero at index 0.
    pub fn eps_coeffs(&self) -> &[f64] {
        &self.eps_coeffs
    }

    /// `sqrt(beta)`, the standard deviation of the noise injected by a
    /// reverse step.
    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Corrupts `original` up to the given per-sample timesteps:
    /// `sqrt(alpha-bar) * original + sqrt(1 - alpha-bar) * noise`.
    ///
    /// `timesteps` holds one index in `[0, T]` per batch element, training
    /// uses `[1, T]` as index `0` leaves the sample untouched.
    pub fn add_noise(
        &self,
        original: &Tensor,
        timesteps: &Tensor,
        noise: &Tensor,
    ) -> Result<Tensor> {
        check_shape("noise", &original.size(), &noise.size())?;
        let batch = batch_size("original samples", original)?;
        self.check_timesteps(timesteps, batch, 0)?;
        let sqrt_alpha_prod = gather(&self.sqrt_alphas_cumprod, timesteps, original);
        let sqrt_one_minus_alpha_prod =
            gather(&self.sqrt_one_minus_alphas_cumprod, timesteps, original);
        Ok(sqrt_alpha_prod * original + sqrt_one_minus_alpha_prod * noise)
    }

    /// Recovers the noise mixed in by [`Self::add_noise`] from the corrupted
    /// and clean samples. Only defined for timesteps in `[1, T]`.
    pub fn predict_noise_from_sample(
        &self,
        sample: &Tensor,
        timesteps: &Tensor,
        original: &Tensor,
    ) -> Result<Tensor> {
        check_shape("original samples", &sample.size(), &original.size())?;
        let batch = batch_size("sample", sample)?;
        self.check_timesteps(timesteps, batch, 1)?;
        let sqrt_alpha_prod = gather(&self.sqrt_alphas_cumprod, timesteps, sample);
        let sqrt_one_minus_alpha_prod =
            gather(&self.sqrt_one_minus_alphas_cumprod, timesteps, sample);
        Ok((sample - sqrt_alpha_prod * original) / sqrt_one_minus_alpha_prod)
    }

    /// Performs a single reverse step from `timestep` to `timestep - 1`.
    ///
    /// `variance_noise` is the standard normal noise injected by the step,
    /// `None` injects nothing as done on the final step.
    pub fn step(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
        variance_noise: Option<&Tensor>,
    ) -> Result<Tensor> {
        if timestep < 1 || timestep > self.train_timesteps() {
            return Err(Error::TimestepOutOfRange {
                timestep: timestep as i64,
                min: 1,
                max: self.train_timesteps() as i64,
            });
        }
        let size = sample.size();
        check_shape("model output", &size, &model_output.size())?;

        let mean = self.one_over_sqrt_alphas[timestep]
            * (sample - self.eps_coeffs[timestep] * model_output);
        match variance_noise {
            Some(noise) => {
                check_shape("variance noise", &size, &noise.size())?;
                Ok(mean + self.sigmas[timestep] * noise)
            }
            None => Ok(mean),
        }
    }

    /// Maps integer timesteps to `t / T` as a float tensor.
    pub fn normalize_timesteps(&self, timesteps: &Tensor) -> Tensor {
        timesteps.to_kind(Kind::Float) / self.train_timesteps() as f64
    }

    /// Draws `batch` timesteps uniformly in `[1, T]`.
    pub fn sample_training_timesteps(&self, batch: i64, device: Device) -> Tensor {
        let high = self.train_timesteps() as i64 + 1;
        Tensor::randint_low(1, high, &[batch], (Kind::Int64, device))
    }

    pub(crate) fn check_timesteps(&self, timesteps: &Tensor, batch: i64, min: i64) -> Result<()> {
        check_shape("timesteps", &[batch], &timesteps.size())?;
        if batch == 0 {
            return Ok(());
        }
        let timesteps = timesteps.to_kind(Kind::Int64);
        let max = self.train_timesteps() as i64;
        for timestep in [timesteps.min().int64_value(&[]), timesteps.max().int64_value(&[])] {
            if timestep < min || timestep > max {
                return Err(Error::TimestepOutOfRange { timestep, min, max });
            }
        }
        Ok(())
    }
}

pub(crate) fn batch_size(name: &'static str, xs: &Tensor) -> Result<i64> {
    match xs.size().first() {
        Some(&batch) => Ok(batch),
        None => Err(Error::ShapeMismatch { name, expected: vec![-1], actual: vec![] }),
    }
}

// Selects one coefficient per batch element, shaped to broadcast over the
// remaining dimensions of `like`.
pub(crate) fn gather(values: &[f64], timesteps: &Tensor, like: &Tensor) -> Tensor {
    let device = like.device();
    let mut shape = vec![1i64; like.dim()];
    if let Some(batch) = shape.first_mut() {
        *batch = timesteps.numel() as i64;
    }
    Tensor::from_slice(values)
        .to_device(device)
        .index_select(0, &timesteps.to_device(device).to_kind(Kind::Int64))
        .to_kind(like.kind())
        .view(shape.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::kind;

    fn reference_alphas_cumprod(
        train_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
    ) -> Vec<f64> {
        let mut prod = 1.;
        (0..=train_timesteps)
            .map(|t| {
                let beta = beta_start + (beta_end - beta_start) * t as f64 / train_timesteps as f64;
                prod *= 1. - beta;
                prod
            })
            .collect()
    }

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() <= tol, "{a} != {b} (tolerance {tol})");
    }

    #[test]
    fn schedule_shapes_and_ranges() {
        for &train_timesteps in &[1usize, 2, 10, 400, 1000] {
            for beta_schedule in [BetaSchedule::Linear, BetaSchedule::ScaledLinear] {
                let config = NoiseScheduleConfig {
                    train_timesteps,
                    beta_start: 1e-4,
                    beta_end: 0.02,
                    beta_schedule,
                };
                let schedule = NoiseSchedule::from_config(&config).unwrap();
                let len = train_timesteps + 1;
                for values in [
                    schedule.betas(),
                    schedule.alphas(),
                    schedule.log_alphas_cumsum(),
                    schedule.alphas_cumprod(),
                    schedule.sqrt_alphas_cumprod(),
                    schedule.sqrt_one_minus_alphas_cumprod(),
                    schedule.one_over_sqrt_alphas(),
                    schedule.eps_coeffs(),
                    schedule.sigmas(),
                ] {
                    assert_eq!(values.len(), len);
                    assert!(values.iter().all(|v| v.is_finite()));
                }
                assert!(schedule.alphas().iter().all(|&a| a > 0. && a < 1.));
                for w in schedule.alphas_cumprod().windows(2) {
                    assert!(w[1] <= w[0]);
                }
                assert_close(schedule.betas()[0], 1e-4, 1e-12);
                assert_close(schedule.betas()[train_timesteps], 0.02, 1e-12);
                assert_eq!(schedule.timesteps().len(), train_timesteps);
            }
        }
    }

    #[test]
    fn reference_values() {
        let schedule = NoiseSchedule::new(400, 1e-4, 0.02).unwrap();
        let alphas_cumprod = reference_alphas_cumprod(400, 1e-4, 0.02);
        let sqrtab = schedule.sqrt_alphas_cumprod();
        let sqrtmab = schedule.sqrt_one_minus_alphas_cumprod();
        assert_close(sqrtab[1], alphas_cumprod[1].sqrt(), 1e-10);
        assert_close(sqrtab[400], alphas_cumprod[400].sqrt(), 1e-10);
        assert_close(sqrtmab[1], (1. - alphas_cumprod[1]).sqrt(), 1e-10);
        assert_close(sqrtmab[400], (1. - alphas_cumprod[400]).sqrt(), 1e-10);
        // (1 - 1e-4) * (1 - (1e-4 + 0.0199 / 400))
        assert_close(sqrtab[1], (0.9999f64 * (1. - 1.4975e-4)).sqrt(), 1e-10);
        assert!(sqrtab[400] > 0. && sqrtab[400] < 0.2);

        let t = 200;
        assert_close(schedule.one_over_sqrt_alphas()[t], 1. / schedule.alphas()[t].sqrt(), 1e-12);
        assert_close(
            schedule.eps_coeffs()[t],
            schedule.betas()[t] / (1. - alphas_cumprod[t]).sqrt(),
            1e-10,
        );
        assert_close(schedule.sigmas()[t], schedule.betas()[t].sqrt(), 1e-12);
    }

    #[test]
    fn clean_state_at_index_zero() {
        let schedule = NoiseSchedule::new(10, 1e-4, 0.02).unwrap();
        assert_eq!(schedule.alphas_cumprod()[0], 1.);
        assert_eq!(schedule.sqrt_alphas_cumprod()[0], 1.);
        assert_eq!(schedule.sqrt_one_minus_alphas_cumprod()[0], 0.);
        assert_eq!(schedule.eps_coeffs()[0], 0.);
        assert_close(schedule.log_alphas_cumsum()[0], (1f64 - 1e-4).ln(), 1e-15);
        assert_eq!(schedule.timesteps(), &[10, 9, 8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn construction_is_deterministic() {
        let a = NoiseSchedule::new(400, 1e-4, 0.02).unwrap();
        let b = NoiseSchedule::new(400, 1e-4, 0.02).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_schedule() {
        for (t, b1, b2) in [(0, 1e-4, 0.02), (10, 0.02, 1e-4), (10, -1e-4, 0.02), (10, 1e-4, 1.5)] {
            assert!(matches!(
                NoiseSchedule::new(t, b1, b2),
                Err(Error::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn schedule_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoiseSchedule>();
    }

    #[test]
    fn add_noise_without_noise() {
        let schedule = NoiseSchedule::new(400, 1e-4, 0.02).unwrap();
        let original = Tensor::randn(&[4, 3, 8, 8], kind::FLOAT_CPU);
        let noise = original.zeros_like();
        let timesteps = Tensor::from_slice(&[1i64, 10, 200, 400]);
        let noisy = schedule.add_noise(&original, &timesteps, &noise).unwrap();
        assert_eq!(noisy.size(), original.size());
        for (b, &t) in [1usize, 10, 200, 400].iter().enumerate() {
            let expected = original.get(b as i64) * schedule.sqrt_alphas_cumprod()[t];
            assert!(noisy.get(b as i64).allclose(&expected, 1e-5, 1e-6, false));
        }
    }

    #[test]
    fn add_noise_per_element_timesteps() {
        let schedule = NoiseSchedule::new(100, 1e-4, 0.02).unwrap();
        let original = Tensor::ones(&[2, 1, 2, 2], kind::FLOAT_CPU);
        let noise = Tensor::ones(&[2, 1, 2, 2], kind::FLOAT_CPU);
        let timesteps = Tensor::from_slice(&[5i64, 80]);
        let noisy = schedule.add_noise(&original, &timesteps, &noise).unwrap();
        for (b, t) in [(0, 5), (1, 80)] {
            let expected =
                schedule.sqrt_alphas_cumprod()[t] + schedule.sqrt_one_minus_alphas_cumprod()[t];
            assert_close(noisy.double_value(&[b, 0, 1, 1]), expected, 1e-6);
        }
    }

    #[test]
    fn add_noise_at_zero_is_identity() {
        let schedule = NoiseSchedule::new(50, 1e-4, 0.02).unwrap();
        let original = Tensor::randn(&[3, 2, 4, 4], kind::FLOAT_CPU);
        let noise = Tensor::randn(&[3, 2, 4, 4], kind::FLOAT_CPU);
        let timesteps = Tensor::from_slice(&[0i64, 0, 0]);
        let noisy = schedule.add_noise(&original, &timesteps, &noise).unwrap();
        assert!(noisy.equal(&original));
    }

    #[test]
    fn empty_batch() {
        let schedule = NoiseSchedule::new(10, 1e-4, 0.02).unwrap();
        let original = Tensor::zeros(&[0, 1, 2, 2], kind::FLOAT_CPU);
        let noise = Tensor::zeros(&[0, 1, 2, 2], kind::FLOAT_CPU);
        let timesteps = Tensor::zeros(&[0], (Kind::Int64, Device::Cpu));
        let noisy = schedule.add_noise(&original, &timesteps, &noise).unwrap();
        assert_eq!(noisy.size(), vec![0, 1, 2, 2]);
        let recovered = schedule.predict_noise_from_sample(&noisy, &timesteps, &original).unwrap();
        assert_eq!(recovered.size(), vec![0, 1, 2, 2]);
    }

    #[test]
    fn add_noise_round_trip() {
        let schedule = NoiseSchedule::new(400, 1e-4, 0.02).unwrap();
        let original = Tensor::randn(&[3, 1, 5, 5], kind::DOUBLE_CPU);
        let noise = Tensor::randn(&[3, 1, 5, 5], kind::DOUBLE_CPU);
        let timesteps = Tensor::from_slice(&[1i64, 123, 400]);
        let noisy = schedule.add_noise(&original, &timesteps, &noise).unwrap();
        let recovered = schedule.predict_noise_from_sample(&noisy, &timesteps, &original).unwrap();
        assert!(recovered.allclose(&noise, 1e-6, 1e-8, false));
    }

    #[test]
    fn add_noise_does_not_mutate_inputs() {
        let schedule = NoiseSchedule::new(10, 1e-4, 0.02).unwrap();
        let original = Tensor::randn(&[2, 3], kind::FLOAT_CPU);
        let noise = Tensor::randn(&[2, 3], kind::FLOAT_CPU);
        let (original_copy, noise_copy) = (original.copy(), noise.copy());
        let timesteps = Tensor::from_slice(&[3i64, 7]);
        let _ = schedule.add_noise(&original, &timesteps, &noise).unwrap();
        assert!(original.equal(&original_copy));
        assert!(noise.equal(&noise_copy));
    }

    #[test]
    fn add_noise_errors() {
        let schedule = NoiseSchedule::new(10, 1e-4, 0.02).unwrap();
        let original = Tensor::zeros(&[2, 1, 4, 4], kind::FLOAT_CPU);
        let noise = Tensor::zeros(&[2, 1, 4, 4], kind::FLOAT_CPU);

        let bad_noise = Tensor::zeros(&[2, 1, 4, 3], kind::FLOAT_CPU);
        let timesteps = Tensor::from_slice(&[1i64, 2]);
        assert!(matches!(
            schedule.add_noise(&original, &timesteps, &bad_noise),
            Err(Error::ShapeMismatch { name: "noise", .. })
        ));

        let short = Tensor::from_slice(&[1i64]);
        assert!(matches!(
            schedule.add_noise(&original, &short, &noise),
            Err(Error::ShapeMismatch { name: "timesteps", .. })
        ));

        let too_late = Tensor::from_slice(&[1i64, 11]);
        match schedule.add_noise(&original, &too_late, &noise) {
            Err(Error::TimestepOutOfRange { timestep: 11, min: 0, max: 10 }) => {}
            other => panic!("unexpected result {other:?}"),
        }

        let negative = Tensor::from_slice(&[-1i64, 2]);
        assert!(matches!(
            schedule.add_noise(&original, &negative, &noise),
            Err(Error::TimestepOutOfRange { timestep: -1, .. })
        ));

        let zero = Tensor::from_slice(&[0i64, 2]);
        assert!(matches!(
            schedule.predict_noise_from_sample(&original, &zero, &original),
            Err(Error::TimestepOutOfRange { timestep: 0, min: 1, .. })
        ));
    }

    #[test]
    fn reverse_step() {
        let schedule = NoiseSchedule::new(20, 1e-4, 0.02).unwrap();
        let sample = Tensor::ones(&[1, 1, 2, 2], kind::DOUBLE_CPU);
        let model_output = Tensor::full(&[1, 1, 2, 2], 0.5, kind::DOUBLE_CPU);
        let z = Tensor::full(&[1, 1, 2, 2], -2., kind::DOUBLE_CPU);
        let t = 5;
        let mean = schedule.one_over_sqrt_alphas()[t] * (1. - 0.5 * schedule.eps_coeffs()[t]);

        let prev = schedule.step(&model_output, t, &sample, None).unwrap();
        assert_close(prev.double_value(&[0, 0, 0, 0]), mean, 1e-12);

        let prev = schedule.step(&model_output, t, &sample, Some(&z)).unwrap();
        assert_close(prev.double_value(&[0, 0, 1, 1]), mean - 2. * schedule.sigmas()[t], 1e-12);
    }

    #[test]
    fn reverse_step_errors() {
        let schedule = NoiseSchedule::new(20, 1e-4, 0.02).unwrap();
        let sample = Tensor::ones(&[2, 3], kind::FLOAT_CPU);
        for t in [0, 21] {
            assert!(matches!(
                schedule.step(&sample, t, &sample, None),
                Err(Error::TimestepOutOfRange { min: 1, max: 20, .. })
            ));
        }
        let wrong = Tensor::ones(&[2, 4], kind::FLOAT_CPU);
        assert!(matches!(
            schedule.step(&wrong, 3, &sample, None),
            Err(Error::ShapeMismatch { name: "model output", .. })
        ));
        assert!(matches!(
            schedule.step(&sample, 3, &sample, Some(&wrong)),
            Err(Error::ShapeMismatch { name: "variance noise", .. })
        ));
    }

    #[test]
    fn timestep_helpers() {
        let schedule = NoiseSchedule::new(4, 1e-4, 0.02).unwrap();
        let normalized = schedule.normalize_timesteps(&Tensor::from_slice(&[0i64, 2, 4]));
        assert_eq!(normalized.kind(), Kind::Float);
        assert_close(normalized.double_value(&[1]), 0.5, 1e-7);
        assert_close(normalized.double_value(&[2]), 1., 1e-7);

        let drawn = schedule.sample_training_timesteps(1000, Device::Cpu);
        assert_eq!(drawn.size(), vec![1000]);
        assert_eq!(drawn.min().int64_value(&[]), 1);
        assert_eq!(drawn.max().int64_value(&[]), 4);
    }
}
