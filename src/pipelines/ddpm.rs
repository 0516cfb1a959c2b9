//! # DDPM sampling
//!
//! Starting from pure gaussian noise, the reverse process walks the schedule
//! from `T` down to `1`, each step removing the noise predicted by the
//! denoiser and injecting a smaller amount of fresh noise. The last step
//! injects none.
use crate::error::{check_shape, Error};
use crate::models::Denoiser;
use crate::noise::{NoiseSource, TorchNoise};
use crate::schedulers::ddpm::NoiseSchedule;
use tch::{Device, Kind, Tensor};

/// Runs the reverse process of a [`NoiseSchedule`].
#[derive(Debug, Clone, Copy)]
pub struct DdpmSampler<'a> {
    schedule: &'a NoiseSchedule,
    guidance_scale: Option<f64>,
    device: Device,
    kind: Kind,
}

impl<'a> DdpmSampler<'a> {
    pub fn new(schedule: &'a NoiseSchedule) -> Self {
        Self { schedule, guidance_scale: None, device: Device::Cpu, kind: Kind::Float }
    }

    /// Enables classifier-free guidance: the noise prediction becomes
    /// `uncond + scale * (cond - uncond)` where `uncond` is predicted without
    /// any condition. A scale of 1 is plain conditional sampling.
    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = Some(guidance_scale);
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        self.schedule
    }

    /// Generates `n_samples` samples of shape `shape`.
    ///
    /// `condition`, when set, must have `n_samples` as its first dimension
    /// and is handed over to the denoiser as is.
    pub fn sample<D, N>(
        &self,
        denoiser: &D,
        shape: &[i64],
        n_samples: i64,
        condition: Option<&Tensor>,
        noise: &mut N,
    ) -> anyhow::Result<Tensor>
    where
        D: Denoiser + ?Sized,
        N: NoiseSource + ?Sized,
    {
        self.run(denoiser, shape, n_samples, condition, noise, |_, _| {})
    }

    /// Same as [`Self::sample`], also returning the intermediate states whose
    /// timestep is a multiple of `every`, from noisiest to the final sample.
    pub fn sample_with_trajectory<D, N>(
        &self,
        denoiser: &D,
        shape: &[i64],
        n_samples: i64,
        condition: Option<&Tensor>,
        noise: &mut N,
        every: usize,
    ) -> anyhow::Result<(Tensor, Vec<(usize, Tensor)>)>
    where
        D: Denoiser + ?Sized,
        N: NoiseSource + ?Sized,
    {
        if every == 0 {
            let err =
                Error::InvalidConfiguration("trajectory interval must be at least 1".to_string());
            return Err(err.into());
        }
        let mut trajectory = vec![];
        let samples = self.run(denoiser, shape, n_samples, condition, noise, |timestep, xs| {
            if timestep % every == 0 {
                trajectory.push((timestep, xs.shallow_clone()))
            }
        })?;
        Ok((samples, trajectory))
    }

    // `on_state` sees the initial noise at T and the state reached after each
    // step, the last one being the sample at 0.
    fn run<D, N, F>(
        &self,
        denoiser: &D,
        shape: &[i64],
        n_samples: i64,
        condition: Option<&Tensor>,
        noise: &mut N,
        mut on_state: F,
    ) -> anyhow::Result<Tensor>
    where
        D: Denoiser + ?Sized,
        N: NoiseSource + ?Sized,
        F: FnMut(usize, &Tensor),
    {
        self.validate(shape, n_samples, condition)?;
        let _no_grad = tch::no_grad_guard();
        let mut size = vec![n_samples];
        size.extend_from_slice(shape);
        let options = (self.kind, self.device);
        tracing::debug!(
            n_samples,
            ?shape,
            conditioned = condition.is_some(),
            guidance_scale = ?self.guidance_scale,
            steps = self.schedule.train_timesteps(),
            "starting ddpm sampling"
        );

        let mut xs = noise.standard_normal(&size, options);
        check_shape("initial noise", &size, &xs.size())?;
        on_state(self.schedule.train_timesteps(), &xs);
        for &timestep in self.schedule.timesteps() {
            let variance_noise =
                if timestep > 1 { Some(noise.standard_normal(&size, options)) } else { None };
            let timesteps = Tensor::full(&[n_samples], timestep as i64, (Kind::Int64, self.device));
            let noise_pred = self.predict_noise(denoiser, &xs, &timesteps, condition)?;
            xs = self.schedule.step(&noise_pred, timestep, &xs, variance_noise.as_ref())?;
            tracing::trace!(timestep, "reverse step");
            on_state(timestep - 1, &xs);
        }
        tracing::debug!("ddpm sampling done");
        Ok(xs)
    }

    fn validate(
        &self,
        shape: &[i64],
        n_samples: i64,
        condition: Option<&Tensor>,
    ) -> crate::Result<()> {
        if n_samples < 1 {
            return Err(Error::InvalidConfiguration(format!(
                "the number of samples must be at least 1, got {n_samples}"
            )));
        }
        if shape.is_empty() || shape.iter().any(|&d| d < 1) {
            return Err(Error::InvalidConfiguration(format!(
                "the sample shape must have positive dimensions, got {shape:?}"
            )));
        }
        if let Some(condition) = condition {
            let batch = condition.size().first().copied();
            if batch != Some(n_samples) {
                return Err(Error::ShapeMismatch {
                    name: "condition",
                    expected: vec![n_samples],
                    actual: batch.into_iter().collect(),
                });
            }
        }
        match self.guidance_scale {
            Some(scale) if !scale.is_finite() => Err(Error::InvalidConfiguration(format!(
                "the guidance scale must be finite, got {scale}"
            ))),
            Some(_) if condition.is_none() => Err(Error::InvalidConfiguration(
                "guidance requires a condition".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn predict_noise<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        xs: &Tensor,
        timesteps: &Tensor,
        condition: Option<&Tensor>,
    ) -> anyhow::Result<Tensor> {
        let size = xs.size();
        let noise_pred = denoiser.predict_noise(xs, timesteps, condition)?;
        check_shape("denoiser output", &size, &noise_pred.size())?;
        match (self.guidance_scale, condition) {
            (Some(guidance_scale), Some(_)) => {
                let noise_pred_uncond = denoiser.predict_noise(xs, timesteps, None)?;
                check_shape("denoiser output", &size, &noise_pred_uncond.size())?;
                Ok(&noise_pred_uncond + (noise_pred - &noise_pred_uncond) * guidance_scale)
            }
            _ => Ok(noise_pred),
        }
    }
}

/// Generates `n_samples` samples with the default sampler settings and
/// libtorch's random generator.
pub fn sample<D: Denoiser + ?Sized>(
    schedule: &NoiseSchedule,
    denoiser: &D,
    shape: &[i64],
    n_samples: i64,
    condition: Option<&Tensor>,
) -> anyhow::Result<Tensor> {
    DdpmSampler::new(schedule).sample(denoiser, shape, n_samples, condition, &mut TorchNoise)
}
