//! Training objective for noise-prediction networks.
//!
//! Each training step corrupts a clean batch at random timesteps and asks the
//! denoiser to recover the injected noise. Parameter updates are left to the
//! caller's optimizer.
use crate::error::check_shape;
use crate::models::Denoiser;
use crate::noise::NoiseSource;
use crate::schedulers::ddpm::NoiseSchedule;
use tch::{Kind, Reduction, Tensor};

/// The outcome of [`training_loss`].
#[derive(Debug)]
pub struct TrainingStep {
    /// Scalar mean squared error, differentiable through the denoiser.
    pub loss: Tensor,
    /// The timesteps drawn for each batch element.
    pub timesteps: Tensor,
}

/// Mean squared error between the injected and the predicted noise when
/// corrupting `original` at `timesteps` with `noise`.
pub fn noise_prediction_loss<D: Denoiser + ?Sized>(
    schedule: &NoiseSchedule,
    denoiser: &D,
    original: &Tensor,
    timesteps: &Tensor,
    noise: &Tensor,
    condition: Option<&Tensor>,
) -> anyhow::Result<Tensor> {
    let noisy = schedule.add_noise(original, timesteps, noise)?;
    let noise_pred = denoiser.predict_noise(&noisy, timesteps, condition)?;
    check_shape("denoiser output", &noisy.size(), &noise_pred.size())?;
    Ok(noise_pred.mse_loss(noise, Reduction::Mean))
}

/// Draws timesteps uniformly in `[1, T]` and noise from `noise_source`, then
/// evaluates [`noise_prediction_loss`].
pub fn training_loss<D, N>(
    schedule: &NoiseSchedule,
    denoiser: &D,
    original: &Tensor,
    condition: Option<&Tensor>,
    noise_source: &mut N,
) -> anyhow::Result<TrainingStep>
where
    D: Denoiser + ?Sized,
    N: NoiseSource + ?Sized,
{
    let size = original.size();
    let batch = crate::schedulers::ddpm::batch_size("original samples", original)?;
    let timesteps = schedule.sample_training_timesteps(batch, original.device());
    let noise = noise_source.standard_normal(&size, (original.kind(), original.device()));
    let loss = noise_prediction_loss(schedule, denoiser, original, &timesteps, &noise, condition)?;
    tracing::trace!(loss = loss.to_kind(Kind::Double).double_value(&[]), "training loss");
    Ok(TrainingStep { loss, timesteps })
}
