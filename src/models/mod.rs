//! # Models
//!
//! The noise predictors driving a diffusion loop. Any network, whether a
//! plain convolutional autoencoder or a conditional UNet, is seen through the
//! single [`Denoiser`] capability.
use tch::Tensor;

pub mod gaussian;

/// Predicts the noise component of a corrupted batch.
pub trait Denoiser {
    /// `xs` is the noisy batch, `timesteps` a 1-D integer tensor holding the
    /// diffusion step of each batch element and `condition` some optional
    /// per-sample data such as class labels.
    ///
    /// The returned tensor must have the same shape as `xs`.
    fn predict_noise(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        condition: Option<&Tensor>,
    ) -> anyhow::Result<Tensor>;
}

impl<D: Denoiser + ?Sized> Denoiser for &D {
    fn predict_noise(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        condition: Option<&Tensor>,
    ) -> anyhow::Result<Tensor> {
        (**self).predict_noise(xs, timesteps, condition)
    }
}

impl<D: Denoiser + ?Sized> Denoiser for Box<D> {
    fn predict_noise(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        condition: Option<&Tensor>,
    ) -> anyhow::Result<Tensor> {
        (**self).predict_noise(xs, timesteps, condition)
    }
}

/// A denoiser backed by a closure, see [`func`].
pub struct Func<F> {
    f: F,
}

impl<F> std::fmt::Debug for Func<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "func")
    }
}

/// Wraps a closure taking the noisy batch, the timesteps and the optional
/// condition into a [`Denoiser`].
pub fn func<F>(f: F) -> Func<F>
where
    F: Fn(&Tensor, &Tensor, Option<&Tensor>) -> anyhow::Result<Tensor>,
{
    Func { f }
}

impl<F> Denoiser for Func<F>
where
    F: Fn(&Tensor, &Tensor, Option<&Tensor>) -> anyhow::Result<Tensor>,
{
    fn predict_noise(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        condition: Option<&Tensor>,
    ) -> anyhow::Result<Tensor> {
        (self.f)(xs, timesteps, condition)
    }
}
