//! Standard normal noise used by the sampling loop and the training helpers.
use tch::{Device, Kind, Tensor};

/// A source of standard normal noise.
///
/// The default [`TorchNoise`] draws from libtorch's global generator, custom
/// implementations can be plugged in to get reproducible draws.
pub trait NoiseSource {
    fn standard_normal(&mut self, size: &[i64], options: (Kind, Device)) -> Tensor;
}

/// Draws from the libtorch generator, seed it with [`tch::manual_seed`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TorchNoise;

impl NoiseSource for TorchNoise {
    fn standard_normal(&mut self, size: &[i64], options: (Kind, Device)) -> Tensor {
        Tensor::randn(size, options)
    }
}

impl<N: NoiseSource + ?Sized> NoiseSource for &mut N {
    fn standard_normal(&mut self, size: &[i64], options: (Kind, Device)) -> Tensor {
        (**self).standard_normal(size, options)
    }
}
