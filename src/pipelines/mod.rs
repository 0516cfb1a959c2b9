//! # Pipelines
//!
//! Generation loops combining a noise schedule with a denoiser.

pub mod ddpm;
