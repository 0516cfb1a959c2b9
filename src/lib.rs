//! # Denoising diffusion schedule and sampler
//!
//! A small implementation of denoising diffusion probabilistic models (DDPM)
//! on top of Torch via [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - A precomputed linear noise schedule with the forward corruption process.
//! - The iterative reverse sampling loop, optionally conditioned and guided.
//! - A training objective helper for noise-prediction networks.
//!
//! Networks plug in through the [`models::Denoiser`] trait, so the diffusion
//! core does not depend on any particular architecture.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239

pub mod error;
pub mod models;
pub mod noise;
pub mod pipelines;
pub mod schedulers;
pub mod training;
pub mod utils;

pub use error::{Error, Result};
