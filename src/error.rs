//! Errors raised by the schedule, sampler and training helpers.
//!
//! Every variant is fatal: they signal a contract violation by the caller,
//! nothing here is retried.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { name: &'static str, expected: Vec<i64>, actual: Vec<i64> },

    #[error("timestep {timestep} is outside of [{min}, {max}]")]
    TimestepOutOfRange { timestep: i64, min: i64, max: i64 },

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns a `ShapeMismatch` error unless `actual` equals `expected`.
pub(crate) fn check_shape(name: &'static str, expected: &[i64], actual: &[i64]) -> Result<()> {
    if expected != actual {
        return Err(Error::ShapeMismatch {
            name,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}
