use std::collections::TryReserveError;

use thiserror::Error;

/// Errors raised before or outside of the random walk itself.
///
/// Numeric problems during likelihood evaluation never show up here, the
/// evaluator turns them into a large finite penalty instead.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum McmcError {
    #[error("invalid model configuration: {0}")]
    Configuration(String),
    #[error("invalid walk settings: {0}")]
    InvalidSettings(String),
    #[error("could not allocate {what} ({len} values)")]
    ResourceExhaustion {
        what: &'static str,
        len: usize,
        #[source]
        source: TryReserveError,
    },
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
}

pub type Result<T> = std::result::Result<T, McmcError>;

/// Allocate a zero-filled buffer, reporting allocation failure as an error.
pub(crate) fn try_zeroed<T: Clone + Default>(what: &'static str, len: usize) -> Result<Vec<T>> {
    let mut out = Vec::new();
    out.try_reserve_exact(len)
        .map_err(|source| McmcError::ResourceExhaustion { what, len, source })?;
    out.resize(len, T::default());
    Ok(out)
}
