use thiserror::Error;

/// Errors returned when constructing a histogram.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// `sigbits` is outside of the supported range.
    #[error("sigbits must be in the range 1..=15")]
    SigbitsOutOfRange,
}
