use thiserror::Error;

pub type TransformResult<T> = Result<T, TransformError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("image {height}x{width} is not a multiple of the {block}x{block} block size")]
    NotBlockAligned {
        height: usize,
        width: usize,
        block: usize,
    },
    #[error("expected {expected} channels, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },
    #[error("block tensor has {actual} blocks of {coeffs} coefficients, expected {expected} blocks of 64 for a {height}x{width} plane")]
    BlockCountMismatch {
        expected: usize,
        actual: usize,
        coeffs: usize,
        height: usize,
        width: usize,
    },
    #[error("quality must be in 1..=100, got {0}")]
    InvalidQuality(u32),
    #[error("parameter tensor has {actual} entries, expected {expected}")]
    ParameterMismatch { expected: usize, actual: usize },
    #[error("resize target {height}x{width} is empty")]
    EmptyResize { height: usize, width: usize },
}
