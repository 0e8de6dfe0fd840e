//! Error types for the RegDA keypoint adaptation system.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(
        "Resolution mismatch: {input_height}x{input_width} / {scale} does not match template grid {template_height}x{template_width}"
    )]
    ResolutionMismatch {
        input_height: usize,
        input_width: usize,
        scale: usize,
        template_height: usize,
        template_width: usize,
    },

    #[error("Invalid disparity mode `{0}`: expected `min` or `max`")]
    InvalidMode(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<candle_core::Error> for Error {
    fn from(e: candle_core::Error) -> Self {
        Error::Tensor(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
