use thiserror::Error;

/// Errors produced while decoding a bit stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerdeErr {
    /// The stream ended before the requested number of bits could be read.
    #[error("bit stream exhausted: needed {needed} more bits, {available} available")]
    UnexpectedEnd { needed: usize, available: usize },

    /// A decoded value is not valid for the type being constructed.
    #[error("invalid value while decoding {context}")]
    InvalidValue { context: &'static str },

    /// A length-prefixed string did not contain valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

pub type SerdeResult<T> = Result<T, SerdeErr>;
