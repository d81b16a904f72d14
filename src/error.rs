use thiserror::Error;

/// Failures a stream worker recovers from by reconnecting.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Source unreachable or rejected the session.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Connected, but no picture arrived for `misses` consecutive pulls.
    #[error("stream stalled after {misses} empty pulls")]
    Stall { misses: u32 },

    /// Frame data present but not usable.
    #[error("decode failed: {0}")]
    Decode(String),
}

impl StreamError {
    pub fn connect(err: impl std::fmt::Display) -> Self {
        Self::Connect(err.to_string())
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }
}
