//! Crate-level error type shared by all operators.

use thiserror::Error;

/// Errors reported by operator setup and execution.
///
/// All failures are terminal for the current call and reported synchronously;
/// no partial-success state exists. On error, operator-owned buffers are in a
/// consistent state and the output tensor contents are unspecified.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A scale parameter is zero, negative, subnormal, or not finite.
    #[error("invalid {which} scale {value:.7e}: scale must be finite and positive")]
    InvalidScale { which: &'static str, value: f32 },

    /// A descriptor or argument field is outside its valid domain.
    #[error("invalid parameter: {what}")]
    InvalidParameter { what: &'static str },

    /// The convolution geometry yields a non-positive output dimension.
    #[error("invalid geometry: output {axis} would be {computed}")]
    InvalidGeometry { axis: &'static str, computed: i64 },

    /// A caller-supplied buffer is smaller than the geometry implies.
    #[error("{what} buffer too small: need {needed} elements, got {got}")]
    BufferTooSmall {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    /// Allocation failure for an operator-owned buffer.
    #[error("failed to allocate {bytes} bytes for {what}")]
    OutOfMemory { what: &'static str, bytes: usize },
}

pub type KernelResult<T> = Result<T, KernelError>;
