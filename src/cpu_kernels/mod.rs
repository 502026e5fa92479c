//! CPU microkernels for quantized convolution.
//!
//! The operator drivers never compute arithmetic themselves: each tile of the
//! iteration space is handed to a microkernel that reads gathered input rows
//! through the indirection table, accumulates against a packed weight block,
//! requantizes, and writes one MR × NR output tile. The contract is a plain
//! function pointer so ISA-specific implementations can be swapped in; the
//! crate ships the portable scalar reference.

pub mod scalar;

use crate::indirection::InputRow;
use crate::microarch::{conv_kernel_config, ConvKernelConfig};
use crate::quantization::ConvQuantizationParams;

/// Read-only per-call state shared by every tile invocation.
#[derive(Debug, Clone, Copy)]
pub struct Q8ConvContext<'a> {
    /// Whole quantized input tensor; indirection offsets index into it.
    pub input: &'a [u8],
    /// Sentinel row substituting for padding and stride-gap positions.
    pub zero_row: &'a [u8],
    /// Reduction depth per tap (group input channels).
    pub kc: usize,
    /// Kernel taps per output position.
    pub ks: usize,
    /// Row stride of an indirection tile window (the tile height MR).
    pub mr: usize,
    pub quantization: ConvQuantizationParams,
}

/// Packed bias and weight block for one (group, output-channel tile).
#[derive(Debug, Clone, Copy)]
pub struct PackedBlock<'a> {
    /// One i32 bias per channel lane, NR entries.
    pub bias: &'a [i32],
    /// Blocked weights, `[tap][k_stride][nr]` with padding lanes holding the
    /// kernel zero point.
    pub weights: &'a [u8],
    /// Rounded-up reduction depth of the packed block.
    pub k_stride: usize,
    /// Channel-lane count of the packed block.
    pub nr: usize,
}

/// Contract of the blocked q8 conv microkernel.
///
/// `indirection` is a `ks × mr` tile window, slot `tap × mr + row`. The
/// kernel must accumulate `bias + Σ_taps Σ_k (x − input_zp)(w − kernel_zp)`
/// in i32 for each of `rows × channels` outputs, requantize through
/// `ctx.quantization`, and store at `out + row × out_stride + channel`.
/// Rows resolving to the zero row contribute nothing because the zero row
/// holds the input zero point.
///
/// # Safety
///
/// `out` must be valid for writes covering `(rows − 1) × out_stride +
/// channels` bytes, and no other tile may write that region concurrently.
pub type Q8ConvUkernel = unsafe fn(
    rows: usize,
    channels: usize,
    ctx: &Q8ConvContext<'_>,
    indirection: &[InputRow],
    packed: PackedBlock<'_>,
    out: *mut u8,
    out_stride: usize,
);

/// A microkernel bundled with the tile geometry it was built for.
#[derive(Debug, Clone, Copy)]
pub struct Q8ConvKernel {
    pub config: ConvKernelConfig,
    pub ukernel: Q8ConvUkernel,
}

impl Q8ConvKernel {
    /// The scalar reference implementation driven with an explicit geometry.
    pub fn with_config(config: ConvKernelConfig) -> Self {
        Self {
            config,
            ukernel: scalar::q8conv,
        }
    }
}

/// The q8 conv kernel for the detected microarchitecture.
///
/// The tile geometry adapts to the host ISA; the implementation is the
/// portable scalar reference until ISA-specific microkernels are wired in.
pub fn q8conv_kernel() -> Q8ConvKernel {
    Q8ConvKernel::with_config(*conv_kernel_config())
}
