//! Portable scalar reference microkernel.

use super::{PackedBlock, Q8ConvContext};
use crate::indirection::InputRow;

/// Scalar q8 conv tile.
///
/// Correct for any tile geometry; serves as the reference implementation for
/// ISA-specific kernels and as the fallback on unrecognized hardware.
///
/// # Safety
///
/// See [`super::Q8ConvUkernel`].
pub unsafe fn q8conv(
    rows: usize,
    channels: usize,
    ctx: &Q8ConvContext<'_>,
    indirection: &[InputRow],
    packed: PackedBlock<'_>,
    out: *mut u8,
    out_stride: usize,
) {
    let input_zp = ctx.quantization.input_zero_point;
    let kernel_zp = ctx.quantization.kernel_zero_point;
    let tap_stride = packed.k_stride * packed.nr;

    for row in 0..rows {
        for channel in 0..channels {
            let mut acc = packed.bias[channel];
            for tap in 0..ctx.ks {
                let gathered =
                    indirection[tap * ctx.mr + row].resolve(ctx.input, ctx.zero_row, ctx.kc);
                let tap_weights = &packed.weights[tap * tap_stride..];
                for k in 0..ctx.kc {
                    let x = i32::from(gathered[k]) - input_zp;
                    let w = i32::from(tap_weights[k * packed.nr + channel]) - kernel_zp;
                    acc += x * w;
                }
            }
            *out.add(row * out_stride + channel) = ctx.quantization.requantize(acc);
        }
    }
}
