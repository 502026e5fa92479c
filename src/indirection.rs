//! Indirection table for gather-based quantized convolution.
//!
//! Transposed convolution reads an irregular input pattern: strided, dilated,
//! padded, and interleaved with the zero rows that upsampling inserts between
//! real samples. Materializing that pattern with an image-to-column copy
//! would replicate every padded patch per output position. Instead the
//! operator builds a flat table with one slot per (batch, group, kernel tap,
//! tiled output row): either the offset of the input row that tap reads, or a
//! shared zero row. The microkernel then reads through the table as if it
//! were a gathered patch, touching only the original tensor.

use crate::error::{KernelError, KernelResult};
use crate::microarch::round_up;

/// One gather slot: a row of the input tensor, or the shared zero row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRow {
    /// Resolves to the zero buffer (padding or stride-gap position).
    Zero,
    /// Element offset of the first gathered channel of an input row.
    At(usize),
}

impl InputRow {
    /// Resolve this slot to a row view of `channels` elements.
    #[inline]
    pub fn resolve<'a>(self, input: &'a [u8], zero_row: &'a [u8], channels: usize) -> &'a [u8] {
        match self {
            InputRow::Zero => &zero_row[..channels],
            InputRow::At(offset) => &input[offset..offset + channels],
        }
    }
}

/// Everything the transposed-convolution gather pattern depends on.
///
/// Two equal `DeconvGather` values produce identical tables, which is what
/// makes the generation-keyed reuse in [`IndirectionBuffer`] sound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeconvGather {
    pub batch_size: usize,
    pub input_height: usize,
    pub input_width: usize,
    pub output_height: usize,
    pub output_width: usize,
    pub kernel_height: usize,
    pub kernel_width: usize,
    pub stride_height: usize,
    pub stride_width: usize,
    pub dilation_height: usize,
    pub dilation_width: usize,
    pub padding_top: usize,
    pub padding_left: usize,
    pub groups: usize,
    pub group_input_channels: usize,
    pub input_pixel_stride: usize,
}

impl DeconvGather {
    fn kernel_size(&self) -> usize {
        self.kernel_height * self.kernel_width
    }

    fn output_size(&self) -> usize {
        self.output_height * self.output_width
    }
}

/// Owned, growable slot table, rebuilt only when the gather geometry changes.
///
/// Slots are element offsets rather than addresses, so a table built for one
/// input tensor stays valid for any other tensor with the same geometry; the
/// generation key covers everything the offsets depend on.
#[derive(Debug, Default)]
pub struct IndirectionBuffer {
    slots: Vec<InputRow>,
    generation: Option<(DeconvGather, usize)>,
}

impl IndirectionBuffer {
    /// Slot layout: one panel of `tiled_output_size × kernel_size` slots per
    /// (group, image), group-major; within a panel, the tile starting at
    /// output row `t` owns slots `[t × kernel_size, (t + mr) × kernel_size)`,
    /// ordered tap-major (`tap × mr + row_in_tile`).
    pub fn slots(&self) -> &[InputRow] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Make the table match `gather` for row-tile height `mr`, rebuilding it
    /// only if the geometry generation changed.
    pub fn prepare(&mut self, gather: &DeconvGather, mr: usize) -> KernelResult<()> {
        if self.generation == Some((*gather, mr)) {
            return Ok(());
        }

        let tiled_output_size = round_up(gather.output_size(), mr);
        let needed =
            gather.batch_size * gather.groups * tiled_output_size * gather.kernel_size();
        self.slots.clear();
        if needed > self.slots.capacity() {
            self.slots.try_reserve_exact(needed).map_err(|_| {
                let bytes = needed * std::mem::size_of::<InputRow>();
                log::error!("failed to allocate {bytes} bytes for indirection buffer");
                KernelError::OutOfMemory {
                    what: "indirection buffer",
                    bytes,
                }
            })?;
        }
        self.slots.resize(needed, InputRow::Zero);
        self.fill(gather, mr, tiled_output_size);
        self.generation = Some((*gather, mr));
        Ok(())
    }

    fn fill(&mut self, gather: &DeconvGather, mr: usize, tiled_output_size: usize) {
        let kernel_size = gather.kernel_size();
        let output_size = gather.output_size();

        for group in 0..gather.groups {
            for image in 0..gather.batch_size {
                let panel =
                    (group * gather.batch_size + image) * tiled_output_size * kernel_size;
                for tile_start in (0..tiled_output_size).step_by(mr) {
                    for row_in_tile in 0..mr {
                        // Rows past the true output (tile round-up) clamp to
                        // the last real pixel so they stay readable; the
                        // driver never asks the microkernel to emit them.
                        let output_index = (tile_start + row_in_tile).min(output_size - 1);
                        let oy = output_index / gather.output_width;
                        let ox = output_index % gather.output_width;
                        for ky in 0..gather.kernel_height {
                            let iy = source_coordinate(
                                oy,
                                gather.padding_top,
                                ky,
                                gather.dilation_height,
                                gather.stride_height,
                                gather.input_height,
                            );
                            for kx in 0..gather.kernel_width {
                                let ix = source_coordinate(
                                    ox,
                                    gather.padding_left,
                                    kx,
                                    gather.dilation_width,
                                    gather.stride_width,
                                    gather.input_width,
                                );
                                let tap = ky * gather.kernel_width + kx;
                                let slot = panel
                                    + tile_start * kernel_size
                                    + tap * mr
                                    + row_in_tile;
                                self.slots[slot] = match (iy, ix) {
                                    (Some(y), Some(x)) => InputRow::At(
                                        ((image * gather.input_height + y)
                                            * gather.input_width
                                            + x)
                                            * gather.input_pixel_stride
                                            + group * gather.group_input_channels,
                                    ),
                                    _ => InputRow::Zero,
                                };
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Invert the transposed-convolution mapping for one axis and tap.
///
/// A tap contributes a real input sample iff `out + padding − tap × dilation`
/// is non-negative, lands on the stride grid (positions between grid points
/// are the zeros upsampling inserted, not samples), and indexes inside the
/// input. A coordinate exactly on the padding boundary is outside the tensor,
/// never clamped to index 0.
fn source_coordinate(
    out: usize,
    padding: usize,
    tap: usize,
    dilation: usize,
    stride: usize,
    input_dim: usize,
) -> Option<usize> {
    let y = (out + padding) as i64 - (tap * dilation) as i64;
    if y < 0 {
        return None;
    }
    let y = y as usize;
    if y % stride != 0 {
        return None;
    }
    let coordinate = y / stride;
    (coordinate < input_dim).then_some(coordinate)
}
