//! Property-based tests for the deconvolution gather and requantization.
//!
//! Uses proptest to verify invariants that must hold for all inputs:
//! - Every indirection slot is the zero sentinel or a valid, stride-aligned
//!   input row
//! - Requantization is monotone, clamped, and anchored at the zero point

use proptest::prelude::*;

use qconv_kernels::{ConvQuantizationParams, DeconvGather, IndirectionBuffer, InputRow};

fn arb_gather() -> impl Strategy<Value = (DeconvGather, usize)> {
    (
        (1usize..3, 1usize..6, 1usize..6, 1usize..8, 1usize..8), // batch, input, output dims
        (1usize..4, 1usize..4, 1usize..4, 1usize..4),            // kernel, stride
        (1usize..3, 1usize..3, 0usize..3, 0usize..3),            // dilation, padding
        (1usize..3, 1usize..4, 1usize..5),                       // groups, channels, mr
    )
        .prop_map(
            |((batch, ih, iw, oh, ow), (kh, kw, sh, sw), (dh, dw, pt, pl), (groups, gic, mr))| {
                (
                    DeconvGather {
                        batch_size: batch,
                        input_height: ih,
                        input_width: iw,
                        output_height: oh,
                        output_width: ow,
                        kernel_height: kh,
                        kernel_width: kw,
                        stride_height: sh,
                        stride_width: sw,
                        dilation_height: dh,
                        dilation_width: dw,
                        padding_top: pt,
                        padding_left: pl,
                        groups,
                        group_input_channels: gic,
                        input_pixel_stride: groups * gic,
                    },
                    mr,
                )
            },
        )
}

/// Scan-based inverse of the forward scatter relation for one axis: the
/// input coordinate that reaches `out` through tap `k`, if any.
fn scan_source(out: usize, k: usize, stride: usize, dilation: usize, padding: usize, input_dim: usize) -> Option<usize> {
    (0..input_dim).find(|&i| (i * stride + k * dilation) as i64 - padding as i64 == out as i64)
}

proptest! {
    /// Every slot the builder emits must agree with an independent
    /// scan-based derivation: zero exactly where no input sample scatters
    /// onto the position, the matching row offset everywhere else.
    #[test]
    fn prop_slots_match_scan_derivation((gather, mr) in arb_gather()) {
        let mut buffer = IndirectionBuffer::default();
        buffer.prepare(&gather, mr).unwrap();

        let kernel_size = gather.kernel_height * gather.kernel_width;
        let output_size = gather.output_height * gather.output_width;
        let tiled = (output_size + mr - 1) / mr * mr;
        prop_assert_eq!(buffer.len(), gather.batch_size * gather.groups * tiled * kernel_size);

        for group in 0..gather.groups {
            for image in 0..gather.batch_size {
                let panel = (group * gather.batch_size + image) * tiled * kernel_size;
                for tiled_index in 0..tiled {
                    let output_index = tiled_index.min(output_size - 1);
                    let oy = output_index / gather.output_width;
                    let ox = output_index % gather.output_width;
                    let tile_start = tiled_index / mr * mr;
                    for ky in 0..gather.kernel_height {
                        let iy = scan_source(
                            oy, ky,
                            gather.stride_height, gather.dilation_height,
                            gather.padding_top, gather.input_height,
                        );
                        for kx in 0..gather.kernel_width {
                            let ix = scan_source(
                                ox, kx,
                                gather.stride_width, gather.dilation_width,
                                gather.padding_left, gather.input_width,
                            );
                            let slot = panel
                                + tile_start * kernel_size
                                + (ky * gather.kernel_width + kx) * mr
                                + (tiled_index - tile_start);
                            let expected = match (iy, ix) {
                                (Some(y), Some(x)) => InputRow::At(
                                    ((image * gather.input_height + y) * gather.input_width + x)
                                        * gather.input_pixel_stride
                                        + group * gather.group_input_channels,
                                ),
                                _ => InputRow::Zero,
                            };
                            prop_assert_eq!(buffer.slots()[slot], expected);
                        }
                    }
                }
            }
        }
    }

    /// Input-row offsets never reach past the last gatherable row.
    #[test]
    fn prop_row_offsets_stay_in_bounds((gather, mr) in arb_gather()) {
        let mut buffer = IndirectionBuffer::default();
        buffer.prepare(&gather, mr).unwrap();

        let pixels = gather.batch_size * gather.input_height * gather.input_width;
        let max_offset = (pixels - 1) * gather.input_pixel_stride
            + (gather.groups - 1) * gather.group_input_channels;
        for slot in buffer.slots() {
            if let InputRow::At(offset) = slot {
                prop_assert!(*offset <= max_offset);
            }
        }
    }

    /// Requantization stays inside the clamp bounds, is monotone in the
    /// accumulator, and maps zero to the clamped output zero point.
    #[test]
    fn prop_requantize_clamped_and_monotone(
        scale in 1e-4f64..1e2,
        zero_point in 0u8..=255,
        min in 0u8..=100,
        max in 150u8..=255,
        accs in proptest::collection::vec(-100_000i32..100_000, 1..50),
    ) {
        let params = ConvQuantizationParams::compute(0, 0, scale, zero_point, min, max);
        prop_assert_eq!(
            params.requantize(0),
            zero_point.clamp(min, max)
        );

        let mut sorted = accs.clone();
        sorted.sort_unstable();
        let mut previous = None;
        for acc in sorted {
            let q = params.requantize(acc);
            prop_assert!((min..=max).contains(&q));
            if let Some(p) = previous {
                prop_assert!(q >= p, "requantize not monotone at {acc}");
            }
            previous = Some(q);
        }
    }
}
