//! Packed weight and bias layout for the blocked q8 conv microkernel.
//!
//! The microkernel consumes weights in NR-wide channel blocks: for each
//! (group, channel block) it reads NR bias lanes and then, tap by tap,
//! `k_stride × NR` interleaved weight bytes. Lanes past the real channel or
//! input-channel counts are filled with the kernel zero point so they
//! contribute zero to the accumulator, which lets partial trailing blocks run
//! through the same code path as full ones.

use crate::cpu_kernels::PackedBlock;
use crate::error::{KernelError, KernelResult};
use crate::microarch::ConvKernelConfig;
use crate::ops::deconv2d::DeconvDescriptor;

/// Weights and bias packed for one deconvolution geometry and tile profile.
///
/// Prepared once ahead of inference and borrowed by every call; the operator
/// never copies or frees it.
#[derive(Debug, Clone)]
pub struct PackedDeconvWeights {
    bias: Vec<i32>,
    weights: Vec<u8>,
    groups: usize,
    group_input_channels: usize,
    group_output_channels: usize,
    kernel_size: usize,
    nr: usize,
    kr: usize,
}

impl PackedDeconvWeights {
    /// Rounded-up per-group output channel count.
    pub fn n_stride(&self) -> usize {
        crate::microarch::round_up(self.group_output_channels, self.nr)
    }

    /// Rounded-up reduction depth.
    pub fn k_stride(&self) -> usize {
        crate::microarch::round_up(self.group_input_channels, self.kr)
    }

    fn block_len(&self) -> usize {
        self.kernel_size * self.k_stride() * self.nr
    }

    /// The bias/weight block for one group and NR-aligned channel block.
    pub fn block(&self, group: usize, channel_block: usize) -> PackedBlock<'_> {
        let blocks_per_group = self.n_stride() / self.nr;
        let index = group * blocks_per_group + channel_block;
        let block_len = self.block_len();
        PackedBlock {
            bias: &self.bias[group * self.n_stride() + channel_block * self.nr..][..self.nr],
            weights: &self.weights[index * block_len..][..block_len],
            k_stride: self.k_stride(),
            nr: self.nr,
        }
    }

    /// Reject packings that do not match the operator about to consume them.
    pub(crate) fn check_compatible(
        &self,
        descriptor: &DeconvDescriptor,
        config: &ConvKernelConfig,
    ) -> KernelResult<()> {
        let compatible = self.groups == descriptor.groups
            && self.group_input_channels == descriptor.group_input_channels
            && self.group_output_channels == descriptor.group_output_channels
            && self.kernel_size == descriptor.kernel_size()
            && self.nr == config.nr
            && self.kr == config.kr;
        if !compatible {
            log::error!(
                "packed weights were prepared for a different geometry or tile profile"
            );
            return Err(KernelError::InvalidParameter {
                what: "packed weights do not match the operator descriptor and tile geometry",
            });
        }
        Ok(())
    }
}

/// Pack a deconvolution kernel and optional bias into the blocked layout.
///
/// `kernel` is the grouped layout `[groups][goc][kh][kw][gic]`, flattened
/// row-major. `bias` holds one i32 per output channel (`groups × goc`);
/// absent bias packs as zero.
pub fn pack_deconv_weights(
    descriptor: &DeconvDescriptor,
    kernel: &[u8],
    bias: Option<&[i32]>,
    config: &ConvKernelConfig,
) -> KernelResult<PackedDeconvWeights> {
    descriptor.validate()?;

    let groups = descriptor.groups;
    let gic = descriptor.group_input_channels;
    let goc = descriptor.group_output_channels;
    let kernel_size = descriptor.kernel_size();

    let expected = groups * goc * kernel_size * gic;
    if kernel.len() != expected {
        log::error!(
            "kernel tensor has {} elements, geometry implies {expected}",
            kernel.len()
        );
        return Err(KernelError::BufferTooSmall {
            what: "kernel",
            needed: expected,
            got: kernel.len(),
        });
    }
    if let Some(bias) = bias {
        let expected = groups * goc;
        if bias.len() != expected {
            log::error!(
                "bias tensor has {} elements, geometry implies {expected}",
                bias.len()
            );
            return Err(KernelError::BufferTooSmall {
                what: "bias",
                needed: expected,
                got: bias.len(),
            });
        }
    }

    let n_stride = config.n_stride(goc);
    let k_stride = config.k_stride(gic);

    let bias_len = groups * n_stride;
    let mut packed_bias = Vec::new();
    packed_bias.try_reserve_exact(bias_len).map_err(|_| {
        let bytes = bias_len * std::mem::size_of::<i32>();
        log::error!("failed to allocate {bytes} bytes for packed bias");
        KernelError::OutOfMemory {
            what: "packed bias",
            bytes,
        }
    })?;
    packed_bias.resize(bias_len, 0i32);

    let weights_len = groups * n_stride * kernel_size * k_stride;
    let mut packed_weights = Vec::new();
    packed_weights.try_reserve_exact(weights_len).map_err(|_| {
        log::error!("failed to allocate {weights_len} bytes for packed weights");
        KernelError::OutOfMemory {
            what: "packed weights",
            bytes: weights_len,
        }
    })?;
    packed_weights.resize(weights_len, descriptor.kernel_zero_point);

    let block_len = kernel_size * k_stride * config.nr;
    let blocks_per_group = n_stride / config.nr;
    for group in 0..groups {
        for oc in 0..goc {
            if let Some(bias) = bias {
                packed_bias[group * n_stride + oc] = bias[group * goc + oc];
            }
            let block = group * blocks_per_group + oc / config.nr;
            let lane = oc % config.nr;
            for tap in 0..kernel_size {
                for ic in 0..gic {
                    let src = ((group * goc + oc) * kernel_size + tap) * gic + ic;
                    let dst =
                        block * block_len + (tap * k_stride + ic) * config.nr + lane;
                    packed_weights[dst] = kernel[src];
                }
            }
        }
    }

    Ok(PackedDeconvWeights {
        bias: packed_bias,
        weights: packed_weights,
        groups,
        group_input_channels: gic,
        group_output_channels: goc,
        kernel_size,
        nr: config.nr,
        kr: config.kr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::deconv2d::DeconvDescriptor;

    fn descriptor(goc: usize, gic: usize) -> DeconvDescriptor {
        DeconvDescriptor {
            kernel_height: 1,
            kernel_width: 2,
            group_input_channels: gic,
            group_output_channels: goc,
            ..DeconvDescriptor::default()
        }
    }

    #[test]
    fn test_pack_interleaves_channel_lanes() {
        let desc = descriptor(2, 2);
        let config = ConvKernelConfig::with_geometry(4, 2, 1);
        // kernel[oc][tap][ic] = 10·oc + 2·tap + ic + 1
        let kernel: Vec<u8> = (0..2u8)
            .flat_map(|oc| (0..2u8).flat_map(move |tap| (0..2u8).map(move |ic| 10 * oc + 2 * tap + ic + 1)))
            .collect();
        let packed = pack_deconv_weights(&desc, &kernel, None, &config).unwrap();
        let block = packed.block(0, 0);
        // Per tap, lanes are [k0·oc0, k0·oc1, k1·oc0, k1·oc1].
        assert_eq!(block.weights, &[1, 11, 2, 12, 3, 13, 4, 14]);
        assert_eq!(block.bias, &[0, 0]);
    }

    #[test]
    fn test_pack_pads_lanes_with_kernel_zero_point() {
        let desc = DeconvDescriptor {
            kernel_zero_point: 9,
            ..descriptor(1, 1)
        };
        let config = ConvKernelConfig::with_geometry(4, 2, 2);
        let packed = pack_deconv_weights(&desc, &[3, 4], Some(&[7]), &config).unwrap();
        let block = packed.block(0, 0);
        // One real channel and one real input channel; every padding lane
        // holds the kernel zero point.
        assert_eq!(block.k_stride, 2);
        assert_eq!(block.weights, &[3, 9, 9, 9, 4, 9, 9, 9]);
        assert_eq!(block.bias, &[7, 0]);
    }

    #[test]
    fn test_pack_rejects_wrong_kernel_len() {
        let desc = descriptor(2, 2);
        let config = ConvKernelConfig::with_geometry(4, 4, 1);
        let err = pack_deconv_weights(&desc, &[0u8; 7], None, &config).unwrap_err();
        assert!(matches!(err, KernelError::BufferTooSmall { what: "kernel", .. }));
    }

    #[test]
    fn test_grouped_blocks_are_independent() {
        let desc = DeconvDescriptor {
            groups: 2,
            ..descriptor(1, 1)
        };
        let config = ConvKernelConfig::with_geometry(4, 1, 1);
        let kernel = [1u8, 2, 3, 4]; // two groups, one channel, two taps
        let packed = pack_deconv_weights(&desc, &kernel, Some(&[5, 6]), &config).unwrap();
        assert_eq!(packed.block(0, 0).weights, &[1, 2]);
        assert_eq!(packed.block(1, 0).weights, &[3, 4]);
        assert_eq!(packed.block(0, 0).bias, &[5]);
        assert_eq!(packed.block(1, 0).bias, &[6]);
    }
}
