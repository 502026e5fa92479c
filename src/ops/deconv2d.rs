//! Quantized 2-D transposed convolution (deconvolution).
//!
//! The operator maps pre-quantized u8 input and pre-packed weights to a
//! quantized u8 output equivalent, within requantization rounding, to a float
//! transposed convolution followed by affine quantization. The pipeline per
//! call: validate parameters, fill the zero row, resolve output geometry,
//! (re)build the indirection table if the geometry generation changed, then
//! drive the microkernel over a 4-D tiled grid. Setup is single-threaded;
//! tiles write disjoint output regions, so dispatch may run across a rayon
//! pool with no further synchronization.

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::cpu_kernels::{self, Q8ConvContext, Q8ConvKernel};
use crate::error::{KernelError, KernelResult};
use crate::indirection::{DeconvGather, IndirectionBuffer, InputRow};
use crate::weights::PackedDeconvWeights;

/// Vector width (in u8 lanes) the zero row must stay readable for, even when
/// the group has fewer real channels.
const ZERO_ROW_GUARD: usize = 8;

/// Static geometry and quantization metadata of one deconvolution.
///
/// Immutable once the operator is created; per-invocation tensor state
/// travels in [`DeconvArguments`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeconvDescriptor {
    pub kernel_height: usize,
    pub kernel_width: usize,
    pub stride_height: usize,
    pub stride_width: usize,
    pub dilation_height: usize,
    pub dilation_width: usize,
    pub padding_top: usize,
    pub padding_right: usize,
    pub padding_bottom: usize,
    pub padding_left: usize,
    /// Extra trailing output beyond the exact inverse-stride result, per
    /// axis; must be smaller than the stride.
    pub adjustment_height: usize,
    pub adjustment_width: usize,
    pub groups: usize,
    pub group_input_channels: usize,
    pub group_output_channels: usize,
    pub kernel_zero_point: u8,
    pub kernel_scale: f32,
    pub output_min: u8,
    pub output_max: u8,
}

impl Default for DeconvDescriptor {
    /// A unit 1×1 / stride-1 / single-channel geometry; useful as a struct
    /// literal base.
    fn default() -> Self {
        Self {
            kernel_height: 1,
            kernel_width: 1,
            stride_height: 1,
            stride_width: 1,
            dilation_height: 1,
            dilation_width: 1,
            padding_top: 0,
            padding_right: 0,
            padding_bottom: 0,
            padding_left: 0,
            adjustment_height: 0,
            adjustment_width: 0,
            groups: 1,
            group_input_channels: 1,
            group_output_channels: 1,
            kernel_zero_point: 0,
            kernel_scale: 1.0,
            output_min: 0,
            output_max: 255,
        }
    }
}

impl DeconvDescriptor {
    pub fn kernel_size(&self) -> usize {
        self.kernel_height * self.kernel_width
    }

    /// Total input channels across groups; also the natural input pixel
    /// stride for dense NHWC tensors.
    pub fn input_channels(&self) -> usize {
        self.groups * self.group_input_channels
    }

    pub fn output_channels(&self) -> usize {
        self.groups * self.group_output_channels
    }

    /// Check every descriptor invariant. Runs before any allocation, so a
    /// rejected descriptor costs nothing.
    pub fn validate(&self) -> KernelResult<()> {
        if self.kernel_height == 0 || self.kernel_width == 0 {
            return invalid_parameter("kernel dimensions must be positive");
        }
        if self.stride_height == 0 || self.stride_width == 0 {
            return invalid_parameter("stride dimensions must be positive");
        }
        if self.dilation_height == 0 || self.dilation_width == 0 {
            return invalid_parameter("dilation dimensions must be positive");
        }
        if self.adjustment_height >= self.stride_height
            || self.adjustment_width >= self.stride_width
        {
            return invalid_parameter("output adjustment must be smaller than the stride");
        }
        if self.groups == 0 || self.group_input_channels == 0 || self.group_output_channels == 0
        {
            return invalid_parameter("group and channel counts must be positive");
        }
        if self.output_min > self.output_max {
            return invalid_parameter("output clamp bounds are inverted");
        }
        validate_scale("kernel", self.kernel_scale)
    }

    /// Transposed-convolution output size for the given input size.
    ///
    /// Centralized so the indirection builder, the execution driver, and
    /// callers sizing output buffers can never disagree: a mismatch here
    /// would mean silently wrong gather addresses, not a crash.
    pub fn output_dims(
        &self,
        input_height: usize,
        input_width: usize,
    ) -> KernelResult<(usize, usize)> {
        let height = output_dimension(
            "height",
            input_height,
            self.stride_height,
            self.padding_top + self.padding_bottom,
            self.dilation_height,
            self.kernel_height,
            self.adjustment_height,
        )?;
        let width = output_dimension(
            "width",
            input_width,
            self.stride_width,
            self.padding_left + self.padding_right,
            self.dilation_width,
            self.kernel_width,
            self.adjustment_width,
        )?;
        Ok((height, width))
    }
}

/// `(input − 1) × stride − padding + dilation × (kernel − 1) + 1 + adjustment`
/// evaluated in signed arithmetic; a non-positive result is rejected rather
/// than left to wrap.
fn output_dimension(
    axis: &'static str,
    input: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
    kernel: usize,
    adjustment: usize,
) -> KernelResult<usize> {
    let computed = (input as i64 - 1) * stride as i64 - padding as i64
        + dilation as i64 * (kernel as i64 - 1)
        + 1
        + adjustment as i64;
    if computed <= 0 {
        log::error!("deconvolution output {axis} would be {computed} for input {input}");
        return Err(KernelError::InvalidGeometry { axis, computed });
    }
    Ok(computed as usize)
}

/// Per-invocation tensor state.
///
/// The output buffer must cover the geometry implied by
/// [`DeconvDescriptor::output_dims`]; the operator writes every output
/// element inside the pixel-stride layout and touches nothing else.
pub struct DeconvArguments<'a> {
    pub batch_size: usize,
    pub input_height: usize,
    pub input_width: usize,
    pub input: &'a [u8],
    /// Elements between consecutive input pixels; `input_channels()` for
    /// dense tensors.
    pub input_pixel_stride: usize,
    pub input_scale: f32,
    pub input_zero_point: u8,
    pub weights: &'a PackedDeconvWeights,
    pub output: &'a mut [u8],
    pub output_pixel_stride: usize,
    pub output_scale: f32,
    pub output_zero_point: u8,
}

/// Sentinel row backing every out-of-bounds or stride-gap gather slot.
#[derive(Debug)]
struct ZeroBuffer {
    data: Vec<u8>,
    offset: usize,
}

impl ZeroBuffer {
    /// Allocate `k_stride` usable elements. Rows narrower than the hardware
    /// vector width get an extra guard head, and the usable row starts past
    /// it, so a full vector access at the row never leaves the allocation.
    fn new(k_stride: usize, group_input_channels: usize) -> KernelResult<Self> {
        let offset = if group_input_channels < ZERO_ROW_GUARD {
            ZERO_ROW_GUARD
        } else {
            0
        };
        let size = k_stride + offset;
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| {
            log::error!("failed to allocate {size} bytes for zero padding");
            KernelError::OutOfMemory {
                what: "zero padding buffer",
                bytes: size,
            }
        })?;
        data.resize(size, 0);
        Ok(Self { data, offset })
    }

    fn fill(&mut self, input_zero_point: u8) {
        self.data.fill(input_zero_point);
    }

    fn row(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

/// A reusable quantized transposed-convolution operator.
///
/// Owns the zero row and the indirection table; input, output, and packed
/// weights are borrowed per call. Calls that repeat the previous geometry
/// skip rebuilding the indirection table, and a later call with a different
/// geometry resizes it rather than reusing stale slots.
#[derive(Debug)]
pub struct Deconv2d {
    descriptor: DeconvDescriptor,
    kernel: Q8ConvKernel,
    zero: ZeroBuffer,
    indirection: IndirectionBuffer,
}

impl Deconv2d {
    /// Create with the hardware-detected microkernel.
    pub fn new(descriptor: DeconvDescriptor) -> KernelResult<Self> {
        Self::with_kernel(descriptor, cpu_kernels::q8conv_kernel())
    }

    /// Create with an explicitly injected microkernel and tile geometry.
    pub fn with_kernel(descriptor: DeconvDescriptor, kernel: Q8ConvKernel) -> KernelResult<Self> {
        descriptor.validate()?;
        let k_stride = kernel.config.k_stride(descriptor.group_input_channels);
        let zero = ZeroBuffer::new(k_stride, descriptor.group_input_channels)?;
        Ok(Self {
            descriptor,
            kernel,
            zero,
            indirection: IndirectionBuffer::default(),
        })
    }

    pub fn descriptor(&self) -> &DeconvDescriptor {
        &self.descriptor
    }

    /// The operator's indirection table, as built by the last call.
    pub fn indirection(&self) -> &IndirectionBuffer {
        &self.indirection
    }

    /// Execute one deconvolution.
    ///
    /// `pool` of `None` runs synchronously on the calling thread; otherwise
    /// tiles are dispatched across the pool and the call returns once every
    /// tile has completed. A zero batch size is a valid no-op.
    pub fn run(
        &mut self,
        args: DeconvArguments<'_>,
        pool: Option<&ThreadPool>,
    ) -> KernelResult<()> {
        if args.batch_size == 0 {
            return Ok(());
        }
        validate_scale("input", args.input_scale)?;
        validate_scale("output", args.output_scale)?;
        if args.input_height == 0 || args.input_width == 0 {
            return invalid_parameter("input dimensions must be positive");
        }

        let descriptor = &self.descriptor;
        args.weights
            .check_compatible(descriptor, &self.kernel.config)?;

        let (output_height, output_width) =
            descriptor.output_dims(args.input_height, args.input_width)?;
        let output_size = output_height * output_width;

        let input_pixels = args.batch_size * args.input_height * args.input_width;
        check_tensor_len(
            "input",
            args.input.len(),
            input_pixels,
            args.input_pixel_stride,
            descriptor.input_channels(),
        )?;
        check_tensor_len(
            "output",
            args.output.len(),
            args.batch_size * output_size,
            args.output_pixel_stride,
            descriptor.output_channels(),
        )?;

        // Combined requantization scale; finiteness follows from the scale
        // checks above, widened to f64 before encoding.
        let scale = f64::from(args.input_scale) * f64::from(descriptor.kernel_scale)
            / f64::from(args.output_scale);
        let quantization = crate::quantization::ConvQuantizationParams::compute(
            args.input_zero_point,
            descriptor.kernel_zero_point,
            scale,
            args.output_zero_point,
            descriptor.output_min,
            descriptor.output_max,
        );

        self.zero.fill(args.input_zero_point);

        let gather = DeconvGather {
            batch_size: args.batch_size,
            input_height: args.input_height,
            input_width: args.input_width,
            output_height,
            output_width,
            kernel_height: descriptor.kernel_height,
            kernel_width: descriptor.kernel_width,
            stride_height: descriptor.stride_height,
            stride_width: descriptor.stride_width,
            dilation_height: descriptor.dilation_height,
            dilation_width: descriptor.dilation_width,
            padding_top: descriptor.padding_top,
            padding_left: descriptor.padding_left,
            groups: descriptor.groups,
            group_input_channels: descriptor.group_input_channels,
            input_pixel_stride: args.input_pixel_stride,
        };
        self.indirection.prepare(&gather, self.kernel.config.mr)?;

        let config = &self.kernel.config;
        let context = Q8ConvContext {
            input: args.input,
            zero_row: self.zero.row(),
            kc: descriptor.group_input_channels,
            ks: descriptor.kernel_size(),
            mr: config.mr,
            quantization,
        };
        let grid = TileGrid {
            groups: descriptor.groups,
            batch_size: args.batch_size,
            output_size,
            tiled_output_size: config.tiled_output_size(output_size),
            group_output_channels: descriptor.group_output_channels,
            mr: config.mr,
            nr: config.nr,
            kernel_size: descriptor.kernel_size(),
            output_pixel_stride: args.output_pixel_stride,
        };

        dispatch(
            &grid,
            &context,
            self.indirection.slots(),
            args.weights,
            self.kernel.ukernel,
            args.output.as_mut_ptr(),
            pool,
        );
        Ok(())
    }
}

/// One-shot create-and-run, the single synchronous call form.
pub fn deconv2d(
    descriptor: DeconvDescriptor,
    args: DeconvArguments<'_>,
    pool: Option<&ThreadPool>,
) -> KernelResult<()> {
    Deconv2d::new(descriptor)?.run(args, pool)
}

/// The 4-D tiled iteration space: unit tiles over groups and images, MR × NR
/// tiles over output pixels and channels.
struct TileGrid {
    groups: usize,
    batch_size: usize,
    output_size: usize,
    tiled_output_size: usize,
    group_output_channels: usize,
    mr: usize,
    nr: usize,
    kernel_size: usize,
    output_pixel_stride: usize,
}

impl TileGrid {
    fn pixel_tiles(&self) -> usize {
        self.tiled_output_size / self.mr
    }

    fn channel_tiles(&self) -> usize {
        (self.group_output_channels + self.nr - 1) / self.nr
    }

    fn total(&self) -> usize {
        self.groups * self.batch_size * self.pixel_tiles() * self.channel_tiles()
    }

    /// Decode a flat tile id into (group, image, pixel tile start, channel
    /// tile start).
    fn decode(&self, tile: usize) -> (usize, usize, usize, usize) {
        let channel_tiles = self.channel_tiles();
        let pixel_tiles = self.pixel_tiles();
        let channel_block = tile % channel_tiles;
        let rest = tile / channel_tiles;
        let pixel_block = rest % pixel_tiles;
        let rest = rest / pixel_tiles;
        let image = rest % self.batch_size;
        let group = rest / self.batch_size;
        (group, image, pixel_block * self.mr, channel_block * self.nr)
    }
}

/// Run every tile, serially or across the pool.
///
/// Tiles write disjoint output regions by construction, so the only
/// synchronization is the pool's own join. The output base pointer crosses
/// the closure boundary as an address; every write lands inside the
/// caller-validated output slice, which outlives the parallel region.
fn dispatch(
    grid: &TileGrid,
    context: &Q8ConvContext<'_>,
    slots: &[InputRow],
    weights: &PackedDeconvWeights,
    ukernel: crate::cpu_kernels::Q8ConvUkernel,
    out: *mut u8,
    pool: Option<&ThreadPool>,
) {
    match pool {
        None => {
            for tile in 0..grid.total() {
                run_tile(grid, context, slots, weights, ukernel, out, tile);
            }
        }
        Some(pool) => {
            let out_addr = out as usize;
            pool.install(|| {
                (0..grid.total()).into_par_iter().for_each(|tile| {
                    let out = out_addr as *mut u8;
                    run_tile(grid, context, slots, weights, ukernel, out, tile);
                });
            });
        }
    }
}

fn run_tile(
    grid: &TileGrid,
    context: &Q8ConvContext<'_>,
    slots: &[InputRow],
    weights: &PackedDeconvWeights,
    ukernel: crate::cpu_kernels::Q8ConvUkernel,
    out: *mut u8,
    tile: usize,
) {
    let (group, image, pixel_start, channel_start) = grid.decode(tile);
    let rows = (grid.output_size - pixel_start).min(grid.mr);
    let channels = (grid.group_output_channels - channel_start).min(grid.nr);

    let window_start = ((group * grid.batch_size + image) * grid.tiled_output_size
        + pixel_start)
        * grid.kernel_size;
    let window = &slots[window_start..window_start + grid.kernel_size * grid.mr];
    let packed = weights.block(group, channel_start / grid.nr);

    let out_offset = (image * grid.output_size + pixel_start) * grid.output_pixel_stride
        + group * grid.group_output_channels
        + channel_start;
    // Disjointness: every (image, pixel, group, channel) quadruple belongs
    // to exactly one tile.
    unsafe {
        ukernel(
            rows,
            channels,
            context,
            window,
            packed,
            out.add(out_offset),
            grid.output_pixel_stride,
        );
    }
}

fn validate_scale(which: &'static str, value: f32) -> KernelResult<()> {
    if value <= 0.0 || !value.is_normal() {
        log::error!("deconvolution rejected: {which} scale {value:.7e} must be finite and positive");
        return Err(KernelError::InvalidScale { which, value });
    }
    Ok(())
}

fn invalid_parameter(what: &'static str) -> KernelResult<()> {
    log::error!("deconvolution rejected: {what}");
    Err(KernelError::InvalidParameter { what })
}

/// The last pixel's row must fit: `(pixels − 1) × stride + channels`.
fn check_tensor_len(
    what: &'static str,
    len: usize,
    pixels: usize,
    pixel_stride: usize,
    channels: usize,
) -> KernelResult<()> {
    let needed = (pixels - 1) * pixel_stride + channels;
    if len < needed {
        log::error!("{what} tensor holds {len} elements, geometry implies {needed}");
        return Err(KernelError::BufferTooSmall { what, needed, got: len });
    }
    Ok(())
}
