//! qconv-kernels: low-level quantized convolution operators for CPU inference.
//!
//! This crate provides 8-bit fixed-point convolution-family operators with:
//! - **Indirection-buffer gather**: the strided, padded, dilated input access
//!   pattern is linearized into a flat table of input-row references read
//!   directly by the microkernel, with no im2col copies
//! - **Hardware-adaptive tile geometry**: the microkernel tile shape (MR, NR,
//!   KR) is resolved once at startup from runtime ISA detection, and can be
//!   injected explicitly anywhere it is consumed
//! - **Tiled parallel execution**: operators partition their iteration space
//!   into independent tiles and dispatch them serially or across a rayon pool
//! - **Raw-slice APIs**: quantized tensors are plain `&[u8]` / `&mut [u8]`
//!   with explicit pixel strides; no tensor framework is required
//!
//! # Quick Start
//!
//! ```ignore
//! use qconv_kernels::{
//!     conv_kernel_config, deconv2d, pack_deconv_weights, DeconvArguments, DeconvDescriptor,
//! };
//!
//! let descriptor = DeconvDescriptor {
//!     kernel_height: 4,
//!     kernel_width: 4,
//!     stride_height: 2,
//!     stride_width: 2,
//!     padding_top: 1,
//!     padding_bottom: 1,
//!     padding_left: 1,
//!     padding_right: 1,
//!     group_input_channels: 32,
//!     group_output_channels: 32,
//!     ..DeconvDescriptor::default()
//! };
//! let weights = pack_deconv_weights(&descriptor, &kernel, Some(&bias), conv_kernel_config())?;
//! deconv2d(descriptor, DeconvArguments { /* tensors */ }, None)?;
//! ```

pub mod cpu_kernels;
pub mod error;
pub mod indirection;
pub mod microarch;
pub mod ops;
pub mod quantization;
pub mod weights;

pub use cpu_kernels::{q8conv_kernel, PackedBlock, Q8ConvContext, Q8ConvKernel, Q8ConvUkernel};
pub use error::{KernelError, KernelResult};
pub use indirection::{DeconvGather, IndirectionBuffer, InputRow};
pub use microarch::{conv_kernel_config, ConvKernelConfig, MicroArch};
pub use ops::deconv2d::{deconv2d, Deconv2d, DeconvArguments, DeconvDescriptor};
pub use quantization::ConvQuantizationParams;
pub use weights::{pack_deconv_weights, PackedDeconvWeights};
