//! Microarchitecture detection and hardware-adaptive kernel geometry.
//!
//! The blocked q8 microkernels come in per-ISA tile shapes: an MR × NR output
//! tile with the reduction axis packed in groups of KR. The geometry is
//! resolved once at startup from runtime feature detection and cached in a
//! global `OnceLock<ConvKernelConfig>`; every consumer either reads that
//! profile or injects an explicit one (tests, external microkernels).

use std::sync::OnceLock;

// ── ISA classes ────────────────────────────────────────────────────────

/// ISA classes with distinct q8 microkernel geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroArch {
    /// x86-64 with AVX2.
    Avx2,
    /// Baseline x86-64 (SSE2 is part of the base ISA).
    Sse2,
    /// AArch64 NEON.
    Neon,
    /// Portable fallback.
    Scalar,
}

impl MicroArch {
    /// Microkernel tile geometry (MR, NR, KR) for the q8 conv family.
    ///
    /// MR is output-pixel rows per tile, NR is output channels per tile, KR
    /// is the packing factor of the reduction (input-channel) axis.
    pub fn q8conv_geometry(self) -> (usize, usize, usize) {
        match self {
            Self::Avx2 => (4, 8, 2),
            Self::Sse2 => (4, 4, 2),
            Self::Neon => (8, 8, 1),
            Self::Scalar => (4, 4, 1),
        }
    }
}

impl std::fmt::Display for MicroArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Avx2 => "x86-64 AVX2",
            Self::Sse2 => "x86-64 SSE2",
            Self::Neon => "AArch64 NEON",
            Self::Scalar => "Scalar",
        };
        write!(f, "{name}")
    }
}

// ── Runtime detection ──────────────────────────────────────────────────

/// Detect the host ISA class.
pub fn detect() -> MicroArch {
    #[cfg(target_arch = "x86_64")]
    {
        return detect_x86();
    }
    #[cfg(target_arch = "aarch64")]
    {
        return detect_aarch64();
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        MicroArch::Scalar
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_x86() -> MicroArch {
    if std::arch::is_x86_feature_detected!("avx2") {
        MicroArch::Avx2
    } else {
        MicroArch::Sse2
    }
}

#[cfg(target_arch = "aarch64")]
fn detect_aarch64() -> MicroArch {
    if std::arch::is_aarch64_feature_detected!("neon") {
        MicroArch::Neon
    } else {
        MicroArch::Scalar
    }
}

// ── ConvKernelConfig ───────────────────────────────────────────────────

/// Hardware tiling profile consumed by the tiled execution drivers.
///
/// Computed once from the detected ISA class. The derived strides round the
/// per-group channel counts and the output pixel count up to the tile
/// geometry, so partial trailing tiles still address full, valid blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvKernelConfig {
    /// Detected ISA class.
    pub arch: MicroArch,
    /// Output-pixel rows per microkernel tile.
    pub mr: usize,
    /// Output channels per microkernel tile.
    pub nr: usize,
    /// Packing factor of the reduction (input-channel) axis.
    pub kr: usize,
}

impl ConvKernelConfig {
    /// Build the profile for a detected ISA class.
    pub fn from_arch(arch: MicroArch) -> Self {
        let (mr, nr, kr) = arch.q8conv_geometry();
        Self { arch, mr, nr, kr }
    }

    /// Explicit tile geometry, for tests and external microkernels.
    pub fn with_geometry(mr: usize, nr: usize, kr: usize) -> Self {
        Self {
            arch: MicroArch::Scalar,
            mr,
            nr,
            kr,
        }
    }

    /// Reduction depth rounded up to the packing factor.
    pub fn k_stride(&self, group_input_channels: usize) -> usize {
        round_up(group_input_channels, self.kr)
    }

    /// Output channel count rounded up to the column tile.
    pub fn n_stride(&self, group_output_channels: usize) -> usize {
        round_up(group_output_channels, self.nr)
    }

    /// Output pixel count rounded up to the row tile.
    pub fn tiled_output_size(&self, output_size: usize) -> usize {
        round_up(output_size, self.mr)
    }
}

impl std::fmt::Display for ConvKernelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} | MR={} NR={} KR={}",
            self.arch, self.mr, self.nr, self.kr
        )
    }
}

/// Round `value` up to the next multiple of `factor`.
pub(crate) fn round_up(value: usize, factor: usize) -> usize {
    (value + factor - 1) / factor * factor
}

// ── Global singleton ───────────────────────────────────────────────────

static CONFIG: OnceLock<ConvKernelConfig> = OnceLock::new();

/// Get the global hardware tiling profile.
///
/// Detected once on first call, then cached for the process lifetime.
pub fn conv_kernel_config() -> &'static ConvKernelConfig {
    CONFIG.get_or_init(|| {
        let config = ConvKernelConfig::from_arch(detect());
        log::debug!("q8 kernel geometry: {config}");
        config
    })
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_geometry_positive() {
        let (mr, nr, kr) = detect().q8conv_geometry();
        assert!(mr >= 1 && nr >= 1 && kr >= 1);
    }

    #[test]
    fn test_geometry_table() {
        assert_eq!(MicroArch::Avx2.q8conv_geometry(), (4, 8, 2));
        assert_eq!(MicroArch::Sse2.q8conv_geometry(), (4, 4, 2));
        assert_eq!(MicroArch::Neon.q8conv_geometry(), (8, 8, 1));
        assert_eq!(MicroArch::Scalar.q8conv_geometry(), (4, 4, 1));
    }

    #[test]
    fn test_strides_round_up() {
        let cfg = ConvKernelConfig::with_geometry(4, 8, 2);
        assert_eq!(cfg.k_stride(1), 2);
        assert_eq!(cfg.k_stride(2), 2);
        assert_eq!(cfg.k_stride(3), 4);
        assert_eq!(cfg.n_stride(8), 8);
        assert_eq!(cfg.n_stride(9), 16);
        assert_eq!(cfg.tiled_output_size(1), 4);
        assert_eq!(cfg.tiled_output_size(4), 4);
        assert_eq!(cfg.tiled_output_size(5), 8);
    }

    #[test]
    fn test_singleton_consistency() {
        let c1 = conv_kernel_config();
        let c2 = conv_kernel_config();
        assert_eq!(c1, c2);
        assert_eq!(c1.mr, c1.arch.q8conv_geometry().0);
    }
}
