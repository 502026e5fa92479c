//! Requantization parameters for quantized convolution.
//!
//! A quantized convolution accumulates `Σ (x − x_zp)(w − w_zp)` in i32 and
//! maps the sum back into the 8-bit output domain through one combined scale
//! `input_scale × kernel_scale / output_scale`. The scale is encoded once per
//! call as a Q31 fixed-point multiplier plus a signed power-of-two shift, so
//! the microkernel requantizes with integer arithmetic only.

/// Packaged quantization metadata, consumed unmodified by the microkernel.
///
/// Built once per operator invocation; performs no accumulator rounding
/// itself. [`ConvQuantizationParams::requantize`] is the single fixed-point
/// mapping every microkernel applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvQuantizationParams {
    pub input_zero_point: i32,
    pub kernel_zero_point: i32,
    pub output_zero_point: i32,
    pub output_min: u8,
    pub output_max: u8,
    multiplier: i32,
    shift: i32,
}

impl ConvQuantizationParams {
    /// Package zero points, clamp bounds, and the combined requantization
    /// scale.
    ///
    /// `scale` must be finite, positive, and normal; callers validate the
    /// constituent scales before any allocation happens, so a violation here
    /// is a caller bug rather than a runtime condition.
    pub fn compute(
        input_zero_point: u8,
        kernel_zero_point: u8,
        scale: f64,
        output_zero_point: u8,
        output_min: u8,
        output_max: u8,
    ) -> Self {
        let (multiplier, shift) = quantize_multiplier(scale);
        Self {
            input_zero_point: i32::from(input_zero_point),
            kernel_zero_point: i32::from(kernel_zero_point),
            output_zero_point: i32::from(output_zero_point),
            output_min,
            output_max,
            multiplier,
            shift,
        }
    }

    /// Map an i32 accumulator into the quantized output domain: scale,
    /// round half away from zero, add the output zero point, clamp.
    #[inline]
    pub fn requantize(&self, acc: i32) -> u8 {
        let scaled = multiply_by_quantized_multiplier(acc, self.multiplier, self.shift);
        let shifted = scaled.saturating_add(self.output_zero_point);
        shifted.clamp(i32::from(self.output_min), i32::from(self.output_max)) as u8
    }
}

/// Encode a positive scale as `(multiplier, shift)` with
/// `scale ≈ multiplier × 2^(shift − 31)` and `multiplier` in `[2^30, 2^31)`.
fn quantize_multiplier(scale: f64) -> (i32, i32) {
    debug_assert!(scale.is_normal() && scale > 0.0, "bad scale {scale}");
    // frexp: scale = fraction × 2^exponent with fraction in [0.5, 1).
    let bits = scale.to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i32 - 1022;
    let fraction = f64::from_bits((bits & 0x000f_ffff_ffff_ffff) | (1022u64 << 52));
    let mut multiplier = (fraction * (1i64 << 31) as f64).round() as i64;
    let mut shift = exponent;
    if multiplier == 1i64 << 31 {
        multiplier /= 2;
        shift += 1;
    }
    (multiplier as i32, shift)
}

/// `acc × multiplier × 2^(shift − 31)`, rounded half away from zero in a
/// single step, saturated to i32.
#[inline]
fn multiply_by_quantized_multiplier(acc: i32, multiplier: i32, shift: i32) -> i32 {
    let product = i64::from(acc) * i64::from(multiplier);
    let right_shift = 31 - shift;
    if right_shift <= 0 {
        // Net left shift: the true value is product × 2^|right_shift|.
        let shifted = (product as i128) << (-right_shift).min(64);
        return shifted.clamp(i128::from(i32::MIN), i128::from(i32::MAX)) as i32;
    }
    let right_shift = right_shift.min(63) as u32;
    let rounding = 1i64 << (right_shift - 1);
    let value = if product >= 0 {
        (product + rounding) >> right_shift
    } else {
        -((-product + rounding) >> right_shift)
    };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(scale: f64) -> ConvQuantizationParams {
        ConvQuantizationParams::compute(0, 0, scale, 0, 0, 255)
    }

    #[test]
    fn test_identity_scale_is_exact() {
        let p = params(1.0);
        for acc in [0, 1, 2, 17, 100, 255] {
            assert_eq!(p.requantize(acc), acc as u8);
        }
    }

    #[test]
    fn test_half_scale_rounds_half_away() {
        let p = params(0.5);
        assert_eq!(p.requantize(2), 1);
        assert_eq!(p.requantize(3), 2); // 1.5 rounds away from zero
        assert_eq!(p.requantize(5), 3); // 2.5 rounds away from zero
    }

    #[test]
    fn test_negative_accumulator_clamps_to_min() {
        let p = ConvQuantizationParams::compute(0, 0, 1.0, 0, 10, 250);
        assert_eq!(p.requantize(-100), 10);
        assert_eq!(p.requantize(300), 250);
    }

    #[test]
    fn test_output_zero_point_offsets_result() {
        let p = ConvQuantizationParams::compute(0, 0, 1.0, 128, 0, 255);
        assert_eq!(p.requantize(0), 128);
        assert_eq!(p.requantize(-5), 123);
        assert_eq!(p.requantize(50), 178);
    }

    #[test]
    fn test_multiplier_encoding_bounds() {
        for scale in [1.0 / 1024.0, 0.25, 0.37, 0.999, 1.0, 1.5, 2.0, 117.3] {
            let (multiplier, shift) = quantize_multiplier(scale);
            let decoded = multiplier as f64 * 2f64.powi(shift - 31);
            assert!((1i64 << 30..1i64 << 31).contains(&i64::from(multiplier)));
            assert!(
                (decoded - scale).abs() / scale < 1e-9,
                "scale {scale} decoded as {decoded}"
            );
        }
    }

    #[test]
    fn test_matches_float_reference() {
        // Reference with the decoded scale: acc × multiplier fits a f64
        // mantissa exactly, so f64 rounding and the integer path must agree
        // on every value including ties.
        for scale in [0.0001, 0.013, 0.5, 0.75, 1.0, 1.25, 4.0] {
            let (multiplier, shift) = quantize_multiplier(scale);
            let decoded = multiplier as f64 * 2f64.powi(shift - 31);
            let p = params(scale);
            for acc in (-2000..2000).step_by(7) {
                let reference = (f64::from(acc) * decoded).round().clamp(0.0, 255.0) as u8;
                assert_eq!(p.requantize(acc), reference, "scale {scale} acc {acc}");
            }
        }
    }
}
