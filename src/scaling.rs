//! Numeric rescaling for inside/outside score vectors.
//!
//! Inside scores are products of many sub-unit probabilities, so raw f64
//! arithmetic underflows on long sentences. Each score vector therefore
//! carries an integer scale exponent: the true value of an entry `x` with
//! exponent `s` is `x * SCALE^s`. Combining two scaled quantities sums their
//! exponents; converting to a log-probability goes through [`scaled_ln`].
//!
//! The scale base is 2^256. Any base large enough that a single rescaling
//! step clears accumulated underflow for plausible sentence lengths works;
//! 2^256 keeps the per-step multiplications exact (powers of two).

/// Binary exponent of the scale base: SCALE = 2^SCALE_EXP.
pub const SCALE_EXP: i32 = 256;

/// Natural log of the scale base.
pub const LN_SCALE: f64 = SCALE_EXP as f64 * std::f64::consts::LN_2;

/// SCALE^delta as an f64, saturating to 0.0 / +inf outside the f64 range.
pub fn scale_factor(delta: i32) -> f64 {
    if delta == 0 {
        return 1.0;
    }
    ((delta as f64) * (SCALE_EXP as f64)).exp2()
}

/// Rescale a score vector in place so its largest magnitude lies within
/// [SCALE^-1, SCALE], returning the adjusted scale exponent.
///
/// An all-zero vector is left untouched and keeps `previous_scale`.
pub fn rescale(scores: &mut [f64], previous_scale: i32) -> i32 {
    let max = scores.iter().fold(0.0_f64, |m, &x| m.max(x.abs()));
    if max == 0.0 || !max.is_finite() {
        return previous_scale;
    }

    let mut shift = 0i32;
    let mut m = max;
    let scale = scale_factor(1);
    let inv_scale = scale_factor(-1);
    while m > scale {
        m *= inv_scale;
        shift += 1;
    }
    while m < inv_scale {
        m *= scale;
        shift -= 1;
    }

    if shift != 0 {
        let factor = scale_factor(-shift);
        for x in scores.iter_mut() {
            *x *= factor;
        }
    }
    previous_scale + shift
}

/// True natural log of a scaled value.
///
/// This is the only sanctioned way to compare scores that may carry
/// different exponents; raw values across nodes are not comparable.
pub fn scaled_ln(value: f64, scale: i32) -> f64 {
    value.ln() + scale as f64 * LN_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_factor_identity() {
        assert_eq!(scale_factor(0), 1.0);
        assert_eq!(scale_factor(1) * scale_factor(-1), 1.0);
    }

    #[test]
    fn test_scale_factor_saturates() {
        assert_eq!(scale_factor(-100), 0.0);
        assert!(scale_factor(100).is_infinite());
    }

    #[test]
    fn test_rescale_noop_in_range() {
        let mut v = vec![0.5, 0.25];
        let s = rescale(&mut v, 0);
        assert_eq!(s, 0);
        assert_eq!(v, vec![0.5, 0.25]);
    }

    #[test]
    fn test_rescale_all_zero_keeps_scale() {
        let mut v = vec![0.0, 0.0];
        assert_eq!(rescale(&mut v, 3), 3);
    }

    #[test]
    fn test_rescale_underflow() {
        // 2^-513 needs two upward shifts to land in [SCALE^-1, SCALE].
        let tiny = scale_factor(-2) / 2.0;
        let mut v = vec![tiny, tiny / 2.0];
        let s = rescale(&mut v, 0);
        assert_eq!(s, -2);
        assert!((v[0] - 0.5).abs() < 1e-12);
        assert!((v[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_scaled_ln_round_trip() {
        // Simulate chains of multiplications of length 1, 10, 50 and check
        // the reconstructed log against a direct log-space sum.
        for &len in &[1usize, 10, 50] {
            let p = 1e-9_f64;
            let mut raw = 1.0;
            let mut scale = 0;
            for _ in 0..len {
                raw *= p;
                let mut v = [raw];
                scale = rescale(&mut v, scale);
                raw = v[0];
            }
            let expected = len as f64 * p.ln();
            let got = scaled_ln(raw, scale);
            assert!(
                (got - expected).abs() < 1e-6 * expected.abs().max(1.0),
                "len={len}: {got} vs {expected}"
            );
        }
    }
}
