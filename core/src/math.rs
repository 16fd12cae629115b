//! # Math Utilities for no_std
//!
//! Integer helpers for the residency statistics, built on libm.

/// Square root for f64
#[inline]
pub fn sqrt(x: f64) -> f64 {
    libm::sqrt(x)
}

/// Integer square root, rounding down.
///
/// Residency variances fit comfortably in the f64 mantissa for any
/// realistic sample magnitude (samples are 32-bit microsecond counts).
#[inline]
pub fn int_sqrt(x: u64) -> u64 {
    if x == 0 {
        return 0;
    }
    let mut r = sqrt(x as f64) as u64;
    // Round-trip guard for values near the mantissa edge. The root of
    // any u64 fits in 32 bits, so capping r keeps (r + 1)^2 in range.
    r = r.min(u32::MAX as u64);
    while r.saturating_mul(r) > x {
        r -= 1;
    }
    while r < u32::MAX as u64 && (r + 1) * (r + 1) <= x {
        r += 1;
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_sqrt_exact() {
        assert_eq!(int_sqrt(0), 0);
        assert_eq!(int_sqrt(1), 1);
        assert_eq!(int_sqrt(4), 2);
        assert_eq!(int_sqrt(144), 12);
        assert_eq!(int_sqrt(1_000_000), 1000);
    }

    #[test]
    fn test_int_sqrt_rounds_down() {
        assert_eq!(int_sqrt(2), 1);
        assert_eq!(int_sqrt(3), 1);
        assert_eq!(int_sqrt(99), 9);
        assert_eq!(int_sqrt(10_001), 100);
    }

    #[test]
    fn test_int_sqrt_large() {
        let v = 3_000_000_000u64;
        let r = int_sqrt(v);
        assert!(r * r <= v);
        assert!((r + 1) * (r + 1) > v);
    }
}
