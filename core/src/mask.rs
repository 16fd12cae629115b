//! CPU set representation for vote tracking and sleep-window scans.

use core::fmt;

use static_assertions::const_assert;

/// Maximum number of CPUs the coordinator can track.
pub const MAX_CPUS: usize = 64;

const_assert!(MAX_CPUS <= u64::BITS as usize);

// ============================================================================
// CPU MASK
// ============================================================================

/// Fixed-width set of CPU ids.
///
/// Backs the per-cluster vote bookkeeping: one bit per CPU, compared
/// for exact equality against a cluster's expected child set.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    /// Empty set.
    pub const EMPTY: CpuMask = CpuMask(0);

    /// Set containing a single CPU.
    #[inline]
    pub const fn single(cpu: usize) -> Self {
        CpuMask(1u64 << (cpu & (MAX_CPUS - 1)))
    }

    /// Set containing CPUs `0..n`.
    #[inline]
    pub const fn first_n(n: usize) -> Self {
        if n == 0 {
            CpuMask(0)
        } else if n >= MAX_CPUS {
            CpuMask(u64::MAX)
        } else {
            CpuMask((1u64 << n) - 1)
        }
    }

    /// Build from a raw bit pattern.
    #[inline(always)]
    pub const fn from_bits(bits: u64) -> Self {
        CpuMask(bits)
    }

    /// Raw bit pattern (used by the trace ring).
    #[inline(always)]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// True when no CPU is present.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when `cpu` is present.
    #[inline(always)]
    pub const fn contains(self, cpu: usize) -> bool {
        self.0 & (1u64 << (cpu & (MAX_CPUS - 1))) != 0
    }

    /// Number of CPUs present.
    #[inline(always)]
    pub const fn weight(self) -> u32 {
        self.0.count_ones()
    }

    /// Add a CPU.
    #[inline]
    pub fn set(&mut self, cpu: usize) {
        self.0 |= 1u64 << (cpu & (MAX_CPUS - 1));
    }

    /// Remove a CPU.
    #[inline]
    pub fn clear(&mut self, cpu: usize) {
        self.0 &= !(1u64 << (cpu & (MAX_CPUS - 1)));
    }

    /// Union.
    #[inline(always)]
    pub const fn or(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 | other.0)
    }

    /// Intersection.
    #[inline(always)]
    pub const fn and(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    /// Set difference: CPUs in `self` but not in `other`.
    #[inline(always)]
    pub const fn and_not(self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & !other.0)
    }

    /// True when the two sets share at least one CPU.
    #[inline(always)]
    pub const fn intersects(self, other: CpuMask) -> bool {
        self.0 & other.0 != 0
    }

    /// True when every CPU of `self` is in `other`.
    #[inline(always)]
    pub const fn is_subset_of(self, other: CpuMask) -> bool {
        self.0 & !other.0 == 0
    }

    /// Iterator over the CPU ids present, ascending.
    #[inline]
    pub fn iter(self) -> CpuMaskIter {
        CpuMaskIter { bits: self.0 }
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

/// Iterator over the CPUs in a [`CpuMask`].
#[derive(Debug, Clone)]
pub struct CpuMaskIter {
    bits: u64,
}

impl Iterator for CpuMaskIter {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.bits == 0 {
            return None;
        }
        let cpu = self.bits.trailing_zeros() as usize;
        self.bits &= self.bits - 1;
        Some(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_contains() {
        let mut m = CpuMask::EMPTY;
        assert!(m.is_empty());
        m.set(0);
        m.set(5);
        assert!(m.contains(0));
        assert!(m.contains(5));
        assert!(!m.contains(1));
        assert_eq!(m.weight(), 2);
        m.clear(0);
        assert!(!m.contains(0));
        assert_eq!(m.weight(), 1);
    }

    #[test]
    fn test_first_n() {
        assert_eq!(CpuMask::first_n(0), CpuMask::EMPTY);
        assert_eq!(CpuMask::first_n(4).bits(), 0b1111);
        assert_eq!(CpuMask::first_n(64).bits(), u64::MAX);
    }

    #[test]
    fn test_set_algebra() {
        let a = CpuMask::from_bits(0b1100);
        let b = CpuMask::from_bits(0b0110);
        assert_eq!(a.or(b).bits(), 0b1110);
        assert_eq!(a.and(b).bits(), 0b0100);
        assert_eq!(a.and_not(b).bits(), 0b1000);
        assert!(a.intersects(b));
        assert!(!a.intersects(CpuMask::from_bits(0b0011)));
        assert!(CpuMask::from_bits(0b0100).is_subset_of(a));
        assert!(!b.is_subset_of(a));
    }

    #[test]
    fn test_iter_ascending() {
        let m = CpuMask::from_bits(0b1010_0001);
        let cpus: alloc::vec::Vec<usize> = m.iter().collect();
        assert_eq!(cpus, [0, 5, 7]);
    }
}
