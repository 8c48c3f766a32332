//! Human-readable size formatting for log output.

use core::fmt;

/// Wraps a size in bytes and formats it with binary prefixes (KiB, MiB, ...).
///
/// Whole multiples of a unit print without a fraction; everything else prints with
/// up to two decimals, truncated rather than rounded so that a size never appears
/// larger than it is.
///
/// # Examples
///
/// ```
/// use sgdma::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(512)), "512B");
/// assert_eq!(format!("{}", HumanSize(4096)), "4KiB");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
/// assert_eq!(format!("{}", HumanSize(256 << 20)), "256MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub u64);

impl From<usize> for HumanSize {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value as u64)
    }
}

impl From<u64> for HumanSize {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        let mut unit = 0;
        while unit + 1 < UNITS.len() && self.0 >> (10 * (unit + 1)) != 0 {
            unit += 1;
        }

        let shift = 10 * unit;
        let whole = self.0 >> shift;
        let rest = self.0 - (whole << shift);
        if rest == 0 {
            return write!(f, "{}{}", whole, UNITS[unit]);
        }

        // Hundredths of a unit, computed in 128 bits so EiB-scale values don't overflow.
        let hundredths = ((rest as u128 * 100) >> shift) as u64;
        match hundredths {
            0 => write!(f, "{}{}", whole, UNITS[unit]),
            h if h % 10 == 0 => write!(f, "{}.{}{}", whole, h / 10, UNITS[unit]),
            h => write!(f, "{}.{:02}{}", whole, h, UNITS[unit]),
        }
    }
}
