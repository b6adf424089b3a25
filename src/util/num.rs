/// Round up `n` to the nearest multiple of `to`
pub const fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// Round down `n` to a multiple of `to`, which must be a power of two
pub const fn round_down_pow2(n: usize, to: usize) -> usize {
    n & !(to - 1)
}

/// Round up `n` to a multiple of `to`, which must be a power of two
pub const fn align_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

/// Units used when printing byte counts
pub const BYTE_UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

/// Divide `bytes` by 1024 while it is larger than 1024, returning the scaled
/// value and its unit, e.g. `1536 -> (1.5, "KB")`.
pub fn scale_bytes(bytes: usize) -> (f64, &'static str) {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value > 1024.0 && unit + 1 < BYTE_UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    (value, BYTE_UNITS[unit])
}

/// `ceil(log4(n))`, with `0` for `n <= 1`. Sizes in `(4^(k-1), 4^k]` map to
/// `k`.
pub fn log4ceil(n: usize) -> u32 {
    let mut k = 0;
    let mut bound = 1usize;
    while bound < n {
        bound = bound.saturating_mul(4);
        k += 1;
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_works() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_down_pow2(8191, 4096), 4096);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(32, 16), 32);
    }

    #[test]
    fn scale_bytes_picks_unit() {
        assert_eq!(scale_bytes(1000), (1000.0, "B"));
        assert_eq!(scale_bytes(1024), (1024.0, "B"));
        assert_eq!(scale_bytes(1536), (1.5, "KB"));
        assert_eq!(scale_bytes(3 * 1024 * 1024), (3.0, "MB"));
    }

    #[test]
    fn log4ceil_computes_correctly() {
        assert_eq!(log4ceil(0), 0);
        assert_eq!(log4ceil(1), 0);
        assert_eq!(log4ceil(4), 1);
        assert_eq!(log4ceil(5), 2);
        assert_eq!(log4ceil(16), 2);
        assert_eq!(log4ceil(17), 3);
    }
}
