/// An inclusive bit range `[msb:lsb]` of a 64-bit value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitRange {
    pub msb: u32,
    pub lsb: u32,
}

impl BitRange {
    pub const fn new(msb: u32, lsb: u32) -> Self {
        Self { msb, lsb }
    }

    pub const fn width(self) -> u32 {
        self.msb - self.lsb + 1
    }

    /// Returns the field selected by this range, shifted down to bit 0.
    pub const fn extract(self, bits: u64) -> u64 {
        bit_extract(bits, self.lsb, self.width())
    }

    /// Places the low `width` bits of `field` at this range.
    pub const fn place(self, field: u64) -> u64 {
        (field & mask(self.width())) << self.lsb
    }
}

#[inline(always)]
pub const fn mask(len: u32) -> u64 {
    if len >= 64 {
        u64::MAX
    } else {
        (1 << len) - 1
    }
}

#[inline(always)]
pub const fn bit_extract(bits: u64, off: u32, len: u32) -> u64 {
    (bits >> off) & mask(len)
}

#[inline(always)]
pub const fn round_down(value: u64, to: u64) -> u64 {
    value & !(to - 1)
}

/// Exclusive end of `[base, base + size)`. Widened so ranges ending at the top of the 64-bit
/// space stay representable.
#[inline(always)]
pub const fn range_end(base: u64, size: u64) -> u128 {
    base as u128 + size as u128
}

#[inline(always)]
pub const fn range_in_range(base1: u64, size1: u64, base2: u64, size2: u64) -> bool {
    (base1 >= base2) && (range_end(base1, size1) <= range_end(base2, size2))
}

/// Parses a decimal, `0x`-hex or `0b`-binary number.
pub fn parse_u64(text: &str) -> Option<u64> {
    let text = text.trim();
    let (digits, radix) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (hex, 16)
    } else if let Some(bin) = text
        .strip_prefix("0b")
        .or_else(|| text.strip_prefix("0B"))
    {
        (bin, 2)
    } else {
        (text, 10)
    };
    if digits.is_empty() || digits.starts_with('_') {
        return None;
    }
    let mut value: u64 = 0;
    for c in digits.chars() {
        if c == '_' {
            continue;
        }
        let digit = c.to_digit(radix)? as u64;
        value = value.checked_mul(radix as u64)?.checked_add(digit)?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_ranges() {
        let vpn2 = BitRange::new(38, 30);
        assert_eq!(vpn2.width(), 9);
        assert_eq!(vpn2.extract(0x8000_0000), 2);
        assert_eq!(vpn2.place(0x3ff), 0x1ff << 30);
        assert_eq!(BitRange::new(63, 0).extract(u64::MAX), u64::MAX);
    }

    #[test]
    fn ranges() {
        assert!(range_in_range(0x2000, 0x1000, 0x1000, 0x3000));
        assert!(!range_in_range(0x3000, 0x2000, 0x1000, 0x3000));
        assert_eq!(range_end(u64::MAX - 0xfff, 0x1000), 1u128 << 64);
        assert_eq!(round_down(0x8020_1234, 0x20_0000), 0x8020_0000);
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_u64("4096"), Some(4096));
        assert_eq!(parse_u64("0x8000_0000"), Some(0x8000_0000));
        assert_eq!(parse_u64("0b101"), Some(5));
        assert_eq!(parse_u64("0x"), None);
        assert_eq!(parse_u64("12z"), None);
        assert_eq!(parse_u64("0x1_0000_0000_0000_0000"), None);
    }
}
