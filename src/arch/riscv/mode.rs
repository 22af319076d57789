use core::fmt;

use crate::util::{bit_extract, BitRange};
use crate::{PageSize, PAGE_SIZE_4K};

/// Deepest page-table walk of any supported mode (Sv48).
pub const MAX_LEVELS: usize = 4;

/// Size of the widened root table of the x4 guest-stage modes.
const X4_ROOT_TABLE_SIZE: u64 = 4 * PAGE_SIZE_4K;

const SV39_PAGE_SIZES: [PageSize; 3] = [PageSize::Size1G, PageSize::Size2M, PageSize::Size4K];
const SV48_PAGE_SIZES: [PageSize; 4] = [
    PageSize::Size512G,
    PageSize::Size1G,
    PageSize::Size2M,
    PageSize::Size4K,
];

// Per-level fields, level 0 (root) first.
const SV39_VPN: [BitRange; 3] = [
    BitRange::new(38, 30),
    BitRange::new(29, 21),
    BitRange::new(20, 12),
];
const SV39X4_VPN: [BitRange; 3] = [
    BitRange::new(40, 30),
    BitRange::new(29, 21),
    BitRange::new(20, 12),
];
const SV48_VPN: [BitRange; 4] = [
    BitRange::new(47, 39),
    BitRange::new(38, 30),
    BitRange::new(29, 21),
    BitRange::new(20, 12),
];
const SV48X4_VPN: [BitRange; 4] = [
    BitRange::new(49, 39),
    BitRange::new(38, 30),
    BitRange::new(29, 21),
    BitRange::new(20, 12),
];

const SV39_PA_PPN: [BitRange; 3] = [
    BitRange::new(55, 30),
    BitRange::new(29, 21),
    BitRange::new(20, 12),
];
const SV48_PA_PPN: [BitRange; 4] = [
    BitRange::new(55, 39),
    BitRange::new(38, 30),
    BitRange::new(29, 21),
    BitRange::new(20, 12),
];

const SV39_PTE_PPN: [BitRange; 3] = [
    BitRange::new(53, 28),
    BitRange::new(27, 19),
    BitRange::new(18, 10),
];
const SV48_PTE_PPN: [BitRange; 4] = [
    BitRange::new(53, 37),
    BitRange::new(36, 28),
    BitRange::new(27, 19),
    BitRange::new(18, 10),
];

/// Address translation schemes, as selected by the MODE field of `satp`, `vsatp` or `hgatp`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TranslationMode {
    Bare,
    Sv39,
    Sv48,
    Sv39x4,
    Sv48x4,
}

impl TranslationMode {
    pub const ALL: [TranslationMode; 5] = [
        TranslationMode::Bare,
        TranslationMode::Sv39,
        TranslationMode::Sv48,
        TranslationMode::Sv39x4,
        TranslationMode::Sv48x4,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            TranslationMode::Bare => "bare",
            TranslationMode::Sv39 => "sv39",
            TranslationMode::Sv48 => "sv48",
            TranslationMode::Sv39x4 => "sv39x4",
            TranslationMode::Sv48x4 => "sv48x4",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.name() == name)
    }

    /// The MODE field encoding of the translation-enable register.
    pub const fn encoding(self) -> u64 {
        match self {
            TranslationMode::Bare => 0,
            TranslationMode::Sv39 | TranslationMode::Sv39x4 => 8,
            TranslationMode::Sv48 | TranslationMode::Sv48x4 => 9,
        }
    }

    /// Number of page-table levels walked by this mode.
    pub const fn levels(self) -> usize {
        match self {
            TranslationMode::Bare => 0,
            TranslationMode::Sv39 | TranslationMode::Sv39x4 => 3,
            TranslationMode::Sv48 | TranslationMode::Sv48x4 => 4,
        }
    }

    pub const fn is_paged(self) -> bool {
        !matches!(self, TranslationMode::Bare)
    }

    /// Whether this is a guest-stage mode with a four-page root table.
    pub const fn is_x4(self) -> bool {
        matches!(self, TranslationMode::Sv39x4 | TranslationMode::Sv48x4)
    }

    /// Width of the translated input address.
    pub const fn input_bits(self) -> u32 {
        match self {
            TranslationMode::Bare => 64,
            TranslationMode::Sv39 => 39,
            TranslationMode::Sv48 => 48,
            TranslationMode::Sv39x4 => 41,
            TranslationMode::Sv48x4 => 50,
        }
    }

    /// Leaf sizes this mode can map, largest first. The position of a size is its leaf level.
    pub fn page_sizes(self) -> &'static [PageSize] {
        match self {
            TranslationMode::Bare => &[],
            TranslationMode::Sv39 | TranslationMode::Sv39x4 => &SV39_PAGE_SIZES,
            TranslationMode::Sv48 | TranslationMode::Sv48x4 => &SV48_PAGE_SIZES,
        }
    }

    pub fn leaf_level(self, size: PageSize) -> Option<usize> {
        self.page_sizes().iter().position(|&s| s == size)
    }

    pub fn vpn_ranges(self) -> &'static [BitRange] {
        match self {
            TranslationMode::Bare => &[],
            TranslationMode::Sv39 => &SV39_VPN,
            TranslationMode::Sv39x4 => &SV39X4_VPN,
            TranslationMode::Sv48 => &SV48_VPN,
            TranslationMode::Sv48x4 => &SV48X4_VPN,
        }
    }

    /// PPN fields of a physical address.
    pub fn pa_ppn_ranges(self) -> &'static [BitRange] {
        match self {
            TranslationMode::Bare => &[],
            TranslationMode::Sv39 | TranslationMode::Sv39x4 => &SV39_PA_PPN,
            TranslationMode::Sv48 | TranslationMode::Sv48x4 => &SV48_PA_PPN,
        }
    }

    /// PPN fields of a page-table entry.
    pub fn pte_ppn_ranges(self) -> &'static [BitRange] {
        match self {
            TranslationMode::Bare => &[],
            TranslationMode::Sv39 | TranslationMode::Sv39x4 => &SV39_PTE_PPN,
            TranslationMode::Sv48 | TranslationMode::Sv48x4 => &SV48_PTE_PPN,
        }
    }

    /// Bytes of page-table storage at `level`.
    pub const fn table_size(self, level: usize) -> u64 {
        if level == 0 && self.is_x4() {
            X4_ROOT_TABLE_SIZE
        } else {
            PAGE_SIZE_4K
        }
    }

    /// Bytes of input address space indexed by one table at `level`.
    pub fn level_span(self, level: usize) -> u64 {
        let msb = self.vpn_ranges()[level].msb;
        1u64 << (msb + 1)
    }

    /// Validates an input address and strips it to the bits the walk indexes.
    ///
    /// Virtual addresses must be sign-extended above the VA width, guest physical addresses of the
    /// x4 modes must be zero-extended.
    pub fn canonical_source(self, addr: u64) -> Option<u64> {
        let bits = self.input_bits();
        if bits >= 64 {
            return Some(addr);
        }
        let upper = addr >> bits;
        let ok = if self.is_x4() {
            upper == 0
        } else {
            let sign = bit_extract(addr, bits - 1, 1);
            let upper_all = u64::MAX >> bits;
            (sign == 0 && upper == 0) || (sign == 1 && upper == upper_all)
        };
        ok.then_some(bit_extract(addr, 0, bits))
    }
}

impl fmt::Display for TranslationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_geometry() {
        assert_eq!(TranslationMode::Sv39.levels(), 3);
        assert_eq!(TranslationMode::Sv48x4.levels(), 4);
        assert_eq!(TranslationMode::Sv39.leaf_level(PageSize::Size4K), Some(2));
        assert_eq!(TranslationMode::Sv48.leaf_level(PageSize::Size512G), Some(0));
        assert_eq!(TranslationMode::Sv39.leaf_level(PageSize::Size512G), None);
        assert_eq!(TranslationMode::Sv39x4.table_size(0), 0x4000);
        assert_eq!(TranslationMode::Sv39x4.table_size(1), 0x1000);
        assert_eq!(TranslationMode::Sv39.level_span(0), 1 << 39);
        assert_eq!(TranslationMode::Sv39.level_span(1), 1 << 30);
        assert_eq!(TranslationMode::Sv48x4.level_span(0), 1 << 50);
        // 2048 root entries of eight bytes fill the 16K root of Sv39x4.
        assert_eq!(
            (1u64 << TranslationMode::Sv39x4.vpn_ranges()[0].width()) * 8,
            TranslationMode::Sv39x4.table_size(0)
        );
    }

    #[test]
    fn canonical_addresses() {
        let sv39 = TranslationMode::Sv39;
        assert_eq!(sv39.canonical_source(0x8000_0000), Some(0x8000_0000));
        assert_eq!(
            sv39.canonical_source(0xffff_ffff_c000_0000),
            Some(0x7f_c000_0000)
        );
        assert_eq!(sv39.canonical_source(0x40_0000_0000), None);
        assert_eq!(
            TranslationMode::Sv39x4.canonical_source(0x1ff_0000_0000),
            Some(0x1ff_0000_0000)
        );
        assert_eq!(TranslationMode::Sv39x4.canonical_source(0x200_0000_0000), None);
    }

    #[test]
    fn names_and_encodings() {
        assert_eq!(TranslationMode::from_name("sv48x4"), Some(TranslationMode::Sv48x4));
        assert_eq!(TranslationMode::from_name("sv57"), None);
        assert_eq!(TranslationMode::Sv39x4.encoding(), 8);
        assert_eq!(TranslationMode::Sv48.encoding(), 9);
    }
}
