use core::fmt;

use tock_registers::{register_bitfields, LocalRegisterCopy};

use super::TranslationMode;

pub const PTE_SIZE: u64 = 8;

register_bitfields! [u64,
    pub PTE [
        V OFFSET(0) NUMBITS(1) [],
        XWR OFFSET(1) NUMBITS(3) [],
        U OFFSET(4) NUMBITS(1) [],
        G OFFSET(5) NUMBITS(1) [],
        A OFFSET(6) NUMBITS(1) [],
        D OFFSET(7) NUMBITS(1) [],
        RSW OFFSET(8) NUMBITS(2) [],
        PPN OFFSET(10) NUMBITS(44) [],
        PBMT OFFSET(61) NUMBITS(2) [
            Pma = 0,
            Nc = 1,
            Io = 2
        ],
        N OFFSET(63) NUMBITS(1) []
    ],
    pub XATP [
        PPN OFFSET(0) NUMBITS(44) [],
        ID OFFSET(44) NUMBITS(16) [],
        MODE OFFSET(60) NUMBITS(4) []
    ]
];

type PteValue = LocalRegisterCopy<u64, PTE::Register>;

/// Page-based memory type (Svpbmt) of a leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PbmtMode {
    /// Use the physical memory attributes of the region.
    Pma,
    /// Non-cacheable, idempotent, weakly-ordered main memory.
    Nc,
    /// Non-cacheable, non-idempotent, strongly-ordered I/O memory.
    Io,
}

impl PbmtMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pma" => Some(PbmtMode::Pma),
            "nc" => Some(PbmtMode::Nc),
            "io" => Some(PbmtMode::Io),
            _ => None,
        }
    }

    const fn bits(self) -> u64 {
        match self {
            PbmtMode::Pma => 0,
            PbmtMode::Nc => 1,
            PbmtMode::Io => 2,
        }
    }

    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(PbmtMode::Pma),
            1 => Some(PbmtMode::Nc),
            2 => Some(PbmtMode::Io),
            _ => None,
        }
    }
}

/// Leaf permissions as an `xwr` triple: bit 2 execute, bit 1 write, bit 0 read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Permissions(u8);

impl Permissions {
    /// Returns `None` for values that do not describe a leaf: zero (a table pointer), the
    /// reserved write-without-read combinations, and anything wider than three bits.
    pub const fn from_xwr(xwr: u64) -> Option<Self> {
        match xwr {
            0 | 0b010 | 0b110 => None,
            1..=7 => Some(Self(xwr as u8)),
            _ => None,
        }
    }

    pub const fn xwr(self) -> u64 {
        self.0 as u64
    }

    pub const fn readable(self) -> bool {
        self.0 & 0b001 != 0
    }

    pub const fn writable(self) -> bool {
        self.0 & 0b010 != 0
    }

    pub const fn executable(self) -> bool {
        self.0 & 0b100 != 0
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.readable(), 'r'),
            flag(self.writable(), 'w'),
            flag(self.executable(), 'x')
        )
    }
}

/// A decoded leaf entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafEntry {
    /// Output address the leaf's frame starts at.
    pub frame: u64,
    pub permissions: Permissions,
    pub user: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub pbmt: PbmtMode,
    pub valid: bool,
}

/// Moves the PPN fields of a physical address into their PTE positions.
fn splice_ppn(mode: TranslationMode, addr: u64) -> u64 {
    mode.pa_ppn_ranges()
        .iter()
        .zip(mode.pte_ppn_ranges())
        .fold(0, |pte, (pa, field)| pte | field.place(pa.extract(addr)))
}

/// Inverse of [`splice_ppn`].
fn unsplice_ppn(mode: TranslationMode, pte: u64) -> u64 {
    mode.pa_ppn_ranges()
        .iter()
        .zip(mode.pte_ppn_ranges())
        .fold(0, |addr, (pa, field)| addr | pa.place(field.extract(pte)))
}

/// Encodes a leaf. Accessed and dirty are always set: the images are never faulted in.
pub fn leaf_pte(
    mode: TranslationMode,
    dest: u64,
    permissions: Permissions,
    user: bool,
    pbmt: Option<PbmtMode>,
    valid: bool,
) -> u64 {
    assert!(
        !(permissions.writable() && !permissions.readable()),
        "write-only leaf permissions {:#b}",
        permissions.xwr()
    );
    let mut pte = PteValue::new(splice_ppn(mode, dest));
    pte.modify(
        PTE::V.val(valid as u64)
            + PTE::XWR.val(permissions.xwr())
            + PTE::U.val(user as u64)
            + PTE::A::SET
            + PTE::D::SET,
    );
    if let Some(pbmt) = pbmt {
        pte.modify(PTE::PBMT.val(pbmt.bits()));
    }
    pte.get()
}

/// Encodes a pointer to the next-level table at `table`.
pub fn pointer_pte(mode: TranslationMode, table: u64) -> u64 {
    let mut pte = PteValue::new(splice_ppn(mode, table));
    pte.modify(PTE::V::SET);
    pte.get()
}

pub fn is_valid(pte: u64) -> bool {
    PteValue::new(pte).is_set(PTE::V)
}

/// A non-zero `xwr` marks a leaf, valid or not.
pub fn is_leaf(pte: u64) -> bool {
    PteValue::new(pte).read(PTE::XWR) != 0
}

/// Address of the table a pointer entry refers to.
pub fn decode_table(mode: TranslationMode, pte: u64) -> u64 {
    unsplice_ppn(mode, pte)
}

pub fn decode_leaf(mode: TranslationMode, pte: u64) -> Option<LeafEntry> {
    let value = PteValue::new(pte);
    Some(LeafEntry {
        frame: unsplice_ppn(mode, pte),
        permissions: Permissions::from_xwr(value.read(PTE::XWR))?,
        user: value.is_set(PTE::U),
        accessed: value.is_set(PTE::A),
        dirty: value.is_set(PTE::D),
        pbmt: PbmtMode::from_bits(value.read(PTE::PBMT))?,
        valid: value.is_set(PTE::V),
    })
}

/// Value of the stage's translation-enable register for a root table at `root`.
pub fn xatp_token(mode: TranslationMode, root: u64) -> u64 {
    let mut xatp = LocalRegisterCopy::<u64, XATP::Register>::new(0);
    xatp.write(XATP::MODE.val(mode.encoding()) + XATP::PPN.val(root >> 12));
    xatp.get()
}
