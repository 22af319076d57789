use core::fmt;

pub type GuestVirtAddr = u64;
pub type GuestPhysAddr = u64;
pub type HostPhysAddr = u64;
pub type SupervisorPhysAddr = u64;

pub const PAGE_SIZE_4K: u64 = 0x1000;

/// Leaf sizes a mapping may use. Which of them a given translation mode can map is decided by
/// `TranslationMode::page_sizes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size1G,
    Size512G,
}

impl PageSize {
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => 0x1000,
            PageSize::Size2M => 0x20_0000,
            PageSize::Size1G => 0x4000_0000,
            PageSize::Size512G => 0x80_0000_0000,
        }
    }

    /// Returns the page size whose byte count is exactly `bytes`.
    pub fn from_bytes(bytes: u64) -> Option<Self> {
        match bytes {
            0x1000 => Some(PageSize::Size4K),
            0x20_0000 => Some(PageSize::Size2M),
            0x4000_0000 => Some(PageSize::Size1G),
            0x80_0000_0000 => Some(PageSize::Size512G),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "4K" | "4k" => Some(PageSize::Size4K),
            "2M" | "2m" => Some(PageSize::Size2M),
            "1G" | "1g" => Some(PageSize::Size1G),
            "512G" | "512g" => Some(PageSize::Size512G),
            _ => None,
        }
    }

    pub const fn is_aligned(self, addr: u64) -> bool {
        addr & (self.bytes() - 1) == 0
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PageSize::Size4K => "4K",
            PageSize::Size2M => "2M",
            PageSize::Size1G => "1G",
            PageSize::Size512G => "512G",
        };
        f.write_str(name)
    }
}

/// The kind of address found on either side of a translation stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressType {
    /// Virtual address.
    Va,
    /// Physical address.
    Pa,
    /// Guest physical address.
    Gpa,
    /// Supervisor physical address.
    Spa,
}

impl AddressType {
    pub const ALL: [AddressType; 4] = [
        AddressType::Va,
        AddressType::Pa,
        AddressType::Gpa,
        AddressType::Spa,
    ];

    /// Name of the record field carrying an address of this type.
    pub const fn field(self) -> &'static str {
        match self {
            AddressType::Va => "va",
            AddressType::Pa => "pa",
            AddressType::Gpa => "gpa",
            AddressType::Spa => "spa",
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}
