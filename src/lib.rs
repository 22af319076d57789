#![no_std]
#![allow(clippy::upper_case_acronyms)]

//! Generates the static translation structures of a bare-metal RISC-V diagnostic image.
//!
//! A [`MemoryMap`] is built from raw per-stage records and validated once. [`PageTables`] then
//! encodes every stage's Sv39/Sv48/Sv39x4/Sv48x4 page tables into a sparse PTE image, and
//! [`LinkerScript`] derives the physical section and load-segment layout from the same map.

extern crate alloc;

#[macro_use]
extern crate log;

#[path = "arch/riscv/mod.rs"]
mod arch;
mod linker_script;
mod mapping;
mod memory;
mod memory_map;
mod page_tables;
mod util;

use alloc::string::String;
use core::fmt;

pub use arch::{
    LeafEntry, PbmtMode, Permissions, TranslationConfig, TranslationMode, TranslationStage,
    MAX_LEVELS,
};
pub use linker_script::{LinkerScript, LinkerScriptSection, DISCARDED_SECTIONS};
pub use mapping::{
    AliasMapping, DirectMapping, MemoryMapping, PmaMemoryType, RawMapping, RawValue,
    TranslatedMapping,
};
pub use memory::{
    AddressType, GuestPhysAddr, GuestVirtAddr, HostPhysAddr, PageSize, SupervisorPhysAddr,
    PAGE_SIZE_4K,
};
pub use memory_map::MemoryMap;
pub use page_tables::{BudgetPolicy, PageTablePage, PageTables};

pub type MapResult<T = ()> = Result<T, MapError>;

/// Failures raised while validating a memory map or generating structures from it.
///
/// None of these are retried internally; a failing build produces no partial output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// Malformed or contradictory mapping input.
    Schema { mapping: String, reason: String },
    /// A mapping sits in a stage partition it does not belong to.
    Consistency { mapping: String, reason: String },
    /// Two address ranges collide.
    Overlap { first: String, second: String },
    /// An alias whose destination is not backed by any non-alias mapping.
    DanglingAlias { mapping: String },
    /// No non-alias mapping places `.text`.
    MissingEntrySection,
    /// The page-table region of a stage is missing or unusable.
    Layout { reason: String },
    /// Allocating another page-table page would exceed the configured budget.
    InsufficientPageTableBudget {
        stage: TranslationStage,
        budget_pages: usize,
    },
    /// The same PTE slot is required to hold two different values.
    ConflictingEntry { address: u64, existing: u64, new: u64 },
    /// A subsection name is claimed by more than one disjoint section group.
    AmbiguousSection { sections: String },
    /// The configuration selects a mode the stage does not support.
    InvalidMode {
        stage: TranslationStage,
        mode: TranslationMode,
    },
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Schema { mapping, reason } => {
                write!(f, "invalid mapping {}: {}", mapping, reason)
            }
            MapError::Consistency { mapping, reason } => {
                write!(f, "inconsistent mapping {}: {}", mapping, reason)
            }
            MapError::Overlap { first, second } => {
                write!(f, "{} overlaps with {}", first, second)
            }
            MapError::DanglingAlias { mapping } => write!(
                f,
                "alias {} is not contained in any non-alias mapping",
                mapping
            ),
            MapError::MissingEntrySection => {
                write!(f, "no non-alias mapping declares a .text section")
            }
            MapError::Layout { reason } => write!(f, "page table layout: {}", reason),
            MapError::InsufficientPageTableBudget {
                stage,
                budget_pages,
            } => write!(
                f,
                "{} stage page tables need more than {} pages",
                stage, budget_pages
            ),
            MapError::ConflictingEntry {
                address,
                existing,
                new,
            } => write!(
                f,
                "PTE at {:#x} already holds {:#x}, refusing to write {:#x}",
                address, existing, new
            ),
            MapError::AmbiguousSection { sections } => {
                write!(f, "section names claimed by multiple sections: {}", sections)
            }
            MapError::InvalidMode { stage, mode } => {
                write!(f, "{} stage does not support {} mode", stage, mode)
            }
        }
    }
}
