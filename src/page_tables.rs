use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::ToString;
use alloc::vec;
use alloc::vec::Vec;

use arrayvec::ArrayVec;

use crate::arch::{
    decode_leaf, decode_table, is_leaf, is_valid, leaf_pte, pointer_pte, xatp_token, PTE_SIZE,
};
use crate::util::round_down;
use crate::{
    LeafEntry, MapError, MapResult, MemoryMap, MemoryMapping, PageSize, PbmtMode, Permissions,
    TranslationConfig, TranslationMode, TranslationStage, MAX_LEVELS, PAGE_SIZE_4K,
};

/// One physical page (or, for the x4 root, four pages) of page-table storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTablePage {
    address: u64,
    level: usize,
    size: u64,
    source_start: u64,
    source_span: u64,
}

impl PageTablePage {
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Start of the (masked) input range this table indexes.
    pub fn source_start(&self) -> u64 {
        self.source_start
    }

    /// Bytes of input address space this table indexes.
    pub fn source_span(&self) -> u64 {
        self.source_span
    }

    pub fn contains_source(&self, source: u64) -> bool {
        source >= self.source_start && source - self.source_start < self.source_span
    }

    /// Address of the slot that translates `source` in this table.
    fn slot(&self, mode: TranslationMode, source: u64) -> u64 {
        let index = mode.vpn_ranges()[self.level].extract(source);
        let slot = self.address + index * PTE_SIZE;
        assert!(
            slot + PTE_SIZE <= self.address + self.size,
            "PTE slot {:#x} outside table at {:#x}",
            slot,
            self.address
        );
        slot
    }
}

/// How much page-table storage a build may use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetPolicy {
    /// Exactly this many 4K pages; running out is an error.
    Fixed(usize),
    /// Start at `initial` pages and retry with one more page, up to `limit`, while the tables
    /// do not fit.
    Grow { initial: usize, limit: usize },
}

/// A single-page leaf to encode.
struct Leaf {
    source: u64,
    dest: u64,
    page_size: PageSize,
    permissions: Permissions,
    user: bool,
    valid: bool,
    pbmt: Option<PbmtMode>,
}

/// The page tables of one translation stage, as a sparse image of populated PTEs.
#[derive(Clone, Debug)]
pub struct PageTables {
    stage: TranslationStage,
    mode: TranslationMode,
    base: u64,
    budget: u64,
    used: u64,
    pages: Vec<PageTablePage>,
    lookup: BTreeMap<(usize, u64), usize>,
    entries: BTreeMap<u64, u64>,
}

impl PageTables {
    /// Builds the page tables of `stage` inside its reserved region using at most
    /// `budget_pages` 4K pages.
    pub fn new(
        config: &TranslationConfig,
        stage: TranslationStage,
        budget_pages: usize,
        map: &MemoryMap,
    ) -> MapResult<Self> {
        if !config.is_enabled(stage) {
            return Err(MapError::Consistency {
                mapping: stage.pagetables_token().to_string(),
                reason: format!("{} stage is not enabled", stage),
            });
        }
        let mode = config.mode(stage);
        if !mode.is_paged() {
            return Err(MapError::Layout {
                reason: format!("{} stage runs in {} mode and has no page tables", stage, mode),
            });
        }
        let region = find_region(config, stage, map)?;
        let budget = (budget_pages as u64)
            .checked_mul(PAGE_SIZE_4K)
            .filter(|&bytes| bytes <= region.size());
        let Some(budget) = budget else {
            return Err(MapError::Layout {
                reason: format!(
                    "budget of {} pages exceeds the {:#x} byte {} region",
                    budget_pages,
                    region.size(),
                    stage.pagetables_token()
                ),
            });
        };
        let root_size = mode.table_size(0);
        if region.dest() % root_size != 0 {
            return Err(MapError::Layout {
                reason: format!(
                    "{} region at {:#x} is not aligned to its {:#x} byte root table",
                    stage,
                    region.dest(),
                    root_size
                ),
            });
        }

        let mut tables = PageTables {
            stage,
            mode,
            base: region.dest(),
            budget,
            used: 0,
            pages: Vec::new(),
            lookup: BTreeMap::new(),
            entries: BTreeMap::new(),
        };
        for mapping in map.stage(stage) {
            for leaf in split_pages(mapping) {
                tables.map_leaf(&leaf)?;
            }
        }
        tables.fill_boundaries();
        info!(
            "{} stage {} page tables: {} pages, {} entries at {:#x}",
            stage,
            mode,
            tables.pages.len(),
            tables.entries.len(),
            tables.base
        );
        Ok(tables)
    }

    /// Builds under `policy`. Growth only happens when the caller asks for it.
    pub fn build(
        config: &TranslationConfig,
        stage: TranslationStage,
        policy: BudgetPolicy,
        map: &MemoryMap,
    ) -> MapResult<Self> {
        match policy {
            BudgetPolicy::Fixed(pages) => Self::new(config, stage, pages, map),
            BudgetPolicy::Grow { initial, limit } => {
                let mut pages = initial;
                loop {
                    match Self::new(config, stage, pages, map) {
                        Err(MapError::InsufficientPageTableBudget { .. }) if pages < limit => {
                            pages += 1;
                            debug!(
                                "{} stage page tables: growing budget to {} pages",
                                stage, pages
                            );
                        }
                        result => return result,
                    }
                }
            }
        }
    }

    pub fn stage(&self) -> TranslationStage {
        self.stage
    }

    pub fn mode(&self) -> TranslationMode {
        self.mode
    }

    /// Physical address of the reserved page-table region and of the root table.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Bytes of the region taken by allocated tables.
    pub fn used_bytes(&self) -> u64 {
        self.used
    }

    /// Allocated tables in allocation order.
    pub fn pages(&self) -> &[PageTablePage] {
        &self.pages
    }

    /// Populated PTEs by physical address. Addresses not present are zero.
    pub fn entries(&self) -> &BTreeMap<u64, u64> {
        &self.entries
    }

    /// Value of the stage's translation-enable CSR (`satp`, `vsatp` or `hgatp`).
    pub fn token(&self) -> u64 {
        xatp_token(self.mode, self.base)
    }

    /// Walks the generated tables for `source` and returns the leaf that maps it.
    pub fn translate(&self, source: u64) -> Option<(u64, LeafEntry)> {
        let source = self.mode.canonical_source(source)?;
        let mut table = self.pages.first()?.address;
        for level in 0..self.mode.levels() {
            let index = self.mode.vpn_ranges()[level].extract(source);
            let pte = *self.entries.get(&(table + index * PTE_SIZE))?;
            if is_leaf(pte) {
                let leaf = decode_leaf(self.mode, pte)?;
                let offset = source & (self.mode.page_sizes()[level].bytes() - 1);
                return Some((leaf.frame + offset, leaf));
            }
            if !is_valid(pte) {
                return None;
            }
            table = decode_table(self.mode, pte);
        }
        None
    }

    /// The little-endian byte image of every allocated table, zero where unpopulated.
    pub fn image(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.used as usize];
        for (&address, value) in &self.entries {
            let offset = (address - self.base) as usize;
            image[offset..offset + PTE_SIZE as usize].copy_from_slice(&value.to_le_bytes());
        }
        image
    }

    fn map_leaf(&mut self, leaf: &Leaf) -> MapResult {
        let leaf_level = self.mode.leaf_level(leaf.page_size).ok_or_else(|| MapError::Schema {
            mapping: format!("{:#x}", leaf.source),
            reason: format!("{} pages are not supported by {}", leaf.page_size, self.mode),
        })?;
        let source = self
            .mode
            .canonical_source(leaf.source)
            .ok_or_else(|| MapError::Schema {
                mapping: format!("{:#x}", leaf.source),
                reason: format!(
                    "{} is outside the {} input address space",
                    self.stage.source_type(),
                    self.mode
                ),
            })?;

        let mut path: ArrayVec<usize, MAX_LEVELS> = ArrayVec::new();
        for level in 0..=leaf_level {
            path.push(self.table_for(source, level)?);
        }
        for level in 0..=leaf_level {
            let table = self.pages[path[level]];
            let value = if level == leaf_level {
                leaf_pte(
                    self.mode,
                    leaf.dest,
                    leaf.permissions,
                    leaf.user,
                    leaf.pbmt,
                    leaf.valid,
                )
            } else {
                pointer_pte(self.mode, self.pages[path[level + 1]].address)
            };
            self.write(table.slot(self.mode, source), value)?;
        }
        Ok(())
    }

    /// Finds the table at `level` indexing `source`, allocating it from the region if needed.
    fn table_for(&mut self, source: u64, level: usize) -> MapResult<usize> {
        let span = self.mode.level_span(level);
        let start = round_down(source, span);
        if let Some(&index) = self.lookup.get(&(level, start)) {
            return Ok(index);
        }
        let size = self.mode.table_size(level);
        if self.used + size > self.budget {
            return Err(MapError::InsufficientPageTableBudget {
                stage: self.stage,
                budget_pages: (self.budget / PAGE_SIZE_4K) as usize,
            });
        }
        let address = self.base + self.used;
        assert!(address % size == 0, "table at {:#x} misaligned", address);
        let page = PageTablePage {
            address,
            level,
            size,
            source_start: start,
            source_span: span,
        };
        debug_assert!(page.contains_source(source));
        debug!(
            "{} stage: level {} table at {:#x} for {:#x}..{:#x}",
            self.stage,
            level,
            address,
            start,
            start as u128 + span as u128
        );
        self.used += size;
        self.pages.push(page);
        self.lookup.insert((level, start), self.pages.len() - 1);
        Ok(self.pages.len() - 1)
    }

    fn write(&mut self, address: u64, value: u64) -> MapResult {
        match self.entries.get(&address) {
            Some(&existing) if existing == value => {
                trace!("PTE {:#x} already holds {:#x}", address, value);
                Ok(())
            }
            Some(&existing) => Err(MapError::ConflictingEntry {
                address,
                existing,
                new: value,
            }),
            None => {
                trace!("PTE {:#x} = {:#x}", address, value);
                self.entries.insert(address, value);
                Ok(())
            }
        }
    }

    /// Pins the first byte and the last slot of the allocation so the emitted image covers it.
    fn fill_boundaries(&mut self) {
        if let (Some(first), Some(last)) = (self.pages.first(), self.pages.last()) {
            let head = first.address;
            let tail = last.address + last.size - PTE_SIZE;
            self.entries.entry(head).or_insert(0);
            self.entries.entry(tail).or_insert(0);
        }
    }
}

/// Locates the mapping whose linker section reserves storage for `stage`'s page tables.
fn find_region<'a>(
    config: &TranslationConfig,
    stage: TranslationStage,
    map: &'a MemoryMap,
) -> MapResult<&'a MemoryMapping> {
    let token = stage.pagetables_token();
    let dotted = format!(".{}", token);
    let mut regions = map.enabled(config).filter(|m| {
        m.sections()
            .iter()
            .any(|name| name == token || name.contains(&dotted))
    });
    let region = regions.next().ok_or_else(|| MapError::Layout {
        reason: format!("no mapping reserves a {} section", token),
    })?;
    if let Some(other) = regions.next() {
        return Err(MapError::Layout {
            reason: format!("both {} and {} reserve {}", region, other, token),
        });
    }
    Ok(region)
}

/// One single-page leaf per page of a translated or alias mapping.
fn split_pages(mapping: &MemoryMapping) -> Vec<Leaf> {
    let (source, dest, permissions, user, valid, pbmt) = match mapping {
        MemoryMapping::Direct(_) => return Vec::new(),
        MemoryMapping::Translated(m) => (
            m.source(),
            m.dest(),
            m.permissions(),
            m.user(),
            m.valid(),
            m.pbmt_mode(),
        ),
        MemoryMapping::Alias(m) => (
            m.source(),
            m.dest(),
            m.permissions(),
            m.user(),
            m.valid(),
            m.pbmt_mode(),
        ),
    };
    let page_size = mapping.page_size();
    (0..mapping.num_pages())
        .map(|i| Leaf {
            source: source.wrapping_add(i * page_size.bytes()),
            dest: dest + i * page_size.bytes(),
            page_size,
            permissions,
            user,
            valid,
            pbmt,
        })
        .collect()
}
