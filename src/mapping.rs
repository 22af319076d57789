use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::util::{parse_u64, range_end};
use crate::{
    AddressType, MapError, MapResult, PageSize, PbmtMode, Permissions, TranslationConfig,
    TranslationStage,
};

/// One field value of a raw mapping record, as handed over by the configuration loader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawValue {
    Int(u64),
    Bool(bool),
    Str(String),
    List(Vec<String>),
}

impl From<u64> for RawValue {
    fn from(value: u64) -> Self {
        RawValue::Int(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Str(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Str(value)
    }
}

impl From<&[&str]> for RawValue {
    fn from(value: &[&str]) -> Self {
        RawValue::List(value.iter().map(|s| s.to_string()).collect())
    }
}

/// A raw key/value mapping record.
pub type RawMapping = BTreeMap<String, RawValue>;

/// Memory type hint for the PMA configuration of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PmaMemoryType {
    /// Uncacheable.
    Uc,
    /// Write-combining.
    Wc,
    /// Write-back.
    Wb,
}

impl PmaMemoryType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "uc" => Some(PmaMemoryType::Uc),
            "wc" => Some(PmaMemoryType::Wc),
            "wb" => Some(PmaMemoryType::Wb),
            _ => None,
        }
    }
}

/// A region placed in memory without any page-table entry, e.g. machine-mode code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectMapping {
    dest_type: AddressType,
    dest: u64,
    page_size: PageSize,
    num_pages: u64,
    pma_memory_type: Option<PmaMemoryType>,
    sections: Vec<String>,
}

/// A region translated by one stage from `source` to `dest`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslatedMapping {
    stage: TranslationStage,
    source: u64,
    dest: u64,
    permissions: Permissions,
    user: bool,
    page_size: PageSize,
    num_pages: u64,
    valid: bool,
    pma_memory_type: Option<PmaMemoryType>,
    pbmt_mode: Option<PbmtMode>,
    sections: Vec<String>,
}

/// A second view of a region whose destination belongs to another mapping. Aliases place nothing
/// and so carry neither linker sections nor a PMA type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliasMapping {
    stage: TranslationStage,
    source: u64,
    dest: u64,
    permissions: Permissions,
    user: bool,
    page_size: PageSize,
    num_pages: u64,
    valid: bool,
    pbmt_mode: Option<PbmtMode>,
}

impl DirectMapping {
    pub fn dest_type(&self) -> AddressType {
        self.dest_type
    }

    pub fn dest(&self) -> u64 {
        self.dest
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    pub fn pma_memory_type(&self) -> Option<PmaMemoryType> {
        self.pma_memory_type
    }

    pub fn sections(&self) -> &[String] {
        &self.sections
    }
}

impl TranslatedMapping {
    pub fn stage(&self) -> TranslationStage {
        self.stage
    }

    pub fn source(&self) -> u64 {
        self.source
    }

    pub fn dest(&self) -> u64 {
        self.dest
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Accessible from user mode (`U` bit).
    pub fn user(&self) -> bool {
        self.user
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn pma_memory_type(&self) -> Option<PmaMemoryType> {
        self.pma_memory_type
    }

    pub fn pbmt_mode(&self) -> Option<PbmtMode> {
        self.pbmt_mode
    }

    pub fn sections(&self) -> &[String] {
        &self.sections
    }
}

impl AliasMapping {
    pub fn stage(&self) -> TranslationStage {
        self.stage
    }

    pub fn source(&self) -> u64 {
        self.source
    }

    pub fn dest(&self) -> u64 {
        self.dest
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn user(&self) -> bool {
        self.user
    }

    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn pbmt_mode(&self) -> Option<PbmtMode> {
        self.pbmt_mode
    }
}

/// One validated memory-map entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryMapping {
    Direct(DirectMapping),
    Translated(TranslatedMapping),
    Alias(AliasMapping),
}

impl MemoryMapping {
    /// Builds a mapping from a raw record, inferring its stage from the address fields present
    /// when the record does not name one.
    pub fn from_raw(raw: &RawMapping, config: &TranslationConfig) -> MapResult<Self> {
        let fields = RawFields::parse(raw)?;
        let mapping = fields.build(config)?;
        mapping.check(config).map_err(|reason| fields.error(reason))?;
        Ok(mapping)
    }

    /// The stage that translates this mapping; `None` for direct mappings.
    pub fn stage(&self) -> Option<TranslationStage> {
        match self {
            MemoryMapping::Direct(_) => None,
            MemoryMapping::Translated(m) => Some(m.stage),
            MemoryMapping::Alias(m) => Some(m.stage),
        }
    }

    pub fn source(&self) -> Option<u64> {
        match self {
            MemoryMapping::Direct(_) => None,
            MemoryMapping::Translated(m) => Some(m.source),
            MemoryMapping::Alias(m) => Some(m.source),
        }
    }

    pub fn dest(&self) -> u64 {
        match self {
            MemoryMapping::Direct(m) => m.dest,
            MemoryMapping::Translated(m) => m.dest,
            MemoryMapping::Alias(m) => m.dest,
        }
    }

    pub fn dest_type(&self) -> AddressType {
        match self {
            MemoryMapping::Direct(m) => m.dest_type,
            MemoryMapping::Translated(m) => m.stage.dest_type(),
            MemoryMapping::Alias(m) => m.stage.dest_type(),
        }
    }

    pub fn page_size(&self) -> PageSize {
        match self {
            MemoryMapping::Direct(m) => m.page_size,
            MemoryMapping::Translated(m) => m.page_size,
            MemoryMapping::Alias(m) => m.page_size,
        }
    }

    pub fn num_pages(&self) -> u64 {
        match self {
            MemoryMapping::Direct(m) => m.num_pages,
            MemoryMapping::Translated(m) => m.num_pages,
            MemoryMapping::Alias(m) => m.num_pages,
        }
    }

    /// Size in bytes. Construction guarantees it fits.
    pub fn size(&self) -> u64 {
        self.num_pages() * self.page_size().bytes()
    }

    pub fn sections(&self) -> &[String] {
        match self {
            MemoryMapping::Direct(m) => &m.sections,
            MemoryMapping::Translated(m) => &m.sections,
            MemoryMapping::Alias(_) => &[],
        }
    }

    pub fn pma_memory_type(&self) -> Option<PmaMemoryType> {
        match self {
            MemoryMapping::Direct(m) => m.pma_memory_type,
            MemoryMapping::Translated(m) => m.pma_memory_type,
            MemoryMapping::Alias(_) => None,
        }
    }

    pub fn is_alias(&self) -> bool {
        matches!(self, MemoryMapping::Alias(_))
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, MemoryMapping::Direct(_))
    }

    /// Per-entry invariants: a non-empty, page-aligned range that fits in 64 bits and, for
    /// paged stages, a source the mode can translate with a leaf size it supports.
    pub(crate) fn check(&self, config: &TranslationConfig) -> Result<(), String> {
        let page_size = self.page_size();
        if self.num_pages() == 0 {
            return Err("num_pages must be at least 1".to_string());
        }
        if !page_size.is_aligned(self.dest()) {
            return Err(format!(
                "{} {:#x} is not aligned to page size {}",
                self.dest_type(),
                self.dest(),
                page_size
            ));
        }
        let size = self
            .num_pages()
            .checked_mul(page_size.bytes())
            .ok_or_else(|| "size overflows 64 bits".to_string())?;
        if self.dest().checked_add(size).is_none() {
            return Err(format!("{} range overflows 64 bits", self.dest_type()));
        }
        let (Some(stage), Some(source)) = (self.stage(), self.source()) else {
            return Ok(());
        };
        if !page_size.is_aligned(source) {
            return Err(format!(
                "{} {:#x} is not aligned to page size {}",
                stage.source_type(),
                source,
                page_size
            ));
        }
        if range_end(source, size) > 1u128 << 64 {
            return Err("source range overflows 64 bits".to_string());
        }
        let mode = config.mode(stage);
        if !mode.is_paged() {
            return Ok(());
        }
        if mode.leaf_level(page_size).is_none() {
            return Err(format!("{} pages are not supported by {}", page_size, mode));
        }
        let last = source + (size - 1);
        let contiguous = match (mode.canonical_source(source), mode.canonical_source(last)) {
            (Some(first), Some(end)) => end.wrapping_sub(first) == size - 1,
            _ => false,
        };
        if !contiguous {
            return Err(format!(
                "{} range {:#x}..={:#x} is outside the {} input address space",
                stage.source_type(),
                source,
                last,
                mode
            ));
        }
        Ok(())
    }
}

impl fmt::Display for MemoryMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryMapping::Direct(m) => write!(f, "[direct {}={:#x}", m.dest_type, m.dest)?,
            MemoryMapping::Translated(m) => write!(
                f,
                "[{} {}={:#x} -> {}={:#x} {}",
                m.stage,
                m.stage.source_type(),
                m.source,
                m.stage.dest_type(),
                m.dest,
                m.permissions
            )?,
            MemoryMapping::Alias(m) => write!(
                f,
                "[{} alias {}={:#x} -> {}={:#x} {}",
                m.stage,
                m.stage.source_type(),
                m.source,
                m.stage.dest_type(),
                m.dest,
                m.permissions
            )?,
        }
        write!(f, " {}x{}", self.num_pages(), self.page_size())?;
        if !self.sections().is_empty() {
            write!(f, " {}", self.sections().join(","))?;
        }
        f.write_str("]")
    }
}

/// Field values pulled out of a raw record before the mapping shape is decided.
#[derive(Default)]
struct RawFields {
    label: String,
    addresses: BTreeMap<AddressType, u64>,
    xwr: Option<u64>,
    umode: Option<bool>,
    page_size: Option<PageSize>,
    num_pages: Option<u64>,
    alias: Option<bool>,
    pma_memory_type: Option<PmaMemoryType>,
    pbmt_mode: Option<PbmtMode>,
    sections: Option<Vec<String>>,
    valid: Option<bool>,
    no_pte_allocation: Option<bool>,
    stage: Option<TranslationStage>,
}

impl RawFields {
    fn parse(raw: &RawMapping) -> MapResult<Self> {
        let mut fields = RawFields {
            label: raw_label(raw),
            ..Default::default()
        };
        for (key, value) in raw {
            match key.as_str() {
                "va" => fields.address(AddressType::Va, value)?,
                "pa" => fields.address(AddressType::Pa, value)?,
                "gpa" => fields.address(AddressType::Gpa, value)?,
                "spa" => fields.address(AddressType::Spa, value)?,
                "xwr" => fields.xwr = Some(fields.number(key, value)?),
                "umode" => fields.umode = Some(fields.flag(key, value)?),
                "page_size" => fields.page_size = Some(fields.page_size_of(value)?),
                "num_pages" => fields.num_pages = Some(fields.number(key, value)?),
                "alias" => fields.alias = Some(fields.flag(key, value)?),
                "pma_memory_type" => {
                    let name = fields.text(key, value)?;
                    let ty = PmaMemoryType::from_name(name)
                        .ok_or_else(|| fields.error(format!("unknown PMA memory type {}", name)))?;
                    fields.pma_memory_type = Some(ty);
                }
                "pbmt_mode" => {
                    let name = fields.text(key, value)?;
                    let mode = PbmtMode::from_name(name)
                        .ok_or_else(|| fields.error(format!("unknown PBMT mode {}", name)))?;
                    fields.pbmt_mode = Some(mode);
                }
                "linker_script_section" => fields.sections = Some(fields.section_list(value)?),
                "valid" => fields.valid = Some(fields.flag(key, value)?),
                "no_pte_allocation" => fields.no_pte_allocation = Some(fields.flag(key, value)?),
                "translation_stage" => {
                    let name = fields.text(key, value)?;
                    let stage = TranslationStage::from_name(name).ok_or_else(|| {
                        fields.error(format!("unknown translation stage {}", name))
                    })?;
                    fields.stage = Some(stage);
                }
                _ => return Err(fields.error(format!("unknown field {}", key))),
            }
        }
        Ok(fields)
    }

    fn build(&self, config: &TranslationConfig) -> MapResult<MemoryMapping> {
        let page_size = self
            .page_size
            .ok_or_else(|| self.error("missing required field page_size".to_string()))?;
        let num_pages = self
            .num_pages
            .ok_or_else(|| self.error("missing required field num_pages".to_string()))?;
        if num_pages == 0 {
            return Err(self.error("num_pages must be at least 1".to_string()));
        }
        match self.infer_stage(config)? {
            Some(stage) => self.build_translated(stage, page_size, num_pages),
            None => self.build_direct(page_size, num_pages),
        }
    }

    /// A declared stage must be enabled; otherwise the first enabled stage whose address fields
    /// are all present claims the mapping.
    fn infer_stage(&self, config: &TranslationConfig) -> MapResult<Option<TranslationStage>> {
        if let Some(stage) = self.stage {
            if !config.is_enabled(stage) {
                return Err(self.error(format!("translation stage {} is not enabled", stage)));
            }
            return Ok(Some(stage));
        }
        Ok(config.enabled_stages().find(|stage| {
            let (from, to) = stage.translates();
            self.addresses.contains_key(&from) && self.addresses.contains_key(&to)
        }))
    }

    fn build_translated(
        &self,
        stage: TranslationStage,
        page_size: PageSize,
        num_pages: u64,
    ) -> MapResult<MemoryMapping> {
        let (from, to) = stage.translates();
        let source = *self
            .addresses
            .get(&from)
            .ok_or_else(|| self.error(format!("{} stage mapping requires {}", stage, from)))?;
        let dest = *self
            .addresses
            .get(&to)
            .ok_or_else(|| self.error(format!("{} stage mapping requires {}", stage, to)))?;
        if let Some(extra) = self.addresses.keys().find(|&&ty| ty != from && ty != to) {
            return Err(self.error(format!("{} is not valid for {} stage", extra, stage)));
        }
        if self.no_pte_allocation == Some(true) {
            return Err(self.error(format!(
                "no_pte_allocation set on a mapping translated by {} stage",
                stage
            )));
        }
        let xwr = self
            .xwr
            .ok_or_else(|| self.error("missing required field xwr".to_string()))?;
        let permissions = Permissions::from_xwr(xwr)
            .ok_or_else(|| self.error(format!("xwr {:#b} is not a valid leaf permission", xwr)))?;
        self.check_aligned(to, dest, page_size)?;
        self.check_aligned(from, source, page_size)?;

        let user = self.umode.unwrap_or(false);
        let valid = self.valid.unwrap_or(true);
        if self.alias.unwrap_or(false) {
            if self.sections.is_some() {
                return Err(self.error("alias mappings cannot place linker sections".to_string()));
            }
            if self.pma_memory_type.is_some() {
                return Err(self.error("alias mappings cannot set pma_memory_type".to_string()));
            }
            return Ok(MemoryMapping::Alias(AliasMapping {
                stage,
                source,
                dest,
                permissions,
                user,
                page_size,
                num_pages,
                valid,
                pbmt_mode: self.pbmt_mode,
            }));
        }
        Ok(MemoryMapping::Translated(TranslatedMapping {
            stage,
            source,
            dest,
            permissions,
            user,
            page_size,
            num_pages,
            valid,
            pma_memory_type: self.pma_memory_type,
            pbmt_mode: self.pbmt_mode,
            sections: self.sections.clone().unwrap_or_default(),
        }))
    }

    fn build_direct(&self, page_size: PageSize, num_pages: u64) -> MapResult<MemoryMapping> {
        if self.addresses.contains_key(&AddressType::Va) {
            return Err(self.error(
                "va given without the destination address of an enabled stage".to_string(),
            ));
        }
        let forbidden = [
            ("xwr", self.xwr.is_some()),
            ("umode", self.umode.is_some()),
            ("alias", self.alias.is_some()),
            ("pbmt_mode", self.pbmt_mode.is_some()),
            ("valid", self.valid.is_some()),
        ];
        if let Some((field, _)) = forbidden.iter().find(|(_, present)| *present) {
            return Err(self.error(format!("{} is not allowed on a direct mapping", field)));
        }
        if self.no_pte_allocation == Some(false) {
            return Err(self.error(
                "mapping has no source address but no_pte_allocation is false".to_string(),
            ));
        }
        let mut dests = self.addresses.iter();
        let (&dest_type, &dest) = dests
            .next()
            .ok_or_else(|| self.error("missing destination address".to_string()))?;
        if let Some((other, _)) = dests.next() {
            return Err(self.error(format!(
                "direct mapping has both {} and {}",
                dest_type, other
            )));
        }
        self.check_aligned(dest_type, dest, page_size)?;
        Ok(MemoryMapping::Direct(DirectMapping {
            dest_type,
            dest,
            page_size,
            num_pages,
            pma_memory_type: self.pma_memory_type,
            sections: self.sections.clone().unwrap_or_default(),
        }))
    }

    fn check_aligned(&self, ty: AddressType, addr: u64, page_size: PageSize) -> MapResult {
        if page_size.is_aligned(addr) {
            Ok(())
        } else {
            Err(self.error(format!(
                "{} {:#x} is not aligned to page size {}",
                ty, addr, page_size
            )))
        }
    }

    fn address(&mut self, ty: AddressType, value: &RawValue) -> MapResult {
        let addr = self.number(ty.field(), value)?;
        self.addresses.insert(ty, addr);
        Ok(())
    }

    fn number(&self, key: &str, value: &RawValue) -> MapResult<u64> {
        match value {
            RawValue::Int(n) => Ok(*n),
            RawValue::Str(s) => {
                parse_u64(s).ok_or_else(|| self.error(format!("{} {:?} is not a number", key, s)))
            }
            _ => Err(self.error(format!("{} must be a number", key))),
        }
    }

    fn flag(&self, key: &str, value: &RawValue) -> MapResult<bool> {
        match value {
            RawValue::Bool(b) => Ok(*b),
            RawValue::Int(0) => Ok(false),
            RawValue::Int(1) => Ok(true),
            RawValue::Str(s) if s == "true" => Ok(true),
            RawValue::Str(s) if s == "false" => Ok(false),
            _ => Err(self.error(format!("{} must be a boolean", key))),
        }
    }

    fn text<'a>(&self, key: &str, value: &'a RawValue) -> MapResult<&'a str> {
        match value {
            RawValue::Str(s) => Ok(s.as_str()),
            _ => Err(self.error(format!("{} must be a string", key))),
        }
    }

    fn page_size_of(&self, value: &RawValue) -> MapResult<PageSize> {
        let size = match value {
            RawValue::Int(n) => PageSize::from_bytes(*n),
            RawValue::Str(s) => PageSize::from_name(s.trim())
                .or_else(|| parse_u64(s).and_then(PageSize::from_bytes)),
            _ => None,
        };
        size.ok_or_else(|| self.error(format!("unsupported page_size {:?}", value)))
    }

    fn section_list(&self, value: &RawValue) -> MapResult<Vec<String>> {
        let names: Vec<String> = match value {
            RawValue::Str(s) => s
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string())
                .collect(),
            RawValue::List(list) => list.iter().map(|name| name.trim().to_string()).collect(),
            _ => return Err(self.error("linker_script_section must be a list".to_string())),
        };
        if names.is_empty() || names.iter().any(|name| name.is_empty()) {
            return Err(self.error("linker_script_section has an empty name".to_string()));
        }
        Ok(names)
    }

    fn error(&self, reason: String) -> MapError {
        MapError::Schema {
            mapping: self.label.clone(),
            reason,
        }
    }
}

/// Identifies a raw record by its address fields, or by its sections when it has none.
fn raw_label(raw: &RawMapping) -> String {
    let mut parts: Vec<String> = AddressType::ALL
        .into_iter()
        .filter_map(|ty| raw.get(ty.field()).map(|v| format!("{}={}", ty, raw_text(v))))
        .collect();
    if let Some(sections) = raw.get("linker_script_section") {
        parts.push(raw_text(sections));
    }
    format!("{{{}}}", parts.join(" "))
}

fn raw_text(value: &RawValue) -> String {
    match value {
        RawValue::Int(n) => format!("{:#x}", n),
        RawValue::Bool(b) => format!("{}", b),
        RawValue::Str(s) => s.clone(),
        RawValue::List(list) => list.join(","),
    }
}
