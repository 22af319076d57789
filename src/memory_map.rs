use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::ToString;
use alloc::vec::Vec;

use crate::util::{range_end, range_in_range};
use crate::{MapError, MapResult, MemoryMapping, RawMapping, TranslationConfig, TranslationStage};

/// Mapping entries partitioned by the stage whose section of the configuration declared them.
///
/// A `MemoryMap` only exists once its entries passed validation, so the page-table and linker
/// builders can rely on non-overlapping ranges, backed aliases and a placed `.text`.
#[derive(Clone, Debug, Default)]
pub struct MemoryMap {
    partitions: BTreeMap<TranslationStage, Vec<MemoryMapping>>,
}

impl MemoryMap {
    /// Builds every raw record of every partition and validates the result.
    pub fn from_raw<I>(partitions: I, config: &TranslationConfig) -> MapResult<Self>
    where
        I: IntoIterator<Item = (TranslationStage, Vec<RawMapping>)>,
    {
        let mut built = Vec::new();
        for (stage, records) in partitions {
            let mappings = records
                .iter()
                .map(|raw| MemoryMapping::from_raw(raw, config))
                .collect::<MapResult<Vec<_>>>()?;
            built.push((stage, mappings));
        }
        Self::from_mappings(built, config)
    }

    /// Validates already-built mappings, re-checking each entry against `config` first.
    pub fn from_mappings<I>(partitions: I, config: &TranslationConfig) -> MapResult<Self>
    where
        I: IntoIterator<Item = (TranslationStage, Vec<MemoryMapping>)>,
    {
        let mut map = MemoryMap::default();
        for (stage, mappings) in partitions {
            for mapping in &mappings {
                mapping.check(config).map_err(|reason| MapError::Schema {
                    mapping: mapping.to_string(),
                    reason,
                })?;
            }
            map.partitions.entry(stage).or_default().extend(mappings);
        }
        map.validate(config)?;
        Ok(map)
    }

    /// Entries declared for `stage`, in declaration order.
    pub fn stage(&self, stage: TranslationStage) -> &[MemoryMapping] {
        self.partitions
            .get(&stage)
            .map(|mappings| mappings.as_slice())
            .unwrap_or(&[])
    }

    /// Entries of every stage enabled by `config`, stage by stage.
    pub fn enabled<'a, 'c>(
        &'a self,
        config: &'c TranslationConfig,
    ) -> impl Iterator<Item = &'a MemoryMapping> + 'c
    where
        'a: 'c,
    {
        config
            .enabled_stages()
            .flat_map(move |stage| self.stage(stage).iter())
    }

    fn validate(&self, config: &TranslationConfig) -> MapResult {
        for (&stage, mappings) in &self.partitions {
            if !config.is_enabled(stage) && !mappings.is_empty() {
                return Err(MapError::Consistency {
                    mapping: mappings[0].to_string(),
                    reason: format!("{} stage is not enabled", stage),
                });
            }
        }
        for stage in config.enabled_stages() {
            let mappings = self.stage(stage);
            check_stage_membership(stage, mappings)?;
            check_source_overlaps(mappings)?;
            check_dest_overlaps(mappings)?;
            check_aliases(mappings)?;
        }
        let has_text = self
            .enabled(config)
            .filter(|m| !m.is_alias())
            .any(|m| m.sections().iter().any(|name| name == ".text"));
        if !has_text {
            return Err(MapError::MissingEntrySection);
        }
        debug!(
            "memory map valid: {} mappings",
            self.enabled(config).count()
        );
        Ok(())
    }
}

fn check_stage_membership(stage: TranslationStage, mappings: &[MemoryMapping]) -> MapResult {
    match mappings
        .iter()
        .find(|m| m.stage().map_or(false, |s| s != stage))
    {
        Some(m) => Err(MapError::Consistency {
            mapping: m.to_string(),
            reason: format!("declared in the {} stage partition", stage),
        }),
        None => Ok(()),
    }
}

/// Fails on the first pair of `[start, start + size)` ranges that intersect.
fn check_sorted_ranges<'a, F>(mut ranges: Vec<&'a MemoryMapping>, start: F) -> MapResult
where
    F: Fn(&MemoryMapping) -> u64,
{
    ranges.sort_by_key(|m| start(*m));
    for pair in ranges.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if range_end(start(a), a.size()) > start(b) as u128 {
            return Err(MapError::Overlap {
                first: a.to_string(),
                second: b.to_string(),
            });
        }
    }
    Ok(())
}

fn check_source_overlaps(mappings: &[MemoryMapping]) -> MapResult {
    let sourced = mappings.iter().filter(|m| m.source().is_some()).collect();
    check_sorted_ranges(sourced, |m| m.source().unwrap_or_default())
}

fn check_dest_overlaps(mappings: &[MemoryMapping]) -> MapResult {
    let placed = mappings.iter().filter(|m| !m.is_alias()).collect();
    check_sorted_ranges(placed, MemoryMapping::dest)
}

fn check_aliases(mappings: &[MemoryMapping]) -> MapResult {
    for alias in mappings.iter().filter(|m| m.is_alias()) {
        let backed = mappings
            .iter()
            .filter(|m| !m.is_alias())
            .any(|m| range_in_range(alias.dest(), alias.size(), m.dest(), m.size()));
        if !backed {
            return Err(MapError::DanglingAlias {
                mapping: alias.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mapping::tests::raw;
    use crate::{RawValue, TranslationMode};
    use alloc::vec;

    pub(crate) fn sv39() -> TranslationConfig {
        TranslationConfig::new(false)
            .with_mode(TranslationStage::S, TranslationMode::Sv39)
            .unwrap()
    }

    pub(crate) fn translated(va: u64, pa: u64, pages: u64, section: Option<&str>) -> RawMapping {
        let mut record = raw(&[
            ("va", va.into()),
            ("pa", pa.into()),
            ("xwr", 0b011u64.into()),
            ("page_size", 0x1000u64.into()),
            ("num_pages", pages.into()),
        ]);
        if let Some(section) = section {
            record.insert("linker_script_section".into(), section.into());
        }
        record
    }

    fn alias(va: u64, pa: u64, pages: u64) -> RawMapping {
        let mut record = translated(va, pa, pages, None);
        record.insert("alias".into(), RawValue::Bool(true));
        record
    }

    fn direct(pa: u64, pages: u64, section: &str) -> RawMapping {
        raw(&[
            ("pa", pa.into()),
            ("page_size", 0x1000u64.into()),
            ("num_pages", pages.into()),
            ("linker_script_section", section.into()),
        ])
    }

    fn build(records: Vec<RawMapping>) -> MapResult<MemoryMap> {
        MemoryMap::from_raw([(TranslationStage::S, records)], &sv39())
    }

    #[test]
    fn accepts_disjoint_map() {
        let map = build(vec![
            translated(0x8000_0000, 0x8000_0000, 2, Some(".text")),
            translated(0x8000_2000, 0x8000_2000, 1, Some(".data")),
            alias(0xc000_0000, 0x8000_1000, 1),
            direct(0x9000_0000, 4, ".jumpstart.rodata.s_stage.pagetables"),
        ])
        .unwrap();
        assert_eq!(map.stage(TranslationStage::S).len(), 4);
        assert!(map.stage(TranslationStage::G).is_empty());
        assert_eq!(map.enabled(&sv39()).count(), 4);
    }

    #[test]
    fn rejects_destination_overlap() {
        let result = build(vec![
            direct(0x1000, 2, ".text"),
            direct(0x2000, 2, ".data"),
        ]);
        match result {
            Err(MapError::Overlap { first, second }) => {
                assert!(first.contains("0x1000"));
                assert!(second.contains("0x2000"));
            }
            other => panic!("expected overlap, got {:?}", other),
        }
    }

    #[test]
    fn rejects_source_overlap() {
        let result = build(vec![
            translated(0x4000, 0x8000_0000, 2, Some(".text")),
            translated(0x5000, 0x9000_0000, 1, Some(".data")),
        ]);
        assert!(matches!(result, Err(MapError::Overlap { .. })));
    }

    #[test]
    fn aliases_may_share_destinations() {
        let result = build(vec![
            translated(0x8000_0000, 0x8000_0000, 4, Some(".text")),
            alias(0x1000, 0x8000_0000, 4),
            alias(0x10000, 0x8000_2000, 2),
        ]);
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_dangling_alias() {
        let result = build(vec![
            translated(0x8000_0000, 0x8000_0000, 2, Some(".text")),
            alias(0x1000, 0x8000_1000, 2),
        ]);
        assert!(matches!(result, Err(MapError::DanglingAlias { .. })));
    }

    #[test]
    fn requires_text_section() {
        let result = build(vec![translated(0x8000_0000, 0x8000_0000, 1, Some(".data"))]);
        assert_eq!(result.err(), Some(MapError::MissingEntrySection));
    }

    #[test]
    fn rejects_foreign_stage_entries() {
        let config = TranslationConfig::new(true)
            .with_mode(TranslationStage::Vs, TranslationMode::Sv39)
            .and_then(|c| c.with_mode(TranslationStage::G, TranslationMode::Sv39x4))
            .unwrap();
        let gpa_record = raw(&[
            ("gpa", 0x8000_0000u64.into()),
            ("spa", 0x8000_0000u64.into()),
            ("xwr", 0b101u64.into()),
            ("page_size", 0x1000u64.into()),
            ("num_pages", 1u64.into()),
            ("linker_script_section", ".text".into()),
        ]);
        let result = MemoryMap::from_raw([(TranslationStage::Vs, vec![gpa_record])], &config);
        assert!(matches!(result, Err(MapError::Consistency { .. })));

        let disabled = MemoryMap::from_raw(
            [(TranslationStage::G, vec![direct(0x8000_0000, 1, ".text")])],
            &sv39(),
        );
        assert!(matches!(disabled, Err(MapError::Consistency { .. })));
    }
}
