use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use crate::util::range_end;
use crate::{MapError, MapResult, MemoryMap, MemoryMapping, TranslationConfig, PAGE_SIZE_4K};

/// Input sections the image never keeps.
pub const DISCARDED_SECTIONS: [&str; 4] = [".note", ".comment", ".eh_frame", ".eh_frame_hdr"];

const GUARD_PREFIX: &str = ".linker_guard_section_";

/// One output section of the image: a physical range and the input sections placed in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkerScriptSection {
    name: String,
    start: u64,
    size: u64,
    subsections: Vec<String>,
    zero_padded: bool,
    guard: bool,
}

impl LinkerScriptSection {
    fn from_mapping(mapping: &MemoryMapping) -> Option<Self> {
        let declared = mapping.sections();
        let name = declared.first()?.clone();
        let mut subsections = declared.to_vec();
        let has = |wanted: &str| subsections.iter().any(|s| s == wanted);
        if has(".text") && !has(".text.startup") {
            subsections.insert(0, ".text.startup".to_string());
        }
        let zero_padded = subsections.iter().any(|s| s == ".bss");
        Some(Self {
            name,
            start: mapping.dest(),
            size: mapping.size(),
            subsections,
            zero_padded,
            guard: false,
        })
    }

    fn guard(index: usize, start: u64) -> Self {
        Self {
            name: format!("{}{}", GUARD_PREFIX, index),
            start,
            size: PAGE_SIZE_4K,
            subsections: Vec::new(),
            zero_padded: false,
            guard: true,
        }
    }

    /// The output section name, and the name of its program header.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u128 {
        range_end(self.start, self.size)
    }

    /// Input sections in placement order.
    pub fn subsections(&self) -> &[String] {
        &self.subsections
    }

    /// Emitted as initialized zero bytes rather than left for a loader to clear.
    pub fn is_zero_padded(&self) -> bool {
        self.zero_padded
    }

    pub fn is_guard(&self) -> bool {
        self.guard
    }

    fn shares_subsection(&self, other: &Self) -> bool {
        self.subsections
            .iter()
            .any(|name| other.subsections.contains(name))
    }

    /// Folds `other` into this section. The lower-placed section keeps its name and leads the
    /// subsection order.
    fn merge(&mut self, mut other: Self) {
        let end = self.end().max(other.end());
        if other.start < self.start {
            core::mem::swap(self, &mut other);
        }
        for name in other.subsections {
            if !self.subsections.contains(&name) {
                self.subsections.push(name);
            }
        }
        if let Some(index) = self.subsections.iter().position(|s| s == ".text.startup") {
            let startup = self.subsections.remove(index);
            self.subsections.insert(0, startup);
        }
        self.size = (end - self.start as u128) as u64;
        self.zero_padded |= other.zero_padded;
    }

    fn phdr(&self) -> String {
        self.name.trim_start_matches('.').replace('.', "_")
    }
}

impl fmt::Display for LinkerScriptSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:#x}, {:#x})",
            self.name,
            self.start,
            self.end()
        )
    }
}

/// Physical layout of one image: placed sections, guards between them, and the load segments.
#[derive(Clone, Debug)]
pub struct LinkerScript {
    entry_label: String,
    source: String,
    sections: Vec<LinkerScriptSection>,
    program_headers: Vec<String>,
}

impl LinkerScript {
    /// Lays out every mapping of the enabled stages that names input sections.
    ///
    /// `source` only describes where the layout came from in the rendered script.
    pub fn new(
        config: &TranslationConfig,
        map: &MemoryMap,
        entry_label: &str,
        source: &str,
    ) -> MapResult<Self> {
        let mut sections: Vec<LinkerScriptSection> = Vec::new();
        for section in map
            .enabled(config)
            .filter_map(LinkerScriptSection::from_mapping)
        {
            insert_section(&mut sections, section)?;
        }
        sort_sections(&mut sections);

        let mut guards = Vec::new();
        for pair in sections.windows(2) {
            if pair[0].end() < pair[1].start as u128 {
                guards.push(LinkerScriptSection::guard(
                    guards.len(),
                    pair[0].end() as u64,
                ));
            }
        }
        sections.extend(guards);
        sort_sections(&mut sections);

        for pair in sections.windows(2) {
            if pair[0].end() > pair[1].start as u128 {
                return Err(MapError::Overlap {
                    first: pair[0].to_string(),
                    second: pair[1].to_string(),
                });
            }
        }

        let mut program_headers: Vec<String> = Vec::new();
        for section in sections.iter().filter(|s| !s.is_guard()) {
            if !program_headers.iter().any(|name| *name == section.name) {
                program_headers.push(section.name.clone());
            }
        }
        info!(
            "linker layout for {}: {} sections, {} program headers",
            source,
            sections.len(),
            program_headers.len()
        );
        Ok(Self {
            entry_label: entry_label.to_string(),
            source: source.to_string(),
            sections,
            program_headers,
        })
    }

    /// Real and guard sections ordered by start address.
    pub fn sections(&self) -> &[LinkerScriptSection] {
        &self.sections
    }

    /// One load segment per output section name, in address order.
    pub fn program_headers(&self) -> &[String] {
        &self.program_headers
    }

    pub fn discarded_sections(&self) -> &[&'static str] {
        &DISCARDED_SECTIONS
    }

    pub fn entry_label(&self) -> &str {
        &self.entry_label
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Adds `section`, merging it with the one existing section it shares input sections with.
fn insert_section(
    sections: &mut Vec<LinkerScriptSection>,
    section: LinkerScriptSection,
) -> MapResult {
    let sharing: Vec<usize> = sections
        .iter()
        .enumerate()
        .filter(|(_, existing)| existing.shares_subsection(&section))
        .map(|(index, _)| index)
        .collect();
    match sharing.as_slice() {
        [] => sections.push(section),
        [index] => {
            let existing = &mut sections[*index];
            existing.merge(section);
            debug!("merged section {}", existing);
        }
        _ => {
            let names: Vec<&str> = sharing.iter().map(|&i| sections[i].name()).collect();
            return Err(MapError::AmbiguousSection {
                sections: format!("{} and {}", section.name, names.join(", ")),
            });
        }
    }
    Ok(())
}

fn sort_sections(sections: &mut [LinkerScriptSection]) {
    sections.sort_by(|a, b| (a.start, &a.name).cmp(&(b.start, &b.name)));
}

/// Renders the layout as a GNU ld script.
impl fmt::Display for LinkerScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "/* Generated from {} */", self.source)?;
        writeln!(f)?;
        writeln!(f, "OUTPUT_ARCH( \"riscv\" )")?;
        writeln!(f, "ENTRY( {} )", self.entry_label)?;
        writeln!(f)?;
        writeln!(f, "PHDRS\n{{")?;
        for section in self.sections.iter().filter(|s| !s.is_guard()) {
            if self.program_headers.contains(&section.name) {
                writeln!(f, "  {} PT_LOAD;", section.phdr())?;
            }
        }
        writeln!(f, "}}")?;
        writeln!(f)?;
        writeln!(f, "SECTIONS\n{{")?;
        for section in &self.sections {
            writeln!(f, "  . = {:#x};", section.start)?;
            if section.guard {
                writeln!(
                    f,
                    "  {} (NOLOAD) : {{ . = . + {:#x}; }}",
                    section.name, section.size
                )?;
                continue;
            }
            if section.zero_padded {
                writeln!(f, "  {} (TYPE = SHT_PROGBITS) : {{", section.name)?;
            } else {
                writeln!(f, "  {} : {{", section.name)?;
            }
            for subsection in &section.subsections {
                writeln!(f, "    *({})", subsection)?;
                writeln!(f, "    *({}.*)", subsection)?;
            }
            if section.zero_padded {
                writeln!(f, "    BYTE(0)")?;
                writeln!(f, "    . = {:#x};", section.size)?;
            }
            writeln!(f, "  }} :{}", section.phdr())?;
        }
        writeln!(f)?;
        write!(f, "  /DISCARD/ : {{")?;
        for name in DISCARDED_SECTIONS {
            write!(f, " *({})", name)?;
        }
        writeln!(f, " }}")?;
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::tests::raw;
    use crate::memory_map::tests::{sv39, translated};
    use crate::{RawMapping, RawValue, TranslationStage};
    use alloc::vec;

    fn layout(records: Vec<RawMapping>) -> MapResult<LinkerScript> {
        let config = sv39();
        let map = MemoryMap::from_raw([(TranslationStage::S, records)], &config)?;
        LinkerScript::new(&config, &map, "_mmode_start", "test.yaml")
    }

    fn sections_of(script: &LinkerScript) -> Vec<(&str, u64, u64)> {
        script
            .sections()
            .iter()
            .map(|s| (s.name(), s.start(), s.size()))
            .collect()
    }

    #[test]
    fn text_startup_goes_first() {
        let script = layout(vec![translated(
            0x8000_0000,
            0x8000_0000,
            2,
            Some(".text,.data"),
        )])
        .unwrap();
        let text = &script.sections()[0];
        assert_eq!(text.name(), ".text");
        assert_eq!(text.subsections(), [".text.startup", ".text", ".data"]);
        assert!(!text.is_zero_padded());
        assert_eq!(script.program_headers(), [".text"]);
    }

    #[test]
    fn bss_is_zero_padded() {
        let script = layout(vec![
            translated(0x8000_0000, 0x8000_0000, 1, Some(".text")),
            translated(0x8000_1000, 0x8000_1000, 4, Some(".bss")),
        ])
        .unwrap();
        let bss = &script.sections()[1];
        assert_eq!(bss.name(), ".bss");
        assert!(bss.is_zero_padded());
        assert!(!script.sections()[0].is_zero_padded());
    }

    #[test]
    fn shared_names_merge() {
        let mut low_data = translated(0x1000, 0x8000_4000, 1, None);
        low_data.insert(
            "linker_script_section".into(),
            RawValue::from(&[".data", ".sdata"][..]),
        );
        let script = layout(vec![
            translated(0x8000_0000, 0x8000_0000, 1, Some(".text")),
            translated(0x2000, 0x8000_5000, 2, Some(".data.extra,.data")),
            low_data,
        ])
        .unwrap();
        let names: Vec<_> = script.sections().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            [".text", ".linker_guard_section_0", ".data"]
        );
        let data = &script.sections()[2];
        assert_eq!((data.start(), data.size()), (0x8000_4000, 0x3000));
        assert_eq!(data.subsections(), [".data", ".sdata", ".data.extra"]);
        assert_eq!(script.program_headers(), [".text", ".data"]);
    }

    #[test]
    fn merged_text_keeps_startup_first() {
        let script = layout(vec![
            translated(0x1000, 0x8000_0000, 1, Some(".data")),
            translated(0x2000, 0x8000_1000, 1, Some(".text,.data")),
        ])
        .unwrap();
        assert_eq!(script.sections().len(), 1);
        let merged = &script.sections()[0];
        assert_eq!(merged.name(), ".data");
        assert_eq!((merged.start(), merged.size()), (0x8000_0000, 0x2000));
        assert_eq!(merged.subsections(), [".text.startup", ".data", ".text"]);
    }

    #[test]
    fn ambiguous_names_fail() {
        let result = layout(vec![
            translated(0x8000_0000, 0x8000_0000, 1, Some(".text")),
            translated(0x1000, 0x8000_1000, 1, Some(".data")),
            translated(0x2000, 0x8000_2000, 1, Some(".rodata")),
            translated(0x3000, 0x8000_3000, 1, Some(".rodata,.data")),
        ]);
        match result {
            Err(MapError::AmbiguousSection { sections }) => {
                assert!(sections.contains(".data") && sections.contains(".rodata"))
            }
            other => panic!("expected ambiguity, got {:?}", other.map(|s| s.to_string())),
        }
    }

    #[test]
    fn guards_fill_gaps() {
        let script = layout(vec![
            translated(0x8000_0000, 0x8000_0000, 2, Some(".text")),
            translated(0x8000_2000, 0x8000_2000, 1, Some(".rodata")),
            translated(0x8001_0000, 0x8001_0000, 1, Some(".data")),
            raw(&[
                ("pa", 0x9000_0000u64.into()),
                ("page_size", 0x1000u64.into()),
                ("num_pages", 4u64.into()),
                (
                    "linker_script_section",
                    ".jumpstart.rodata.s_stage.pagetables".into(),
                ),
            ]),
        ])
        .unwrap();
        assert_eq!(
            sections_of(&script),
            [
                (".text", 0x8000_0000, 0x2000),
                (".rodata", 0x8000_2000, 0x1000),
                (".linker_guard_section_0", 0x8000_3000, 0x1000),
                (".data", 0x8001_0000, 0x1000),
                (".linker_guard_section_1", 0x8001_1000, 0x1000),
                (".jumpstart.rodata.s_stage.pagetables", 0x9000_0000, 0x4000),
            ]
        );
        assert!(script.sections()[2].is_guard());
        assert_eq!(
            script.program_headers(),
            [
                ".text",
                ".rodata",
                ".data",
                ".jumpstart.rodata.s_stage.pagetables"
            ]
        );
    }

    #[test]
    fn widened_merge_overlaps() {
        let result = layout(vec![
            translated(0x8000_0000, 0x8000_0000, 1, Some(".text")),
            translated(0x2000, 0x8000_2000, 1, Some(".data")),
            translated(0x4000, 0x8000_4000, 1, Some(".rodata")),
            translated(0x6000, 0x8000_6000, 1, Some(".data")),
        ]);
        match result {
            Err(MapError::Overlap { first, second }) => {
                assert!(first.starts_with(".data"));
                assert!(second.starts_with(".rodata"));
            }
            other => panic!("expected overlap, got {:?}", other.map(|s| s.to_string())),
        }
    }

    #[test]
    fn renders_ld_script() {
        let script = layout(vec![
            translated(0x8000_0000, 0x8000_0000, 1, Some(".text")),
            translated(0x8000_2000, 0x8000_2000, 2, Some(".bss")),
        ])
        .unwrap();
        assert_eq!(script.entry_label(), "_mmode_start");
        assert_eq!(script.source(), "test.yaml");
        assert_eq!(script.discarded_sections(), DISCARDED_SECTIONS);
        let text = script.to_string();
        assert!(text.contains("ENTRY( _mmode_start )"));
        assert!(text.contains("  text PT_LOAD;\n  bss PT_LOAD;\n"));
        assert!(!text.contains("linker_guard_section_0 PT_LOAD"));
        assert!(text.contains("  .linker_guard_section_0 (NOLOAD) : { . = . + 0x1000; }"));
        assert!(text.contains("  .bss (TYPE = SHT_PROGBITS) : {"));
        assert!(text.contains("    *(.text.startup)\n    *(.text.startup.*)\n    *(.text)\n"));
        assert!(text.contains("    . = 0x2000;\n  } :bss"));
        assert!(
            text.contains("/DISCARD/ : { *(.note) *(.comment) *(.eh_frame) *(.eh_frame_hdr) }")
        );
    }
}
