use core::fmt;

use arrayvec::ArrayVec;

use super::TranslationMode;
use crate::{AddressType, MapError, MapResult};

/// One RISC-V address-translation stage. `Vs` followed by `G` forms the two-stage
/// guest translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TranslationStage {
    S,
    Hs,
    Vs,
    G,
}

impl TranslationStage {
    /// All stages in the order mapping stage inference scans them.
    pub const ALL: [TranslationStage; 4] = [
        TranslationStage::S,
        TranslationStage::Hs,
        TranslationStage::Vs,
        TranslationStage::G,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            TranslationStage::S => "s",
            TranslationStage::Hs => "hs",
            TranslationStage::Vs => "vs",
            TranslationStage::G => "g",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.name() == name)
    }

    pub fn modes(self) -> &'static [TranslationMode] {
        match self {
            TranslationStage::S | TranslationStage::Hs | TranslationStage::Vs => &[
                TranslationMode::Bare,
                TranslationMode::Sv39,
                TranslationMode::Sv48,
            ],
            TranslationStage::G => &[
                TranslationMode::Bare,
                TranslationMode::Sv39x4,
                TranslationMode::Sv48x4,
            ],
        }
    }

    /// The (input, output) address types of this stage.
    pub const fn translates(self) -> (AddressType, AddressType) {
        match self {
            TranslationStage::S | TranslationStage::Hs => (AddressType::Va, AddressType::Pa),
            TranslationStage::Vs => (AddressType::Va, AddressType::Gpa),
            TranslationStage::G => (AddressType::Gpa, AddressType::Spa),
        }
    }

    pub const fn source_type(self) -> AddressType {
        self.translates().0
    }

    pub const fn dest_type(self) -> AddressType {
        self.translates().1
    }

    pub const fn requires_virtualization(self) -> bool {
        !matches!(self, TranslationStage::S)
    }

    /// The stage that translates this stage's output, if any.
    pub const fn next_stage(self) -> Option<Self> {
        match self {
            TranslationStage::Vs => Some(TranslationStage::G),
            _ => None,
        }
    }

    /// Name of the CSR that enables translation for this stage.
    pub const fn xatp(self) -> &'static str {
        match self {
            TranslationStage::S | TranslationStage::Hs => "satp",
            TranslationStage::Vs => "vsatp",
            TranslationStage::G => "hgatp",
        }
    }

    /// Token that marks the linker section reserved for this stage's page tables.
    pub const fn pagetables_token(self) -> &'static str {
        match self {
            TranslationStage::S => "s_stage.pagetables",
            TranslationStage::Hs => "hs_stage.pagetables",
            TranslationStage::Vs => "vs_stage.pagetables",
            TranslationStage::G => "g_stage.pagetables",
        }
    }
}

impl fmt::Display for TranslationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Translation settings of one build: whether virtualization is enabled and the mode each stage
/// runs in. Built once per build and passed to everything that needs it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranslationConfig {
    virtualization: bool,
    modes: ArrayVec<(TranslationStage, TranslationMode), 4>,
}

impl TranslationConfig {
    /// Every stage starts in `bare` mode.
    pub fn new(virtualization: bool) -> Self {
        Self {
            virtualization,
            modes: ArrayVec::new(),
        }
    }

    /// Selects `mode` for `stage`.
    pub fn with_mode(mut self, stage: TranslationStage, mode: TranslationMode) -> MapResult<Self> {
        if !stage.modes().contains(&mode) {
            return Err(MapError::InvalidMode { stage, mode });
        }
        self.modes.retain(|(s, _)| *s != stage);
        self.modes.push((stage, mode));
        Ok(self)
    }

    pub fn virtualization_enabled(&self) -> bool {
        self.virtualization
    }

    /// Without virtualization only `s` is active; with it `hs`, `vs` and `g` replace it.
    pub fn is_enabled(&self, stage: TranslationStage) -> bool {
        stage.requires_virtualization() == self.virtualization
    }

    pub fn enabled_stages(&self) -> impl Iterator<Item = TranslationStage> + '_ {
        TranslationStage::ALL
            .into_iter()
            .filter(move |&stage| self.is_enabled(stage))
    }

    pub fn mode(&self, stage: TranslationStage) -> TranslationMode {
        self.modes
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, mode)| *mode)
            .unwrap_or(TranslationMode::Bare)
    }
}
