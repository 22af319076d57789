mod mode;
mod pte;
mod stage;

pub use mode::{TranslationMode, MAX_LEVELS};
pub use pte::{LeafEntry, PbmtMode, Permissions};
pub use stage::{TranslationConfig, TranslationStage};

pub(crate) use pte::{
    decode_leaf, decode_table, is_leaf, is_valid, leaf_pte, pointer_pte, xatp_token, PTE_SIZE,
};
