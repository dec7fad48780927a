pub mod conditions;
pub mod document;
pub mod error;
pub mod patch;

pub use conditions::{
    find_condition, set_condition, Condition, ConditionStatus, READY_CONDITION, STATE_CONDITION,
};
pub use document::Document;
pub use error::DocumentError;
pub use patch::{apply_json_patch, diff_paths, merge_patch, PatchOp, PatchOpKind};
