//! Purpose: Define the public Rust API boundary for colserve.
//! Exports: Query entry points and the types callers need to drive them.
//! Role: Additive-only surface; the CLI and server import from here, not from `core`.
//! Invariants: Error kinds re-exported here are the ones collaborators map to transport status.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::cancel::CancelFlag;
pub use crate::core::encode::{EncodeCompression, EncodeOptions, encode_table};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::params::{QueryParams, QueryRequest};
pub use crate::core::predicate::{CompareOp, Condition, Predicate, parse_condition};
pub use crate::core::query::{QueryOptions, execute_query, execute_query_with};
pub use crate::core::scan::{
    DEFAULT_BATCH_SIZE, HIPSCAT_INDEX_COLUMN, ScanOptions, ScanPlan, Table,
};
