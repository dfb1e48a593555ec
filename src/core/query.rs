//! Purpose: The single entry point from a validated path plus raw params to result bytes.
//! Exports: `execute_query`, `execute_query_with`, `QueryOptions`.
//! Role: Orchestrates params -> predicate -> lazy scan -> materialize -> encode.
//! Invariants: Either the full buffer or an error; never a partial result.
//! Invariants: Performs no logging; callers decide what to report.
use std::path::Path;

use crate::core::cancel::CancelFlag;
use crate::core::encode::{EncodeOptions, encode_table};
use crate::core::error::Error;
use crate::core::params::QueryParams;
use crate::core::scan::{ScanOptions, ScanPlan};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct QueryOptions {
    pub scan: ScanOptions,
    pub encode: EncodeOptions,
}

pub fn execute_query(source: &Path, params: &QueryParams) -> Result<Vec<u8>, Error> {
    execute_query_with(source, params, QueryOptions::default(), &CancelFlag::new())
}

pub fn execute_query_with(
    source: &Path,
    params: &QueryParams,
    options: QueryOptions,
    cancel: &CancelFlag,
) -> Result<Vec<u8>, Error> {
    // Compile first: a bad filter is rejected without touching the file.
    let request = params.compile()?;
    let table = ScanPlan::open(source)
        .with_options(options.scan)
        .apply(request)
        .collect_with_cancel(cancel)?;
    cancel.check()?;
    encode_table(&table, options.encode)
}
