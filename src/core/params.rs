//! Purpose: Normalize the raw `cols` / `query` / `exclude_cols` parameter bag once, at the boundary.
//! Exports: `QueryParams`, `QueryRequest`.
//! Role: The only place that decides "absent vs empty"; downstream code sees `Option`s with meaning.
//! Invariants: Absent and empty (or all-blank) `cols` means no projection; same for `query` and filtering.
//! Invariants: Column lists drop blank names and keep the first of any duplicate.

use serde::Deserialize;

use crate::core::error::Error;
use crate::core::predicate::Predicate;

const COLUMN_SEPARATOR: char = ',';

/// Raw query-string parameters as received from the collaborator.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct QueryParams {
    #[serde(default)]
    pub cols: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub exclude_cols: Option<String>,
}

/// Validated request: projection, exclusions, and the compiled predicate.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryRequest {
    pub projection: Option<Vec<String>>,
    pub exclusions: Vec<String>,
    pub predicate: Option<Predicate>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cols(mut self, cols: impl Into<String>) -> Self {
        self.cols = Some(cols.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_exclude_cols(mut self, exclude_cols: impl Into<String>) -> Self {
        self.exclude_cols = Some(exclude_cols.into());
        self
    }

    pub fn projection(&self) -> Option<Vec<String>> {
        let columns = split_columns(self.cols.as_deref()?);
        if columns.is_empty() {
            None
        } else {
            Some(columns)
        }
    }

    pub fn exclusions(&self) -> Vec<String> {
        self.exclude_cols
            .as_deref()
            .map(split_columns)
            .unwrap_or_default()
    }

    pub fn predicate(&self) -> Result<Option<Predicate>, Error> {
        match self.query.as_deref() {
            Some(query) if !query.trim().is_empty() => Predicate::compile(query).map(Some),
            _ => Ok(None),
        }
    }

    pub fn compile(&self) -> Result<QueryRequest, Error> {
        Ok(QueryRequest {
            projection: self.projection(),
            exclusions: self.exclusions(),
            predicate: self.predicate()?,
        })
    }
}

fn split_columns(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in raw.split(COLUMN_SEPARATOR).map(str::trim) {
        if name.is_empty() || out.iter().any(|seen| seen == name) {
            continue;
        }
        out.push(name.to_string());
    }
    out
}
