//! Purpose: Compile `query` filter strings into numeric column predicates and evaluate them on Arrow batches.
//! Exports: `CompareOp`, `Condition`, `Predicate`, `parse_condition`.
//! Role: Small hand-written scanner; no regex, no expression language.
//! Invariants: Grammar per segment is `<ident><op><number>`, ident is `[A-Za-z_]+`.
//! Invariants: The operator token is the maximal run of `<`, `>`, `=`; only the five known forms are accepted.
//! Invariants: Conditions combine with AND in input order; empty segments are errors.

use std::fmt;

use arrow::array::{Array, BooleanArray, Float64Array};
use arrow::compute::kernels::cmp;
use arrow::datatypes::DataType;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;

use crate::core::error::{Error, ErrorKind};

const CONDITION_SEPARATOR: char = ',';

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl CompareOp {
    // Two-character forms first so `<=` never lexes as `<`.
    const TOKENS: [(&'static str, CompareOp); 5] = [
        ("<=", CompareOp::Le),
        (">=", CompareOp::Ge),
        ("<", CompareOp::Lt),
        (">", CompareOp::Gt),
        ("=", CompareOp::Eq),
    ];

    pub fn from_token(token: &str) -> Option<Self> {
        Self::TOKENS
            .iter()
            .find(|(text, _)| *text == token)
            .map(|(_, op)| *op)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "=",
        }
    }

    fn compare(self, column: &dyn Array, value: f64) -> Result<BooleanArray, ArrowError> {
        let scalar = Float64Array::new_scalar(value);
        match self {
            CompareOp::Lt => cmp::lt(&column, &scalar),
            CompareOp::Le => cmp::lt_eq(&column, &scalar),
            CompareOp::Gt => cmp::gt(&column, &scalar),
            CompareOp::Ge => cmp::gt_eq(&column, &scalar),
            CompareOp::Eq => cmp::eq(&column, &scalar),
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: CompareOp,
    pub value: f64,
}

impl Condition {
    /// Row mask for this condition; null cells compare as null and are dropped by the reader.
    fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray, ArrowError> {
        let column = batch.column_by_name(&self.column).ok_or_else(|| {
            ArrowError::SchemaError(format!("filter column {} missing from batch", self.column))
        })?;
        let values = arrow::compute::cast(column, &DataType::Float64)?;
        self.op.compare(values.as_ref(), self.value)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.column, self.op, self.value)
    }
}

/// Conjunction of numeric conditions compiled from a `query` string.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Predicate {
    conditions: Vec<Condition>,
}

impl Predicate {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Compile a comma-separated list such as `ra>=30.1,dec<=-30.3`.
    pub fn compile(query: &str) -> Result<Self, Error> {
        let conditions = query
            .split(CONDITION_SEPARATOR)
            .map(parse_condition)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { conditions })
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Distinct column names referenced by the predicate, first use first.
    pub fn columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for condition in &self.conditions {
            if !out.contains(&condition.column.as_str()) {
                out.push(condition.column.as_str());
            }
        }
        out
    }

    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray, ArrowError> {
        let mut mask: Option<BooleanArray> = None;
        for condition in &self.conditions {
            let next = condition.evaluate(batch)?;
            mask = Some(match mask {
                Some(acc) => arrow::compute::and(&acc, &next)?,
                None => next,
            });
        }
        Ok(mask.unwrap_or_else(|| BooleanArray::from(vec![true; batch.num_rows()])))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, condition) in self.conditions.iter().enumerate() {
            if idx > 0 {
                write!(f, "{CONDITION_SEPARATOR}")?;
            }
            write!(f, "{condition}")?;
        }
        Ok(())
    }
}

pub fn parse_condition(segment: &str) -> Result<Condition, Error> {
    let text = segment.trim();
    if text.is_empty() {
        return Err(syntax_error(segment, "empty condition"));
    }

    let ident_len = text
        .bytes()
        .take_while(|byte| byte.is_ascii_alphabetic() || *byte == b'_')
        .count();
    if ident_len == 0 {
        return Err(syntax_error(segment, "expected a column name"));
    }
    let (column, rest) = text.split_at(ident_len);

    let op_len = rest
        .bytes()
        .take_while(|byte| matches!(byte, b'<' | b'>' | b'='))
        .count();
    if op_len == 0 {
        return Err(syntax_error(segment, "expected a comparison operator"));
    }
    let (token, literal) = rest.split_at(op_len);
    let op = CompareOp::from_token(token).ok_or_else(|| {
        syntax_error(segment, format!("unrecognized operator `{token}`"))
    })?;

    let value = parse_literal(literal).ok_or_else(|| {
        syntax_error(segment, format!("invalid numeric literal `{literal}`"))
    })?;

    Ok(Condition {
        column: column.to_string(),
        op,
        value,
    })
}

fn parse_literal(literal: &str) -> Option<f64> {
    if literal.is_empty() {
        return None;
    }
    // `inf`/`nan` parse as f64 but are not numeric literals here.
    if !literal
        .bytes()
        .all(|byte| byte.is_ascii_digit() || matches!(byte, b'+' | b'-' | b'.' | b'e' | b'E'))
    {
        return None;
    }
    literal.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn syntax_error(segment: &str, message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidPredicateSyntax)
        .with_message(message)
        .with_segment(segment)
        .with_hint("Conditions look like `column<op>number`, e.g. `ra>=30.1,dec<=-30.3`.")
}
