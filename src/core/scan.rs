//! Purpose: Lazy Parquet scan with projection and predicate pushdown, materialized into memory.
//! Exports: `ScanPlan`, `ScanOptions`, `Table`, `HIPSCAT_INDEX_COLUMN`.
//! Role: Builds a deferred plan; `collect` is the only step that touches the file.
//! Invariants: `open` performs no I/O; unreadable sources surface at `collect` as `SourceUnreadable`.
//! Invariants: Output columns follow the requested order; `_hipscat_index` is dropped iff a predicate runs.
//! Invariants: Sources are opened read-only per call; nothing is cached between calls.
//! Notes: Predicate columns are resolved against the full source schema, not the projection.
//! Notes: Excluded names missing from the source are ignored; projected names must exist.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ARROW_SCHEMA_META_KEY;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::{
    ArrowPredicate, ArrowPredicateFn, ParquetRecordBatchReaderBuilder, RowFilter,
};
use parquet::file::metadata::KeyValue;

use crate::core::cancel::CancelFlag;
use crate::core::error::{Error, ErrorKind};
use crate::core::params::QueryRequest;
use crate::core::predicate::Predicate;

/// Internal partitioning key that never leaks into filtered output.
pub const HIPSCAT_INDEX_COLUMN: &str = "_hipscat_index";

pub const DEFAULT_BATCH_SIZE: usize = 8192;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanOptions {
    pub batch_size: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// A materialized result: schema, record batches and the source's file metadata.
#[derive(Clone, Debug)]
pub struct Table {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    key_value_metadata: Vec<KeyValue>,
}

impl Table {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self {
            schema,
            batches,
            key_value_metadata: Vec::new(),
        }
    }

    pub fn with_key_value_metadata(mut self, metadata: Vec<KeyValue>) -> Self {
        self.key_value_metadata = metadata;
        self
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn key_value_metadata(&self) -> &[KeyValue] {
        &self.key_value_metadata
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema
            .fields()
            .iter()
            .map(|field| field.name().as_str())
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct ScanPlan {
    source: PathBuf,
    projection: Option<Vec<String>>,
    exclusions: Vec<String>,
    predicate: Option<Predicate>,
    options: ScanOptions,
}

impl ScanPlan {
    pub fn open(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            projection: None,
            exclusions: Vec::new(),
            predicate: None,
            options: ScanOptions::default(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    /// Restrict output to `columns` in this order; blank names are skipped, an empty list keeps all.
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns
            .into_iter()
            .map(Into::into)
            .filter(|name| !name.trim().is_empty())
            .collect();
        self.projection = if columns.is_empty() {
            None
        } else {
            Some(columns)
        };
        self
    }

    pub fn exclude<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusions = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = if predicate.is_empty() {
            None
        } else {
            Some(predicate)
        };
        self
    }

    pub fn apply(self, request: QueryRequest) -> Self {
        let mut plan = self.exclude(request.exclusions);
        if let Some(projection) = request.projection {
            plan = plan.select(projection);
        }
        if let Some(predicate) = request.predicate {
            plan = plan.filter(predicate);
        }
        plan
    }

    pub fn collect(self) -> Result<Table, Error> {
        self.collect_with_cancel(&CancelFlag::new())
    }

    pub fn collect_with_cancel(self, cancel: &CancelFlag) -> Result<Table, Error> {
        self.collect_observed(cancel, |_| {})
    }

    /// Like `collect_with_cancel`, calling `on_batch` after each batch is materialized.
    fn collect_observed<F>(self, cancel: &CancelFlag, mut on_batch: F) -> Result<Table, Error>
    where
        F: FnMut(&RecordBatch),
    {
        cancel.check()?;
        let file = File::open(&self.source).map_err(|err| {
            unreadable(&self.source, "failed to open source").with_source(err)
        })?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|err| {
            unreadable(&self.source, "source is not a readable parquet file").with_source(err)
        })?;

        let source_schema = builder.schema().clone();
        let key_value_metadata = builder
            .metadata()
            .file_metadata()
            .key_value_metadata()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.key != ARROW_SCHEMA_META_KEY)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let output = self.output_columns(&source_schema)?;
        if output.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("no columns left to return")
                .with_path(&self.source)
                .with_hint("Request at least one column that is not excluded."));
        }
        let output_schema = Arc::new(source_schema.project(&output).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to project schema")
                .with_source(err)
        })?);

        // The reader yields masked columns in file order; `order` maps them back to request order.
        let mut mask_roots = output.clone();
        mask_roots.sort_unstable();
        let order: Vec<usize> = output
            .iter()
            .map(|root| mask_roots.partition_point(|masked| masked < root))
            .collect();
        let projection = ProjectionMask::roots(builder.parquet_schema(), mask_roots);

        let row_filter = match self.predicate {
            Some(predicate) => {
                let roots = predicate_roots(&source_schema, &predicate)?;
                let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
                let filter = ArrowPredicateFn::new(mask, move |batch| predicate.evaluate(&batch));
                let predicates: Vec<Box<dyn ArrowPredicate>> = vec![Box::new(filter)];
                Some(RowFilter::new(predicates))
            }
            None => None,
        };

        let mut builder = builder
            .with_projection(projection)
            .with_batch_size(self.options.batch_size.max(1));
        if let Some(row_filter) = row_filter {
            builder = builder.with_row_filter(row_filter);
        }
        let reader = builder.build().map_err(|err| {
            unreadable(&self.source, "failed to build parquet reader").with_source(err)
        })?;

        let mut batches = Vec::new();
        for batch in reader {
            cancel.check()?;
            let batch = batch.map_err(|err| {
                unreadable(&self.source, "failed to read record batch").with_source(err)
            })?;
            let columns = order
                .iter()
                .map(|idx| batch.column(*idx).clone())
                .collect::<Vec<_>>();
            let batch = RecordBatch::try_new(output_schema.clone(), columns).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to reorder record batch")
                    .with_source(err)
            })?;
            on_batch(&batch);
            batches.push(batch);
        }
        cancel.check()?;

        Ok(Table::new(output_schema, batches).with_key_value_metadata(key_value_metadata))
    }

    /// Root column indices of the output, in output order.
    fn output_columns(&self, schema: &Schema) -> Result<Vec<usize>, Error> {
        let mut columns = match &self.projection {
            Some(names) => {
                let mut out = Vec::with_capacity(names.len());
                for name in names {
                    let idx = column_index(schema, name)?;
                    if !out.contains(&idx) {
                        out.push(idx);
                    }
                }
                out
            }
            None => (0..schema.fields().len()).collect(),
        };

        for name in &self.exclusions {
            if let Ok(idx) = schema.index_of(name) {
                columns.retain(|column| *column != idx);
            }
        }

        if self.predicate.is_some() {
            if let Ok(idx) = schema.index_of(HIPSCAT_INDEX_COLUMN) {
                columns.retain(|column| *column != idx);
            }
        }
        Ok(columns)
    }
}

fn predicate_roots(schema: &Schema, predicate: &Predicate) -> Result<Vec<usize>, Error> {
    let mut roots = Vec::new();
    for name in predicate.columns() {
        let idx = column_index(schema, name)?;
        let data_type = schema.field(idx).data_type();
        if !data_type.is_numeric() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("cannot compare non-numeric column ({data_type})"))
                .with_column(name)
                .with_hint("Filters compare numeric columns against numbers."));
        }
        roots.push(idx);
    }
    roots.sort_unstable();
    roots.dedup();
    Ok(roots)
}

fn column_index(schema: &Schema, name: &str) -> Result<usize, Error> {
    schema.index_of(name).map_err(|_| {
        Error::new(ErrorKind::UnknownColumn)
            .with_message("column not found in source")
            .with_column(name)
    })
}

fn unreadable(path: &Path, message: &str) -> Error {
    Error::new(ErrorKind::SourceUnreadable)
        .with_message(message)
        .with_path(path)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;

    use arrow::array::{Array, Float64Array, Int64Array, StringArray, UInt64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;

    use super::{HIPSCAT_INDEX_COLUMN, ScanOptions, ScanPlan};
    use crate::core::cancel::CancelFlag;
    use crate::core::error::ErrorKind;
    use crate::core::predicate::Predicate;

    fn write_fixture(path: &Path) {
        let schema = Arc::new(Schema::new(vec![
            Field::new(HIPSCAT_INDEX_COLUMN, DataType::UInt64, false),
            Field::new("x", DataType::Int64, false),
            Field::new("y", DataType::Float64, true),
            Field::new("z", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(UInt64Array::from(vec![100, 200, 300])),
                Arc::new(Int64Array::from(vec![15, 5, 40])),
                Arc::new(Float64Array::from(vec![Some(2.0), Some(1.0), None])),
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("a"), Some("b"), None])),
            ],
        )
        .expect("batch");
        let file = File::create(path).expect("create fixture");
        let mut writer = ArrowWriter::try_new(file, schema, None).expect("writer");
        writer.write(&batch).expect("write");
        writer.close().expect("close");
    }

    fn fixture() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("Npix=1.parquet");
        write_fixture(&path);
        (dir, path)
    }

    fn int_column(table: &super::Table, name: &str) -> Vec<i64> {
        let idx = table.schema().index_of(name).expect("column");
        table
            .batches()
            .iter()
            .flat_map(|batch| {
                let array = batch
                    .column(idx)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .expect("int64");
                array.values().to_vec()
            })
            .collect()
    }

    #[test]
    fn open_is_lazy() {
        let plan = ScanPlan::open("/definitely/not/here.parquet").select(["x"]);
        let err = plan.collect().expect_err("missing file");
        assert_eq!(err.kind(), ErrorKind::SourceUnreadable);
    }

    #[test]
    fn garbage_file_is_unreadable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.parquet");
        std::fs::write(&path, b"not parquet at all").expect("write");
        let err = ScanPlan::open(&path).collect().expect_err("bad file");
        assert_eq!(err.kind(), ErrorKind::SourceUnreadable);
        assert_eq!(err.path(), Some(path.as_path()));
    }

    #[test]
    fn no_projection_no_filter_returns_everything() {
        let (_dir, path) = fixture();
        let table = ScanPlan::open(&path).collect().expect("collect");
        assert_eq!(
            table.column_names(),
            vec![HIPSCAT_INDEX_COLUMN, "x", "y", "z", "name"]
        );
        assert_eq!(table.num_rows(), 3);
    }

    #[test]
    fn projection_follows_requested_order() {
        let (_dir, path) = fixture();
        let table = ScanPlan::open(&path)
            .select(["z", "", "x"])
            .collect()
            .expect("collect");
        assert_eq!(table.column_names(), vec!["z", "x"]);
        assert_eq!(int_column(&table, "z"), vec![1, 2, 3]);
        assert_eq!(int_column(&table, "x"), vec![15, 5, 40]);
    }

    #[test]
    fn projection_without_filter_keeps_index_column() {
        let (_dir, path) = fixture();
        let table = ScanPlan::open(&path)
            .select([HIPSCAT_INDEX_COLUMN, "x"])
            .collect()
            .expect("collect");
        assert_eq!(table.column_names(), vec![HIPSCAT_INDEX_COLUMN, "x"]);
    }

    #[test]
    fn filter_drops_index_column_and_rows() {
        let (_dir, path) = fixture();
        let table = ScanPlan::open(&path)
            .filter(Predicate::compile("x>10,y<=3").expect("predicate"))
            .collect()
            .expect("collect");
        assert_eq!(table.column_names(), vec!["x", "y", "z", "name"]);
        assert_eq!(table.num_rows(), 1);
        assert_eq!(int_column(&table, "z"), vec![1]);
    }

    #[test]
    fn filter_drops_index_even_when_projected() {
        let (_dir, path) = fixture();
        let table = ScanPlan::open(&path)
            .select([HIPSCAT_INDEX_COLUMN, "z"])
            .filter(Predicate::compile("x>=5").expect("predicate"))
            .collect()
            .expect("collect");
        assert_eq!(table.column_names(), vec!["z"]);
        assert_eq!(int_column(&table, "z"), vec![1, 2, 3]);
    }

    #[test]
    fn filter_may_reference_unprojected_columns() {
        let (_dir, path) = fixture();
        let table = ScanPlan::open(&path)
            .select(["z"])
            .filter(Predicate::compile("x<10").expect("predicate"))
            .collect()
            .expect("collect");
        assert_eq!(int_column(&table, "z"), vec![2]);
    }

    #[test]
    fn unknown_columns_are_reported_by_name() {
        let (_dir, path) = fixture();
        let err = ScanPlan::open(&path)
            .select(["x", "mag_r"])
            .collect()
            .expect_err("unknown projection");
        assert_eq!(err.kind(), ErrorKind::UnknownColumn);
        assert_eq!(err.column(), Some("mag_r"));

        let err = ScanPlan::open(&path)
            .filter(Predicate::compile("w>1").expect("predicate"))
            .collect()
            .expect_err("unknown filter column");
        assert_eq!(err.kind(), ErrorKind::UnknownColumn);
        assert_eq!(err.column(), Some("w"));
    }

    #[test]
    fn unknown_exclusions_are_ignored() {
        let (_dir, path) = fixture();
        let table = ScanPlan::open(&path)
            .exclude(["nope", "name"])
            .collect()
            .expect("collect");
        assert_eq!(table.column_names(), vec![HIPSCAT_INDEX_COLUMN, "x", "y", "z"]);
    }

    #[test]
    fn exclusion_applies_after_projection() {
        let (_dir, path) = fixture();
        let table = ScanPlan::open(&path)
            .select(["x", "y", "z"])
            .exclude(["y"])
            .collect()
            .expect("collect");
        assert_eq!(table.column_names(), vec!["x", "z"]);
    }

    #[test]
    fn nothing_left_to_return_is_a_usage_error() {
        let (_dir, path) = fixture();
        let err = ScanPlan::open(&path)
            .select([HIPSCAT_INDEX_COLUMN])
            .filter(Predicate::compile("x>1").expect("predicate"))
            .collect()
            .expect_err("empty output");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn non_numeric_filter_column_is_rejected() {
        let (_dir, path) = fixture();
        let err = ScanPlan::open(&path)
            .filter(Predicate::compile("name=1").expect("predicate"))
            .collect()
            .expect_err("string column");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.column(), Some("name"));
    }

    #[test]
    fn small_batches_still_collect_every_row() {
        let (_dir, path) = fixture();
        let table = ScanPlan::open(&path)
            .with_options(ScanOptions { batch_size: 1 })
            .select(["x"])
            .collect()
            .expect("collect");
        assert_eq!(int_column(&table, "x"), vec![15, 5, 40]);
        assert!(table.batches().iter().all(|batch| batch.num_rows() <= 1));
    }

    #[test]
    fn cancelled_flag_stops_before_reading() {
        let (_dir, path) = fixture();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = ScanPlan::open(&path)
            .collect_with_cancel(&cancel)
            .expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn cancelling_mid_scan_discards_collected_batches() {
        let (_dir, path) = fixture();
        let cancel = CancelFlag::new();
        let mut seen = 0;
        let result = ScanPlan::open(&path)
            .with_options(ScanOptions { batch_size: 1 })
            .select(["x"])
            .collect_observed(&cancel, |_| {
                seen += 1;
                let remote = cancel.clone();
                thread::spawn(move || remote.cancel())
                    .join()
                    .expect("cancel thread");
            });
        let err = result.expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(seen, 1);
    }

    #[test]
    fn null_cells_never_match() {
        let (_dir, path) = fixture();
        let table = ScanPlan::open(&path)
            .select(["y"])
            .filter(Predicate::compile("y>=0").expect("predicate"))
            .collect()
            .expect("collect");
        let values: Vec<f64> = table
            .batches()
            .iter()
            .flat_map(|batch| {
                let array = batch
                    .column(0)
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .expect("f64");
                assert_eq!(array.null_count(), 0);
                array.values().to_vec()
            })
            .collect();
        assert_eq!(values, vec![2.0, 1.0]);
    }
}
