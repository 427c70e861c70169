//! Dataset profiling.
//!
//! The profile document is the only view of the data the planning model
//! gets: schema, per-column statistics, and the first few rows.
//! [`ArrowProfiler`] reads CSV, Parquet and JSON Lines files in record
//! batches so large files are never held in memory whole. A `.json` file
//! holds one top-level array of records and is parsed in full.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Seek};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use async_trait::async_trait;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::{Deserialize, Serialize};

use crate::error::ProfileError;

/// Rows copied into the profile verbatim.
pub const SAMPLE_ROWS: usize = 5;
/// Distinct values listed for a categorical column.
pub const MAX_UNIQUE_VALUES: usize = 20;
/// Most frequent values listed for a categorical column.
pub const MAX_VALUE_COUNTS: usize = 10;
/// Distinct values tracked per column before counting stops admitting new ones.
const MAX_TRACKED_DISTINCT: usize = 10_000;
/// JSON Lines records read to infer the schema.
const JSON_SCHEMA_INFERENCE_ROWS: usize = 1_000;

/// Profile document for one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub filename: String,
    pub row_count: usize,
    pub column_count: usize,
    pub columns: Vec<ColumnProfile>,
    pub sample_rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

impl DatasetProfile {
    /// Names of every column, in schema order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Coarse column classification shown to the planning model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnCategory {
    Numeric,
    Datetime,
    Boolean,
    Categorical,
}

impl ColumnCategory {
    fn of(data_type: &DataType) -> Self {
        match data_type {
            DataType::Boolean => ColumnCategory::Boolean,
            DataType::Date32
            | DataType::Date64
            | DataType::Timestamp(_, _)
            | DataType::Time32(_)
            | DataType::Time64(_) => ColumnCategory::Datetime,
            dt if dt.is_numeric() => ColumnCategory::Numeric,
            _ => ColumnCategory::Categorical,
        }
    }
}

/// Per-column profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub dtype: String,
    pub category: ColumnCategory,
    pub missing: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<NumericStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_counts: Option<Vec<ValueCount>>,
}

/// Summary statistics of a numeric column, rounded to two decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Sample standard deviation.
    pub std: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueCount {
    pub value: String,
    pub count: u64,
}

/// Produces the profile document for a dataset file.
#[async_trait]
pub trait Profiler: Send + Sync {
    async fn profile(&self, path: &Path) -> Result<DatasetProfile, ProfileError>;
}

/// Supported input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    Csv,
    Parquet,
    /// A top-level array of objects.
    Json,
    /// One object per line.
    JsonLines,
}

impl DatasetFormat {
    /// Detect the format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self, ProfileError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => Ok(DatasetFormat::Csv),
            "parquet" | "pq" => Ok(DatasetFormat::Parquet),
            "json" => Ok(DatasetFormat::Json),
            "jsonl" | "ndjson" => Ok(DatasetFormat::JsonLines),
            other => Err(ProfileError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Profiler over Arrow's CSV, Parquet and JSON readers.
#[derive(Debug, Clone)]
pub struct ArrowProfiler {
    batch_size: usize,
}

impl Default for ArrowProfiler {
    fn default() -> Self {
        Self { batch_size: 8192 }
    }
}

impl ArrowProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Profile synchronously. Used from a blocking task.
    pub fn profile_blocking(&self, path: &Path) -> Result<DatasetProfile, ProfileError> {
        if !path.exists() {
            return Err(ProfileError::NotFound(path.display().to_string()));
        }
        let format = DatasetFormat::from_path(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match format {
            DatasetFormat::Csv => {
                let mut file = File::open(path)?;
                let (schema, _) = arrow::csv::reader::Format::default()
                    .with_header(true)
                    .infer_schema(&mut file, None)?;
                file.rewind()?;
                let schema = Arc::new(schema);
                let reader = arrow::csv::ReaderBuilder::new(Arc::clone(&schema))
                    .with_header(true)
                    .with_batch_size(self.batch_size)
                    .build(file)?;
                profile_batches(filename, &schema, reader)
            }
            DatasetFormat::Parquet => {
                let file = File::open(path)?;
                let builder =
                    ParquetRecordBatchReaderBuilder::try_new(file)?.with_batch_size(self.batch_size);
                let schema = Arc::clone(builder.schema());
                let reader = builder.build()?;
                profile_batches(filename, &schema, reader)
            }
            DatasetFormat::JsonLines => {
                let (schema, _) = arrow::json::reader::infer_json_schema(
                    BufReader::new(File::open(path)?),
                    Some(JSON_SCHEMA_INFERENCE_ROWS),
                )?;
                let schema = Arc::new(schema);
                let reader = arrow::json::ReaderBuilder::new(Arc::clone(&schema))
                    .with_batch_size(self.batch_size)
                    .build(BufReader::new(File::open(path)?))?;
                profile_batches(filename, &schema, reader)
            }
            DatasetFormat::Json => {
                let records = read_json_records(path)?;
                let schema = Arc::new(arrow::json::reader::infer_json_schema_from_iterator(
                    records.iter().map(Ok),
                )?);
                let mut decoder = arrow::json::ReaderBuilder::new(Arc::clone(&schema))
                    .with_batch_size(self.batch_size)
                    .build_decoder()?;
                let batches = records.chunks(self.batch_size).filter_map(|chunk| {
                    decoder
                        .serialize(chunk)
                        .and_then(|()| decoder.flush())
                        .transpose()
                });
                profile_batches(filename, &schema, batches)
            }
        }
    }
}

#[async_trait]
impl Profiler for ArrowProfiler {
    async fn profile(&self, path: &Path) -> Result<DatasetProfile, ProfileError> {
        let profiler = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || profiler.profile_blocking(&path))
            .await
            .map_err(|e| ProfileError::Io(std::io::Error::other(e)))?
    }
}

/// Read a `.json` dataset: a top-level array whose items are all objects.
fn read_json_records(path: &Path) -> Result<Vec<serde_json::Value>, ProfileError> {
    let document: serde_json::Value = serde_json::from_reader(BufReader::new(File::open(path)?))
        .map_err(|e| ProfileError::InvalidJson(e.to_string()))?;
    let serde_json::Value::Array(records) = document else {
        return Err(ProfileError::InvalidJson(
            "expected a top-level array of records".to_string(),
        ));
    };
    if let Some(index) = records.iter().position(|r| !r.is_object()) {
        return Err(ProfileError::InvalidJson(format!(
            "record {} is not an object",
            index + 1
        )));
    }
    Ok(records)
}

fn profile_batches<I>(
    filename: String,
    schema: &Schema,
    batches: I,
) -> Result<DatasetProfile, ProfileError>
where
    I: Iterator<Item = Result<RecordBatch, ArrowError>>,
{
    let mut accumulators: Vec<ColumnAccumulator> = schema
        .fields()
        .iter()
        .map(|f| ColumnAccumulator::new(f.name().clone(), f.data_type().clone()))
        .collect();
    let mut sample_rows = Vec::new();
    let mut row_count = 0usize;

    for batch in batches {
        let batch = batch?;
        for (acc, column) in accumulators.iter_mut().zip(batch.columns()) {
            acc.update(column)?;
        }

        let mut row = 0;
        while sample_rows.len() < SAMPLE_ROWS && row < batch.num_rows() {
            sample_rows.push(sample_row(&accumulators, batch.columns(), row)?);
            row += 1;
        }
        row_count += batch.num_rows();
    }

    if schema.fields().is_empty() {
        return Err(ProfileError::Empty(filename));
    }

    tracing::debug!(
        filename = %filename,
        rows = row_count,
        columns = accumulators.len(),
        "Profiled dataset"
    );

    Ok(DatasetProfile {
        filename,
        row_count,
        column_count: accumulators.len(),
        columns: accumulators.into_iter().map(ColumnAccumulator::finish).collect(),
        sample_rows,
    })
}

fn sample_row(
    accumulators: &[ColumnAccumulator],
    columns: &[ArrayRef],
    row: usize,
) -> Result<serde_json::Map<String, serde_json::Value>, ProfileError> {
    let mut map = serde_json::Map::new();
    for (acc, column) in accumulators.iter().zip(columns) {
        let value = if column.is_null(row) {
            serde_json::Value::Null
        } else {
            let text = array_value_to_string(column.as_ref(), row)?;
            match acc.category {
                ColumnCategory::Numeric | ColumnCategory::Boolean => {
                    serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
                }
                _ => serde_json::Value::String(text),
            }
        };
        map.insert(acc.name.clone(), value);
    }
    Ok(map)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Streaming per-column statistics.
struct ColumnAccumulator {
    name: String,
    data_type: DataType,
    category: ColumnCategory,
    missing: usize,
    // Welford running moments over non-null numeric values.
    count: u64,
    mean: f64,
    m2: f64,
    min: Option<f64>,
    max: Option<f64>,
    counts: HashMap<String, u64>,
    first_seen: Vec<String>,
}

impl ColumnAccumulator {
    fn new(name: String, data_type: DataType) -> Self {
        Self {
            category: ColumnCategory::of(&data_type),
            name,
            data_type,
            missing: 0,
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: None,
            max: None,
            counts: HashMap::new(),
            first_seen: Vec::new(),
        }
    }

    fn update(&mut self, column: &ArrayRef) -> Result<(), ProfileError> {
        self.missing += column.null_count();

        match self.category {
            ColumnCategory::Numeric => {
                let floats = cast(column, &DataType::Float64)?;
                if let Some(values) = floats.as_any().downcast_ref::<Float64Array>() {
                    for value in values.iter().flatten() {
                        if value.is_nan() {
                            continue;
                        }
                        self.count += 1;
                        let delta = value - self.mean;
                        self.mean += delta / self.count as f64;
                        self.m2 += delta * (value - self.mean);
                        self.min = Some(self.min.map_or(value, |m| m.min(value)));
                        self.max = Some(self.max.map_or(value, |m| m.max(value)));
                    }
                }
            }
            ColumnCategory::Categorical => {
                for row in 0..column.len() {
                    if column.is_null(row) {
                        continue;
                    }
                    let value = array_value_to_string(column.as_ref(), row)?;
                    if let Some(count) = self.counts.get_mut(&value) {
                        *count += 1;
                    } else if self.counts.len() < MAX_TRACKED_DISTINCT {
                        self.first_seen.push(value.clone());
                        self.counts.insert(value, 1);
                    }
                }
            }
            ColumnCategory::Datetime | ColumnCategory::Boolean => {}
        }
        Ok(())
    }

    fn finish(self) -> ColumnProfile {
        let (stats, unique_values, value_counts) = match self.category {
            ColumnCategory::Numeric => {
                let has_values = self.count > 0;
                let std = (self.count > 1).then(|| round2((self.m2 / (self.count - 1) as f64).sqrt()));
                let stats = NumericStats {
                    mean: has_values.then(|| round2(self.mean)),
                    min: self.min.map(round2),
                    max: self.max.map(round2),
                    std,
                };
                (Some(stats), None, None)
            }
            ColumnCategory::Categorical => {
                let unique: Vec<String> = self
                    .first_seen
                    .iter()
                    .take(MAX_UNIQUE_VALUES)
                    .cloned()
                    .collect();

                let order: HashMap<&str, usize> = self
                    .first_seen
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (v.as_str(), i))
                    .collect();
                let mut counts: Vec<ValueCount> = self
                    .counts
                    .iter()
                    .map(|(value, count)| ValueCount {
                        value: value.clone(),
                        count: *count,
                    })
                    .collect();
                // Most frequent first; ties keep first-seen order.
                counts.sort_by(|a, b| {
                    b.count.cmp(&a.count).then_with(|| {
                        order
                            .get(a.value.as_str())
                            .cmp(&order.get(b.value.as_str()))
                    })
                });
                counts.truncate(MAX_VALUE_COUNTS);
                (None, Some(unique), Some(counts))
            }
            ColumnCategory::Datetime | ColumnCategory::Boolean => (None, None, None),
        };

        ColumnProfile {
            name: self.name,
            dtype: self.data_type.to_string(),
            category: self.category,
            missing: self.missing,
            stats,
            unique_values,
            value_counts,
        }
    }
}
