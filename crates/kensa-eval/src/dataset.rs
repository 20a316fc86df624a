use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use kensa_core::error::DatasetError;

/// Context key under which the targets column is exposed to judge metrics.
pub const TARGETS_KEY: &str = "targets";

/// A single evaluation case. Its identity is its position in the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationCase {
    pub id: usize,
    /// Input to the model under test.
    pub input: String,
    /// Reference answer, when the dataset has a targets column.
    #[serde(default)]
    pub ground_truth: Option<String>,
    /// Every other column of the row, plus `targets` when configured.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl EvaluationCase {
    pub fn new(id: usize, input: impl Into<String>) -> Self {
        Self {
            id,
            input: input.into(),
            ground_truth: None,
            context: BTreeMap::new(),
        }
    }

    pub fn with_ground_truth(mut self, ground_truth: impl Into<String>) -> Self {
        let gt = ground_truth.into();
        self.context.insert(TARGETS_KEY.into(), gt.clone());
        self.ground_truth = Some(gt);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Which columns of a table feed the input and the ground truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub input: String,
    pub targets: Option<String>,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            input: "inputs".into(),
            targets: None,
        }
    }
}

impl ColumnMapping {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            targets: None,
        }
    }

    pub fn with_targets(mut self, targets: impl Into<String>) -> Self {
        self.targets = Some(targets.into());
        self
    }
}

/// An ordered, immutable set of evaluation cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cases: Vec<EvaluationCase>,
    /// Column names with a value in every row of the source table.
    #[serde(default)]
    pub columns: BTreeSet<String>,
    #[serde(default)]
    pub has_targets: bool,
}

impl Dataset {
    /// Build a dataset from row objects, validating the column mapping.
    pub fn from_records(
        name: impl Into<String>,
        records: &[Map<String, Value>],
        mapping: &ColumnMapping,
    ) -> Result<Self, DatasetError> {
        if records.is_empty() {
            return Err(DatasetError::Empty);
        }

        let mut columns: Option<BTreeSet<String>> = None;
        let mut cases = Vec::with_capacity(records.len());
        for (row_idx, record) in records.iter().enumerate() {
            let filled: BTreeSet<String> = record
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, _)| k.clone())
                .collect();
            columns = Some(match columns {
                Some(seen) => seen.intersection(&filled).cloned().collect(),
                None => filled,
            });

            let input = record
                .get(&mapping.input)
                .and_then(cell_to_string)
                .ok_or_else(|| DatasetError::MissingColumn {
                    column: mapping.input.clone(),
                    row: Some(row_idx),
                })?;

            let mut context: BTreeMap<String, String> = record
                .iter()
                .filter(|(k, _)| **k != mapping.input)
                .filter_map(|(k, v)| cell_to_string(v).map(|s| (k.clone(), s)))
                .collect();

            let ground_truth = match &mapping.targets {
                Some(col) => {
                    let cell = record.get(col).ok_or_else(|| DatasetError::MissingColumn {
                        column: col.clone(),
                        row: Some(row_idx),
                    })?;
                    cell_to_string(cell)
                }
                None => None,
            };
            if let Some(gt) = &ground_truth {
                context.insert(TARGETS_KEY.into(), gt.clone());
            }

            cases.push(EvaluationCase {
                id: row_idx,
                input,
                ground_truth,
                context,
            });
        }

        Ok(Self {
            name: name.into(),
            description: String::new(),
            cases,
            columns: columns.unwrap_or_default(),
            has_targets: mapping.targets.is_some(),
        })
    }

    /// Build a dataset from already constructed cases.
    pub fn from_cases(name: impl Into<String>, cases: Vec<EvaluationCase>) -> Result<Self, DatasetError> {
        if cases.is_empty() {
            return Err(DatasetError::Empty);
        }
        let has_targets = cases.iter().any(|c| c.ground_truth.is_some());
        let columns = cases
            .iter()
            .map(|c| c.context.keys().cloned().collect::<BTreeSet<_>>())
            .reduce(|seen, keys| seen.intersection(&keys).cloned().collect())
            .unwrap_or_default();
        let cases = cases
            .into_iter()
            .enumerate()
            .map(|(id, case)| EvaluationCase { id, ..case })
            .collect();
        Ok(Self {
            name: name.into(),
            description: String::new(),
            cases,
            columns,
            has_targets,
        })
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Whether a grading-context column can be resolved for every case.
    pub fn has_column(&self, column: &str) -> bool {
        !self.cases.is_empty() && self.cases.iter().all(|c| c.context.contains_key(column))
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

fn cell_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Supplies the cases for a run.
pub trait DatasetProvider: Send + Sync {
    fn load(&self) -> Result<Dataset, DatasetError>;
}

/// In-memory table of rows.
#[derive(Debug, Clone)]
pub struct RecordsDataset {
    name: String,
    records: Vec<Map<String, Value>>,
    mapping: ColumnMapping,
}

impl RecordsDataset {
    pub fn new(name: impl Into<String>, mapping: ColumnMapping) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
            mapping,
        }
    }

    /// Add a row; non-object values are ignored.
    pub fn with_row(mut self, row: Value) -> Self {
        if let Value::Object(map) = row {
            self.records.push(map);
        }
        self
    }

    /// Build from equally sized named columns, like a data frame literal.
    pub fn from_columns(
        name: impl Into<String>,
        columns: Vec<(&str, Vec<&str>)>,
        mapping: ColumnMapping,
    ) -> Result<Self, DatasetError> {
        let len = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        if let Some((col, values)) = columns.iter().find(|(_, v)| v.len() != len) {
            return Err(DatasetError::Parse(format!(
                "column '{col}' has {} values, expected {len}",
                values.len()
            )));
        }
        let records = (0..len)
            .map(|i| {
                columns
                    .iter()
                    .map(|(col, values)| (col.to_string(), Value::String(values[i].to_string())))
                    .collect()
            })
            .collect();
        Ok(Self {
            name: name.into(),
            records,
            mapping,
        })
    }
}

impl DatasetProvider for RecordsDataset {
    fn load(&self) -> Result<Dataset, DatasetError> {
        Dataset::from_records(self.name.clone(), &self.records, &self.mapping)
    }
}

#[derive(Debug, Deserialize)]
struct DatasetDocument {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DatasetFile {
    Rows(Vec<Map<String, Value>>),
    Document(DatasetDocument),
}

/// A `.json` (row array or `{name, description, rows}`) or `.jsonl` file.
#[derive(Debug, Clone)]
pub struct JsonFileDataset {
    path: PathBuf,
    mapping: ColumnMapping,
}

impl JsonFileDataset {
    pub fn new(path: impl Into<PathBuf>, mapping: ColumnMapping) -> Self {
        Self {
            path: path.into(),
            mapping,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn default_name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".into())
    }

    /// Parse file contents; `jsonl` selects the line-delimited format.
    pub fn parse(&self, text: &str, jsonl: bool) -> Result<Dataset, DatasetError> {
        if jsonl {
            let rows = text
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(n, line)| {
                    serde_json::from_str::<Map<String, Value>>(line)
                        .map_err(|e| DatasetError::Parse(format!("line {}: {e}", n + 1)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Dataset::from_records(self.default_name(), &rows, &self.mapping);
        }

        let file: DatasetFile =
            serde_json::from_str(text).map_err(|e| DatasetError::Parse(e.to_string()))?;
        match file {
            DatasetFile::Rows(rows) => {
                Dataset::from_records(self.default_name(), &rows, &self.mapping)
            }
            DatasetFile::Document(doc) => {
                let name = doc.name.unwrap_or_else(|| self.default_name());
                Ok(Dataset::from_records(name, &doc.rows, &self.mapping)?
                    .with_description(doc.description))
            }
        }
    }
}

impl DatasetProvider for JsonFileDataset {
    fn load(&self) -> Result<Dataset, DatasetError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| DatasetError::Parse(format!("{}: {e}", self.path.display())))?;
        let jsonl = self
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"));
        self.parse(&text, jsonl)
    }
}
