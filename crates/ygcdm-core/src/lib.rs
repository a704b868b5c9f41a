//! Core domain model and record schemas for the YouGile CDM task loader.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "ygcdm-core";

/// Remote resource collections the loader reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    Boards,
    Columns,
    StringStickers,
    Tasks,
}

impl Resource {
    /// Path segment appended to the API base url.
    pub fn path(self) -> &'static str {
        match self {
            Resource::Boards => "boards",
            Resource::Columns => "columns",
            Resource::StringStickers => "string-stickers",
            Resource::Tasks => "tasks",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub board_id: String,
    pub project_id: Option<String>,
    pub board_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub column_id: String,
    pub board_id: String,
    pub column_name: String,
}

/// One in-scope column joined with its board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardColumn {
    pub board_id: String,
    pub project_id: Option<String>,
    pub board_name: String,
    pub column_id: String,
    pub column_name: String,
}

/// One state of a string-sticker dictionary, in long form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickerState {
    pub sticker_id: String,
    pub sticker_name: String,
    pub state_id: String,
    pub state_name: Option<String>,
}

/// A top-level task flattened onto the task schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_name: Option<String>,
    pub creation_ms: Option<i64>,
    pub column_id: Option<String>,
    pub subtask_ids: Vec<String>,
    pub contract_status_state_id: Option<String>,
}

/// A subtask flattened onto the subtask schema, with the paired fields already collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskRecord {
    pub subtask_id: String,
    pub subtask_name: Option<String>,
    pub deleted: bool,
    pub column_id: Option<String>,
    pub delivery_term_state_id: Option<String>,
    pub lot_status_state_id: Option<String>,
    pub loading_place_state_id: Option<String>,
    pub ship_name: Option<String>,
    pub quantity_plan: Option<String>,
    pub quantity_fact: Option<String>,
    pub discharging_place: Option<String>,
    pub loading_dates: Option<String>,
    pub prov_paid_state_id: Option<String>,
    pub final_paid_state_id: Option<String>,
    /// Raw deadline values; they are parsed only once the subtask lands in a fact row.
    pub deadline_start: JsonValue,
    pub deadline_end: JsonValue,
}

/// Output column order of the fact table.
pub const FACT_COLUMNS: [&str; 22] = [
    "loaded_ts",
    "task_name",
    "task_id",
    "task_creation_dt",
    "board_name",
    "column_name",
    "task_status",
    "subtask_id",
    "subtask_name",
    "subtask_status",
    "quantity_plan",
    "quantity_fact",
    "delivery_term",
    "loading_place",
    "loading_start_date",
    "loading_end_date",
    "ship_name",
    "discharging_place",
    "deadline_start_date",
    "deadline_end_date",
    "prov_paid",
    "final_paid",
];

/// One reconciled (task, subtask) row of the fact table.
///
/// Equality and hashing compare quantities bitwise so exact duplicates collapse even when a
/// quantity is NaN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactRow {
    pub loaded_ts: DateTime<Utc>,
    pub task_name: Option<String>,
    pub task_id: String,
    pub task_creation_dt: Option<NaiveDate>,
    pub board_name: Option<String>,
    pub column_name: Option<String>,
    pub task_status: Option<String>,
    pub subtask_id: Option<String>,
    pub subtask_name: Option<String>,
    pub subtask_status: Option<String>,
    pub quantity_plan: Option<f64>,
    pub quantity_fact: Option<f64>,
    pub delivery_term: Option<String>,
    pub loading_place: Option<String>,
    pub loading_start_date: Option<NaiveDate>,
    pub loading_end_date: Option<NaiveDate>,
    pub ship_name: Option<String>,
    pub discharging_place: Option<String>,
    pub deadline_start_date: Option<NaiveDate>,
    pub deadline_end_date: Option<NaiveDate>,
    pub prov_paid: Option<String>,
    pub final_paid: Option<String>,
}

fn float_bits(value: Option<f64>) -> Option<u64> {
    value.map(f64::to_bits)
}

impl PartialEq for FactRow {
    fn eq(&self, other: &Self) -> bool {
        self.loaded_ts == other.loaded_ts
            && self.task_name == other.task_name
            && self.task_id == other.task_id
            && self.task_creation_dt == other.task_creation_dt
            && self.board_name == other.board_name
            && self.column_name == other.column_name
            && self.task_status == other.task_status
            && self.subtask_id == other.subtask_id
            && self.subtask_name == other.subtask_name
            && self.subtask_status == other.subtask_status
            && float_bits(self.quantity_plan) == float_bits(other.quantity_plan)
            && float_bits(self.quantity_fact) == float_bits(other.quantity_fact)
            && self.delivery_term == other.delivery_term
            && self.loading_place == other.loading_place
            && self.loading_start_date == other.loading_start_date
            && self.loading_end_date == other.loading_end_date
            && self.ship_name == other.ship_name
            && self.discharging_place == other.discharging_place
            && self.deadline_start_date == other.deadline_start_date
            && self.deadline_end_date == other.deadline_end_date
            && self.prov_paid == other.prov_paid
            && self.final_paid == other.final_paid
    }
}

impl Eq for FactRow {}

impl Hash for FactRow {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.loaded_ts.hash(state);
        self.task_name.hash(state);
        self.task_id.hash(state);
        self.task_creation_dt.hash(state);
        self.board_name.hash(state);
        self.column_name.hash(state);
        self.task_status.hash(state);
        self.subtask_id.hash(state);
        self.subtask_name.hash(state);
        self.subtask_status.hash(state);
        float_bits(self.quantity_plan).hash(state);
        float_bits(self.quantity_fact).hash(state);
        self.delivery_term.hash(state);
        self.loading_place.hash(state);
        self.loading_start_date.hash(state);
        self.loading_end_date.hash(state);
        self.ship_name.hash(state);
        self.discharging_place.hash(state);
        self.deadline_start_date.hash(state);
        self.deadline_end_date.hash(state);
        self.prov_paid.hash(state);
        self.final_paid.hash(state);
    }
}

/// Data-loss findings that are reported but do not fail a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityWarning {
    /// A live task references a subtask that did not come back from the source.
    MissingSubtask { task_id: String, subtask_id: String },
    /// The global task listing holds in-scope tasks the per-column fetch did not return.
    TaskCountMismatch {
        per_column: usize,
        global: usize,
        missing_task_ids: Vec<String>,
    },
}

impl fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityWarning::MissingSubtask {
                task_id,
                subtask_id,
            } => write!(f, "subtask {subtask_id} of task {task_id} was not returned by the source"),
            IntegrityWarning::TaskCountMismatch {
                per_column,
                global,
                missing_task_ids,
            } => write!(
                f,
                "per-column fetch returned {per_column} tasks, global listing has {global}; missing: {}",
                missing_task_ids.join(", ")
            ),
        }
    }
}

/// Malformed source values. Always fatal for a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("record in {resource} has no `{field}` identifier")]
    MissingId { resource: Resource, field: &'static str },
    #[error("field `{field}` of {record_id} holds {value}, expected {expected}")]
    FieldType {
        field: &'static str,
        record_id: String,
        value: String,
        expected: &'static str,
    },
    #[error("loading dates `{value}` of subtask {subtask_id} do not split into start and end")]
    LoadingDates { subtask_id: String, value: String },
    #[error("date `{value}` in `{field}` of subtask {subtask_id} is not dd.mm.yyyy")]
    Date {
        field: &'static str,
        subtask_id: String,
        value: String,
    },
    #[error("`{field}` of subtask {subtask_id} is not a number: `{value}`")]
    Quantity {
        field: &'static str,
        subtask_id: String,
        value: String,
    },
    #[error("millisecond timestamp {value} in `{field}` of {record_id} is out of range")]
    Timestamp {
        field: &'static str,
        record_id: String,
        value: i64,
    },
}

pub const TASK_ID: &str = "task_id";
pub const TASK_NAME: &str = "task_name";
pub const TASK_CREATION_MS: &str = "task_creation_dt";
pub const TASK_SUBTASKS: &str = "subtasks";
pub const TASK_COLUMN_ID: &str = "column_id";
pub const CONTRACT_STATUS_STATE_ID: &str = "contract_status_state_id";

pub const SUBTASK_ID: &str = "subtask_id";
pub const SUBTASK_NAME: &str = "subtask_name";
pub const SUBTASK_DELETED: &str = "deleted";
pub const SUBTASK_COLUMN_ID: &str = "subtask_column_id";
pub const DELIVERY_TERM_STATE_ID: &str = "delivery_term_state_id";
pub const LOT_STATUS_STATE_ID: &str = "lot_status_state_id";
pub const LOADING_PLACE_STATE_ID: &str = "loading_place_state_id";
pub const SHIP_NAME: &str = "ship_name";
pub const QUANTITY_PLAN: &str = "quantity_plan";
pub const QUANTITY_FACT: &str = "quantity_fact";
pub const DISCHARGING_PLACE_PRIMARY: &str = "discharging_place1";
pub const DISCHARGING_PLACE_SECONDARY: &str = "discharging_place2";
pub const LOADING_DATES_PRIMARY: &str = "loading_dates1";
pub const LOADING_DATES_SECONDARY: &str = "loading_dates2";
pub const PROV_PAID_STATE_ID: &str = "prov_paid_state_id";
pub const FINAL_PAID_STATE_ID: &str = "final_paid_state_id";
pub const DEADLINE_START_MS: &str = "deadline_start_date";
pub const DEADLINE_END_MS: &str = "deadline_end_date";

/// Sticker ids carrying the task-level custom fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStickerBindings {
    pub contract_status: String,
}

/// Sticker ids carrying the subtask-level custom fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskStickerBindings {
    pub delivery_term: String,
    pub lot_status: String,
    pub loading_place: String,
    pub ship_name: String,
    pub quantity_plan: String,
    pub quantity_fact: String,
    pub discharging_place_primary: String,
    pub discharging_place_secondary: String,
    pub loading_dates_primary: String,
    pub loading_dates_secondary: String,
    pub prov_paid: String,
    pub final_paid: String,
}

/// Source path of one target column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub column: &'static str,
    pub path: Vec<String>,
}

impl FieldSpec {
    /// Dotted source path such as `deadline.startDate`.
    pub fn dotted(column: &'static str, path: &str) -> Self {
        Self {
            column,
            path: path.split('.').map(ToString::to_string).collect(),
        }
    }

    /// Value of one sticker, stored under `stickers.<sticker_id>`.
    pub fn sticker(column: &'static str, sticker_id: &str) -> Self {
        Self {
            column,
            path: vec!["stickers".to_string(), sticker_id.to_string()],
        }
    }
}

/// Fixed target schema of one resource; every raw record is re-projected onto it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    fields: Vec<FieldSpec>,
}

impl RecordSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn tasks(stickers: &TaskStickerBindings) -> Self {
        Self::new(vec![
            FieldSpec::dotted(TASK_NAME, "title"),
            FieldSpec::dotted(TASK_CREATION_MS, "timestamp"),
            FieldSpec::dotted(TASK_ID, "id"),
            FieldSpec::dotted(TASK_SUBTASKS, "subtasks"),
            FieldSpec::dotted(TASK_COLUMN_ID, "columnId"),
            FieldSpec::sticker(CONTRACT_STATUS_STATE_ID, &stickers.contract_status),
        ])
    }

    pub fn subtasks(stickers: &SubtaskStickerBindings) -> Self {
        Self::new(vec![
            FieldSpec::dotted(SUBTASK_NAME, "title"),
            FieldSpec::dotted(SUBTASK_ID, "id"),
            FieldSpec::dotted(SUBTASK_DELETED, "deleted"),
            FieldSpec::dotted(SUBTASK_COLUMN_ID, "columnId"),
            FieldSpec::sticker(DELIVERY_TERM_STATE_ID, &stickers.delivery_term),
            FieldSpec::sticker(LOT_STATUS_STATE_ID, &stickers.lot_status),
            FieldSpec::sticker(LOADING_PLACE_STATE_ID, &stickers.loading_place),
            FieldSpec::sticker(SHIP_NAME, &stickers.ship_name),
            FieldSpec::sticker(QUANTITY_PLAN, &stickers.quantity_plan),
            FieldSpec::sticker(QUANTITY_FACT, &stickers.quantity_fact),
            FieldSpec::sticker(DISCHARGING_PLACE_PRIMARY, &stickers.discharging_place_primary),
            FieldSpec::sticker(DISCHARGING_PLACE_SECONDARY, &stickers.discharging_place_secondary),
            FieldSpec::sticker(LOADING_DATES_PRIMARY, &stickers.loading_dates_primary),
            FieldSpec::sticker(LOADING_DATES_SECONDARY, &stickers.loading_dates_secondary),
            FieldSpec::sticker(PROV_PAID_STATE_ID, &stickers.prov_paid),
            FieldSpec::sticker(FINAL_PAID_STATE_ID, &stickers.final_paid),
            FieldSpec::dotted(DEADLINE_START_MS, "deadline.startDate"),
            FieldSpec::dotted(DEADLINE_END_MS, "deadline.deadline"),
        ])
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.column)
    }

    /// Re-project a raw record: every schema column is present, absent paths become null.
    pub fn project(&self, record: &JsonValue) -> ProjectedRecord {
        let values = self
            .fields
            .iter()
            .map(|field| {
                let value = json_path(record, &field.path)
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                (field.column, value)
            })
            .collect();
        ProjectedRecord { values }
    }
}

fn json_path<'a>(value: &'a JsonValue, path: &[String]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(segment.as_str())?;
    }
    Some(cur)
}

/// Integer milliseconds from a raw value, accepting numbers and numeric strings. Null and blank
/// text have no value.
pub fn parse_millis(
    field: &'static str,
    record_id: &str,
    value: &JsonValue,
) -> Result<Option<i64>, ParseError> {
    let parsed = match value {
        JsonValue::Null => return Ok(None),
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) if s.trim().is_empty() => return Ok(None),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.map(Some).ok_or_else(|| ParseError::FieldType {
        field,
        record_id: record_id.to_string(),
        value: value.to_string(),
        expected: "millisecond timestamp",
    })
}

/// A raw record reduced to the columns of its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedRecord {
    values: BTreeMap<&'static str, JsonValue>,
}

impl ProjectedRecord {
    pub fn value(&self, column: &str) -> &JsonValue {
        self.values.get(column).unwrap_or(&JsonValue::Null)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// Scalar rendered as text; null stays `None`.
    pub fn text(&self, column: &str) -> Option<String> {
        match self.value(column) {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Integer milliseconds, accepting numbers and numeric strings.
    pub fn millis(&self, column: &'static str, record_id: &str) -> Result<Option<i64>, ParseError> {
        parse_millis(column, record_id, self.value(column))
    }

    /// Only an explicit `true` counts; absent or null flags are false.
    pub fn flag(&self, column: &str) -> bool {
        matches!(self.value(column), JsonValue::Bool(true))
    }

    /// List of string ids; null or absent lists are empty.
    pub fn text_list(&self, column: &str) -> Vec<String> {
        match self.value(column) {
            JsonValue::Array(items) => items
                .iter()
                .filter_map(|item| match item {
                    JsonValue::String(s) => Some(s.clone()),
                    JsonValue::Null => None,
                    other => Some(other.to_string()),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}
