//! YouGile resource adapters: board/column scoping, sticker dictionaries and task retrieval.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};
use ygcdm_core::{
    Board, BoardColumn, Column, ParseError, ProjectedRecord, RecordSchema, Resource, StickerState,
    SubtaskRecord, SubtaskStickerBindings, TaskRecord, TaskStickerBindings,
    CONTRACT_STATUS_STATE_ID, DEADLINE_END_MS, DEADLINE_START_MS, DELIVERY_TERM_STATE_ID,
    DISCHARGING_PLACE_PRIMARY, DISCHARGING_PLACE_SECONDARY, FINAL_PAID_STATE_ID,
    LOADING_DATES_PRIMARY, LOADING_DATES_SECONDARY, LOADING_PLACE_STATE_ID, LOT_STATUS_STATE_ID,
    PROV_PAID_STATE_ID, QUANTITY_FACT, QUANTITY_PLAN, SHIP_NAME, SUBTASK_COLUMN_ID,
    SUBTASK_DELETED, SUBTASK_ID, SUBTASK_NAME, TASK_COLUMN_ID, TASK_CREATION_MS, TASK_ID,
    TASK_NAME, TASK_SUBTASKS,
};
use ygcdm_storage::{PaginatedFetcher, TransportError};

pub const CRATE_NAME: &str = "ygcdm-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Page sizes per listing. Subtasks use small pages: the global task listing is the largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageSizes {
    pub boards: usize,
    pub columns: usize,
    pub string_stickers: usize,
    pub column_tasks: usize,
    pub subtasks: usize,
}

impl Default for PageSizes {
    fn default() -> Self {
        Self {
            boards: 1000,
            columns: 1000,
            string_stickers: 1000,
            column_tasks: 1000,
            subtasks: 100,
        }
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn required_id(value: &JsonValue, resource: Resource) -> Result<String, ParseError> {
    json_str(value, &["id"])
        .map(ToString::to_string)
        .ok_or(ParseError::MissingId {
            resource,
            field: "id",
        })
}

fn text_or_empty(value: &JsonValue, path: &[&str]) -> String {
    json_str(value, path).unwrap_or_default().to_string()
}

pub fn board_from_record(record: &JsonValue) -> Result<Board, ParseError> {
    Ok(Board {
        board_id: required_id(record, Resource::Boards)?,
        project_id: json_str(record, &["projectId"]).map(ToString::to_string),
        board_name: text_or_empty(record, &["title"]),
    })
}

pub fn column_from_record(record: &JsonValue) -> Result<Column, ParseError> {
    Ok(Column {
        column_id: required_id(record, Resource::Columns)?,
        board_id: text_or_empty(record, &["boardId"]),
        column_name: text_or_empty(record, &["title"]),
    })
}

/// Inner-join columns to boards, keeping only boards named in `tracked`.
pub fn join_board_columns(
    boards: &[Board],
    columns: &[Column],
    tracked: &BTreeSet<String>,
) -> Vec<BoardColumn> {
    let by_id: HashMap<&str, &Board> = boards.iter().map(|b| (b.board_id.as_str(), b)).collect();

    columns
        .iter()
        .filter_map(|column| {
            let Some(board) = by_id.get(column.board_id.as_str()) else {
                debug!(column_id = %column.column_id, board_id = %column.board_id, "column without board dropped");
                return None;
            };
            tracked.contains(&board.board_name).then(|| BoardColumn {
                board_id: board.board_id.clone(),
                project_id: board.project_id.clone(),
                board_name: board.board_name.clone(),
                column_id: column.column_id.clone(),
                column_name: column.column_name.clone(),
            })
        })
        .collect()
}

/// Columns of the tracked boards; this list bounds every task query of a run.
pub async fn build_board_index(
    fetcher: &PaginatedFetcher,
    tracked: &BTreeSet<String>,
    sizes: &PageSizes,
) -> Result<Vec<BoardColumn>, AdapterError> {
    let boards = fetcher
        .fetch(Resource::Boards, None, sizes.boards, false)
        .await?
        .iter()
        .map(board_from_record)
        .collect::<Result<Vec<_>, _>>()?;
    let columns = fetcher
        .fetch(Resource::Columns, None, sizes.columns, false)
        .await?
        .iter()
        .map(column_from_record)
        .collect::<Result<Vec<_>, _>>()?;

    let index = join_board_columns(&boards, &columns, tracked);
    info!(boards = boards.len(), columns = columns.len(), in_scope = index.len(), "board index built");
    Ok(index)
}

/// All string-sticker states in long form, fetched once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickerCatalog {
    pub states: Vec<StickerState>,
}

impl StickerCatalog {
    pub fn from_records(records: &[JsonValue]) -> Result<Self, ParseError> {
        let mut states = Vec::new();
        for record in records {
            let sticker_id = required_id(record, Resource::StringStickers)?;
            let sticker_name = text_or_empty(record, &["name"]);
            let Some(raw_states) = record.get("states").and_then(JsonValue::as_array) else {
                continue;
            };
            for state in raw_states {
                let Some(state_id) = json_str(state, &["id"]) else {
                    continue;
                };
                states.push(StickerState {
                    sticker_id: sticker_id.clone(),
                    sticker_name: sticker_name.clone(),
                    state_id: state_id.to_string(),
                    state_name: json_str(state, &["name"]).map(ToString::to_string),
                });
            }
        }
        Ok(Self { states })
    }

    pub async fn fetch(fetcher: &PaginatedFetcher, page_size: usize) -> Result<Self, AdapterError> {
        let records = fetcher
            .fetch(Resource::StringStickers, None, page_size, false)
            .await?;
        let catalog = Self::from_records(&records)?;
        info!(stickers = records.len(), states = catalog.states.len(), "sticker catalog built");
        Ok(catalog)
    }

    /// State id to state name for one dictionary, labelled with its target field names.
    pub fn hub(&self, dictionary: &str, state_field: &str, value_field: &str) -> Hub {
        let mut values = HashMap::new();
        for state in self.states.iter().filter(|s| s.sticker_name == dictionary) {
            values
                .entry(state.state_id.clone())
                .or_insert_with(|| state.state_name.clone());
        }
        if values.is_empty() {
            debug!(dictionary, "no sticker states for dictionary");
        }
        Hub {
            dictionary: dictionary.to_string(),
            state_field: state_field.to_string(),
            value_field: value_field.to_string(),
            values,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hub {
    pub dictionary: String,
    pub state_field: String,
    pub value_field: String,
    values: HashMap<String, Option<String>>,
}

impl Hub {
    pub fn resolve(&self, state_id: Option<&str>) -> Option<String> {
        state_id
            .and_then(|id| self.values.get(id))
            .and_then(Clone::clone)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Names of the six dictionaries as they appear in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryNames {
    pub contract_status: String,
    pub delivery_term: String,
    pub lot_status: String,
    pub loading_place: String,
    pub prov_paid: String,
    pub final_paid: String,
}

/// The six hubs joined onto the fact table, all derived from one catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubSet {
    pub contract_status: Hub,
    pub delivery_term: Hub,
    pub lot_status: Hub,
    pub loading_place: Hub,
    pub prov_paid: Hub,
    pub final_paid: Hub,
}

impl HubSet {
    pub fn from_catalog(catalog: &StickerCatalog, names: &DictionaryNames) -> Self {
        Self {
            contract_status: catalog.hub(&names.contract_status, CONTRACT_STATUS_STATE_ID, "task_status"),
            delivery_term: catalog.hub(&names.delivery_term, DELIVERY_TERM_STATE_ID, "delivery_term"),
            lot_status: catalog.hub(&names.lot_status, LOT_STATUS_STATE_ID, "subtask_status"),
            loading_place: catalog.hub(&names.loading_place, LOADING_PLACE_STATE_ID, "loading_place"),
            prov_paid: catalog.hub(&names.prov_paid, PROV_PAID_STATE_ID, "prov_paid"),
            final_paid: catalog.hub(&names.final_paid, FINAL_PAID_STATE_ID, "final_paid"),
        }
    }
}

fn first_present(primary: Option<String>, secondary: Option<String>) -> Option<String> {
    primary.or(secondary)
}

fn projected_id(
    projected: &ProjectedRecord,
    column: &'static str,
) -> Result<String, ParseError> {
    projected.text(column).ok_or(ParseError::MissingId {
        resource: Resource::Tasks,
        field: column,
    })
}

/// Turns raw task listings into task and subtask records.
#[derive(Debug, Clone)]
pub struct TaskAdapter {
    task_schema: RecordSchema,
    subtask_schema: RecordSchema,
}

impl TaskAdapter {
    pub fn new(task_stickers: &TaskStickerBindings, subtask_stickers: &SubtaskStickerBindings) -> Self {
        Self {
            task_schema: RecordSchema::tasks(task_stickers),
            subtask_schema: RecordSchema::subtasks(subtask_stickers),
        }
    }

    pub fn task_from_record(&self, record: &JsonValue) -> Result<TaskRecord, ParseError> {
        let projected = self.task_schema.project(record);
        let task_id = projected_id(&projected, TASK_ID)?;
        Ok(TaskRecord {
            task_name: projected.text(TASK_NAME),
            creation_ms: projected.millis(TASK_CREATION_MS, &task_id)?,
            column_id: projected.text(TASK_COLUMN_ID),
            subtask_ids: projected.text_list(TASK_SUBTASKS),
            contract_status_state_id: projected.text(CONTRACT_STATUS_STATE_ID),
            task_id,
        })
    }

    /// Flatten a subtask and collapse its mutually exclusive field pairs, first non-null wins.
    /// Nothing is parsed here: most of the listing never joins a tracked task. A record without
    /// an id cannot be joined and yields `None`.
    pub fn subtask_from_record(&self, record: &JsonValue) -> Option<SubtaskRecord> {
        let projected = self.subtask_schema.project(record);
        let subtask_id = projected.text(SUBTASK_ID)?;
        Some(SubtaskRecord {
            subtask_name: projected.text(SUBTASK_NAME),
            deleted: projected.flag(SUBTASK_DELETED),
            column_id: projected.text(SUBTASK_COLUMN_ID),
            delivery_term_state_id: projected.text(DELIVERY_TERM_STATE_ID),
            lot_status_state_id: projected.text(LOT_STATUS_STATE_ID),
            loading_place_state_id: projected.text(LOADING_PLACE_STATE_ID),
            ship_name: projected.text(SHIP_NAME),
            quantity_plan: projected.text(QUANTITY_PLAN),
            quantity_fact: projected.text(QUANTITY_FACT),
            discharging_place: first_present(
                projected.text(DISCHARGING_PLACE_PRIMARY),
                projected.text(DISCHARGING_PLACE_SECONDARY),
            ),
            loading_dates: first_present(
                projected.text(LOADING_DATES_PRIMARY),
                projected.text(LOADING_DATES_SECONDARY),
            ),
            prov_paid_state_id: projected.text(PROV_PAID_STATE_ID),
            final_paid_state_id: projected.text(FINAL_PAID_STATE_ID),
            deadline_start: projected.value(DEADLINE_START_MS).clone(),
            deadline_end: projected.value(DEADLINE_END_MS).clone(),
            subtask_id,
        })
    }

    /// Tasks of every in-scope column, one filtered listing per column.
    ///
    /// The unfiltered task listing can skip records when paged by offset; per-column listings
    /// stay small enough to avoid it. Columns are fetched one after another through the shared
    /// limiter.
    pub async fn fetch_column_tasks(
        &self,
        fetcher: &PaginatedFetcher,
        index: &[BoardColumn],
        page_size: usize,
    ) -> Result<Vec<TaskRecord>, AdapterError> {
        let mut tasks = Vec::new();
        for column in index {
            let records = fetcher
                .fetch(Resource::Tasks, Some(&column.column_id), page_size, false)
                .await?;
            if records.is_empty() {
                debug!(column_id = %column.column_id, "column has no tasks");
                continue;
            }
            for record in &records {
                tasks.push(self.task_from_record(record)?);
            }
        }
        info!(columns = index.len(), tasks = tasks.len(), "column tasks fetched");
        Ok(tasks)
    }

    /// Every task of the workspace, deleted ones included; subtasks are looked up here.
    pub async fn fetch_all_subtasks(
        &self,
        fetcher: &PaginatedFetcher,
        page_size: usize,
    ) -> Result<Vec<SubtaskRecord>, AdapterError> {
        let records = fetcher
            .fetch(Resource::Tasks, None, page_size, true)
            .await?;
        let subtasks: Vec<SubtaskRecord> = records
            .iter()
            .filter_map(|record| self.subtask_from_record(record))
            .collect();
        if subtasks.len() < records.len() {
            debug!(skipped = records.len() - subtasks.len(), "task records without id skipped");
        }
        info!(subtasks = subtasks.len(), "subtasks fetched");
        Ok(subtasks)
    }
}
