//! Joins scoped tasks, their subtasks, the board index and the sticker hubs into fact rows.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use ygcdm_adapters::HubSet;
use ygcdm_core::{
    parse_millis, BoardColumn, FactRow, IntegrityWarning, ParseError, SubtaskRecord, TaskRecord,
    DEADLINE_END_MS, DEADLINE_START_MS, QUANTITY_FACT, QUANTITY_PLAN, TASK_CREATION_MS,
};

const LOADING_START_DATE: &str = "loading_start_date";
const LOADING_END_DATE: &str = "loading_end_date";
const LOADING_DATE_FORMAT: &str = "%d.%m.%Y";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reconciliation {
    pub rows: Vec<FactRow>,
    pub warnings: Vec<IntegrityWarning>,
}

/// Build the fact table for one run.
///
/// Every task yields one row per referenced subtask (one row with no subtask when it references
/// none). Deleted subtasks are dropped before any value is parsed, so malformed data on a deleted
/// subtask never fails a run.
pub fn reconcile_records(
    index: &[BoardColumn],
    hubs: &HubSet,
    tasks: &[TaskRecord],
    subtasks: &[SubtaskRecord],
    run_ts: DateTime<Utc>,
) -> Result<Reconciliation, ParseError> {
    let mut columns: HashMap<&str, &BoardColumn> = HashMap::with_capacity(index.len());
    for column in index {
        columns.entry(column.column_id.as_str()).or_insert(column);
    }
    let mut by_id: HashMap<&str, Vec<&SubtaskRecord>> = HashMap::new();
    for subtask in subtasks {
        by_id.entry(subtask.subtask_id.as_str()).or_default().push(subtask);
    }

    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    let mut flagged: HashSet<&str> = HashSet::new();

    for task in tasks {
        let placement = task
            .column_id
            .as_deref()
            .and_then(|id| columns.get(id))
            .copied();
        let task_creation_dt = millis_to_date(TASK_CREATION_MS, &task.task_id, task.creation_ms)?;

        let subtask_ids: Vec<Option<&str>> = if task.subtask_ids.is_empty() {
            vec![None]
        } else {
            task.subtask_ids.iter().map(|id| Some(id.as_str())).collect()
        };

        for subtask_id in subtask_ids {
            let matches: Vec<Option<&SubtaskRecord>> =
                match subtask_id.and_then(|id| by_id.get(id)) {
                    Some(found) => found.iter().copied().map(Some).collect(),
                    None => vec![None],
                };

            for subtask in matches {
                if subtask.is_some_and(|s| s.deleted) {
                    continue;
                }
                if let Some(id) = subtask_id {
                    let unresolved = subtask.and_then(|s| s.subtask_name.as_ref()).is_none();
                    if unresolved && flagged.insert(id) {
                        warnings.push(IntegrityWarning::MissingSubtask {
                            task_id: task.task_id.clone(),
                            subtask_id: id.to_string(),
                        });
                    }
                }

                rows.push(fact_row(
                    run_ts,
                    task,
                    task_creation_dt,
                    placement,
                    subtask_id,
                    subtask,
                    hubs,
                )?);
            }
        }
    }

    Ok(Reconciliation {
        rows: dedup_rows(rows),
        warnings,
    })
}

fn fact_row(
    run_ts: DateTime<Utc>,
    task: &TaskRecord,
    task_creation_dt: Option<NaiveDate>,
    placement: Option<&BoardColumn>,
    subtask_id: Option<&str>,
    subtask: Option<&SubtaskRecord>,
    hubs: &HubSet,
) -> Result<FactRow, ParseError> {
    let record_id = subtask_id.unwrap_or(&task.task_id);
    let (loading_start_date, loading_end_date) =
        parse_loading_dates(record_id, subtask.and_then(|s| s.loading_dates.as_deref()))?;
    let deadline_start_ms = parse_millis(
        DEADLINE_START_MS,
        record_id,
        subtask.map_or(&JsonValue::Null, |s| &s.deadline_start),
    )?;
    let deadline_end_ms = parse_millis(
        DEADLINE_END_MS,
        record_id,
        subtask.map_or(&JsonValue::Null, |s| &s.deadline_end),
    )?;

    Ok(FactRow {
        loaded_ts: run_ts,
        task_name: task.task_name.clone(),
        task_id: task.task_id.clone(),
        task_creation_dt,
        board_name: placement.map(|c| c.board_name.clone()),
        column_name: placement.map(|c| c.column_name.clone()),
        task_status: hubs
            .contract_status
            .resolve(task.contract_status_state_id.as_deref()),
        subtask_id: subtask_id.map(ToString::to_string),
        subtask_name: subtask.and_then(|s| s.subtask_name.clone()),
        subtask_status: hubs
            .lot_status
            .resolve(subtask.and_then(|s| s.lot_status_state_id.as_deref())),
        quantity_plan: parse_quantity(
            QUANTITY_PLAN,
            record_id,
            subtask.and_then(|s| s.quantity_plan.as_deref()),
        )?,
        quantity_fact: parse_quantity(
            QUANTITY_FACT,
            record_id,
            subtask.and_then(|s| s.quantity_fact.as_deref()),
        )?,
        delivery_term: hubs
            .delivery_term
            .resolve(subtask.and_then(|s| s.delivery_term_state_id.as_deref())),
        loading_place: hubs
            .loading_place
            .resolve(subtask.and_then(|s| s.loading_place_state_id.as_deref())),
        loading_start_date,
        loading_end_date,
        ship_name: subtask.and_then(|s| s.ship_name.clone()),
        discharging_place: subtask.and_then(|s| s.discharging_place.clone()),
        deadline_start_date: millis_to_date(DEADLINE_START_MS, record_id, deadline_start_ms)?,
        deadline_end_date: millis_to_date(DEADLINE_END_MS, record_id, deadline_end_ms)?,
        prov_paid: hubs
            .prov_paid
            .resolve(subtask.and_then(|s| s.prov_paid_state_id.as_deref())),
        final_paid: hubs
            .final_paid
            .resolve(subtask.and_then(|s| s.final_paid_state_id.as_deref())),
    })
}

/// Split `"dd.mm.yyyy-dd.mm.yyyy"` into start and end dates. Whitespace is ignored; a blank value
/// has no dates.
pub fn parse_loading_dates(
    subtask_id: &str,
    raw: Option<&str>,
) -> Result<(Option<NaiveDate>, Option<NaiveDate>), ParseError> {
    let Some(raw) = raw else {
        return Ok((None, None));
    };
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Ok((None, None));
    }

    let parts: Vec<&str> = compact.split('-').collect();
    let [start, end] = parts.as_slice() else {
        return Err(ParseError::LoadingDates {
            subtask_id: subtask_id.to_string(),
            value: raw.to_string(),
        });
    };
    Ok((
        Some(parse_day(LOADING_START_DATE, subtask_id, start)?),
        Some(parse_day(LOADING_END_DATE, subtask_id, end)?),
    ))
}

fn parse_day(field: &'static str, subtask_id: &str, value: &str) -> Result<NaiveDate, ParseError> {
    NaiveDate::parse_from_str(value, LOADING_DATE_FORMAT).map_err(|_| ParseError::Date {
        field,
        subtask_id: subtask_id.to_string(),
        value: value.to_string(),
    })
}

/// Empty text is a missing quantity; anything else must be a number.
pub fn parse_quantity(
    field: &'static str,
    subtask_id: &str,
    raw: Option<&str>,
) -> Result<Option<f64>, ParseError> {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    raw.parse::<f64>().map(Some).map_err(|_| ParseError::Quantity {
        field,
        subtask_id: subtask_id.to_string(),
        value: raw.to_string(),
    })
}

/// UTC calendar day of a millisecond epoch timestamp.
pub fn millis_to_date(
    field: &'static str,
    record_id: &str,
    millis: Option<i64>,
) -> Result<Option<NaiveDate>, ParseError> {
    millis
        .map(|value| {
            DateTime::from_timestamp_millis(value)
                .map(|ts| ts.date_naive())
                .ok_or_else(|| ParseError::Timestamp {
                    field,
                    record_id: record_id.to_string(),
                    value,
                })
        })
        .transpose()
}

/// Drop exact duplicates, keeping the first occurrence and the original order.
pub fn dedup_rows(rows: Vec<FactRow>) -> Vec<FactRow> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.into_iter().filter(|row| seen.insert(row.clone())).collect()
}

/// Compare the per-column task fetch with the global listing fetched for subtasks.
///
/// Live tasks that sit in an in-scope column of the global listing but never came back from
/// their column's listing are reported.
pub fn task_count_guard(
    index: &[BoardColumn],
    column_tasks: &[TaskRecord],
    listing: &[SubtaskRecord],
) -> Option<IntegrityWarning> {
    let scoped: HashSet<&str> = index.iter().map(|c| c.column_id.as_str()).collect();
    let fetched: HashSet<&str> = column_tasks.iter().map(|t| t.task_id.as_str()).collect();

    let in_scope: Vec<&SubtaskRecord> = listing
        .iter()
        .filter(|s| !s.deleted)
        .filter(|s| s.column_id.as_deref().is_some_and(|id| scoped.contains(id)))
        .collect();
    let missing_task_ids: Vec<String> = in_scope
        .iter()
        .filter(|s| !fetched.contains(s.subtask_id.as_str()))
        .map(|s| s.subtask_id.clone())
        .collect();

    (!missing_task_ids.is_empty()).then(|| IntegrityWarning::TaskCountMismatch {
        per_column: column_tasks.len(),
        global: in_scope.len(),
        missing_task_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use ygcdm_adapters::StickerCatalog;
    use ygcdm_core::StickerState;

    fn run_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 21, 5, 0, 0).single().unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn index() -> Vec<BoardColumn> {
        vec![BoardColumn {
            board_id: "B1".into(),
            project_id: None,
            board_name: "Sales".into(),
            column_id: "C1".into(),
            column_name: "In progress".into(),
        }]
    }

    fn hubs() -> HubSet {
        let state = |sticker: &str, id: &str, name: &str| StickerState {
            sticker_id: sticker.into(),
            sticker_name: sticker.into(),
            state_id: id.into(),
            state_name: Some(name.into()),
        };
        let catalog = StickerCatalog {
            states: vec![
                state("Status", "won", "Won"),
                state("Lot", "won", "Shipped"),
                state("Basis", "fob", "FOB"),
            ],
        };
        HubSet {
            contract_status: catalog.hub("Status", "contract_status_state_id", "task_status"),
            lot_status: catalog.hub("Lot", "lot_status_state_id", "subtask_status"),
            delivery_term: catalog.hub("Basis", "delivery_term_state_id", "delivery_term"),
            ..HubSet::default()
        }
    }

    fn task(id: &str, subtasks: &[&str]) -> TaskRecord {
        TaskRecord {
            task_id: id.into(),
            task_name: Some(format!("Task {id}")),
            creation_ms: Some(1714521600000),
            column_id: Some("C1".into()),
            subtask_ids: subtasks.iter().map(ToString::to_string).collect(),
            contract_status_state_id: Some("won".into()),
        }
    }

    fn subtask(id: &str) -> SubtaskRecord {
        SubtaskRecord {
            subtask_id: id.into(),
            subtask_name: Some(format!("Lot {id}")),
            deleted: false,
            column_id: None,
            delivery_term_state_id: None,
            lot_status_state_id: None,
            loading_place_state_id: None,
            ship_name: None,
            quantity_plan: None,
            quantity_fact: None,
            discharging_place: None,
            loading_dates: None,
            prov_paid_state_id: None,
            final_paid_state_id: None,
            deadline_start: JsonValue::Null,
            deadline_end: JsonValue::Null,
        }
    }

    #[test]
    fn won_task_with_one_subtask_yields_one_row() {
        let out = reconcile_records(&index(), &hubs(), &[task("T1", &["S1"])], &[subtask("S1")], run_ts())
            .unwrap();

        assert_eq!(out.rows.len(), 1);
        let row = &out.rows[0];
        assert_eq!(row.task_id, "T1");
        assert_eq!(row.subtask_id.as_deref(), Some("S1"));
        assert_eq!(row.task_status.as_deref(), Some("Won"));
        assert_eq!(row.loaded_ts, run_ts());
        assert_eq!(row.board_name.as_deref(), Some("Sales"));
        assert_eq!(row.task_creation_dt, Some(day(2024, 5, 1)));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn subtask_list_explodes_into_rows_sharing_task_fields() {
        let out = reconcile_records(
            &index(),
            &hubs(),
            &[task("T1", &["A", "B"]), task("T2", &[])],
            &[subtask("A"), subtask("B")],
            run_ts(),
        )
        .unwrap();

        assert_eq!(out.rows.len(), 3);
        assert_eq!(out.rows[0].task_name, out.rows[1].task_name);
        assert_eq!(out.rows[1].subtask_id.as_deref(), Some("B"));
        assert_eq!(out.rows[2].task_id, "T2");
        assert_eq!(out.rows[2].subtask_id, None);
        assert_eq!(out.rows[2].subtask_name, None);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn deleted_subtasks_are_excluded_even_with_bad_values() {
        let mut gone = subtask("S2");
        gone.deleted = true;
        gone.quantity_plan = Some("a lot".into());
        gone.deadline_end = json!("tbd");

        let out = reconcile_records(
            &index(),
            &hubs(),
            &[task("T1", &["S1", "S2"])],
            &[subtask("S1"), gone],
            run_ts(),
        )
        .unwrap();

        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].subtask_id.as_deref(), Some("S1"));
    }

    #[test]
    fn deadlines_parse_only_for_joined_subtasks() {
        let mut lot = subtask("S1");
        lot.deadline_start = json!("1714521600000");
        lot.deadline_end = json!(1715299200000_i64);
        let mut unrelated = subtask("X8");
        unrelated.deadline_start = json!("n/a");

        let out = reconcile_records(
            &index(),
            &hubs(),
            &[task("T1", &["S1"])],
            &[lot.clone(), unrelated],
            run_ts(),
        )
        .unwrap();
        assert_eq!(out.rows[0].deadline_start_date, Some(day(2024, 5, 1)));
        assert_eq!(out.rows[0].deadline_end_date, Some(day(2024, 5, 10)));

        lot.deadline_end = json!("tbd");
        let err = reconcile_records(&index(), &hubs(), &[task("T1", &["S1"])], &[lot], run_ts())
            .unwrap_err();
        assert!(matches!(err, ParseError::FieldType { field: DEADLINE_END_MS, .. }));
    }

    #[test]
    fn missing_subtask_warns_once_and_keeps_null_row() {
        let out = reconcile_records(
            &index(),
            &hubs(),
            &[task("T1", &["X"]), task("T2", &["X"])],
            &[],
            run_ts(),
        )
        .unwrap();

        assert_eq!(out.rows.len(), 2);
        assert!(out.rows.iter().all(|r| r.subtask_id.as_deref() == Some("X")));
        assert!(out.rows.iter().all(|r| r.subtask_name.is_none()));
        assert_eq!(
            out.warnings,
            vec![IntegrityWarning::MissingSubtask {
                task_id: "T1".into(),
                subtask_id: "X".into(),
            }]
        );
    }

    #[test]
    fn hubs_do_not_leak_between_dictionaries() {
        let mut lot = subtask("S1");
        lot.lot_status_state_id = Some("won".into());
        lot.delivery_term_state_id = Some("won".into());

        let out = reconcile_records(&index(), &hubs(), &[task("T1", &["S1"])], &[lot], run_ts())
            .unwrap();

        assert_eq!(out.rows[0].subtask_status.as_deref(), Some("Shipped"));
        assert_eq!(out.rows[0].delivery_term, None);
    }

    #[test]
    fn task_outside_index_keeps_null_placement() {
        let mut stray = task("T1", &[]);
        stray.column_id = Some("elsewhere".into());

        let out = reconcile_records(&index(), &hubs(), &[stray], &[], run_ts()).unwrap();

        assert_eq!(out.rows[0].board_name, None);
        assert_eq!(out.rows[0].column_name, None);
    }

    #[test]
    fn loading_dates_split_and_ignore_spaces() {
        assert_eq!(
            parse_loading_dates("S1", Some("01.05.2024 - 10.05.2024")).unwrap(),
            (Some(day(2024, 5, 1)), Some(day(2024, 5, 10)))
        );
        assert_eq!(parse_loading_dates("S1", Some("  ")).unwrap(), (None, None));
        assert_eq!(parse_loading_dates("S1", None).unwrap(), (None, None));
    }

    #[test]
    fn loading_dates_without_two_parts_fail() {
        let err = parse_loading_dates("S1", Some("01.05.2024")).unwrap_err();
        assert!(matches!(err, ParseError::LoadingDates { .. }));

        let err = parse_loading_dates("S1", Some("01.05.2024-02.05.2024-03.05.2024")).unwrap_err();
        assert!(matches!(err, ParseError::LoadingDates { .. }));

        let err = parse_loading_dates("S1", Some("2024.05.01-10.05.2024")).unwrap_err();
        assert!(matches!(err, ParseError::Date { field: LOADING_START_DATE, .. }));
    }

    #[test]
    fn secondary_loading_dates_reach_the_row() {
        let mut lot = subtask("S1");
        lot.loading_dates = Some("01.05.2024-10.05.2024".into());

        let out = reconcile_records(&index(), &hubs(), &[task("T1", &["S1"])], &[lot], run_ts())
            .unwrap();

        assert_eq!(out.rows[0].loading_start_date, Some(day(2024, 5, 1)));
        assert_eq!(out.rows[0].loading_end_date, Some(day(2024, 5, 10)));
    }

    #[test]
    fn quantities_parse_or_fail() {
        assert_eq!(parse_quantity(QUANTITY_PLAN, "S1", Some(" 4980.5 ")).unwrap(), Some(4980.5));
        assert_eq!(parse_quantity(QUANTITY_PLAN, "S1", Some("")).unwrap(), None);
        assert_eq!(parse_quantity(QUANTITY_PLAN, "S1", None).unwrap(), None);

        let mut lot = subtask("S1");
        lot.quantity_fact = Some("five".into());
        let err = reconcile_records(&index(), &hubs(), &[task("T1", &["S1"])], &[lot], run_ts())
            .unwrap_err();
        assert!(matches!(err, ParseError::Quantity { field: QUANTITY_FACT, .. }));
    }

    #[test]
    fn out_of_range_timestamp_is_a_parse_error() {
        let mut bad = task("T1", &[]);
        bad.creation_ms = Some(i64::MAX);

        let err = reconcile_records(&index(), &hubs(), &[bad], &[], run_ts()).unwrap_err();
        assert!(matches!(err, ParseError::Timestamp { field: TASK_CREATION_MS, .. }));
    }

    #[test]
    fn deadline_millis_truncate_to_utc_day() {
        assert_eq!(
            millis_to_date(DEADLINE_END_MS, "S1", Some(1715385599999)).unwrap(),
            Some(day(2024, 5, 10))
        );
    }

    #[test]
    fn duplicate_subtask_references_collapse() {
        let out = reconcile_records(
            &index(),
            &hubs(),
            &[task("T1", &["S1", "S1"])],
            &[subtask("S1")],
            run_ts(),
        )
        .unwrap();
        assert_eq!(out.rows.len(), 1);

        let again = dedup_rows(out.rows.clone());
        assert_eq!(again, out.rows);
    }

    #[test]
    fn count_guard_reports_tasks_missing_from_column_fetch() {
        let mut listed = subtask("T9");
        listed.column_id = Some("C1".into());
        let mut removed = subtask("T8");
        removed.column_id = Some("C1".into());
        removed.deleted = true;
        let mut elsewhere = subtask("T7");
        elsewhere.column_id = Some("C2".into());
        let mut fetched = subtask("T1");
        fetched.column_id = Some("C1".into());

        let warning = task_count_guard(
            &index(),
            &[task("T1", &[])],
            &[fetched.clone(), listed, removed, elsewhere],
        );

        assert_eq!(
            warning,
            Some(IntegrityWarning::TaskCountMismatch {
                per_column: 1,
                global: 2,
                missing_task_ids: vec!["T9".into()],
            })
        );
        assert_eq!(task_count_guard(&index(), &[task("T1", &[])], &[fetched]), None);
    }
}
