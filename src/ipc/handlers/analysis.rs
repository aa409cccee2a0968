use serde_json::json;

use crate::analysis::{self, Filter, StagePair};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::sheet::{self, Metric};

const ACCOUNT_PREFIX: &str = "iclab";
const ACCOUNT_DIGITS: usize = 3;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

/// UI input contract: strip non-digits, left-pad to three digits, prefix
/// with the account literal. "99" and "iclab099" both normalize to
/// "iclab099".
fn normalize_account_id(raw: &str) -> Result<String, String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err("studentId must contain at least one digit".to_string());
    }
    Ok(format!(
        "{ACCOUNT_PREFIX}{digits:0>width$}",
        width = ACCOUNT_DIGITS
    ))
}

fn parse_stage_pair(raw: Option<&serde_json::Value>, label: &str) -> Result<StagePair, String> {
    let Some(raw) = raw else {
        return Ok(StagePair::all());
    };
    if raw.is_null() {
        return Ok(StagePair::all());
    }
    let Some(obj) = raw.as_object() else {
        return Err(format!("filters.{label} must be an object"));
    };
    let read = |key: &str| -> Result<bool, String> {
        match obj.get(key) {
            None => Ok(true),
            Some(v) if v.is_null() => Ok(true),
            Some(v) => v
                .as_bool()
                .ok_or_else(|| format!("filters.{label}.{key} must be a boolean")),
        }
    };
    Ok(StagePair {
        first: read("first")?,
        second: read("second")?,
    })
}

/// Tolerant filter parsing: every switch defaults to on, so an absent or
/// null filters object means "include everyone".
fn parse_filter(raw: Option<&serde_json::Value>, two_row_header: bool) -> Result<Filter, String> {
    if !two_row_header {
        return Ok(Filter::Single(parse_stage_pair(raw, "pass")?));
    }
    let (design_raw, pattern_raw) = match raw {
        None => (None, None),
        Some(v) if v.is_null() => (None, None),
        Some(v) => {
            let Some(obj) = v.as_object() else {
                return Err("filters must be an object".to_string());
            };
            (obj.get("design"), obj.get("pattern"))
        }
    };
    Ok(Filter::Dual {
        design: parse_stage_pair(design_raw, "design")?,
        pattern: parse_stage_pair(pattern_raw, "pattern")?,
    })
}

fn parse_metric(req: &Request) -> Result<Option<Metric>, serde_json::Value> {
    match req.params.get("metric") {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "params.metric must be a string",
                    None,
                ));
            };
            match Metric::from_name(s) {
                Some(m) => Ok(Some(m)),
                None => Err(err(
                    &req.id,
                    "bad_params",
                    format!("unknown metric: {s}"),
                    None,
                )),
            }
        }
    }
}

fn handle_analysis_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(wb) = state.workbook.as_ref() else {
        return err(&req.id, "no_workbook", "load a workbook first", None);
    };
    let sheet_name = match required_str(req, "sheet") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let raw_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let account = match normalize_account_id(&raw_id) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let metric = match parse_metric(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let Some(grid) = wb.sheet(&sheet_name) else {
        return err(
            &req.id,
            "not_found",
            format!("worksheet {sheet_name} not found"),
            None,
        );
    };
    let normalized = match sheet::normalize_sheet(&sheet_name, grid) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };
    let filter = match parse_filter(req.params.get("filters"), normalized.two_row_header) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    match analysis::compute_analysis(&normalized, &filter, metric, &account) {
        Ok(result) => ok(
            &req.id,
            json!({
                "analysis": result,
                "filters": filter
            }),
        ),
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analysis.open" => Some(handle_analysis_open(state, req)),
        _ => None,
    }
}
