use std::path::PathBuf;

use serde_json::json;

use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::workbook::{self, Workbook};

fn handle_workbook_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let path = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = path else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match workbook::open_workbook_file(&path) {
        Ok(wb) => install_workbook(state, req, wb, Some(path)),
        Err(e) => err(&req.id, "workbook_open_failed", format!("{e:?}"), None),
    }
}

fn handle_workbook_load(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(sheets) = req.params.get("sheets").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing params.sheets", None);
    };

    let mut wb = Workbook::default();
    for (name, rows) in sheets {
        match workbook::grid_from_json(rows) {
            Ok(grid) => wb.insert_sheet(name.clone(), grid),
            Err(msg) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("sheet {name}: {msg}"),
                    None,
                )
            }
        }
    }
    install_workbook(state, req, wb, None)
}

// A workbook without any Lab worksheet is rejected and the previous
// workbook, if any, stays selected.
fn install_workbook(
    state: &mut AppState,
    req: &Request,
    wb: Workbook,
    path: Option<PathBuf>,
) -> serde_json::Value {
    let sheets = wb.lab_sheet_names();
    if sheets.is_empty() {
        return err(
            &req.id,
            "no_lab_sheets",
            "no Lab worksheets found in the workbook",
            None,
        );
    }
    state.workbook = Some(wb);
    state.source_path = path;
    ok(&req.id, json!({ "sheets": sheets }))
}

fn handle_sheets_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(wb) = state.workbook.as_ref() else {
        return err(&req.id, "no_workbook", "load a workbook first", None);
    };
    ok(&req.id, json!({ "sheets": wb.lab_sheet_names() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "workbook.open" => Some(handle_workbook_open(state, req)),
        "workbook.load" => Some(handle_workbook_load(state, req)),
        "sheets.list" => Some(handle_sheets_list(state, req)),
        _ => None,
    }
}
