use std::path::PathBuf;

use serde::Deserialize;

use crate::workbook::Workbook;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workbook: Option<Workbook>,
    pub source_path: Option<PathBuf>,
}
