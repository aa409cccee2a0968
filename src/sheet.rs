use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::analysis::AnalysisError;
use crate::workbook::{cell_at, Cell, Grid};

/// Known metric columns, in declared order. Discovery preserves this order
/// regardless of column order in the sheet.
pub const METRICS: [Metric; 5] = [
    Metric::Area,
    Metric::Latency,
    Metric::Power,
    Metric::Performance,
    Metric::Ct,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Metric {
    Area,
    Latency,
    Power,
    Performance,
    #[serde(rename = "CT")]
    Ct,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Area => "Area",
            Metric::Latency => "Latency",
            Metric::Power => "Power",
            Metric::Performance => "Performance",
            Metric::Ct => "CT",
        }
    }

    pub fn from_name(name: &str) -> Option<Metric> {
        METRICS.iter().copied().find(|m| m.as_str() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PassStage {
    #[serde(rename = "1st_demo")]
    FirstDemo,
    #[serde(rename = "2nd_demo")]
    SecondDemo,
}

impl PassStage {
    pub fn from_tag(tag: &str) -> Option<PassStage> {
        match tag.trim() {
            "1st_demo" => Some(PassStage::FirstDemo),
            "2nd_demo" => Some(PassStage::SecondDemo),
            _ => None,
        }
    }
}

/// Ordinary sheets tag a record with one pass stage; the two-row-header
/// sheet carries two independent gates. `None` means the cell held no
/// recognizable stage tag; filters never admit it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageTags {
    Single(Option<PassStage>),
    Dual {
        design: Option<PassStage>,
        pattern: Option<PassStage>,
    },
}

#[derive(Debug, Clone)]
pub struct StudentRecord {
    pub account: String,
    pub stages: StageTags,
    pub metrics: BTreeMap<Metric, f64>,
    pub lab_score: Option<f64>,
}

impl StudentRecord {
    pub fn metric(&self, m: Metric) -> Option<f64> {
        self.metrics.get(&m).copied()
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedSheet {
    pub name: String,
    pub two_row_header: bool,
    pub records: Vec<StudentRecord>,
}

pub const TWO_ROW_HEADER_SHEET: &str = "Lab03";
pub const GROUP_HEADER: &str = "Performance Results";
const ACCOUNT_HEADER: &str = "Account";
const PASS_HEADER: &str = "Pass";
const DESIGN_PASS_HEADER: &str = "Design Pass";
const PATTERN_PASS_HEADER: &str = "Pattern Pass";

pub fn is_two_row_header_sheet(name: &str) -> bool {
    name.eq_ignore_ascii_case(TWO_ROW_HEADER_SHEET)
}

pub fn normalize_sheet(name: &str, grid: &Grid) -> Result<NormalizedSheet, AnalysisError> {
    if is_two_row_header_sheet(name) {
        normalize_two_row_header(name, grid)
    } else {
        normalize_ordinary(name, grid)
    }
}

fn header_position(row: &[Cell], label: &str) -> Option<usize> {
    row.iter().position(|c| c.text() == label)
}

fn normalize_ordinary(name: &str, grid: &Grid) -> Result<NormalizedSheet, AnalysisError> {
    let Some(header) = grid.first() else {
        return Err(AnalysisError::structure(name, "sheet is empty"));
    };

    let Some(account_col) = header_position(header, ACCOUNT_HEADER) else {
        return Err(AnalysisError::structure(name, "missing 'Account' header"));
    };
    let pass_col = header_position(header, PASS_HEADER);
    let score_col = header_position(header, &format!("{name} Score"));
    let metric_cols: Vec<(Metric, usize)> = METRICS
        .iter()
        .filter_map(|&m| header_position(header, m.as_str()).map(|i| (m, i)))
        .collect();

    let mut records = Vec::new();
    let mut seen = HashSet::new();
    for row in grid.iter().skip(1) {
        let account = cell_at(row, account_col).text();
        if account.is_empty() || !seen.insert(account.clone()) {
            continue;
        }
        let pass = pass_col.and_then(|i| cell_at(row, i).as_str().and_then(PassStage::from_tag));
        let mut metrics = BTreeMap::new();
        for &(m, i) in &metric_cols {
            // Strict typing on ordinary sheets: non-numeric cells leave the
            // metric absent, which the filter later rejects as non-finite.
            if let Some(v) = cell_at(row, i).as_number() {
                metrics.insert(m, v);
            }
        }
        let lab_score = score_col.and_then(|i| cell_at(row, i).as_number());
        records.push(StudentRecord {
            account,
            stages: StageTags::Single(pass),
            metrics,
            lab_score,
        });
    }

    Ok(NormalizedSheet {
        name: name.to_string(),
        two_row_header: false,
        records,
    })
}

/// Header information is split across two physical rows: row 0 carries the
/// grouping label and `Account`, row 1 carries the gate and metric
/// sub-columns. Data starts at row 2.
fn normalize_two_row_header(name: &str, grid: &Grid) -> Result<NormalizedSheet, AnalysisError> {
    let Some(header) = grid.first() else {
        return Err(AnalysisError::structure(name, "sheet is empty"));
    };
    if header_position(header, GROUP_HEADER).is_none() {
        return Err(AnalysisError::structure(
            name,
            &format!("missing '{GROUP_HEADER}' header"),
        ));
    }
    let Some(account_col) = header_position(header, ACCOUNT_HEADER) else {
        return Err(AnalysisError::structure(name, "missing 'Account' header"));
    };

    // Each sub-column may be independently absent; that only means the
    // field is unavailable in this sheet.
    let empty_row: Vec<Cell> = Vec::new();
    let sub = grid.get(1).unwrap_or(&empty_row);
    let design_col = header_position(sub, DESIGN_PASS_HEADER);
    let pattern_col = header_position(sub, PATTERN_PASS_HEADER);
    let metric_cols: Vec<(Metric, usize)> = METRICS
        .iter()
        .filter_map(|&m| header_position(sub, m.as_str()).map(|i| (m, i)))
        .collect();

    let mut records = Vec::new();
    let mut seen = HashSet::new();
    for row in grid.iter().skip(2) {
        let account = cell_at(row, account_col).text();
        if account.is_empty() || !seen.insert(account.clone()) {
            continue;
        }
        let design = design_col.and_then(|i| cell_at(row, i).as_str().and_then(PassStage::from_tag));
        let pattern =
            pattern_col.and_then(|i| cell_at(row, i).as_str().and_then(PassStage::from_tag));
        let mut metrics = BTreeMap::new();
        for &(m, i) in &metric_cols {
            metrics.insert(m, cell_at(row, i).to_number_lossy());
        }
        records.push(StudentRecord {
            account,
            stages: StageTags::Dual { design, pattern },
            metrics,
            lab_score: None,
        });
    }

    Ok(NormalizedSheet {
        name: name.to_string(),
        two_row_header: true,
        records,
    })
}
