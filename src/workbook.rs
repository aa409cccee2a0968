use std::collections::BTreeMap;
use std::path::Path;

use calamine::{open_workbook_auto, DataType, Reader};

/// One worksheet cell, already divorced from the source file format.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
    Bool(bool),
}

static EMPTY_CELL: Cell = Cell::Empty;

impl Cell {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Strictly typed numeric read. Text never coerces.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Lossy numeric read: anything that is not a finite number becomes 0.
    pub fn to_number_lossy(&self) -> f64 {
        let v = match self {
            Cell::Number(v) => *v,
            Cell::Text(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        };
        if v.is_finite() {
            v
        } else {
            0.0
        }
    }

    /// Display-ish text used for header and account matching. Whole numbers
    /// render without a trailing ".0" so numeric account cells line up with
    /// their string spellings.
    pub fn text(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Number(v) => {
                if v.fract() == 0.0 && v.abs() < 1e15 {
                    format!("{}", *v as i64)
                } else {
                    v.to_string()
                }
            }
            Cell::Text(s) => s.trim().to_string(),
            Cell::Bool(b) => b.to_string(),
        }
    }
}

pub type Grid = Vec<Vec<Cell>>;

pub fn cell_at(row: &[Cell], idx: usize) -> &Cell {
    row.get(idx).unwrap_or(&EMPTY_CELL)
}

/// A parsed workbook: named worksheets, each a 2-D grid of cells. Read-only
/// once loaded; every analysis run works from this snapshot.
#[derive(Debug, Default)]
pub struct Workbook {
    sheets: BTreeMap<String, Grid>,
}

impl Workbook {
    pub fn insert_sheet(&mut self, name: String, grid: Grid) {
        self.sheets.insert(name, grid);
    }

    pub fn sheet(&self, name: &str) -> Option<&Grid> {
        self.sheets.get(name)
    }

    /// Worksheet names matching `Lab` + digits, sorted lexicographically.
    pub fn lab_sheet_names(&self) -> Vec<String> {
        self.sheets
            .keys()
            .filter(|n| is_lab_sheet_name(n))
            .cloned()
            .collect()
    }
}

/// `Lab` followed by at least one digit, ASCII-case-insensitive.
pub fn is_lab_sheet_name(name: &str) -> bool {
    let Some(head) = name.get(..3) else {
        return false;
    };
    let tail = &name[3..];
    head.eq_ignore_ascii_case("lab") && !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit())
}

pub fn open_workbook_file(path: &Path) -> anyhow::Result<Workbook> {
    let mut book = open_workbook_auto(path)?;
    let names = book.sheet_names().to_vec();
    let mut wb = Workbook::default();
    for name in names {
        let Some(range) = book.worksheet_range(&name) else {
            continue;
        };
        let range = range?;
        let grid: Grid = range
            .rows()
            .map(|row| row.iter().map(cell_from_data).collect())
            .collect();
        wb.insert_sheet(name, grid);
    }
    Ok(wb)
}

fn cell_from_data(cell: &DataType) -> Cell {
    match cell {
        DataType::Empty => Cell::Empty,
        DataType::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                Cell::Empty
            } else {
                Cell::Text(t.to_string())
            }
        }
        DataType::Float(v) => Cell::Number(*v),
        DataType::Int(v) => Cell::Number(*v as f64),
        DataType::Bool(b) => Cell::Bool(*b),
        _ => Cell::Empty,
    }
}

/// Inline grid from IPC params: an array of rows, each an array of
/// string/number/bool/null cells.
pub fn grid_from_json(rows: &serde_json::Value) -> Result<Grid, String> {
    let Some(rows) = rows.as_array() else {
        return Err("rows must be an array of arrays".to_string());
    };
    let mut grid = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let Some(cells) = row.as_array() else {
            return Err(format!("row {} must be an array", i));
        };
        grid.push(cells.iter().map(cell_from_json).collect());
    }
    Ok(grid)
}

fn cell_from_json(v: &serde_json::Value) -> Cell {
    match v {
        serde_json::Value::Bool(b) => Cell::Bool(*b),
        serde_json::Value::Number(n) => n.as_f64().map(Cell::Number).unwrap_or(Cell::Empty),
        serde_json::Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                Cell::Empty
            } else {
                Cell::Text(t.to_string())
            }
        }
        _ => Cell::Empty,
    }
}
