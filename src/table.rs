use crate::rules::{Record, ReplacementRule};
use anyhow::{Context, Result};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("workbook has no worksheets")]
    NoSheets,
    #[error("worksheet '{0}' not found")]
    UnknownSheet(String),
    #[error("worksheet is missing required headers: {}", .0.join(", "))]
    MissingHeaders(Vec<String>),
}

/// A data row dropped because required fields were blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    pub row: u32,
    pub empty_fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TableData {
    pub sheet_name: String,
    pub records: Vec<Record>,
    pub skipped: Vec<SkippedRow>,
}

/// Cell text of one worksheet, keyed by 1-based (row, column).
#[derive(Debug, Default)]
pub struct Grid {
    cells: BTreeMap<(u32, u32), String>,
    max_row: u32,
}

impl Grid {
    pub fn insert(&mut self, row: u32, col: u32, value: impl Into<String>) {
        self.max_row = self.max_row.max(row);
        self.cells.insert((row, col), value.into());
    }

    fn get(&self, row: u32, col: u32) -> &str {
        self.cells
            .get(&(row, col))
            .map(String::as_str)
            .unwrap_or("")
    }

    fn header_columns(&self) -> HashMap<String, u32> {
        let mut columns = HashMap::new();
        for ((_, col), value) in self.cells.range((1, 0)..(2, 0)) {
            let header = value.trim();
            if header.is_empty() {
                continue;
            }
            columns.entry(header.to_string()).or_insert(*col);
        }
        columns
    }
}

/// Reads the worksheet that was active when the workbook was saved, or `sheet`.
pub fn read_workbook(
    path: &Path,
    sheet: Option<&str>,
    rules: &[ReplacementRule],
) -> Result<TableData> {
    let book = umya_spreadsheet::reader::xlsx::read(path)
        .with_context(|| format!("open workbook {path:?}"))?;
    let sheets = book.get_sheet_collection_no_check();
    let worksheet = match sheet {
        Some(name) => sheets
            .iter()
            .find(|candidate| candidate.get_name() == name)
            .ok_or_else(|| TableError::UnknownSheet(name.to_string()))?,
        None => {
            let active = *book.get_workbook_view().get_active_tab() as usize;
            sheets
                .get(active)
                .or_else(|| sheets.first())
                .ok_or(TableError::NoSheets)?
        }
    };

    let mut grid = Grid::default();
    for cell in worksheet.get_cell_collection() {
        let coordinate = cell.get_coordinate();
        let value = cell_text(cell);
        if value.is_empty() {
            continue;
        }
        grid.insert(*coordinate.get_row_num(), *coordinate.get_col_num(), value);
    }

    let mut data = extract_records(&grid, rules)?;
    data.sheet_name = worksheet.get_name().to_string();
    Ok(data)
}

/// Cell text as stored, except date-formatted cells which use their display text
/// instead of the raw serial number.
fn cell_text(cell: &umya_spreadsheet::Cell) -> String {
    let is_date = cell
        .get_style()
        .get_number_format()
        .is_some_and(|format| is_date_format(format.get_format_code()));
    if is_date {
        cell.get_formatted_value()
    } else {
        cell.get_value().to_string()
    }
}

/// True when a number format code renders dates or times.
fn is_date_format(code: &str) -> bool {
    let mut in_quotes = false;
    let mut in_brackets = false;
    let mut escaped = false;
    for ch in code.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => in_quotes = !in_quotes,
            '[' if !in_quotes => in_brackets = true,
            ']' if !in_quotes => in_brackets = false,
            _ if in_quotes || in_brackets => {}
            'y' | 'Y' | 'd' | 'D' | 'h' | 'H' | 's' | 'S' => return true,
            _ => {}
        }
    }
    false
}

/// Turns a header row plus data rows into records for `rules`.
pub fn extract_records(grid: &Grid, rules: &[ReplacementRule]) -> Result<TableData, TableError> {
    let columns = grid.header_columns();
    let mut missing: Vec<String> = Vec::new();
    for rule in rules {
        if !columns.contains_key(&rule.excel_header) && !missing.contains(&rule.excel_header) {
            missing.push(rule.excel_header.clone());
        }
    }
    if !missing.is_empty() {
        return Err(TableError::MissingHeaders(missing));
    }

    let mut records = Vec::new();
    let mut skipped = Vec::new();
    for row in 2..=grid.max_row {
        let mut record = Record::new();
        for rule in rules {
            let col = columns[&rule.excel_header];
            record.insert(
                rule.excel_header.clone(),
                grid.get(row, col).trim().to_string(),
            );
        }

        if record.values().all(|value| value.is_empty()) {
            continue;
        }

        let mut empty_fields: Vec<String> = Vec::new();
        for rule in rules.iter().filter(|rule| rule.required) {
            if record[&rule.excel_header].is_empty() && !empty_fields.contains(&rule.excel_header)
            {
                empty_fields.push(rule.excel_header.clone());
            }
        }
        if empty_fields.is_empty() {
            records.push(record);
        } else {
            skipped.push(SkippedRow { row, empty_fields });
        }
    }

    Ok(TableData {
        sheet_name: String::new(),
        records,
        skipped,
    })
}
