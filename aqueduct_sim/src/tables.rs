//! Plain CSV tables for the week-scenario inputs.
//!
//! Demand patterns, starting offsets and initial tank levels arrive as
//! small numeric tables with an index column, one header row and no
//! quoting. Parsed by hand; anything malformed is an invalid
//! configuration naming the file and line.

use std::path::Path;

use crate::SimError;

/// A numeric table: header row, index column, f64 cells.
#[derive(Debug, Clone)]
pub struct CsvTable {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl CsvTable {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SimError::InvalidConfiguration(format!("cannot read table {}: {e}", path.display()))
        })?;
        let mut lines = raw.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

        let (_, header) = lines.next().ok_or_else(|| {
            SimError::InvalidConfiguration(format!("empty table {}", path.display()))
        })?;
        // first header cell names the index column; skip it
        let columns: Vec<String> = header
            .split(',')
            .skip(1)
            .map(|c| c.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for (lineno, line) in lines {
            let cells: Vec<&str> = line.split(',').skip(1).collect();
            if cells.len() != columns.len() {
                return Err(SimError::InvalidConfiguration(format!(
                    "{}:{}: expected {} cells, found {}",
                    path.display(),
                    lineno + 1,
                    columns.len(),
                    cells.len()
                )));
            }
            let mut row = Vec::with_capacity(cells.len());
            for cell in cells {
                let value = cell.trim().parse::<f64>().map_err(|_| {
                    SimError::InvalidConfiguration(format!(
                        "{}:{}: not a number: {cell:?}",
                        path.display(),
                        lineno + 1
                    ))
                })?;
                row.push(value);
            }
            rows.push(row);
        }
        Ok(Self { columns, rows })
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// A single cell addressed by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(col).copied()
    }

    /// A single cell addressed by row and column position.
    pub fn value_at(&self, row: usize, col: usize) -> Option<f64> {
        self.rows.get(row)?.get(col).copied()
    }

    /// A slice of one column, rows `start..start + len` (saturating at the
    /// end of the table).
    pub fn column_slice(&self, column: &str, start: usize, len: usize) -> Option<Vec<f64>> {
        let col = self.columns.iter().position(|c| c == column)?;
        let end = (start + len).min(self.rows.len());
        if start >= end {
            return None;
        }
        Some(self.rows[start..end].iter().map(|r| r[col]).collect())
    }
}
