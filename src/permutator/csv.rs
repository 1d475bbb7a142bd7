//! CSV permutator: grid-level permutations of a comma-separated seed.

use std::fs;
use std::path::Path;

use crossbeam_channel::Sender;

use super::{publish, Permutator};
use crate::errors::{FuzzerError, Result};
use crate::test_case::TestCase;

/// Rows or columns appended by the spam permutations.
const SPAM_COUNT: usize = 4096;

/// Parsed grid form of a CSV seed, plus the description log that
/// becomes the published case's `changes`.
pub struct ParsedCsv {
    lines: Vec<Vec<String>>,
    rows: usize,
    columns: usize,
    description: Vec<String>,
}

impl ParsedCsv {
    /// Splits `text` into a grid: lines on newlines, fields on commas.
    pub fn parse(text: &str) -> ParsedCsv {
        let mut lines = Vec::new();
        let mut columns = 0;
        for line in text.lines() {
            let fields: Vec<String> = line.split(',').map(str::to_string).collect();
            columns = fields.len();
            lines.push(fields);
        }
        let rows = lines.len();
        ParsedCsv {
            lines,
            rows,
            columns,
            description: Vec::new(),
        }
    }

    fn add_to_desc(&mut self, change: String) {
        self.description.push(change);
    }

    /// Serializes the grid back to CSV text.
    pub fn flatten(&self) -> String {
        let mut out = String::new();
        for row in &self.lines {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    pub fn delete_row(&mut self, u: usize) {
        if u < self.rows {
            self.lines.remove(u);
            self.rows -= 1;
            self.add_to_desc(format!("removed row {}", u));
        } else {
            self.add_to_desc(format!("no row {} to remove", u));
        }
    }

    pub fn delete_col(&mut self, u: usize) {
        if u < self.columns {
            for line in &mut self.lines {
                line.remove(u);
            }
            self.columns -= 1;
            self.add_to_desc(format!("removed column {}", u));
        } else {
            self.add_to_desc(format!("no column {} to remove", u));
        }
    }

    /// Inserts `row` at index `l`. The resulting grid equals the old
    /// one with exactly one row inserted there; the source row is
    /// owned by the grid afterwards, never shared.
    pub fn add_row(&mut self, l: usize, row: Vec<String>) {
        if l < self.rows {
            if row.len() == self.columns {
                self.lines.insert(l, row);
                self.rows += 1;
                self.add_to_desc(format!("added row at {}", l));
            } else {
                self.add_to_desc(format!(
                    "row of width {} does not fit {} columns",
                    row.len(),
                    self.columns
                ));
            }
        } else {
            self.add_to_desc(format!("{} is not a valid location to insert a row", l));
        }
    }

    /// Inserts `col` at index `l`, clamped to the current width.
    pub fn add_column(&mut self, l: usize, col: Vec<String>) {
        let l = l.min(self.columns);
        if col.len() == self.rows {
            for (i, line) in self.lines.iter_mut().enumerate() {
                line.insert(l, col[i].clone());
            }
            self.columns += 1;
            self.add_to_desc(format!("added column at {}", l));
        } else {
            self.add_to_desc(format!(
                "column of height {} does not fit {} rows",
                col.len(),
                self.rows
            ));
        }
    }

    fn get_row(&self, r: usize) -> Vec<String> {
        self.lines[r].clone()
    }

    fn get_col(&self, c: usize) -> Vec<String> {
        self.lines.iter().map(|row| row[c].clone()).collect()
    }

    /// Inserts a duplicate of row `r` next to it.
    pub fn copy_row(&mut self, r: usize) {
        if r < self.rows {
            let row = self.get_row(r);
            self.add_row(r, row);
            self.add_to_desc(format!("copied row {}", r));
        }
    }

    /// Inserts a duplicate of column `c` next to it.
    pub fn copy_col(&mut self, c: usize) {
        if c < self.columns {
            let col = self.get_col(c);
            self.add_column(c, col);
            self.add_to_desc(format!("copied column {}", c));
        }
    }

    pub fn add_blank_row(&mut self, r: usize) {
        self.add_row(r, vec![String::new(); self.columns]);
    }

    pub fn add_blank_col(&mut self, c: usize) {
        self.add_column(c, vec![String::new(); self.rows]);
    }

    /// Replaces every row with a blank row of the same width, keeping
    /// the grid geometry. The blanked grid is what every subsequent
    /// publication observes.
    pub fn blank(&mut self) {
        for row in &mut self.lines {
            for field in row.iter_mut() {
                field.clear();
            }
        }
        self.add_to_desc("blanked CSV keeping original geometry".to_string());
    }

    /// Grows the grid by thousands of rows at the tail: blank rows, or
    /// copies of the last row. A single summary entry goes in the
    /// description; logging each insertion would dwarf the input.
    pub fn spam_rows(&mut self, copies: bool) {
        if self.rows == 0 || self.columns == 0 {
            return;
        }
        for _ in 1..SPAM_COUNT {
            let last = self.rows - 1;
            let row = if copies {
                self.get_row(last)
            } else {
                vec![String::new(); self.columns]
            };
            self.lines.insert(last, row);
            self.rows += 1;
        }
        self.add_to_desc(format!(
            "spammed {} {} rows",
            SPAM_COUNT - 1,
            if copies { "copied" } else { "blank" }
        ));
    }

    /// Column counterpart of `spam_rows`.
    pub fn spam_cols(&mut self, copies: bool) {
        if self.rows == 0 || self.columns == 0 {
            return;
        }
        for _ in 1..SPAM_COUNT {
            let last = self.columns - 1;
            let col = if copies {
                self.get_col(last)
            } else {
                vec![String::new(); self.rows]
            };
            for (i, line) in self.lines.iter_mut().enumerate() {
                line.insert(last, col[i].clone());
            }
            self.columns += 1;
        }
        self.add_to_desc(format!(
            "spammed {} {} columns",
            SPAM_COUNT - 1,
            if copies { "copied" } else { "blank" }
        ));
    }
}

/// A seed is CSV when every line splits into the same number of fields
/// and there are at least two columns. Single-column text is left to
/// the plain generator; without this floor nearly any text would
/// classify as CSV.
pub fn is_valid_csv(bytes: &[u8]) -> bool {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(_) => return false,
    };
    let mut width = None;
    let mut line_count = 0;
    for line in text.lines() {
        let fields = line.split(',').count();
        if *width.get_or_insert(fields) != fields {
            return false;
        }
        line_count += 1;
    }
    line_count > 0 && width.unwrap_or(0) >= 2
}

pub struct CsvPermutator {
    to_harness: Sender<TestCase>,
    to_mutator: Sender<TestCase>,
}

impl CsvPermutator {
    pub fn new(to_harness: Sender<TestCase>, to_mutator: Sender<TestCase>) -> CsvPermutator {
        CsvPermutator {
            to_harness,
            to_mutator,
        }
    }

    fn publish_perm(&self, perm: &ParsedCsv) {
        let case = TestCase {
            input: perm.flatten().into_bytes(),
            changes: perm.description.clone(),
        };
        publish(&self.to_harness, &self.to_mutator, case);
    }
}

impl Permutator for CsvPermutator {
    /// Takes the CSV seed as base and publishes one case per
    /// permutation, each built from a fresh parse.
    fn permutate_input(&mut self, file: &Path) -> Result<()> {
        let text = fs::read_to_string(file).map_err(FuzzerError::SeedInput)?;

        let permutations: &[fn(&mut ParsedCsv)] = &[
            |perm| perm.add_to_desc("initial input".to_string()),
            |perm| perm.blank(),
            |perm| perm.delete_row(0),
            |perm| perm.delete_col(0),
            |perm| perm.copy_row(perm.rows.saturating_sub(1)),
            |perm| perm.copy_col(perm.columns.saturating_sub(1)),
            |perm| perm.add_blank_row(0),
            |perm| perm.add_blank_col(0),
            |perm| perm.spam_rows(false),
            |perm| perm.spam_rows(true),
            |perm| perm.spam_cols(false),
            |perm| perm.spam_cols(true),
        ];

        for permute in permutations {
            let mut perm = ParsedCsv::parse(&text);
            perm.add_to_desc(format!(
                "read CSV seed: {} rows, {} columns",
                perm.rows, perm.columns
            ));
            permute(&mut perm);
            self.publish_perm(&perm);
        }
        Ok(())
    }
}
