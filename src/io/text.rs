//! Reader for delimited numeric text files.
//!
//! Instrument exports in the wild carry arbitrary headers, so the reader
//! makes two passes: the first scans for the end of the header (the first
//! line that both contains a digit and parses as the selected columns), the
//! second reads or samples the data rows.

use std::fs;
use std::path::Path;

use crate::io::pos::ColumnMap;
use crate::io::sample::select_indices;
use crate::progress::{ProgressTicker, RefreshContext};
use crate::result::LoadError;
use crate::types::IonHit;

/// Delimiters accepted between fields: tab, space, comma.
pub const DEFAULT_TEXT_DELIMS: &str = "\t ,";

/// Loads a delimited text file of ion records. `map.selected` picks which
/// fields feed the four output columns; lines may carry extra fields, which
/// are ignored. Sampling works as in the POS loader: `limit` below the data
/// row count selects that many rows uniformly.
pub fn load_text(
    path: &Path,
    delims: &str,
    map: &ColumnMap,
    limit: Option<usize>,
    strong_random: bool,
    ctx: &mut RefreshContext<'_>,
) -> Result<Vec<IonHit>, LoadError> {
    let content = fs::read_to_string(path).map_err(LoadError::open)?;
    if content.is_empty() {
        return Err(LoadError::Empty);
    }

    let lines: Vec<&str> = content.lines().collect();
    let data_start = find_header_end(&lines, delims, map).ok_or(LoadError::OnlyHeader)?;

    // Indexable data rows: non-blank lines from the first data line on,
    // keeping 1-based line numbers for error reporting.
    let data_rows: Vec<(usize, &str)> = lines
        .iter()
        .enumerate()
        .skip(data_start)
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| (i + 1, *line))
        .collect();

    match limit {
        Some(limit) if limit < data_rows.len() => {
            let indices = select_indices(data_rows.len(), limit, strong_random);
            let mut ions = Vec::new();
            ions.try_reserve_exact(indices.len())
                .map_err(|_| LoadError::Alloc)?;
            let mut ticker = ProgressTicker::new(indices.len());
            for &index in &indices {
                let (line_no, line) = data_rows[index];
                ions.push(parse_row(line, line_no, delims, map)?);
                if !ticker.tick(ctx) {
                    return Err(LoadError::Aborted);
                }
            }
            Ok(ions)
        }
        _ => {
            let mut ions = Vec::new();
            ions.try_reserve_exact(data_rows.len())
                .map_err(|_| LoadError::Alloc)?;
            let mut ticker = ProgressTicker::new(data_rows.len());
            for &(line_no, line) in &data_rows {
                ions.push(parse_row(line, line_no, delims, map)?);
                if !ticker.tick(ctx) {
                    return Err(LoadError::Aborted);
                }
            }
            Ok(ions)
        }
    }
}

/// Index of the first data line: enough fields, at least one digit, and every
/// selected field parses as f32. The digit requirement keeps degenerate
/// tokens like "nan" from ending the header early.
fn find_header_end(lines: &[&str], delims: &str, map: &ColumnMap) -> Option<usize> {
    for (i, line) in lines.iter().enumerate() {
        if !line.bytes().any(|b| b.is_ascii_digit()) {
            continue;
        }
        let fields = split_fields(line, delims);
        if fields.len() <= map.max_selected() {
            continue;
        }
        let parses = map
            .selected
            .iter()
            .all(|&col| fields[col].parse::<f32>().is_ok());
        if parses {
            return Some(i);
        }
    }
    None
}

fn parse_row(
    line: &str,
    line_no: usize,
    delims: &str,
    map: &ColumnMap,
) -> Result<IonHit, LoadError> {
    let fields = split_fields(line, delims);
    if fields.len() <= map.max_selected() {
        return Err(LoadError::FieldCount { line: line_no });
    }
    let mut cols = [0.0f32; 4];
    for (out, &col) in cols.iter_mut().zip(&map.selected) {
        *out = fields[col]
            .parse()
            .map_err(|_| LoadError::BadField { line: line_no })?;
    }
    let ion = IonHit::from_columns(cols);
    if ion.has_nan() {
        return Err(LoadError::NanFound);
    }
    Ok(ion)
}

fn split_fields<'a>(line: &'a str, delims: &str) -> Vec<&'a str> {
    line.split(|c| delims.contains(c))
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .collect()
}
