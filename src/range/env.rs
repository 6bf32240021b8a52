//! Reader and writer for the Rouen-group `.env` dialect.
//!
//! No public specification exists; this is a best-effort reader built from
//! example files. `#` starts a comment, the first payload line carries the
//! ion and range counts, a block of `name r g b` rows follows, and range rows
//! are `name low high` plus legacy trailing values.

use std::fmt::Write;

use crate::range::RangeTable;
use crate::result::RangeError;
use crate::types::Colour;

pub(crate) fn parse(content: &str) -> Result<(RangeTable, Vec<String>), RangeError> {
    let mut table = RangeTable::new();
    let warnings = Vec::new();

    let mut declared_ranges: Option<usize> = None;
    let mut in_name_block = true;
    let mut beyond_ranges = false;

    for raw_line in content.lines() {
        if beyond_ranges {
            break;
        }
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();

        let Some(expected_ranges) = declared_ranges else {
            // Counts line: number of ions, then number of ranges
            if tokens.len() != 2 {
                return Err(RangeError::Format);
            }
            let _num_ions: usize = tokens[0].parse().map_err(|_| RangeError::Format)?;
            let num_ranges: usize = tokens[1].parse().map_err(|_| RangeError::Format)?;
            declared_ranges = Some(num_ranges);
            continue;
        };

        if in_name_block {
            match tokens.len() {
                5 => in_name_block = false, // first range row; handled below
                4 => {
                    let name = tokens[0];
                    if !name
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '.')
                    {
                        return Err(RangeError::Format);
                    }
                    let mut channels = [0.0f32; 3];
                    for (channel, token) in channels.iter_mut().zip(&tokens[1..]) {
                        *channel = token.parse().map_err(|_| RangeError::Format)?;
                        if !(0.0..=1.0).contains(channel) {
                            return Err(RangeError::Format);
                        }
                    }
                    // Only one name per ion; use it for both short and long
                    table.push_ion_unchecked(
                        name.to_string(),
                        name.to_string(),
                        Colour::rgb(channels[0], channels[1], channels[2]),
                    );
                    continue;
                }
                _ => return Err(RangeError::Format),
            }
        }

        // Range block: `name low high <trailing legacy values>`
        if tokens.len() == 5 {
            let ion_id = table
                .ion_id_by_name(tokens[0])
                .ok_or(RangeError::Format)?;
            let low: f32 = tokens[1].parse().map_err(|_| RangeError::Format)?;
            let high: f32 = tokens[2].parse().map_err(|_| RangeError::Format)?;
            table.push_range_unchecked(low, high, ion_id);
        } else {
            beyond_ranges = true;
        }

        if table.num_ranges() > expected_ranges {
            return Err(RangeError::Format);
        }
    }

    // Hitting end of input while still inside the range block means either a
    // truncated file or not an env file at all.
    let declared = declared_ranges.ok_or(RangeError::Empty)?;
    if !beyond_ranges && table.num_ranges() < declared {
        return Err(RangeError::Format);
    }
    if table.num_ranges() == 0 {
        return Err(RangeError::Empty);
    }

    Ok((table, warnings))
}

pub(crate) fn render(table: &RangeTable) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "#aptflow {}", env!("CARGO_PKG_VERSION"));
    let _ = writeln!(out, "{} {}", table.num_ions(), table.num_ranges());
    for ion_id in 0..table.num_ions() {
        let colour = table.colour(ion_id);
        let _ = writeln!(
            out,
            "{} {} {} {}",
            table.short_name(ion_id),
            colour.r,
            colour.g,
            colour.b
        );
    }
    for range_id in 0..table.num_ranges() {
        let (low, high) = table.range(range_id);
        let _ = writeln!(
            out,
            "{} {} {}    1.0 1.0",
            table.short_name(table.ion_of_range(range_id)),
            low,
            high
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::range::{RangeFile, RangeFormat};
    use crate::result::RangeError;

    fn parse(content: &str) -> Result<RangeFile, RangeError> {
        RangeFile::parse(content, RangeFormat::Env)
    }

    const BASIC_FILE: &str = "# example environment file\n\
        2 2\n\
        Fe 0.5 0.2 0.1\n\
        Cr 0.1 0.8 0.3\n\
        Fe 26.9 28.1 1.0 1.0\n\
        Cr 25.8 26.2 1.0 1.0\n";

    #[test]
    fn parses_basic_file() {
        let parsed = parse(BASIC_FILE).expect("parse failed");
        let table = &parsed.table;
        assert_eq!(table.num_ions(), 2);
        assert_eq!(table.num_ranges(), 2);
        assert_eq!(table.range(0), (26.9, 28.1));
        assert_eq!(table.short_name(table.ion_of_range(1)), "Cr");
        assert_eq!(table.colour(0), crate::types::Colour::rgb(0.5, 0.2, 0.1));
    }

    #[test]
    fn out_of_gamut_colour_is_rejected() {
        let content = BASIC_FILE.replace("Fe 0.5 0.2 0.1", "Fe 1.5 0.2 0.1");
        assert!(matches!(parse(&content), Err(RangeError::Format)));
    }

    #[test]
    fn bad_ion_name_charset_is_rejected() {
        let content = BASIC_FILE.replace("Fe 0.5 0.2 0.1", "Fe! 0.5 0.2 0.1");
        assert!(matches!(parse(&content), Err(RangeError::Format)));
    }

    #[test]
    fn undeclared_range_ion_is_rejected() {
        let content = BASIC_FILE.replace("Cr 25.8 26.2", "Ni 25.8 26.2");
        assert!(matches!(parse(&content), Err(RangeError::Format)));
    }

    #[test]
    fn truncated_range_block_is_rejected() {
        // Declares two ranges but ends after one
        let content = "2 2\n\
            Fe 0.5 0.2 0.1\n\
            Cr 0.1 0.8 0.3\n\
            Fe 26.9 28.1 1.0 1.0\n";
        assert!(matches!(parse(content), Err(RangeError::Format)));
    }

    #[test]
    fn trailing_data_ends_range_block() {
        let content = format!("{BASIC_FILE}some trailing section\n");
        let parsed = parse(&content).expect("parse failed");
        assert_eq!(parsed.table.num_ranges(), 2);
    }

    #[test]
    fn render_round_trips() {
        let parsed = parse(BASIC_FILE).expect("parse failed");
        let rendered = RangeFile::render(&parsed.table, RangeFormat::Env);
        let reparsed = parse(&rendered).expect("re-parse failed");
        assert_eq!(reparsed.table, parsed.table);
    }
}
