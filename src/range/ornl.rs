//! Reader and writer for the Oak Ridge `.rng` dialect.
//!
//! There is no published standard for this format; the classic description is
//! by example in Miller, "Atom Probe: Analysis at the Atomic Scale", and real
//! files deviate from it freely. The reader is therefore as accommodating as
//! it reasonably can be: trailing junk after an ion's colour triple is
//! tolerated (with a warning), arbitrary lead-in characters before each range
//! row are skipped, and range rows whose multiplicity columns are all zero
//! are dropped after the sweep.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::range::formula::{match_composed_name, Fragment};
use crate::range::RangeTable;
use crate::result::RangeError;
use crate::types::Colour;

/// A cursor over file content with `fscanf`-flavoured helpers: tokens are
/// separated by any whitespace, and lines can be consumed independently.
struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Scanner<'a> {
        Scanner { text, pos: 0 }
    }

    fn peek_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn skip_while(&mut self, pred: impl Fn(char) -> bool) {
        while let Some(c) = self.peek_char() {
            if !pred(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    /// Skips whitespace (including newlines) and returns the next token.
    fn token(&mut self) -> Option<&'a str> {
        self.skip_while(|c| c.is_whitespace());
        let start = self.pos;
        self.skip_while(|c| !c.is_whitespace());
        (self.pos > start).then(|| &self.text[start..self.pos])
    }

    /// Consumes up to and including the next newline, returning the consumed
    /// text without its line terminator.
    fn rest_of_line(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == '\n' {
                break;
            }
        }
        self.text[start..self.pos].trim_end_matches(['\n', '\r'])
    }

    /// Advances to the next ASCII digit, returning `false` on end of input.
    fn skip_until_digit(&mut self) -> bool {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                return true;
            }
            self.pos += c.len_utf8();
        }
        false
    }

    fn uint(&mut self) -> Option<usize> {
        self.token()?.parse().ok()
    }

    fn float(&mut self) -> Option<f32> {
        self.token()?.parse().ok()
    }
}

pub(crate) fn parse(content: &str) -> Result<(RangeTable, Vec<String>), RangeError> {
    let mut scanner = Scanner::new(content);
    let mut warnings = Vec::new();

    let num_ions = scanner.uint().ok_or(RangeError::Header)?;
    let num_ranges = scanner.uint().ok_or(RangeError::Header)?;
    if num_ions == 0 || num_ranges == 0 {
        return Err(RangeError::Empty);
    }

    let mut table = RangeTable::new();

    for i in 0..num_ions {
        // Certain programs append a string of unknown purpose after the
        // colour triple; gobble to end of line before the next ion block.
        if scanner.peek_char() == Some(' ') {
            let junk = scanner.rest_of_line();
            if !junk.trim().is_empty() {
                warnings.push(format!(
                    "ignored trailing content before ion block {i}: `{}`",
                    junk.trim()
                ));
            }
        }
        let long_name = scanner.token().ok_or(RangeError::LongName)?.to_string();
        let short_name = scanner.token().ok_or(RangeError::ShortName)?.to_string();
        let r = scanner.float().ok_or(RangeError::Colour)?;
        let g = scanner.float().ok_or(RangeError::Colour)?;
        let b = scanner.float().ok_or(RangeError::Colour)?;
        table.push_ion_unchecked(short_name, long_name, Colour::rgb(r, g, b));
    }

    // Remainder of the final colour line, then the dashed separator line.
    let tail = scanner.rest_of_line();
    if !tail.trim().is_empty() {
        warnings.push(format!(
            "ignored trailing content after colour for ion {num_ions}: `{}`",
            tail.trim()
        ));
    }
    let separator = scanner.rest_of_line();
    if !separator.starts_with('-') {
        return Err(RangeError::TableSeparator);
    }

    // The separator may carry column headers; they are declared as comments
    // by the format description, so a disagreement with the ion declarations
    // is only worth a warning.
    let headers: Vec<&str> = separator.split_whitespace().collect();
    if headers.len() > 1 {
        if headers.len() - 1 != num_ions {
            return Err(RangeError::TableSeparator);
        }
        for (ion_id, header) in headers[1..].iter().enumerate() {
            if table.short_name(ion_id) != *header {
                warnings.push(
                    "range table headings do not match the order of the declared ions; \
                     the declaration order will be used"
                        .to_string(),
                );
                break;
            }
        }
    }

    // Sweep the range rows, keeping the whole multiplicity table for the
    // composite-ion pass below.
    let mut mass_pairs = Vec::with_capacity(num_ranges);
    let mut multiplicities = vec![0usize; num_ranges * num_ions];
    for row in 0..num_ranges {
        if !scanner.skip_until_digit() {
            return Err(RangeError::RangeLeadIn);
        }
        let low = scanner.float().ok_or(RangeError::MassPair)?;
        let high = scanner.float().ok_or(RangeError::MassPair)?;
        if low >= high {
            return Err(RangeError::Flipped);
        }
        mass_pairs.push((low, high));
        for col in 0..num_ions {
            multiplicities[row * num_ions + col] =
                scanner.uint().ok_or(RangeError::TableEntry)?;
        }
    }

    if multiplicities.iter().sum::<usize>() == 0 {
        return Err(RangeError::TooManyUselessRanges);
    }

    // Ions whose multiplicity column is all zero are never referenced
    // directly; they are candidate "composed" species that composite rows
    // (multiplicity sum > 1) resolve against by formula matching.
    let mut composed: Vec<(String, usize)> = Vec::new();
    for col in 0..num_ions {
        let all_zero = (0..num_ranges).all(|row| multiplicities[row * num_ions + col] == 0);
        if all_zero {
            composed.push((table.short_name(col).to_string(), col));
        }
    }

    const UNMAPPED: usize = usize::MAX;
    let mut row_ions = Vec::with_capacity(num_ranges);
    for row in 0..num_ranges {
        let mut entries: BTreeMap<usize, usize> = BTreeMap::new();
        for col in 0..num_ions {
            let m = multiplicities[row * num_ions + col];
            if m > 0 {
                entries.insert(col, m);
            }
        }
        let total: usize = entries.values().sum();
        match total {
            0 => row_ions.push(UNMAPPED),
            1 => row_ions.push(*entries.keys().next().expect("total is 1")),
            _ => {
                let wanted: Vec<Fragment> = entries
                    .iter()
                    .map(|(&col, &count)| (table.short_name(col).to_string(), count))
                    .collect();
                let ion_id = match_composed_name(&composed, &wanted)
                    .ok_or(RangeError::NoMappedIonName)?;
                row_ions.push(ion_id);
            }
        }
    }

    for (row, &ion_id) in row_ions.iter().enumerate() {
        if ion_id != UNMAPPED {
            let (low, high) = mass_pairs[row];
            table.push_range_unchecked(low, high, ion_id);
        }
    }

    Ok((table, warnings))
}

pub(crate) fn render(table: &RangeTable) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {}", table.num_ions(), table.num_ranges());
    for ion_id in 0..table.num_ions() {
        let colour = table.colour(ion_id);
        let _ = writeln!(out, "{}", table.long_name(ion_id));
        let _ = writeln!(
            out,
            "{} {} {} {}",
            table.short_name(ion_id),
            colour.r,
            colour.g,
            colour.b
        );
    }
    out.push_str("-------------");
    for ion_id in 0..table.num_ions() {
        let _ = write!(out, " {}", table.short_name(ion_id));
    }
    out.push('\n');
    for range_id in 0..table.num_ranges() {
        let (low, high) = table.range(range_id);
        let _ = write!(out, ". {low} {high}");
        for ion_id in 0..table.num_ions() {
            let flag = usize::from(ion_id == table.ion_of_range(range_id));
            let _ = write!(out, " {flag}");
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::range::{RangeFile, RangeFormat};
    use crate::result::RangeError;

    fn parse(content: &str) -> Result<RangeFile, RangeError> {
        RangeFile::parse(content, RangeFormat::Ornl)
    }

    const TWO_ION_FILE: &str = "2 1\n\
        Carbon\n\
        C 1.0 0.0 0.0\n\
        Hydrogen\n\
        H 0.0 1.0 0.0\n\
        -------------- C H\n\
        . 12.0 12.1 1 0\n";

    #[test]
    fn parses_simple_file() {
        let parsed = parse(TWO_ION_FILE).expect("parse failed");
        let table = &parsed.table;
        assert_eq!(table.num_ions(), 2);
        assert_eq!(table.num_ranges(), 1);
        assert_eq!(table.range(0), (12.0, 12.1));
        assert_eq!(table.short_name(table.ion_of_range(0)), "C");
        assert_eq!(table.colour(0), crate::types::Colour::rgb(1.0, 0.0, 0.0));
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn warns_on_header_order_mismatch() {
        let content = TWO_ION_FILE.replace("-------------- C H", "-------------- H C");
        let parsed = parse(&content).expect("parse failed");
        assert_eq!(parsed.warnings.len(), 1);
        // The declaration order wins regardless
        assert_eq!(parsed.table.short_name(parsed.table.ion_of_range(0)), "C");
    }

    #[test]
    fn warns_on_trailing_junk_after_colour() {
        let content = TWO_ION_FILE.replace("C 1.0 0.0 0.0", "C 1.0 0.0 0.0 (Carbon12)");
        let parsed = parse(&content).expect("parse failed");
        assert_eq!(parsed.warnings.len(), 1);
        assert_eq!(parsed.table.num_ions(), 2);
    }

    #[test]
    fn wrong_header_count_is_separator_error() {
        let content = TWO_ION_FILE.replace("-------------- C H", "-------------- C H He");
        assert!(matches!(parse(&content), Err(RangeError::TableSeparator)));
    }

    const FOUR_ION_HEADER: &str = "Copper\nCu 1.0 0.0 0.0\n\
        Nickel\nNi 0.0 1.0 0.0\n\
        CopperNickel\nCu2Ni1 0.0 0.0 1.0\n\
        Zinc\nZn 1.0 1.0 0.0\n\
        -------------- Cu Ni Cu2Ni1 Zn\n";

    #[test]
    fn single_entry_row_maps_directly() {
        // A row whose sole multiplicity sits in the composed ion's column
        let content = format!(
            "4 2\n{FOUR_ION_HEADER}\
            . 95.3 95.6 0 0 1 0\n\
            . 63.0 63.5 1 0 0 0\n"
        );
        let parsed = parse(&content).expect("parse failed");
        let table = &parsed.table;
        assert_eq!(table.num_ranges(), 2);
        assert_eq!(table.short_name(table.ion_of_range(0)), "Cu2Ni1");
        assert_eq!(table.short_name(table.ion_of_range(1)), "Cu");
    }

    #[test]
    fn composite_row_matches_zero_column_ion_by_bijection() {
        // Multiplicity vector {Cu:2, Ni:1}; the Cu2Ni1 column is all-zero,
        // making it the composed-name candidate the row resolves to
        let content = format!(
            "4 2\n{FOUR_ION_HEADER}\
            . 1 2 2 1 0 0\n\
            . 63.0 63.5 1 0 0 0\n"
        );
        let parsed = parse(&content).expect("parse failed");
        let table = &parsed.table;
        assert_eq!(table.short_name(table.ion_of_range(0)), "Cu2Ni1");
        assert_eq!(table.short_name(table.ion_of_range(1)), "Cu");
    }

    #[test]
    fn unmatched_composite_is_rejected() {
        // {Cu:1, Ni:1} decomposes to neither Cu2Ni1 nor Zn
        let content = format!(
            "4 2\n{FOUR_ION_HEADER}\
            . 1 2 1 1 0 0\n\
            . 63.0 63.5 1 0 0 0\n"
        );
        assert!(matches!(parse(&content), Err(RangeError::NoMappedIonName)));
    }

    #[test]
    fn zero_multiplicity_rows_are_pruned() {
        let content = "1 2\n\
            Iron\nFe 0.5 0.5 0.5\n\
            -------------\n\
            . 27.0 28.1 1\n\
            . 56.0 57.0 0\n";
        let parsed = parse(content).expect("parse failed");
        assert_eq!(parsed.table.num_ranges(), 1);
        assert_eq!(parsed.table.range(0), (27.0, 28.1));
    }

    #[test]
    fn all_zero_table_is_rejected() {
        let content = "1 1\n\
            Iron\nFe 0.5 0.5 0.5\n\
            -------------\n\
            . 27.0 28.1 0\n";
        assert!(matches!(
            parse(content),
            Err(RangeError::TooManyUselessRanges)
        ));
    }

    #[test]
    fn flipped_range_is_rejected() {
        let content = TWO_ION_FILE.replace(". 12.0 12.1 1 0", ". 12.1 12.0 1 0");
        assert!(matches!(parse(&content), Err(RangeError::Flipped)));
    }

    #[test]
    fn missing_separator_is_rejected() {
        let content = TWO_ION_FILE.replace("-------------- C H\n", "C H\n");
        assert!(matches!(parse(&content), Err(RangeError::TableSeparator)));
    }

    #[test]
    fn empty_counts_are_rejected() {
        assert!(matches!(parse("0 0\n"), Err(RangeError::Empty)));
        assert!(matches!(parse("bad\n"), Err(RangeError::Header)));
    }

    #[test]
    fn render_round_trips() {
        let content = format!(
            "4 2\n{FOUR_ION_HEADER}\
            . 95.3 95.6 0 0 1 0\n\
            . 63.0 63.5 1 0 0 0\n"
        );
        let parsed = parse(&content).expect("parse failed");
        let rendered = RangeFile::render(&parsed.table, RangeFormat::Ornl);
        let reparsed = parse(&rendered).expect("re-parse failed");
        assert_eq!(reparsed.table, parsed.table);
    }
}
