//! Reader and writer for the Imago/Cameca `.rrng` dialect.
//!
//! An ini-style format with `[Ions]` and `[Ranges]` sections. The `[Ions]`
//! section does not declare the range-level ion table; it lists the
//! *reference atoms* from which each range's species is composed. Range lines
//! carry the actual species as `El:count` pairs and/or a `Name:` field, eg:
//!
//! ```text
//! Range1=31.8372 32.2963 Vol:0.01521 Zn:1 Color:999999
//! Range2=95.3100 95.5800 Vol:0.04542 Zn:1 Sb:1 Name:1Zn1Sb1 Color:00FFFF
//! ```

use std::fmt::Write;

use crate::range::RangeTable;
use crate::result::RangeError;
use crate::types::Colour;

#[derive(PartialEq)]
enum Block {
    None,
    Ions,
    Ranges,
}

pub(crate) fn parse(content: &str) -> Result<(RangeTable, Vec<String>), RangeError> {
    let mut block = Block::None;
    let mut seen_ion_block = false;
    let mut num_reference_atoms = 0usize;
    let mut declared_ranges = 0usize;
    let mut parsed_rows = 0usize;
    let mut reference_atoms: Vec<String> = Vec::new();
    let mut table = RangeTable::new();
    let mut warnings = Vec::new();

    for raw_line in content.lines() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if line == "[Ions]" {
            block = Block::Ions;
            continue;
        }
        if line == "[Ranges]" {
            block = Block::Ranges;
            continue;
        }

        match block {
            Block::None => {}
            Block::Ions => {
                let (key, value) = line.split_once('=').ok_or(RangeError::Format)?;
                seen_ion_block = true;
                if key.eq_ignore_ascii_case("number") {
                    // Set-once, and must be non-zero
                    if num_reference_atoms != 0 {
                        return Err(RangeError::Format);
                    }
                    num_reference_atoms = value.parse().map_err(|_| RangeError::Format)?;
                    if num_reference_atoms == 0 {
                        return Err(RangeError::Format);
                    }
                } else if key.len() > 3
                    && key.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("ion"))
                {
                    reference_atoms.push(value.to_string());
                    if reference_atoms.len() > num_reference_atoms {
                        return Err(RangeError::Format);
                    }
                } else {
                    return Err(RangeError::Format);
                }
            }
            Block::Ranges => {
                // The blocks look independent, but resolving element keys
                // requires the reference-atom list, so ranges must follow it.
                if !seen_ion_block {
                    return Err(RangeError::Format);
                }
                if line.len() <= 6 {
                    return Err(RangeError::Format);
                }
                let (key, value) = line.split_once('=').ok_or(RangeError::Format)?;
                if key.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("numbe")) {
                    if declared_ranges != 0 {
                        return Err(RangeError::Format);
                    }
                    declared_ranges = value.parse().map_err(|_| RangeError::Format)?;
                    if declared_ranges == 0 {
                        return Err(RangeError::Format);
                    }
                } else if key.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("range")) {
                    parsed_rows += 1;
                    parse_range_line(value, &reference_atoms, &mut table, &mut warnings)?;
                } else {
                    return Err(RangeError::Format);
                }
            }
        }
    }

    if !seen_ion_block || declared_ranges == 0 || num_reference_atoms == 0 {
        return Err(RangeError::Format);
    }
    if declared_ranges != parsed_rows {
        return Err(RangeError::Format);
    }

    Ok((table, warnings))
}

fn parse_range_line(
    value: &str,
    reference_atoms: &[String],
    table: &mut RangeTable,
    warnings: &mut Vec<String>,
) -> Result<(), RangeError> {
    let mut fields = value.split_whitespace();
    let low_str = fields.next().ok_or(RangeError::Format)?;
    let high_str = fields.next().ok_or(RangeError::Format)?;

    let mut colour: Option<Colour> = None;
    let mut name_field: Option<&str> = None;
    let mut composed_name = String::new();

    for field in fields {
        let (key, field_value) = field.split_once(':').ok_or(RangeError::Format)?;
        if key.eq_ignore_ascii_case("vol") {
            // Volume of the species; not carried by the table
        } else if key.eq_ignore_ascii_case("name") {
            name_field = Some(field_value);
        } else if key.eq_ignore_ascii_case("color") {
            if field_value.len() != 6 {
                return Err(RangeError::Format);
            }
            colour = Some(
                Colour::from_hex6(&field_value.to_ascii_lowercase()).ok_or(RangeError::Format)?,
            );
        } else {
            // An element key must have been declared in [Ions]
            if !reference_atoms.iter().any(|a| a == key) {
                return Err(RangeError::Format);
            }
            let count: usize = field_value.parse().map_err(|_| RangeError::Format)?;
            if count == 0 {
                return Err(RangeError::Format);
            }
            // Give multi-atom species a chemical-formula look
            if count == 1 {
                composed_name.push_str(key);
            } else {
                composed_name.push_str(key);
                composed_name.push_str(field_value);
            }
        }
    }

    // Files in the wild omit the colour; invent one rather than reject
    let colour = colour.unwrap_or_else(|| {
        Colour::rgb(
            rand::random::<f32>(),
            rand::random::<f32>(),
            rand::random::<f32>(),
        )
    });

    let ion_name = if !composed_name.is_empty() {
        composed_name
    } else if let Some(name_value) = name_field {
        if name_value.is_empty() {
            return Err(RangeError::Format);
        }
        // A Name field may lead with a decimal charge value; strip it
        let stripped_at = name_value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(0);
        name_value[stripped_at..].to_string()
    } else {
        // Some tools emit range lines that name no species at all; the
        // purpose of these lines is unclear, so skip them rather than abort.
        warnings.push(format!(
            "range line `{value}` names no species (no element fields, no Name field); ignored"
        ));
        return Ok(());
    };

    let low: f32 = low_str.parse().map_err(|_| RangeError::Format)?;
    let high: f32 = high_str.parse().map_err(|_| RangeError::Format)?;

    let ion_id = match table.ion_id_by_name(&ion_name) {
        Some(existing) => existing,
        None => {
            table.push_ion_unchecked(ion_name.clone(), ion_name, colour);
            table.num_ions() - 1
        }
    };
    table.push_range_unchecked(low, high, ion_id);
    Ok(())
}

pub(crate) fn render(table: &RangeTable) -> String {
    let mut out = String::new();
    out.push_str("[Ions]\n");
    let _ = writeln!(out, "Number={}", table.num_ions());
    for ion_id in 0..table.num_ions() {
        let _ = writeln!(out, "Ion{}={}", ion_id + 1, table.short_name(ion_id));
    }
    out.push_str("[Ranges] \n");
    let _ = writeln!(out, "Number={}", table.num_ranges());
    for range_id in 0..table.num_ranges() {
        let (low, high) = table.range(range_id);
        let ion_id = table.ion_of_range(range_id);
        let _ = writeln!(
            out,
            "Range{}={} {} {}:1 Color:{}",
            range_id + 1,
            low,
            high,
            table.short_name(ion_id),
            table.colour(ion_id).to_hex6().to_ascii_uppercase()
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::range::{RangeFile, RangeFormat};
    use crate::result::RangeError;

    fn parse(content: &str) -> Result<RangeFile, RangeError> {
        RangeFile::parse(content, RangeFormat::Rrng)
    }

    const BASIC_FILE: &str = "[Ions]\n\
        Number=2\n\
        Ion1=Zn\n\
        Ion2=Sb\n\
        [Ranges]\n\
        Number=3\n\
        Range1=31.8372 32.2963 Vol:0.01521 Zn:1 Color:999999\n\
        Range2=95.3100 95.5800 Vol:0.04542 Zn:1 Sb:1 Color:00FFFF\n\
        Range3=47.0 47.5 Name:2ZnSb Color:112233\n";

    #[test]
    fn parses_element_and_name_forms() {
        let parsed = parse(BASIC_FILE).expect("parse failed");
        let table = &parsed.table;
        assert_eq!(table.num_ranges(), 3);
        assert_eq!(table.short_name(table.ion_of_range(0)), "Zn");
        // Zn:1 Sb:1 composes to "ZnSb"
        assert_eq!(table.short_name(table.ion_of_range(1)), "ZnSb");
        // Name:2ZnSb strips the charge prefix and reuses the ZnSb ion
        assert_eq!(table.ion_of_range(2), table.ion_of_range(1));
        assert_eq!(table.num_ions(), 2);
    }

    #[test]
    fn multiplicity_keeps_formula_look() {
        let content = "[Ions]\nNumber=1\nIon1=Cu\n[Ranges]\nNumber=1\n\
            Range1=128.0 129.0 Cu:2 Color:ff0000\n";
        let parsed = parse(content).expect("parse failed");
        assert_eq!(parsed.table.short_name(0), "Cu2");
    }

    #[test]
    fn missing_colour_gets_fallback() {
        let content = "[Ions]\nNumber=1\nIon1=Fe\n[Ranges]\nNumber=1\n\
            Range1=27.0 28.0 Fe:1\n";
        let parsed = parse(content).expect("parse failed");
        assert!(parsed.table.colour(0).is_normalised());
    }

    #[test]
    fn undeclared_element_is_rejected() {
        let content = "[Ions]\nNumber=1\nIon1=Fe\n[Ranges]\nNumber=1\n\
            Range1=27.0 28.0 Cu:1 Color:ff0000\n";
        assert!(matches!(parse(content), Err(RangeError::Format)));
    }

    #[test]
    fn nameless_rows_are_skipped_with_warning() {
        let content = "[Ions]\nNumber=1\nIon1=Fe\n[Ranges]\nNumber=2\n\
            Range1=27.0 28.0 Fe:1 Color:ff0000\n\
            Range2=30.0 31.0 Vol:0.01 Color:00ff00\n";
        let parsed = parse(content).expect("parse failed");
        assert_eq!(parsed.table.num_ranges(), 1);
        assert_eq!(parsed.warnings.len(), 1);
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let content = BASIC_FILE.replace("Number=3", "Number=4");
        assert!(matches!(parse(&content), Err(RangeError::Format)));
    }

    #[test]
    fn ranges_before_ions_are_rejected() {
        let content = "[Ranges]\nNumber=1\nRange1=1.0 2.0 Fe:1 Color:ff0000\n";
        assert!(matches!(parse(content), Err(RangeError::Format)));
    }

    #[test]
    fn comments_are_stripped() {
        let content = BASIC_FILE.replace("Number=3", "Number=3 # three ranges");
        let parsed = parse(&content).expect("parse failed");
        assert_eq!(parsed.table.num_ranges(), 3);
    }

    #[test]
    fn render_round_trips() {
        let parsed = parse(BASIC_FILE).expect("parse failed");
        let rendered = RangeFile::render(&parsed.table, RangeFormat::Rrng);
        let reparsed = parse(&rendered).expect("re-parse failed");
        assert_eq!(reparsed.table.num_ranges(), parsed.table.num_ranges());
        for i in 0..parsed.table.num_ranges() {
            assert_eq!(reparsed.table.range(i), parsed.table.range(i));
            assert_eq!(
                reparsed.table.short_name(reparsed.table.ion_of_range(i)),
                parsed.table.short_name(parsed.table.ion_of_range(i))
            );
        }
    }
}
