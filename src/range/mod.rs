//! The in-memory range table, its self-consistency rules, and the readers and
//! writers for the three legacy range-file dialects.
//!
//! A *range* is a closed interval on the mass-to-charge axis assigned to
//! exactly one ion species. Range files pair an ion table (names + colours)
//! with a range table; see [`RangeFile::open`] for the supported dialects.

mod elements;
mod env;
mod formula;
mod ornl;
mod rrng;

pub use formula::decompose_ion_name;

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::result::RangeError;
use crate::types::{Colour, IonHit};

/// Which end of a range a [`RangeTable::move_range`] call adjusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeEnd {
    Lower,
    Upper,
}

/// The three supported range-file dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFormat {
    /// Oak Ridge `.rng`: count header, ion blocks, dashed separator, then a
    /// multiplicity table.
    Ornl,
    /// Imago/Cameca `.rrng`: ini-style `[Ions]` / `[Ranges]` sections.
    Rrng,
    /// Rouen `.env`: counts, name/colour block, then named range rows.
    Env,
}

impl RangeFormat {
    /// All formats, in the order the brute-force fallback tries them.
    pub const ALL: [RangeFormat; 3] = [RangeFormat::Ornl, RangeFormat::Rrng, RangeFormat::Env];

    /// Guesses a format from a file extension, defaulting to ORNL as the
    /// oldest and loosest dialect.
    pub fn from_extension(ext: &str) -> RangeFormat {
        match ext.to_ascii_lowercase().as_str() {
            "rrng" => RangeFormat::Rrng,
            "env" => RangeFormat::Env,
            _ => RangeFormat::Ornl,
        }
    }

    /// True if `ext` names any recognised range-file extension.
    pub fn extension_is_range(ext: &str) -> bool {
        matches!(ext.to_ascii_lowercase().as_str(), "rng" | "rrng" | "env")
    }
}

/// An ion table plus a range table, with the cross-references between them.
///
/// Invariants, checked by [`RangeTable::is_self_consistent`] and preserved by
/// every mutator:
/// - every range has strictly positive width;
/// - no two ranges overlap, nest, straddle or duplicate one another
///   (shared endpoints are legal);
/// - every range maps to an in-bounds ion id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeTable {
    /// (short, long) name per ion; the short name keys external references.
    ion_names: Vec<(String, String)>,
    /// One colour per ion.
    colours: Vec<Colour>,
    /// (low, high) mass-to-charge pairs.
    ranges: Vec<(f32, f32)>,
    /// Owning ion index per range.
    range_to_ion: Vec<usize>,
}

impl RangeTable {
    pub fn new() -> RangeTable {
        RangeTable::default()
    }

    pub fn num_ions(&self) -> usize {
        self.ion_names.len()
    }

    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn short_name(&self, ion_id: usize) -> &str {
        &self.ion_names[ion_id].0
    }

    pub fn long_name(&self, ion_id: usize) -> &str {
        &self.ion_names[ion_id].1
    }

    pub fn colour(&self, ion_id: usize) -> Colour {
        self.colours[ion_id]
    }

    pub fn range(&self, range_id: usize) -> (f32, f32) {
        self.ranges[range_id]
    }

    pub fn ion_of_range(&self, range_id: usize) -> usize {
        self.range_to_ion[range_id]
    }

    /// Number of ranges owned by a given ion.
    pub fn num_ranges_of_ion(&self, ion_id: usize) -> usize {
        self.range_to_ion.iter().filter(|&&i| i == ion_id).count()
    }

    /// Looks an ion up by its short name.
    pub fn ion_id_by_name(&self, short_name: &str) -> Option<usize> {
        self.ion_names.iter().position(|(s, _)| s == short_name)
    }

    /// The id of the range containing `mass`, if any. Range bounds are
    /// inclusive at both ends.
    pub fn range_id_of_mass(&self, mass: f32) -> Option<usize> {
        self.ranges
            .iter()
            .position(|&(lo, hi)| mass >= lo && mass <= hi)
    }

    /// The id of the ion whose range contains `mass`, if any.
    pub fn ion_id_of_mass(&self, mass: f32) -> Option<usize> {
        self.range_id_of_mass(mass).map(|r| self.range_to_ion[r])
    }

    pub fn is_ranged(&self, mass: f32) -> bool {
        self.range_id_of_mass(mass).is_some()
    }

    /// The 1-based atomic number of the ion, if its short or long name names
    /// a single element. Composed species return `None`.
    pub fn atomic_number_of_ion(&self, ion_id: usize) -> Option<usize> {
        let (short, long) = &self.ion_names[ion_id];
        elements::atomic_number(short).or_else(|| elements::atomic_number(long))
    }

    /// Verifies the table invariants. Parsers run this after any successful
    /// parse; mutators preserve it.
    pub fn is_self_consistent(&self) -> bool {
        if self.range_to_ion.len() != self.ranges.len()
            || self.colours.len() != self.ion_names.len()
        {
            return false;
        }
        if self.range_to_ion.iter().any(|&i| i >= self.ion_names.len()) {
            return false;
        }
        for (i, &(lo, hi)) in self.ranges.iter().enumerate() {
            if lo >= hi {
                return false;
            }
            for &other in &self.ranges[i + 1..] {
                if ranges_conflict((lo, hi), other) {
                    return false;
                }
            }
        }
        true
    }

    /// Appends a new ion. Fails if either name collides with an existing ion.
    pub fn add_ion(
        &mut self,
        short_name: &str,
        long_name: &str,
        colour: Colour,
    ) -> Result<usize, RangeError> {
        if self
            .ion_names
            .iter()
            .any(|(s, l)| s == short_name || l == long_name)
        {
            return Err(RangeError::Format);
        }
        self.ion_names
            .push((short_name.to_string(), long_name.to_string()));
        self.colours.push(Colour::default());
        let id = self.ion_names.len() - 1;
        self.colours[id] = colour;
        Ok(id)
    }

    /// Appends a new range owned by `ion_id`. Fails on inverted bounds, an
    /// out-of-bounds ion, or any conflict with an existing range.
    pub fn add_range(&mut self, low: f32, high: f32, ion_id: usize) -> Result<usize, RangeError> {
        if low >= high {
            return Err(RangeError::Flipped);
        }
        if ion_id >= self.ion_names.len() {
            return Err(RangeError::Format);
        }
        if self.ranges.iter().any(|&r| ranges_conflict((low, high), r)) {
            return Err(RangeError::Overlap);
        }
        self.ranges.push((low, high));
        self.range_to_ion.push(ion_id);
        debug_assert!(self.is_self_consistent());
        Ok(self.ranges.len() - 1)
    }

    /// Moves one end of a range to a new mass. Returns `false` (leaving the
    /// table untouched) if the move would invert the range or conflict with
    /// any other range.
    pub fn move_range(&mut self, range_id: usize, end: RangeEnd, new_mass: f32) -> bool {
        let (lo, hi) = self.ranges[range_id];
        let candidate = match end {
            RangeEnd::Upper => {
                if new_mass <= lo {
                    return false;
                }
                (lo, new_mass)
            }
            RangeEnd::Lower => {
                if new_mass >= hi {
                    return false;
                }
                (new_mass, hi)
            }
        };
        if self.candidate_conflicts(range_id, candidate) {
            return false;
        }
        self.ranges[range_id] = candidate;
        debug_assert!(self.is_self_consistent());
        true
    }

    /// Moves both ends of a range at once (a translation, when the width is
    /// preserved by the caller). Same refusal rules as [`Self::move_range`].
    pub fn move_both(&mut self, range_id: usize, new_low: f32, new_high: f32) -> bool {
        if new_low >= new_high {
            return false;
        }
        if self.candidate_conflicts(range_id, (new_low, new_high)) {
            return false;
        }
        self.ranges[range_id] = (new_low, new_high);
        debug_assert!(self.is_self_consistent());
        true
    }

    fn candidate_conflicts(&self, range_id: usize, candidate: (f32, f32)) -> bool {
        self.ranges
            .iter()
            .enumerate()
            .any(|(i, &r)| i != range_id && ranges_conflict(candidate, r))
    }

    pub fn set_colour(&mut self, ion_id: usize, colour: Colour) {
        self.colours[ion_id] = colour;
    }

    pub fn set_short_name(&mut self, ion_id: usize, name: &str) {
        self.ion_names[ion_id].0 = name.to_string();
    }

    pub fn set_long_name(&mut self, ion_id: usize, name: &str) {
        self.ion_names[ion_id].1 = name.to_string();
    }

    /// Reassigns a range to a different ion. Fails on an out-of-bounds ion.
    pub fn set_range_ion(&mut self, range_id: usize, ion_id: usize) -> bool {
        if ion_id >= self.ion_names.len() {
            return false;
        }
        self.range_to_ion[range_id] = ion_id;
        true
    }

    /// Discards every ion hit whose value falls outside all ranges.
    pub fn keep_ranged(&self, ions: &mut Vec<IonHit>) {
        ions.retain(|ion| self.is_ranged(ion.mass));
    }

    /// Discards every hit not classified as the named ion. Returns `false`
    /// when no ion has that short name.
    pub fn keep_ion(&self, ions: &mut Vec<IonHit>, short_name: &str) -> bool {
        let Some(target) = self.ion_id_by_name(short_name) else {
            return false;
        };
        ions.retain(|ion| self.ion_id_of_mass(ion.mass) == Some(target));
        true
    }

    /// Discards every hit outside one specific range.
    pub fn keep_range_id(&self, ions: &mut Vec<IonHit>, range_id: usize) {
        let (lo, hi) = self.ranges[range_id];
        ions.retain(|ion| ion.mass >= lo && ion.mass <= hi);
    }

    // Internal appenders used by the parsers, which establish the invariants
    // in bulk and verify them once at the end.
    pub(crate) fn push_ion_unchecked(&mut self, short: String, long: String, colour: Colour) {
        self.ion_names.push((short, long));
        self.colours.push(colour);
    }

    pub(crate) fn push_range_unchecked(&mut self, low: f32, high: f32, ion_id: usize) {
        self.ranges.push((low, high));
        self.range_to_ion.push(ion_id);
    }
}

/// True when two ranges overlap, nest, straddle or duplicate one another.
/// Ranges that merely share an endpoint do not conflict.
fn ranges_conflict(a: (f32, f32), b: (f32, f32)) -> bool {
    if a == b {
        return true;
    }
    a.0.max(b.0) < a.1.min(b.1)
}

/// A parsed range file: the table plus any non-fatal warnings the parser
/// accumulated, and the dialect it was read as.
#[derive(Debug, Clone)]
pub struct RangeFile {
    pub table: RangeTable,
    /// Non-fatal oddities found while parsing (eg, a column header that
    /// disagrees with the declared ion order).
    pub warnings: Vec<String>,
    format: RangeFormat,
}

impl RangeFile {
    /// Opens a range file. When `format` is `None` the dialect is guessed
    /// from the file extension; if the guessed parser rejects the file, the
    /// remaining parsers are tried in order, and the error from the guessed
    /// format is reported if all of them fail.
    pub fn open(path: &Path, format: Option<RangeFormat>) -> Result<RangeFile, RangeError> {
        match format {
            Some(format) => Self::open_as(path, format),
            None => Self::open_guess(path),
        }
    }

    fn open_as(path: &Path, format: RangeFormat) -> Result<RangeFile, RangeError> {
        let content = fs::read_to_string(path).map_err(RangeError::open)?;
        Self::parse(&content, format)
    }

    fn open_guess(path: &Path) -> Result<RangeFile, RangeError> {
        let assumed = path
            .extension()
            .and_then(|e| e.to_str())
            .map(RangeFormat::from_extension)
            .unwrap_or(RangeFormat::Ornl);

        let content = fs::read_to_string(path).map_err(RangeError::open)?;
        match Self::parse(&content, assumed) {
            Ok(parsed) => Ok(parsed),
            Err(first_err) => {
                for format in RangeFormat::ALL {
                    if format == assumed {
                        continue;
                    }
                    if let Ok(parsed) = Self::parse(&content, format) {
                        return Ok(parsed);
                    }
                }
                Err(first_err)
            }
        }
    }

    /// Parses in-memory content as the given dialect. Runs the
    /// self-consistency check on success.
    pub fn parse(content: &str, format: RangeFormat) -> Result<RangeFile, RangeError> {
        let (table, warnings) = match format {
            RangeFormat::Ornl => ornl::parse(content)?,
            RangeFormat::Rrng => rrng::parse(content)?,
            RangeFormat::Env => env::parse(content)?,
        };
        if !table.is_self_consistent() {
            return Err(RangeError::Inconsistent);
        }
        for warning in &warnings {
            log::warn!("range file: {warning}");
        }
        Ok(RangeFile {
            table,
            warnings,
            format,
        })
    }

    pub fn format(&self) -> RangeFormat {
        self.format
    }

    /// Writes the table to `path` in the canonical form of the requested
    /// dialect.
    pub fn write(&self, path: &Path, format: RangeFormat) -> Result<(), RangeError> {
        let mut file = fs::File::create(path).map_err(RangeError::open)?;
        let rendered = Self::render(&self.table, format);
        file.write_all(rendered.as_bytes())
            .map_err(RangeError::open)
    }

    /// Renders the table as the canonical text of the requested dialect.
    pub fn render(table: &RangeTable, format: RangeFormat) -> String {
        match format {
            RangeFormat::Ornl => ornl::render(table),
            RangeFormat::Rrng => rrng::render(table),
            RangeFormat::Env => env::render(table),
        }
    }
}
