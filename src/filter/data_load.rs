//! The data-load filter: synthesises an ion stream from a POS or text file.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::constants::MAX_IONS_LOAD_DEFAULT;
use crate::filter::properties::{PropertyOutcome, PropertySet, PropertyValue};
use crate::filter::{Filter, FilterKind, FilterOps, OutputCache};
use crate::io::{load_pos, load_text, ColumnMap, DEFAULT_TEXT_DELIMS};
use crate::progress::RefreshContext;
use crate::result::{FilterError, StateError};
use crate::state::{state_bool, StateContext};
use crate::stream::{FilterId, FilterStream, IonStream, StreamList, StreamMask, StreamPayload};
use crate::types::Colour;

pub const KEY_FILE: u32 = 1;
pub const KEY_FILE_TYPE: u32 = 2;
pub const KEY_MAX_IONS: u32 = 3;
pub const KEY_COLOUR: u32 = 4;
pub const KEY_ION_SIZE: u32 = 5;
pub const KEY_ENABLED: u32 = 6;
pub const KEY_VALUE_LABEL: u32 = 7;
pub const KEY_COLUMNS: u32 = 8;
pub const KEY_SELECTED_COLUMN0: u32 = 9;
pub const KEY_SELECTED_COLUMN1: u32 = 10;
pub const KEY_SELECTED_COLUMN2: u32 = 11;
pub const KEY_SELECTED_COLUMN3: u32 = 12;

/// Which on-disk representation the file uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IonFileType {
    Pos,
    Text,
}

impl IonFileType {
    fn label(&self) -> &'static str {
        match self {
            IonFileType::Pos => "POS Data",
            IonFileType::Text => "Text Data",
        }
    }

    /// Guesses from a file extension; binary POS is the default.
    pub fn from_path(path: &Path) -> IonFileType {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("txt") || ext.eq_ignore_ascii_case("csv") => {
                IonFileType::Text
            }
            _ => IonFileType::Pos,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataLoadFilter {
    label: String,
    cache: OutputCache,
    file_path: String,
    file_type: IonFileType,
    columns: ColumnMap,
    /// Sampling cap; 0 loads everything.
    max_ions: usize,
    enabled: bool,
    colour: Colour,
    ion_size: f32,
    value_label: String,
    strong_random: bool,
}

impl DataLoadFilter {
    pub fn new() -> DataLoadFilter {
        DataLoadFilter {
            label: "Pos Data".to_string(),
            cache: OutputCache::new(),
            file_path: String::new(),
            file_type: IonFileType::Pos,
            columns: ColumnMap::identity(),
            max_ions: MAX_IONS_LOAD_DEFAULT,
            enabled: true,
            colour: Colour::rgb(1.0, 0.0, 0.0),
            ion_size: 2.0,
            value_label: "Mass-to-Charge (amu/e)".to_string(),
            strong_random: false,
        }
    }

    pub fn for_file(path: &Path) -> DataLoadFilter {
        let mut filter = DataLoadFilter::new();
        filter.file_path = path.to_string_lossy().into_owned();
        filter.file_type = IonFileType::from_path(path);
        filter
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub(crate) fn set_strong_random(&mut self, strong: bool) {
        self.strong_random = strong;
    }

    fn limit(&self) -> Option<usize> {
        (self.max_ions > 0).then_some(self.max_ions)
    }
}

impl Default for DataLoadFilter {
    fn default() -> DataLoadFilter {
        DataLoadFilter::new()
    }
}

impl FilterOps for DataLoadFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::DataLoad
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn set_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    fn cache(&self) -> &OutputCache {
        &self.cache
    }

    fn cache_mut(&mut self) -> &mut OutputCache {
        &mut self.cache
    }

    fn clone_uncached(&self) -> Filter {
        let mut copy = self.clone();
        copy.cache = OutputCache::new();
        copy.cache.set_enabled(self.cache.enabled());
        Filter::DataLoad(copy)
    }

    fn cache_bytes(&self, _n_objects: usize) -> Option<usize> {
        // Inputs are irrelevant for a source node; project from the file
        let file_bytes = fs::metadata(&self.file_path).ok()?.len() as usize;
        let full = file_bytes / self.columns.input_cols.max(1) * 4;
        Some(match self.limit() {
            Some(limit) => full.min(limit * std::mem::size_of::<crate::types::IonHit>()),
            None => full,
        })
    }

    fn refresh(
        &mut self,
        _inputs: &[FilterStream],
        self_id: FilterId,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<StreamList, FilterError> {
        let mut outputs = StreamList::new();
        if !self.enabled || self.file_path.is_empty() {
            self.cache.finish(&mut outputs);
            return Ok(outputs);
        }
        if ctx.cancelled() {
            return Err(FilterError::Aborted);
        }

        ctx.begin_step(1, 1, "Load");
        let path = PathBuf::from(&self.file_path);
        let data = match self.file_type {
            IonFileType::Pos => {
                load_pos(&path, &self.columns, self.limit(), self.strong_random, ctx)?
            }
            IonFileType::Text => load_text(
                &path,
                DEFAULT_TEXT_DELIMS,
                &self.columns,
                self.limit(),
                self.strong_random,
                ctx,
            )?,
        };

        let mut stream = IonStream::new(data);
        stream.colour = self.colour;
        stream.ion_size = self.ion_size;
        stream.value_label = self.value_label.clone();
        outputs.push(FilterStream::transient(
            StreamPayload::Ions(Arc::new(stream)),
            self_id,
        ));
        self.cache.finish(&mut outputs);
        Ok(outputs)
    }

    fn properties(&self) -> Vec<PropertySet> {
        let mut data = PropertySet::new("Data");
        data.push(KEY_FILE, "File", PropertyValue::String(self.file_path.clone()));
        data.push(
            KEY_FILE_TYPE,
            "File type",
            PropertyValue::Choice {
                selected: match self.file_type {
                    IonFileType::Pos => 0,
                    IonFileType::Text => 1,
                },
                options: vec![
                    IonFileType::Pos.label().to_string(),
                    IonFileType::Text.label().to_string(),
                ],
            },
        );
        data.push(
            KEY_COLUMNS,
            "Input columns",
            PropertyValue::Integer(self.columns.input_cols as i64),
        );
        for (i, key) in [
            KEY_SELECTED_COLUMN0,
            KEY_SELECTED_COLUMN1,
            KEY_SELECTED_COLUMN2,
            KEY_SELECTED_COLUMN3,
        ]
        .iter()
        .enumerate()
        {
            let name = ["X column", "Y column", "Z column", "Value column"][i];
            data.push(
                *key,
                name,
                PropertyValue::Integer(self.columns.selected[i] as i64),
            );
        }
        data.push(
            KEY_MAX_IONS,
            "Max ions",
            PropertyValue::Integer(self.max_ions as i64),
        );
        data.push(KEY_ENABLED, "Enabled", PropertyValue::Bool(self.enabled));

        let mut appearance = PropertySet::new("Appearance");
        appearance.push(KEY_COLOUR, "Colour", PropertyValue::Colour(self.colour));
        appearance.push(
            KEY_ION_SIZE,
            "Draw size",
            PropertyValue::Real(self.ion_size as f64),
        );
        appearance.push(
            KEY_VALUE_LABEL,
            "Value label",
            PropertyValue::String(self.value_label.clone()),
        );
        vec![data, appearance]
    }

    fn set_property(&mut self, key: u32, value: &PropertyValue) -> PropertyOutcome {
        match key {
            KEY_FILE => {
                let Some(path) = value.as_str() else {
                    return PropertyOutcome::rejected();
                };
                if path == self.file_path {
                    return PropertyOutcome::unchanged();
                }
                self.file_path = path.to_string();
                self.file_type = IonFileType::from_path(Path::new(path));
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_FILE_TYPE => {
                let Some(selected) = value.as_choice() else {
                    return PropertyOutcome::rejected();
                };
                let new_type = match selected {
                    0 => IonFileType::Pos,
                    1 => IonFileType::Text,
                    _ => return PropertyOutcome::rejected(),
                };
                if new_type == self.file_type {
                    return PropertyOutcome::unchanged();
                }
                self.file_type = new_type;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_COLUMNS => {
                let Some(cols) = value.as_integer() else {
                    return PropertyOutcome::rejected();
                };
                if cols < 1 || self.columns.selected.iter().any(|&s| s as i64 >= cols) {
                    return PropertyOutcome::rejected();
                }
                if cols as usize == self.columns.input_cols {
                    return PropertyOutcome::unchanged();
                }
                self.columns.input_cols = cols as usize;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_SELECTED_COLUMN0 | KEY_SELECTED_COLUMN1 | KEY_SELECTED_COLUMN2
            | KEY_SELECTED_COLUMN3 => {
                let Some(col) = value.as_integer() else {
                    return PropertyOutcome::rejected();
                };
                if col < 0 || col as usize >= self.columns.input_cols {
                    return PropertyOutcome::rejected();
                }
                let slot = (key - KEY_SELECTED_COLUMN0) as usize;
                if self.columns.selected[slot] == col as usize {
                    return PropertyOutcome::unchanged();
                }
                self.columns.selected[slot] = col as usize;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_MAX_IONS => {
                let Some(max) = value.as_integer() else {
                    return PropertyOutcome::rejected();
                };
                if max < 0 {
                    return PropertyOutcome::rejected();
                }
                if max as usize == self.max_ions {
                    return PropertyOutcome::unchanged();
                }
                self.max_ions = max as usize;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_ENABLED => {
                let Some(enabled) = value.as_bool() else {
                    return PropertyOutcome::rejected();
                };
                if enabled == self.enabled {
                    return PropertyOutcome::unchanged();
                }
                self.enabled = enabled;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_COLOUR => {
                let Some(colour) = value.as_colour() else {
                    return PropertyOutcome::rejected();
                };
                if colour == self.colour {
                    return PropertyOutcome::unchanged();
                }
                self.colour = colour;
                // Presentation only: patch the cached stream rather than
                // recomputing it
                self.cache.mutate_ions(|ions| ions.colour = colour);
                PropertyOutcome::refresh()
            }
            KEY_ION_SIZE => {
                let Some(size) = value.as_real() else {
                    return PropertyOutcome::rejected();
                };
                if size < 0.0 {
                    return PropertyOutcome::rejected();
                }
                if size as f32 == self.ion_size {
                    return PropertyOutcome::unchanged();
                }
                self.ion_size = size as f32;
                let ion_size = self.ion_size;
                self.cache.mutate_ions(move |ions| ions.ion_size = ion_size);
                PropertyOutcome::refresh()
            }
            KEY_VALUE_LABEL => {
                let Some(label) = value.as_str() else {
                    return PropertyOutcome::rejected();
                };
                if label == self.value_label {
                    return PropertyOutcome::unchanged();
                }
                self.value_label = label.to_string();
                let value_label = self.value_label.clone();
                self.cache
                    .mutate_ions(move |ions| ions.value_label = value_label.clone());
                PropertyOutcome::refresh()
            }
            _ => PropertyOutcome::rejected(),
        }
    }

    fn use_mask(&self) -> StreamMask {
        StreamMask::empty()
    }

    fn block_mask(&self) -> StreamMask {
        StreamMask::empty()
    }

    fn emit_mask(&self) -> StreamMask {
        StreamMask::IONS
    }

    fn state_tags(&self) -> Vec<(&'static str, String)> {
        let mut selected = String::new();
        for (i, col) in self.columns.selected.iter().enumerate() {
            if i > 0 {
                selected.push(',');
            }
            let _ = write!(selected, "{col}");
        }
        vec![
            ("file", crate::state::encode_path(&self.file_path)),
            (
                "filetype",
                match self.file_type {
                    IonFileType::Pos => "pos".to_string(),
                    IonFileType::Text => "text".to_string(),
                },
            ),
            ("columns", self.columns.input_cols.to_string()),
            ("selected", selected),
            ("maxions", self.max_ions.to_string()),
            ("enabled", (self.enabled as u8).to_string()),
            ("colour", self.colour.to_hex8()),
            ("ionsize", self.ion_size.to_string()),
            ("valuelabel", self.value_label.clone()),
        ]
    }

    fn restore_tag(
        &mut self,
        tag: &str,
        value: &str,
        state: &StateContext,
    ) -> Result<(), StateError> {
        match tag {
            "file" => self.file_path = state.decode_path(value),
            "filetype" => {
                self.file_type = match value {
                    "pos" => IonFileType::Pos,
                    "text" => IonFileType::Text,
                    _ => return crate::result::state_error(format!("bad file type `{value}`")),
                }
            }
            "columns" => {
                self.columns.input_cols = value
                    .parse()
                    .map_err(|_| StateError::Malformed {
                        description: format!("bad column count `{value}`"),
                    })?;
            }
            "selected" => {
                let mut parts = value.split(',');
                for slot in self.columns.selected.iter_mut() {
                    let part = parts.next().ok_or_else(|| StateError::Malformed {
                        description: "expected 4 selected columns".to_string(),
                    })?;
                    *slot = part.parse().map_err(|_| StateError::Malformed {
                        description: format!("bad selected column `{part}`"),
                    })?;
                }
            }
            "maxions" => {
                self.max_ions = value.parse().map_err(|_| StateError::Malformed {
                    description: format!("bad max ion count `{value}`"),
                })?;
            }
            "enabled" => self.enabled = state_bool(value)?,
            "colour" => {
                self.colour = Colour::from_hex8(value).ok_or_else(|| StateError::Malformed {
                    description: format!("bad colour `{value}`"),
                })?;
            }
            "ionsize" => {
                self.ion_size = value.parse().map_err(|_| StateError::Malformed {
                    description: format!("bad ion size `{value}`"),
                })?;
            }
            "valuelabel" => self.value_label = value.to_string(),
            _ => {
                return crate::result::state_error(format!("unknown dataload tag `{tag}`"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;
    use crate::io::write_pos;
    use crate::progress::run_unwatched;
    use crate::types::{IonHit, Point3};

    fn pos_file(n: usize) -> NamedTempFile {
        let ions: Vec<IonHit> = (0..n)
            .map(|i| IonHit::new(Point3::new(i as f32, 0.0, 0.0), i as f32))
            .collect();
        let file = NamedTempFile::new().unwrap();
        write_pos(file.path(), &ions).unwrap();
        file
    }

    #[test]
    fn loads_and_labels_stream() {
        let file = pos_file(32);
        let mut filter = DataLoadFilter::for_file(file.path());
        let outputs = run_unwatched(|ctx| {
            filter.refresh(&[], FilterId::DETACHED, ctx)
        })
        .unwrap();
        assert_eq!(outputs.len(), 1);
        let ions = outputs[0].expect_ions().unwrap();
        assert_eq!(ions.data.len(), 32);
        assert_eq!(ions.colour, Colour::rgb(1.0, 0.0, 0.0));
        assert_eq!(ions.value_label, "Mass-to-Charge (amu/e)");
        // Successful refresh with caching on leaves a valid cache
        assert!(filter.cache().is_valid());
        assert!(outputs[0].cached);
    }

    #[test]
    fn disabled_filter_emits_nothing() {
        let file = pos_file(8);
        let mut filter = DataLoadFilter::for_file(file.path());
        let outcome = filter.set_property(KEY_ENABLED, &PropertyValue::Bool(false));
        assert!(outcome.accepted && outcome.needs_refresh);
        let outputs =
            run_unwatched(|ctx| filter.refresh(&[], FilterId::DETACHED, ctx)).unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn sampling_limit_applies() {
        let file = pos_file(100);
        let mut filter = DataLoadFilter::for_file(file.path());
        filter.set_property(KEY_MAX_IONS, &PropertyValue::Integer(10));
        let outputs =
            run_unwatched(|ctx| filter.refresh(&[], FilterId::DETACHED, ctx)).unwrap();
        assert_eq!(outputs[0].expect_ions().unwrap().data.len(), 10);
    }

    #[test]
    fn colour_change_mutates_cache_in_place() {
        let file = pos_file(4);
        let mut filter = DataLoadFilter::for_file(file.path());
        run_unwatched(|ctx| filter.refresh(&[], FilterId::DETACHED, ctx)).unwrap();
        assert!(filter.cache().is_valid());

        let green = Colour::rgb(0.0, 1.0, 0.0);
        let outcome = filter.set_property(KEY_COLOUR, &PropertyValue::Colour(green));
        assert!(outcome.accepted && outcome.needs_refresh);
        // Cache survives and carries the new colour
        assert!(filter.cache().is_valid());
        let emitted = filter.cache().emit();
        assert_eq!(emitted[0].expect_ions().unwrap().colour, green);
    }

    #[test]
    fn property_round_trip_is_idempotent() {
        let filter_file = pos_file(4);
        let mut filter = DataLoadFilter::for_file(filter_file.path());
        let sets = filter.properties();
        for set in &sets {
            for prop in &set.properties {
                let outcome = filter.set_property(prop.key, &prop.value);
                assert!(outcome.accepted, "property {} rejected", prop.name);
                assert!(
                    !outcome.needs_refresh,
                    "property {} claims refresh on no-op",
                    prop.name
                );
            }
        }
    }

    #[test]
    fn rejects_bad_column_selection() {
        let mut filter = DataLoadFilter::new();
        let outcome = filter.set_property(KEY_SELECTED_COLUMN2, &PropertyValue::Integer(7));
        assert!(!outcome.accepted);
        // Shrinking below a selected column is refused
        assert!(filter.set_property(KEY_COLUMNS, &PropertyValue::Integer(6)).accepted);
        assert!(filter.set_property(KEY_SELECTED_COLUMN2, &PropertyValue::Integer(5)).accepted);
        assert!(!filter.set_property(KEY_COLUMNS, &PropertyValue::Integer(4)).accepted);
    }
}
