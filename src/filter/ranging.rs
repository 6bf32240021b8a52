//! The ranging filter: partitions ion streams into per-species buckets using
//! a range table, and publishes that table downstream as a range stream.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::constants::PROGRESS_REDUCE;
use crate::filter::properties::{
    demux_key, mux_key, PropertyOutcome, PropertySet, PropertyValue,
};
use crate::filter::{Filter, FilterKind, FilterOps, OutputCache};
use crate::plot::RegionMove;
use crate::progress::{ProgressTicker, RefreshContext};
use crate::range::{RangeEnd, RangeFile, RangeTable};
use crate::result::{FilterError, StateError};
use crate::state::{state_bool, StateContext};
use crate::stream::{
    FilterId, FilterStream, IonStream, RangeStream, StreamList, StreamMask, StreamPayload,
};
use crate::types::{Colour, IonHit};

pub const KEY_FILE: u32 = 1;
pub const KEY_DROP_UNRANGED: u32 = 2;

// Per-element property blocks; the low bits multiplex the ion or range index.
pub const KEY_ION_ENABLED_BASE: u32 = 0x1000;
pub const KEY_ION_NAME_BASE: u32 = 0x2000;
pub const KEY_ION_COLOUR_BASE: u32 = 0x3000;
pub const KEY_RANGE_ENABLED_BASE: u32 = 0x4000;
pub const KEY_RANGE_ION_BASE: u32 = 0x5000;
pub const KEY_RANGE_LOW_BASE: u32 = 0x6000;
pub const KEY_RANGE_HIGH_BASE: u32 = 0x7000;

const KEY_BLOCK_MASK: u32 = 0xF000;

#[derive(Debug, Clone)]
pub struct RangingFilter {
    label: String,
    cache: OutputCache,
    file_path: String,
    table: RangeTable,
    loaded: bool,
    enabled_ranges: Vec<bool>,
    enabled_ions: Vec<bool>,
    drop_unranged: bool,
    /// Enable bitmaps restored from a state file before the table itself is
    /// loaded; applied on the next load if the sizes still agree.
    restored_range_bits: Option<Vec<bool>>,
    restored_ion_bits: Option<Vec<bool>>,
    parse_warnings: Vec<String>,
}

impl RangingFilter {
    pub fn new() -> RangingFilter {
        RangingFilter {
            label: "Ranging".to_string(),
            cache: OutputCache::new(),
            file_path: String::new(),
            table: RangeTable::new(),
            loaded: false,
            enabled_ranges: Vec::new(),
            enabled_ions: Vec::new(),
            drop_unranged: true,
            restored_range_bits: None,
            restored_ion_bits: None,
            parse_warnings: Vec::new(),
        }
    }

    /// Builds a filter directly from an already-parsed range file.
    pub fn from_range_file(file: RangeFile) -> RangingFilter {
        let mut filter = RangingFilter::new();
        filter.parse_warnings = file.warnings.clone();
        filter.adopt_table(file.table);
        filter
    }

    pub fn table(&self) -> &RangeTable {
        &self.table
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn has_table(&self) -> bool {
        self.loaded && !self.table.is_empty()
    }

    pub fn parse_warnings(&self) -> &[String] {
        &self.parse_warnings
    }

    fn adopt_table(&mut self, table: RangeTable) {
        self.enabled_ranges = match self.restored_range_bits.take() {
            Some(bits) if bits.len() == table.num_ranges() => bits,
            _ => vec![true; table.num_ranges()],
        };
        self.enabled_ions = match self.restored_ion_bits.take() {
            Some(bits) if bits.len() == table.num_ions() => bits,
            _ => vec![true; table.num_ions()],
        };
        self.table = table;
        self.loaded = true;
    }

    fn ensure_loaded(&mut self) -> Result<(), FilterError> {
        if self.loaded || self.file_path.is_empty() {
            return Ok(());
        }
        let file = RangeFile::open(Path::new(&self.file_path), None)?;
        self.parse_warnings = file.warnings.clone();
        self.adopt_table(file.table);
        Ok(())
    }

    fn range_stream(&self, self_id: FilterId) -> FilterStream {
        FilterStream::transient(
            StreamPayload::Range(Arc::new(RangeStream {
                table: Arc::new(self.table.clone()),
                enabled_ranges: self.enabled_ranges.clone(),
                enabled_ions: self.enabled_ions.clone(),
            })),
            self_id,
        )
    }

    /// Applies a region drag coming back from a plot. Extends one end or
    /// translates the whole range; refuses moves that would break the
    /// non-overlap invariant. On success the cache is dropped so the next
    /// refresh propagates the new split.
    pub fn set_from_region(&mut self, method: RegionMove, region_id: usize, new_pos: f32) -> bool {
        if region_id >= self.table.num_ranges() {
            return false;
        }
        let moved = match method {
            RegionMove::ExtendLow => self.table.move_range(region_id, RangeEnd::Lower, new_pos),
            RegionMove::ExtendHigh => self.table.move_range(region_id, RangeEnd::Upper, new_pos),
            RegionMove::Translate => {
                let (low, high) = self.table.range(region_id);
                let half_width = (high - low) / 2.0;
                self.table
                    .move_both(region_id, new_pos - half_width, new_pos + half_width)
            }
        };
        if moved {
            self.cache.clear();
        }
        moved
    }

    /// Pass 1: bucket sizes, data-parallel with one accumulator per worker,
    /// merged at the end.
    fn count_buckets(
        &self,
        inputs: &[FilterStream],
        ctx: &RefreshContext<'_>,
    ) -> Result<Vec<usize>, FilterError> {
        let num_ions = self.table.num_ions();
        let cancel = ctx.cancel_handle();
        let cancelled = AtomicBool::new(false);

        let mut counts = vec![0usize; num_ions];
        for stream in inputs {
            let Some(ions) = stream.expect_ions() else {
                continue;
            };
            let stream_counts = ions
                .data
                .par_chunks(PROGRESS_REDUCE)
                .map(|chunk| {
                    let mut local = vec![0usize; num_ions];
                    if cancelled.load(Ordering::Relaxed) {
                        return local;
                    }
                    for ion in chunk {
                        if let Some(range_id) = self.table.range_id_of_mass(ion.mass) {
                            if self.enabled_ranges[range_id] {
                                let ion_id = self.table.ion_of_range(range_id);
                                if self.enabled_ions[ion_id] {
                                    local[ion_id] += 1;
                                }
                            }
                        }
                    }
                    if cancel() {
                        cancelled.store(true, Ordering::Relaxed);
                    }
                    local
                })
                .reduce(
                    || vec![0usize; num_ions],
                    |mut a, b| {
                        for (total, part) in a.iter_mut().zip(&b) {
                            *total += part;
                        }
                        a
                    },
                );
            for (total, part) in counts.iter_mut().zip(&stream_counts) {
                *total += part;
            }
            if cancelled.load(Ordering::Relaxed) {
                return Err(FilterError::Aborted);
            }
        }
        Ok(counts)
    }
}

impl Default for RangingFilter {
    fn default() -> RangingFilter {
        RangingFilter::new()
    }
}

impl FilterOps for RangingFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Ranging
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
        Filter::Ranging(copy)
    }

    fn cache_bytes(&self, n_objects: usize) -> Option<usize> {
        Some(n_objects * std::mem::size_of::<IonHit>())
    }

    fn init(&mut self, _inputs: &[FilterStream], self_id: FilterId) -> StreamList {
        // Publish the range stream during the structural pass so children can
        // see the table before any heavy work happens.
        let _ = self.ensure_loaded();
        let mut out = StreamList::new();
        if self.loaded {
            out.push(self.range_stream(self_id));
        }
        out
    }

    fn refresh(
        &mut self,
        inputs: &[FilterStream],
        self_id: FilterId,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<StreamList, FilterError> {
        if ctx.cancelled() {
            return Err(FilterError::Aborted);
        }
        self.ensure_loaded()?;

        let num_ions = self.table.num_ions();
        let mut outputs = StreamList::new();

        ctx.begin_step(1, 2, "Pre-allocate");
        let counts = self.count_buckets(inputs, ctx)?;

        let mut buckets: Vec<Vec<IonHit>> = Vec::with_capacity(num_ions);
        for &count in &counts {
            let mut bucket = Vec::new();
            bucket
                .try_reserve_exact(count)
                .map_err(|_| FilterError::Alloc)?;
            buckets.push(bucket);
        }
        let mut unranged: Vec<IonHit> = Vec::new();

        ctx.begin_step(2, 2, "Range");
        let total = crate::stream::total_ions(inputs);
        let mut ticker = ProgressTicker::new(total);

        // Presentation attributes to carry over from the inputs: the first
        // stream's colour becomes the unranged colour, and the point size
        // propagates only when all inputs agree on it.
        let mut default_colour: Option<Colour> = None;
        let mut ion_size: Option<f32> = None;
        let mut same_size = true;
        let mut value_label = String::new();

        for stream in inputs {
            let Some(ions) = stream.expect_ions() else {
                continue;
            };
            if default_colour.is_none() {
                default_colour = Some(ions.colour);
                value_label = ions.value_label.clone();
            }
            match ion_size {
                None => ion_size = Some(ions.ion_size),
                Some(size) => {
                    same_size &= (size - ions.ion_size).abs() < f32::EPSILON;
                }
            }

            // Pass 2: linear fill; parallel variants measured slower here
            for ion in &ions.data {
                match self.table.range_id_of_mass(ion.mass) {
                    Some(range_id) => {
                        if self.enabled_ranges[range_id] {
                            let ion_id = self.table.ion_of_range(range_id);
                            if self.enabled_ions[ion_id] {
                                buckets[ion_id].push(*ion);
                            }
                        }
                    }
                    None => {
                        if !self.drop_unranged {
                            unranged.push(*ion);
                        }
                    }
                }
                if !ticker.tick(ctx) {
                    return Err(FilterError::Aborted);
                }
            }
        }

        // Emit in ion-id order, unranged last; empty buckets are suppressed
        for (ion_id, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let mut stream = IonStream::new(bucket);
            stream.colour = self.table.colour(ion_id);
            if let (Some(size), true) = (ion_size, same_size) {
                stream.ion_size = size;
            }
            stream.value_label = value_label.clone();
            outputs.push(FilterStream::transient(
                StreamPayload::Ions(Arc::new(stream)),
                self_id,
            ));
        }
        if !unranged.is_empty() {
            let mut stream = IonStream::new(unranged);
            if let Some(colour) = default_colour {
                stream.colour = colour;
            }
            if let (Some(size), true) = (ion_size, same_size) {
                stream.ion_size = size;
            }
            stream.value_label = value_label;
            outputs.push(FilterStream::transient(
                StreamPayload::Ions(Arc::new(stream)),
                self_id,
            ));
        }

        outputs.push(self.range_stream(self_id));
        self.cache.finish(&mut outputs);
        Ok(outputs)
    }

    fn properties(&self) -> Vec<PropertySet> {
        let mut data = PropertySet::new("Data");
        data.push(KEY_FILE, "File", PropertyValue::String(self.file_path.clone()));
        data.push(
            KEY_DROP_UNRANGED,
            "Drop unranged",
            PropertyValue::Bool(self.drop_unranged),
        );

        let mut ions = PropertySet::new("Ions");
        for ion_id in 0..self.table.num_ions() {
            ions.push(
                mux_key(KEY_ION_ENABLED_BASE, ion_id),
                &format!("{} enabled", self.table.short_name(ion_id)),
                PropertyValue::Bool(self.enabled_ions[ion_id]),
            );
            ions.push(
                mux_key(KEY_ION_NAME_BASE, ion_id),
                "Name",
                PropertyValue::String(self.table.short_name(ion_id).to_string()),
            );
            ions.push(
                mux_key(KEY_ION_COLOUR_BASE, ion_id),
                "Colour",
                PropertyValue::Colour(self.table.colour(ion_id)),
            );
        }

        let mut ranges = PropertySet::new("Ranges");
        for range_id in 0..self.table.num_ranges() {
            let (low, high) = self.table.range(range_id);
            ranges.push(
                mux_key(KEY_RANGE_ENABLED_BASE, range_id),
                &format!("Range {} enabled", range_id + 1),
                PropertyValue::Bool(self.enabled_ranges[range_id]),
            );
            ranges.push(
                mux_key(KEY_RANGE_ION_BASE, range_id),
                "Ion",
                PropertyValue::Integer(self.table.ion_of_range(range_id) as i64),
            );
            ranges.push(
                mux_key(KEY_RANGE_LOW_BASE, range_id),
                "Start rng",
                PropertyValue::Real(low as f64),
            );
            ranges.push(
                mux_key(KEY_RANGE_HIGH_BASE, range_id),
                "End rng",
                PropertyValue::Real(high as f64),
            );
        }
        vec![data, ions, ranges]
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
                self.loaded = false;
                self.table = RangeTable::new();
                self.enabled_ions.clear();
                self.enabled_ranges.clear();
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_DROP_UNRANGED => {
                let Some(drop) = value.as_bool() else {
                    return PropertyOutcome::rejected();
                };
                if drop == self.drop_unranged {
                    return PropertyOutcome::unchanged();
                }
                self.drop_unranged = drop;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            _ => self.set_element_property(key, value),
        }
    }

    fn use_mask(&self) -> StreamMask {
        StreamMask::IONS | StreamMask::RANGE
    }

    fn block_mask(&self) -> StreamMask {
        // Ion streams are replaced by the buckets; upstream range streams are
        // swallowed so a chain of nodes carries exactly one range stream.
        StreamMask::IONS | StreamMask::RANGE
    }

    fn emit_mask(&self) -> StreamMask {
        StreamMask::IONS | StreamMask::RANGE
    }

    fn state_tags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("file", crate::state::encode_path(&self.file_path)),
            ("dropunranged", (self.drop_unranged as u8).to_string()),
            ("enabledions", bits_to_string(&self.enabled_ions)),
            ("enabledranges", bits_to_string(&self.enabled_ranges)),
        ]
    }

    fn restore_tag(
        &mut self,
        tag: &str,
        value: &str,
        state: &StateContext,
    ) -> Result<(), StateError> {
        match tag {
            "file" => {
                self.file_path = state.decode_path(value);
                self.loaded = false;
            }
            "dropunranged" => self.drop_unranged = state_bool(value)?,
            "enabledions" => self.restored_ion_bits = Some(bits_from_string(value)?),
            "enabledranges" => self.restored_range_bits = Some(bits_from_string(value)?),
            _ => {
                return crate::result::state_error(format!("unknown rangefile tag `{tag}`"));
            }
        }
        Ok(())
    }
}

impl RangingFilter {
    fn set_element_property(&mut self, key: u32, value: &PropertyValue) -> PropertyOutcome {
        let base = key & KEY_BLOCK_MASK;
        let index = demux_key(key, base);
        match base {
            KEY_ION_ENABLED_BASE => {
                let Some(enabled) = value.as_bool() else {
                    return PropertyOutcome::rejected();
                };
                if index >= self.enabled_ions.len() {
                    return PropertyOutcome::rejected();
                }
                if self.enabled_ions[index] == enabled {
                    return PropertyOutcome::unchanged();
                }
                self.enabled_ions[index] = enabled;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_ION_NAME_BASE => {
                let Some(name) = value.as_str() else {
                    return PropertyOutcome::rejected();
                };
                if index >= self.table.num_ions() {
                    return PropertyOutcome::rejected();
                }
                if name.is_empty() {
                    return PropertyOutcome::rejected();
                }
                if self.table.short_name(index) == name {
                    return PropertyOutcome::unchanged();
                }
                self.table.set_short_name(index, name);
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_ION_COLOUR_BASE => {
                let Some(colour) = value.as_colour() else {
                    return PropertyOutcome::rejected();
                };
                if index >= self.table.num_ions() {
                    return PropertyOutcome::rejected();
                }
                if self.table.colour(index) == colour {
                    return PropertyOutcome::unchanged();
                }
                self.table.set_colour(index, colour);
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_RANGE_ENABLED_BASE => {
                let Some(enabled) = value.as_bool() else {
                    return PropertyOutcome::rejected();
                };
                if index >= self.enabled_ranges.len() {
                    return PropertyOutcome::rejected();
                }
                if self.enabled_ranges[index] == enabled {
                    return PropertyOutcome::unchanged();
                }
                self.enabled_ranges[index] = enabled;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_RANGE_ION_BASE => {
                let Some(ion) = value.as_integer() else {
                    return PropertyOutcome::rejected();
                };
                if index >= self.table.num_ranges() || ion < 0 {
                    return PropertyOutcome::rejected();
                }
                if self.table.ion_of_range(index) == ion as usize {
                    return PropertyOutcome::unchanged();
                }
                if !self.table.set_range_ion(index, ion as usize) {
                    return PropertyOutcome::rejected();
                }
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_RANGE_LOW_BASE | KEY_RANGE_HIGH_BASE => {
                let Some(mass) = value.as_real() else {
                    return PropertyOutcome::rejected();
                };
                if index >= self.table.num_ranges() {
                    return PropertyOutcome::rejected();
                }
                let (low, high) = self.table.range(index);
                let end = if base == KEY_RANGE_LOW_BASE {
                    if mass as f32 == low {
                        return PropertyOutcome::unchanged();
                    }
                    RangeEnd::Lower
                } else {
                    if mass as f32 == high {
                        return PropertyOutcome::unchanged();
                    }
                    RangeEnd::Upper
                };
                // Route through move_range so non-overlap is preserved
                if !self.table.move_range(index, end, mass as f32) {
                    return PropertyOutcome::rejected();
                }
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            _ => PropertyOutcome::rejected(),
        }
    }
}

fn bits_to_string(bits: &[bool]) -> String {
    bits.iter().map(|&b| if b { '1' } else { '0' }).collect()
}

fn bits_from_string(s: &str) -> Result<Vec<bool>, StateError> {
    s.chars()
        .map(|c| match c {
            '0' => Ok(false),
            '1' => Ok(true),
            _ => Err(StateError::Malformed {
                description: format!("bad enable bitmap `{s}`"),
            }),
        })
        .collect()
}
