//! The ion-colour filter: recolours ion streams by their scalar value using
//! a colour map, splitting them into one stream per colour step.

use std::sync::Arc;

use crate::constants::MAX_COLOUR_STEPS;
use crate::filter::properties::{PropertyOutcome, PropertySet, PropertyValue};
use crate::filter::{Filter, FilterKind, FilterOps, OutputCache};
use crate::progress::{ProgressTicker, RefreshContext};
use crate::result::{FilterError, StateError};
use crate::state::{state_bool, StateContext};
use crate::stream::{
    DrawPrimitive, DrawStream, FilterId, FilterStream, IonStream, StreamList, StreamMask,
    StreamPayload,
};
use crate::types::{Colour, IonHit};

pub const KEY_COLOUR_MAP: u32 = 1;
pub const KEY_MAP_START: u32 = 2;
pub const KEY_MAP_END: u32 = 3;
pub const KEY_N_COLOURS: u32 = 4;
pub const KEY_SHOW_BAR: u32 = 5;

/// The analytically-computable colour maps offered by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColourMap {
    Jet,
    Grayscale,
    Rainbow,
}

impl ColourMap {
    pub const ALL: [ColourMap; 3] = [ColourMap::Jet, ColourMap::Grayscale, ColourMap::Rainbow];

    pub fn label(&self) -> &'static str {
        match self {
            ColourMap::Jet => "Jet",
            ColourMap::Grayscale => "Grayscale",
            ColourMap::Rainbow => "Rainbow",
        }
    }

    pub fn from_label(label: &str) -> Option<ColourMap> {
        ColourMap::ALL.iter().copied().find(|m| m.label() == label)
    }

    /// Maps `t` in [0,1] to a colour.
    pub fn sample(&self, t: f32) -> Colour {
        let t = t.clamp(0.0, 1.0);
        match self {
            ColourMap::Grayscale => Colour::rgb(t, t, t),
            ColourMap::Jet => {
                // Piecewise-linear blue -> cyan -> yellow -> red ramp
                let r = (1.5 - (4.0 * t - 3.0).abs()).clamp(0.0, 1.0);
                let g = (1.5 - (4.0 * t - 2.0).abs()).clamp(0.0, 1.0);
                let b = (1.5 - (4.0 * t - 1.0).abs()).clamp(0.0, 1.0);
                Colour::rgb(r, g, b)
            }
            ColourMap::Rainbow => {
                // Hue sweep red -> violet
                let h = (1.0 - t) * 5.0;
                let sector = h as usize;
                let f = h - sector as f32;
                match sector {
                    0 => Colour::rgb(1.0, f, 0.0),
                    1 => Colour::rgb(1.0 - f, 1.0, 0.0),
                    2 => Colour::rgb(0.0, 1.0, f),
                    3 => Colour::rgb(0.0, 1.0 - f, 1.0),
                    _ => Colour::rgb(f.min(1.0) * 0.5, 0.0, 1.0),
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IonColourFilter {
    label: String,
    cache: OutputCache,
    map: ColourMap,
    map_start: f32,
    map_end: f32,
    n_colours: usize,
    show_bar: bool,
}

impl IonColourFilter {
    pub fn new() -> IonColourFilter {
        IonColourFilter {
            label: "Spectral Colour".to_string(),
            cache: OutputCache::new(),
            map: ColourMap::Jet,
            map_start: 0.0,
            map_end: 100.0,
            n_colours: MAX_COLOUR_STEPS,
            show_bar: true,
        }
    }

    fn step_colour(&self, step: usize) -> Colour {
        let value =
            step as f32 * (self.map_end - self.map_start) / self.n_colours as f32 + self.map_start;
        let t = (value - self.map_start) / (self.map_end - self.map_start);
        self.map.sample(t)
    }

    fn colour_bar(&self) -> DrawStream {
        let colours = (0..self.n_colours).map(|i| self.step_colour(i)).collect();
        DrawStream {
            primitives: vec![DrawPrimitive::ColourBar {
                colours,
                min: self.map_start,
                max: self.map_end,
            }],
        }
    }
}

impl Default for IonColourFilter {
    fn default() -> IonColourFilter {
        IonColourFilter::new()
    }
}

impl FilterOps for IonColourFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::IonColour
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
        Filter::IonColour(copy)
    }

    fn cache_bytes(&self, n_objects: usize) -> Option<usize> {
        Some(n_objects * std::mem::size_of::<IonHit>())
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
        ctx.begin_step(1, 1, "Colour");

        let span = self.map_end - self.map_start;
        let mut buckets: Vec<Vec<IonHit>> = vec![Vec::new(); self.n_colours];
        let mut ion_size: Option<f32> = None;
        let mut value_label = String::new();

        let total = crate::stream::total_ions(inputs);
        let mut ticker = ProgressTicker::new(total);
        for stream in inputs {
            let Some(ions) = stream.expect_ions() else {
                continue;
            };
            if ion_size.is_none() {
                ion_size = Some(ions.ion_size);
                value_label = ions.value_label.clone();
            }
            for ion in &ions.data {
                let t = ((ion.mass - self.map_start) / span).clamp(0.0, 1.0);
                let step = (t * (self.n_colours - 1) as f32) as usize;
                buckets[step].push(*ion);
                if !ticker.tick(ctx) {
                    return Err(FilterError::Aborted);
                }
            }
        }

        let mut outputs = StreamList::new();
        let any_ions = buckets.iter().any(|b| !b.is_empty());
        for (step, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let mut stream = IonStream::new(bucket);
            stream.colour = self.step_colour(step);
            if let Some(size) = ion_size {
                stream.ion_size = size;
            }
            stream.value_label = value_label.clone();
            outputs.push(FilterStream::transient(
                StreamPayload::Ions(Arc::new(stream)),
                self_id,
            ));
        }
        self.cache.finish(&mut outputs);
        // The colour bar rides along uncached: it is rebuilt on every
        // emission, cache hits included, and never enters the cached set
        if any_ions && self.show_bar {
            outputs.push(FilterStream::transient(
                StreamPayload::Draw(Arc::new(self.colour_bar())),
                self_id,
            ));
        }
        Ok(outputs)
    }

    fn properties(&self) -> Vec<PropertySet> {
        let mut set = PropertySet::new("Colouring");
        set.push(
            KEY_COLOUR_MAP,
            "Colour map",
            PropertyValue::Choice {
                selected: ColourMap::ALL
                    .iter()
                    .position(|&m| m == self.map)
                    .expect("map is in ALL"),
                options: ColourMap::ALL.iter().map(|m| m.label().to_string()).collect(),
            },
        );
        set.push(
            KEY_MAP_START,
            "Map start",
            PropertyValue::Real(self.map_start as f64),
        );
        set.push(
            KEY_MAP_END,
            "Map end",
            PropertyValue::Real(self.map_end as f64),
        );
        set.push(
            KEY_N_COLOURS,
            "Num colours",
            PropertyValue::Integer(self.n_colours as i64),
        );
        set.push(KEY_SHOW_BAR, "Show bar", PropertyValue::Bool(self.show_bar));
        vec![set]
    }

    fn set_property(&mut self, key: u32, value: &PropertyValue) -> PropertyOutcome {
        match key {
            KEY_COLOUR_MAP => {
                let Some(selected) = value.as_choice() else {
                    return PropertyOutcome::rejected();
                };
                let Some(&map) = ColourMap::ALL.get(selected) else {
                    return PropertyOutcome::rejected();
                };
                if map == self.map {
                    return PropertyOutcome::unchanged();
                }
                self.map = map;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_MAP_START => {
                let Some(start) = value.as_real() else {
                    return PropertyOutcome::rejected();
                };
                let start = start as f32;
                if start == self.map_start {
                    return PropertyOutcome::unchanged();
                }
                if start >= self.map_end {
                    return PropertyOutcome::rejected();
                }
                self.map_start = start;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_MAP_END => {
                let Some(end) = value.as_real() else {
                    return PropertyOutcome::rejected();
                };
                let end = end as f32;
                if end == self.map_end {
                    return PropertyOutcome::unchanged();
                }
                if end <= self.map_start {
                    return PropertyOutcome::rejected();
                }
                self.map_end = end;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_N_COLOURS => {
                let Some(n) = value.as_integer() else {
                    return PropertyOutcome::rejected();
                };
                // Clamp into the valid step range rather than reject
                let n = (n.max(1) as usize).min(MAX_COLOUR_STEPS);
                if n == self.n_colours {
                    return PropertyOutcome::unchanged();
                }
                self.n_colours = n;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_SHOW_BAR => {
                let Some(show) = value.as_bool() else {
                    return PropertyOutcome::rejected();
                };
                if show == self.show_bar {
                    return PropertyOutcome::unchanged();
                }
                // The bar is not part of the cached output; the next
                // emission simply includes or omits it
                self.show_bar = show;
                PropertyOutcome::refresh()
            }
            _ => PropertyOutcome::rejected(),
        }
    }

    fn emit_cached(&self, self_id: FilterId) -> StreamList {
        let mut outputs = self.cache.emit();
        let any_ions = outputs.iter().any(|s| s.expect_ions().is_some());
        if any_ions && self.show_bar {
            outputs.push(FilterStream::transient(
                StreamPayload::Draw(Arc::new(self.colour_bar())),
                self_id,
            ));
        }
        outputs
    }

    fn use_mask(&self) -> StreamMask {
        StreamMask::IONS
    }

    fn block_mask(&self) -> StreamMask {
        StreamMask::IONS
    }

    fn emit_mask(&self) -> StreamMask {
        StreamMask::IONS | StreamMask::DRAW
    }

    fn state_tags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("colourmap", self.map.label().to_string()),
            ("mapstart", self.map_start.to_string()),
            ("mapend", self.map_end.to_string()),
            ("ncolours", self.n_colours.to_string()),
            ("showbar", (self.show_bar as u8).to_string()),
        ]
    }

    fn restore_tag(
        &mut self,
        tag: &str,
        value: &str,
        _state: &StateContext,
    ) -> Result<(), StateError> {
        match tag {
            "colourmap" => {
                self.map = ColourMap::from_label(value).ok_or_else(|| StateError::Malformed {
                    description: format!("bad colour map `{value}`"),
                })?;
            }
            "mapstart" => {
                self.map_start = value.parse().map_err(|_| StateError::Malformed {
                    description: format!("bad map start `{value}`"),
                })?;
            }
            "mapend" => {
                self.map_end = value.parse().map_err(|_| StateError::Malformed {
                    description: format!("bad map end `{value}`"),
                })?;
            }
            "ncolours" => {
                let n: usize = value.parse().map_err(|_| StateError::Malformed {
                    description: format!("bad colour count `{value}`"),
                })?;
                self.n_colours = n.clamp(1, MAX_COLOUR_STEPS);
            }
            "showbar" => self.show_bar = state_bool(value)?,
            _ => {
                return crate::result::state_error(format!("unknown ioncolour tag `{tag}`"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::run_unwatched;
    use crate::types::Point3;

    fn ion_input(masses: &[f32]) -> Vec<FilterStream> {
        let hits: Vec<IonHit> = masses
            .iter()
            .map(|&m| IonHit::new(Point3::ORIGIN, m))
            .collect();
        vec![FilterStream::transient(
            StreamPayload::Ions(Arc::new(IonStream::new(hits))),
            FilterId::DETACHED,
        )]
    }

    #[test]
    fn splits_into_colour_steps() {
        let mut filter = IonColourFilter::new();
        filter.set_property(KEY_N_COLOURS, &PropertyValue::Integer(2));
        let inputs = ion_input(&[0.0, 100.0]);
        let outputs =
            run_unwatched(|ctx| filter.refresh(&inputs, FilterId::DETACHED, ctx)).unwrap();

        // Two ion streams plus the colour bar
        assert_eq!(outputs.len(), 3);
        let first = outputs[0].expect_ions().unwrap();
        let second = outputs[1].expect_ions().unwrap();
        assert_eq!(first.data.len(), 1);
        assert_eq!(second.data.len(), 1);
        assert_ne!(first.colour, second.colour);
        // The buckets are cached, the bar stays transient
        assert!(outputs[0].cached && outputs[1].cached);
        assert!(!outputs[2].cached);
        match &outputs[2].payload {
            StreamPayload::Draw(draw) => {
                assert!(matches!(
                    draw.primitives[0],
                    DrawPrimitive::ColourBar { .. }
                ));
            }
            other => panic!("expected a draw stream, got {other:?}"),
        }
    }

    #[test]
    fn bar_is_rebuilt_uncached_on_cache_hits() {
        let mut filter = IonColourFilter::new();
        let inputs = ion_input(&[25.0, 75.0]);
        run_unwatched(|ctx| filter.refresh(&inputs, FilterId::DETACHED, ctx)).unwrap();
        assert!(filter.cache().is_valid());

        let emitted = filter.emit_cached(FilterId::DETACHED);
        let bar = emitted.last().unwrap();
        assert!(matches!(bar.payload, StreamPayload::Draw(_)));
        assert!(!bar.cached);
        // The cached set itself holds only the ion buckets
        assert!(filter
            .cache()
            .emit()
            .iter()
            .all(|s| s.expect_ions().is_some()));

        // Hiding the bar keeps the cache and drops it from emissions
        let outcome = filter.set_property(KEY_SHOW_BAR, &PropertyValue::Bool(false));
        assert!(outcome.accepted && outcome.needs_refresh);
        assert!(filter.cache().is_valid());
        let emitted = filter.emit_cached(FilterId::DETACHED);
        assert!(emitted.iter().all(|s| s.expect_ions().is_some()));
    }

    #[test]
    fn out_of_map_values_clamp_to_ends() {
        let mut filter = IonColourFilter::new();
        filter.set_property(KEY_N_COLOURS, &PropertyValue::Integer(4));
        let inputs = ion_input(&[-50.0, 500.0]);
        let outputs =
            run_unwatched(|ctx| filter.refresh(&inputs, FilterId::DETACHED, ctx)).unwrap();
        // End steps get one ion each (plus the bar)
        assert_eq!(outputs.len(), 3);
    }

    #[test]
    fn no_ions_means_no_bar() {
        let mut filter = IonColourFilter::new();
        let outputs = run_unwatched(|ctx| filter.refresh(&[], FilterId::DETACHED, ctx)).unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn map_bounds_validate() {
        let mut filter = IonColourFilter::new();
        assert!(!filter.set_property(KEY_MAP_START, &PropertyValue::Real(200.0)).accepted);
        assert!(!filter.set_property(KEY_MAP_END, &PropertyValue::Real(-10.0)).accepted);
        assert!(filter.set_property(KEY_MAP_END, &PropertyValue::Real(50.0)).accepted);
    }

    #[test]
    fn colour_maps_cover_unit_interval() {
        for map in ColourMap::ALL {
            for i in 0..=10 {
                let colour = map.sample(i as f32 / 10.0);
                assert!(colour.is_normalised(), "{map:?} out of gamut at {i}");
            }
        }
    }
}
