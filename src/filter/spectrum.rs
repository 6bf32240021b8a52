//! The spectrum filter: a 1-D histogram of ion values, with region
//! annotations copied from an upstream range stream.

use std::sync::Arc;

use crate::constants::{SPECTRUM_AUTO_MAX_BINS, SPECTRUM_MAX_BINS};
use crate::filter::properties::{PropertyOutcome, PropertySet, PropertyValue};
use crate::filter::{Filter, FilterKind, FilterOps, OutputCache};
use crate::plot::{PlotBounds, PlotRegionSeed};
use crate::progress::{ProgressTicker, RefreshContext};
use crate::result::{FilterError, StateError};
use crate::state::{state_bool, StateContext};
use crate::stream::{
    FilterId, FilterStream, PlotStream, PlotStyle, StreamList, StreamMask, StreamPayload,
};
use crate::types::Colour;

pub const KEY_BIN_WIDTH: u32 = 1;
pub const KEY_AUTO_EXTREMA: u32 = 2;
pub const KEY_MIN: u32 = 3;
pub const KEY_MAX: u32 = 4;
pub const KEY_LOG_Y: u32 = 5;
pub const KEY_PLOT_STYLE: u32 = 6;
pub const KEY_COLOUR: u32 = 7;

#[derive(Debug, Clone)]
pub struct SpectrumFilter {
    label: String,
    cache: OutputCache,
    bin_width: f32,
    auto_extrema: bool,
    min_plot: f32,
    max_plot: f32,
    log_y: bool,
    style: PlotStyle,
    colour: Colour,
}

impl SpectrumFilter {
    pub fn new() -> SpectrumFilter {
        SpectrumFilter {
            label: "Spectrum".to_string(),
            cache: OutputCache::new(),
            bin_width: 0.5,
            auto_extrema: true,
            min_plot: 0.0,
            max_plot: 150.0,
            log_y: true,
            style: PlotStyle::Lines,
            colour: Colour::rgb(0.0, 0.0, 1.0),
        }
    }

    fn limits_are_sane(&self) -> bool {
        let delta = (self.max_plot as f64 - self.min_plot as f64) / self.bin_width as f64;
        self.min_plot.is_finite()
            && self.max_plot.is_finite()
            && self.min_plot < self.max_plot
            && delta.abs() <= f32::MAX as f64
            && self.bin_width >= f32::EPSILON.sqrt()
    }
}

impl Default for SpectrumFilter {
    fn default() -> SpectrumFilter {
        SpectrumFilter::new()
    }
}

impl FilterOps for SpectrumFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Spectrum
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
        Filter::Spectrum(copy)
    }

    fn cache_bytes(&self, _n_objects: usize) -> Option<usize> {
        if !self.limits_are_sane() {
            return None;
        }
        let bins = ((self.max_plot - self.min_plot) / self.bin_width) as usize;
        Some(bins * 2 * std::mem::size_of::<f32>())
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
        let total = crate::stream::total_ions(inputs);

        if self.auto_extrema {
            ctx.begin_step(1, 2, "Extrema");
            let mut min = f32::INFINITY;
            let mut max = f32::NEG_INFINITY;
            let mut ticker = ProgressTicker::new(total);
            for stream in inputs {
                let Some(ions) = stream.expect_ions() else {
                    continue;
                };
                for ion in &ions.data {
                    min = min.min(ion.mass);
                    max = max.max(ion.mass);
                    if !ticker.tick(ctx) {
                        return Err(FilterError::Aborted);
                    }
                }
            }
            if min.is_finite() && max.is_finite() {
                // Push the limits out a little so edge bins stay visible
                self.min_plot = min - 1.0;
                self.max_plot = max + 1.0;
            } else {
                self.min_plot = f32::INFINITY;
                self.max_plot = f32::NEG_INFINITY;
            }
            ctx.begin_step(2, 2, "Count");
        } else {
            ctx.begin_step(1, 1, "Count");
        }

        // Pathological extents or bin width collapse to a tiny unit domain
        // rather than failing the refresh
        if !self.limits_are_sane() {
            self.min_plot = 0.0;
            self.max_plot = 1.0;
            self.bin_width = 0.1;
        }

        let cap = if self.auto_extrema {
            SPECTRUM_AUTO_MAX_BINS
        } else {
            SPECTRUM_MAX_BINS
        };
        let mut n_bins = (((self.max_plot - self.min_plot) / self.bin_width) as usize).min(cap);
        if n_bins == 0 {
            n_bins = 10;
            self.bin_width = (self.max_plot - self.min_plot) / n_bins as f32;
        }

        let mut xy = Vec::new();
        xy.try_reserve_exact(n_bins).map_err(|_| FilterError::Alloc)?;
        for i in 0..n_bins {
            xy.push((self.min_plot + i as f32 * self.bin_width, 0.0f32));
        }

        // Accumulate; ions outside the domain are silently dropped
        let mut ticker = ProgressTicker::new(total);
        for stream in inputs {
            let Some(ions) = stream.expect_ions() else {
                continue;
            };
            for ion in &ions.data {
                let offset = ion.mass - self.min_plot;
                if offset >= 0.0 {
                    let bin = (offset / self.bin_width) as usize;
                    if bin < n_bins {
                        xy[bin].1 += 1.0;
                    }
                }
                if !ticker.tick(ctx) {
                    return Err(FilterError::Aborted);
                }
            }
        }

        // Use the common input value label for the x axis; mixed inputs get
        // a mixed label
        let mut x_label = String::new();
        for stream in inputs {
            let Some(ions) = stream.expect_ions() else {
                continue;
            };
            if x_label.is_empty() {
                x_label = ions.value_label.clone();
            } else if x_label != ions.value_label {
                x_label = "Mixed data".to_string();
                break;
            }
        }

        // Copy enabled ranges out of the upstream range stream as draggable
        // regions, keyed back to the producing filter
        let mut regions = Vec::new();
        for stream in inputs {
            let Some(range) = stream.expect_range() else {
                continue;
            };
            for range_id in 0..range.table.num_ranges() {
                let ion_id = range.table.ion_of_range(range_id);
                if range.enabled_ranges[range_id] && range.enabled_ions[ion_id] {
                    regions.push(PlotRegionSeed {
                        region_id: range_id,
                        bounds: range.table.range(range_id),
                        colour: range.table.colour(ion_id),
                        owner: stream.producer,
                    });
                }
            }
        }

        let mut bounds = PlotBounds::new_inverse();
        for &(x, y) in &xy {
            bounds.expand(x, y);
        }
        if self.log_y {
            // Leave room for log(0) bins
            bounds.min_y = bounds.min_y.min(1.0);
        }

        let plot = PlotStream {
            xy,
            y_err: Vec::new(),
            x_label,
            y_label: "Count".to_string(),
            title: self.label.clone(),
            colour: self.colour,
            style: self.style,
            log_y: self.log_y,
            hard_bounds: bounds,
            plot_index: 0,
            regions,
        };

        let mut outputs = StreamList::new();
        outputs.push(FilterStream::transient(
            StreamPayload::Plot(Arc::new(plot)),
            self_id,
        ));
        self.cache.finish(&mut outputs);
        Ok(outputs)
    }

    fn properties(&self) -> Vec<PropertySet> {
        let mut set = PropertySet::new("Spectrum");
        set.push(
            KEY_BIN_WIDTH,
            "Bin width",
            PropertyValue::Real(self.bin_width as f64),
        );
        set.push(
            KEY_AUTO_EXTREMA,
            "Auto min/max",
            PropertyValue::Bool(self.auto_extrema),
        );
        set.push(KEY_MIN, "Min", PropertyValue::Real(self.min_plot as f64));
        set.push(KEY_MAX, "Max", PropertyValue::Real(self.max_plot as f64));
        set.push(KEY_LOG_Y, "Logarithmic", PropertyValue::Bool(self.log_y));
        set.push(
            KEY_PLOT_STYLE,
            "Plot type",
            PropertyValue::Choice {
                selected: PlotStyle::ALL
                    .iter()
                    .position(|&s| s == self.style)
                    .expect("style is in ALL"),
                options: PlotStyle::ALL.iter().map(|s| s.label().to_string()).collect(),
            },
        );
        set.push(KEY_COLOUR, "Colour", PropertyValue::Colour(self.colour));
        vec![set]
    }

    fn set_property(&mut self, key: u32, value: &PropertyValue) -> PropertyOutcome {
        match key {
            KEY_BIN_WIDTH => {
                let Some(width) = value.as_real() else {
                    return PropertyOutcome::rejected();
                };
                let width = width as f32;
                if width == self.bin_width {
                    return PropertyOutcome::unchanged();
                }
                if width < f32::EPSILON
                    || !self.max_plot.is_finite()
                    || !self.min_plot.is_finite()
                    || width > self.max_plot - self.min_plot
                {
                    return PropertyOutcome::rejected();
                }
                self.bin_width = width;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_AUTO_EXTREMA => {
                let Some(auto) = value.as_bool() else {
                    return PropertyOutcome::rejected();
                };
                if auto == self.auto_extrema {
                    return PropertyOutcome::unchanged();
                }
                self.auto_extrema = auto;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_MIN => {
                if self.auto_extrema {
                    return PropertyOutcome::rejected();
                }
                let Some(min) = value.as_real() else {
                    return PropertyOutcome::rejected();
                };
                let min = min as f32;
                if min == self.min_plot {
                    return PropertyOutcome::unchanged();
                }
                if min >= self.max_plot {
                    return PropertyOutcome::rejected();
                }
                self.min_plot = min;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_MAX => {
                if self.auto_extrema {
                    return PropertyOutcome::rejected();
                }
                let Some(max) = value.as_real() else {
                    return PropertyOutcome::rejected();
                };
                let max = max as f32;
                if max == self.max_plot {
                    return PropertyOutcome::unchanged();
                }
                if max <= self.min_plot {
                    return PropertyOutcome::rejected();
                }
                self.max_plot = max;
                self.cache.clear();
                PropertyOutcome::refresh()
            }
            KEY_LOG_Y => {
                let Some(log_y) = value.as_bool() else {
                    return PropertyOutcome::rejected();
                };
                if log_y == self.log_y {
                    return PropertyOutcome::unchanged();
                }
                self.log_y = log_y;
                // Presentation only: patch cached plots instead of
                // recomputing the histogram
                self.cache.mutate_plots(move |plot| {
                    plot.log_y = log_y;
                    if log_y {
                        plot.hard_bounds.min_y = plot.hard_bounds.min_y.min(1.0);
                    }
                });
                PropertyOutcome::refresh()
            }
            KEY_PLOT_STYLE => {
                let Some(selected) = value.as_choice() else {
                    return PropertyOutcome::rejected();
                };
                let Some(&style) = PlotStyle::ALL.get(selected) else {
                    return PropertyOutcome::rejected();
                };
                if style == self.style {
                    return PropertyOutcome::unchanged();
                }
                self.style = style;
                self.cache.mutate_plots(move |plot| plot.style = style);
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
                self.cache.mutate_plots(move |plot| plot.colour = colour);
                PropertyOutcome::refresh()
            }
            _ => PropertyOutcome::rejected(),
        }
    }

    fn use_mask(&self) -> StreamMask {
        StreamMask::IONS | StreamMask::RANGE
    }

    fn block_mask(&self) -> StreamMask {
        // Absolutely nothing passes through this filter
        StreamMask::all()
    }

    fn emit_mask(&self) -> StreamMask {
        StreamMask::PLOT
    }

    fn state_tags(&self) -> Vec<(&'static str, String)> {
        vec![
            ("binwidth", self.bin_width.to_string()),
            ("autoextrema", (self.auto_extrema as u8).to_string()),
            ("min", self.min_plot.to_string()),
            ("max", self.max_plot.to_string()),
            ("logarithmic", (self.log_y as u8).to_string()),
            ("plottype", self.style.label().to_string()),
            ("colour", self.colour.to_hex8()),
        ]
    }

    fn restore_tag(
        &mut self,
        tag: &str,
        value: &str,
        _state: &StateContext,
    ) -> Result<(), StateError> {
        match tag {
            "binwidth" => {
                let width: f32 = value.parse().map_err(|_| StateError::Malformed {
                    description: format!("bad bin width `{value}`"),
                })?;
                if width <= 0.0 {
                    return crate::result::state_error("bin width must be positive");
                }
                self.bin_width = width;
            }
            "autoextrema" => self.auto_extrema = state_bool(value)?,
            "min" => {
                self.min_plot = value.parse().map_err(|_| StateError::Malformed {
                    description: format!("bad min `{value}`"),
                })?;
            }
            "max" => {
                self.max_plot = value.parse().map_err(|_| StateError::Malformed {
                    description: format!("bad max `{value}`"),
                })?;
            }
            "logarithmic" => self.log_y = state_bool(value)?,
            "plottype" => {
                self.style = PlotStyle::from_label(value).ok_or_else(|| StateError::Malformed {
                    description: format!("bad plot type `{value}`"),
                })?;
            }
            "colour" => {
                self.colour = Colour::from_hex8(value).ok_or_else(|| StateError::Malformed {
                    description: format!("bad colour `{value}`"),
                })?;
            }
            _ => {
                return crate::result::state_error(format!("unknown spectrumplot tag `{tag}`"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ranging::RangingFilter;
    use crate::progress::run_unwatched;
    use crate::range::{RangeFile, RangeFormat};
    use crate::stream::IonStream;
    use crate::types::{IonHit, Point3};

    fn ion_input(masses: impl Iterator<Item = f32>) -> Vec<FilterStream> {
        let hits: Vec<IonHit> = masses.map(|m| IonHit::new(Point3::ORIGIN, m)).collect();
        vec![FilterStream::transient(
            StreamPayload::Ions(Arc::new(IonStream::new(hits))),
            FilterId::DETACHED,
        )]
    }

    fn refresh(filter: &mut SpectrumFilter, inputs: &[FilterStream]) -> StreamList {
        run_unwatched(|ctx| filter.refresh(inputs, FilterId(2), ctx)).unwrap()
    }

    #[test]
    fn unit_bins_count_each_ion_once() {
        let mut filter = SpectrumFilter::new();
        filter.set_property(KEY_BIN_WIDTH, &PropertyValue::Real(1.0));
        filter.set_property(KEY_LOG_Y, &PropertyValue::Bool(false));
        let red = Colour::rgb(1.0, 0.0, 0.0);
        filter.set_property(KEY_COLOUR, &PropertyValue::Colour(red));

        let inputs = ion_input((0..100).map(|i| i as f32));
        let outputs = refresh(&mut filter, &inputs);
        assert_eq!(outputs.len(), 1);
        let plot = outputs[0].expect_plot().unwrap();

        assert_eq!(plot.colour, red);
        assert!(!plot.log_y);
        // Extrema padding widens the domain to [-1, 100]
        assert_eq!(plot.xy.first().unwrap().0, -1.0);
        // Every ion lands in exactly one bin
        let total: f32 = plot.xy.iter().map(|&(_, y)| y).sum();
        assert_eq!(total, 100.0);
        assert!(plot.xy.iter().all(|&(_, y)| y <= 1.0));
        assert_eq!(plot.y_label, "Count");
    }

    #[test]
    fn degenerate_domain_resets_to_unit() {
        let mut filter = SpectrumFilter::new();
        // All ions at one value; padding still gives a 2-wide window, so
        // force the degenerate path with a pathological manual setup
        filter.auto_extrema = false;
        filter.min_plot = 5.0;
        filter.max_plot = 5.0;
        let outputs = refresh(&mut filter, &ion_input([5.0f32].into_iter()));
        let plot = outputs[0].expect_plot().unwrap();
        // Reset kicked in: domain [0,1], width 0.1 -> 10 bins
        assert_eq!(filter.min_plot, 0.0);
        assert_eq!(filter.max_plot, 1.0);
        assert_eq!(plot.xy.len(), 10);
    }

    #[test]
    fn no_input_resets_to_unit_domain() {
        let mut filter = SpectrumFilter::new();
        let outputs = refresh(&mut filter, &[]);
        let plot = outputs[0].expect_plot().unwrap();
        assert_eq!(plot.xy.len(), 10);
        assert!(plot.xy.iter().all(|&(_, y)| y == 0.0));
    }

    #[test]
    fn auto_mode_caps_bin_count() {
        let mut filter = SpectrumFilter::new();
        filter.set_property(KEY_BIN_WIDTH, &PropertyValue::Real(0.001));
        let outputs = refresh(&mut filter, &ion_input((0..100).map(|i| i as f32)));
        let plot = outputs[0].expect_plot().unwrap();
        assert_eq!(plot.xy.len(), SPECTRUM_AUTO_MAX_BINS);
    }

    #[test]
    fn regions_are_copied_from_range_stream() {
        let range_file = RangeFile::parse(
            "1 1\nIron\nFe 0.5 0.5 0.5\n-------------\n. 26.0 28.0 1\n",
            RangeFormat::Ornl,
        )
        .unwrap();
        let mut ranger = RangingFilter::from_range_file(range_file);
        let upstream = ion_input((0..50).map(|i| 26.0 + (i as f32) * 0.01));
        let ranged = run_unwatched(|ctx| ranger.refresh(&upstream, FilterId(9), ctx)).unwrap();

        let mut filter = SpectrumFilter::new();
        let outputs = refresh(&mut filter, &ranged);
        let plot = outputs[0].expect_plot().unwrap();
        assert_eq!(plot.regions.len(), 1);
        let region = &plot.regions[0];
        assert_eq!(region.bounds, (26.0, 28.0));
        assert_eq!(region.owner, FilterId(9));
        assert_eq!(region.colour, Colour::rgb(0.5, 0.5, 0.5));
    }

    #[test]
    fn log_toggle_mutates_cache_without_invalidating() {
        let mut filter = SpectrumFilter::new();
        filter.set_property(KEY_LOG_Y, &PropertyValue::Bool(false));
        refresh(&mut filter, &ion_input((0..10).map(|i| i as f32)));
        assert!(filter.cache().is_valid());

        let outcome = filter.set_property(KEY_LOG_Y, &PropertyValue::Bool(true));
        assert!(outcome.accepted && outcome.needs_refresh);
        assert!(filter.cache().is_valid());
        let emitted = filter.cache().emit();
        let plot = emitted[0].expect_plot().unwrap();
        assert!(plot.log_y);
        assert!(plot.hard_bounds.min_y <= 1.0);
    }

    #[test]
    fn min_max_rejected_in_auto_mode() {
        let mut filter = SpectrumFilter::new();
        assert!(!filter.set_property(KEY_MIN, &PropertyValue::Real(1.0)).accepted);
        filter.set_property(KEY_AUTO_EXTREMA, &PropertyValue::Bool(false));
        assert!(filter.set_property(KEY_MIN, &PropertyValue::Real(1.0)).accepted);
        // Inverted limits refused
        assert!(!filter.set_property(KEY_MAX, &PropertyValue::Real(0.5)).accepted);
    }
}
