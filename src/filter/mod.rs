//! The filter contract and the concrete transformation filters.
//!
//! A filter consumes the streams produced by its parent in the tree and
//! emits streams of its own. [`Filter`] is a closed tagged union over the
//! concrete filter types; the shared behaviour lives in the [`FilterOps`]
//! capability trait, which every variant implements.

pub mod data_load;
pub mod external;
pub mod ion_colour;
pub mod properties;
pub mod ranging;
pub mod spectrum;

pub use data_load::DataLoadFilter;
pub use external::ExternalProgramFilter;
pub use ion_colour::IonColourFilter;
pub use properties::{PropertyOutcome, PropertySet, PropertyValue};
pub use ranging::RangingFilter;
pub use spectrum::SpectrumFilter;

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::progress::RefreshContext;
use crate::result::{FilterError, StateError};
use crate::state::StateContext;
use crate::stream::{FilterId, FilterStream, IonStream, PlotStream, StreamList, StreamMask, StreamPayload};

/// Discriminates the concrete filter types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    DataLoad,
    Ranging,
    Spectrum,
    IonColour,
    ExternalProgram,
}

impl FilterKind {
    /// The element name this filter type uses in persisted state.
    pub fn type_name(&self) -> &'static str {
        match self {
            FilterKind::DataLoad => "dataload",
            FilterKind::Ranging => "rangefile",
            FilterKind::Spectrum => "spectrumplot",
            FilterKind::IonColour => "ioncolour",
            FilterKind::ExternalProgram => "externalprog",
        }
    }

    pub fn from_type_name(name: &str) -> Option<FilterKind> {
        match name {
            "dataload" => Some(FilterKind::DataLoad),
            "rangefile" => Some(FilterKind::Ranging),
            "spectrumplot" => Some(FilterKind::Spectrum),
            "ioncolour" => Some(FilterKind::IonColour),
            "externalprog" => Some(FilterKind::ExternalProgram),
            _ => None,
        }
    }

    /// Human-readable type string shown next to the user's label.
    pub fn display_name(&self) -> &'static str {
        match self {
            FilterKind::DataLoad => "Pos Data",
            FilterKind::Ranging => "Ranging",
            FilterKind::Spectrum => "Spectrum",
            FilterKind::IonColour => "Spectral Colour",
            FilterKind::ExternalProgram => "Ext. Program",
        }
    }
}

impl Display for FilterKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// The per-node output cache.
///
/// When caching is enabled and a refresh succeeds, the node keeps shared
/// copies of its outputs, marked `cached`, and re-emits them until the cache
/// is invalidated. Consumers treat cached streams as immutable; the only
/// sanctioned in-place edits are the cosmetic mutations below, which a filter
/// may apply when a presentation-only property changes.
#[derive(Debug, Clone)]
pub struct OutputCache {
    enabled: bool,
    valid: bool,
    outputs: Vec<FilterStream>,
}

impl OutputCache {
    pub fn new() -> OutputCache {
        OutputCache {
            enabled: true,
            valid: false,
            outputs: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clear();
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn clear(&mut self) {
        self.outputs.clear();
        self.valid = false;
    }

    /// Finalises a successful refresh: with caching on, the emitted streams
    /// are marked cached and retained.
    pub fn finish(&mut self, outputs: &mut StreamList) {
        if self.enabled {
            for stream in outputs.iter_mut() {
                stream.cached = true;
            }
            self.outputs = outputs.to_vec();
            self.valid = true;
        } else {
            self.valid = false;
        }
    }

    /// Re-emits the cached outputs.
    pub fn emit(&self) -> StreamList {
        debug_assert!(self.valid);
        self.outputs.iter().cloned().collect()
    }

    /// Applies a cosmetic edit to every cached plot stream in place.
    pub fn mutate_plots(&mut self, mutate: impl Fn(&mut PlotStream)) {
        for stream in &mut self.outputs {
            if let StreamPayload::Plot(plot) = &mut stream.payload {
                mutate(Arc::make_mut(plot));
            }
        }
    }

    /// Applies a cosmetic edit to every cached ion stream in place.
    pub fn mutate_ions(&mut self, mutate: impl Fn(&mut IonStream)) {
        for stream in &mut self.outputs {
            if let StreamPayload::Ions(ions) = &mut stream.payload {
                mutate(Arc::make_mut(ions));
            }
        }
    }
}

impl Default for OutputCache {
    fn default() -> OutputCache {
        OutputCache::new()
    }
}

/// The capability surface every concrete filter implements.
pub trait FilterOps {
    fn kind(&self) -> FilterKind;

    /// The user-visible label of this node.
    fn label(&self) -> &str;
    fn set_label(&mut self, label: &str);

    fn cache(&self) -> &OutputCache;
    fn cache_mut(&mut self) -> &mut OutputCache;

    /// Deep copy of the configuration with an empty cache.
    fn clone_uncached(&self) -> Filter;

    /// Projected cache size in bytes for `n_objects` input elements, or
    /// `None` when the size cannot be estimated.
    fn cache_bytes(&self, n_objects: usize) -> Option<usize>;

    /// Structural pre-pass run top-down before the refresh proper, so that
    /// cheap metadata (notably range streams) is visible to children during
    /// their own `init`. Must do no heavy work.
    fn init(&mut self, _inputs: &[FilterStream], _self_id: FilterId) -> StreamList {
        StreamList::new()
    }

    /// The heavy pass: consume `inputs`, produce outputs. Implementations
    /// poll `ctx` for cancellation at the standard stride and must release
    /// partial results before returning an error.
    fn refresh(
        &mut self,
        inputs: &[FilterStream],
        self_id: FilterId,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<StreamList, FilterError>;

    fn properties(&self) -> Vec<PropertySet>;

    /// Applies a property change. Implementations must clear the cache
    /// before returning `needs_refresh` for any change that affects computed
    /// output; presentation-only changes may instead mutate the cached
    /// streams in place and keep the cache.
    fn set_property(&mut self, key: u32, value: &PropertyValue) -> PropertyOutcome;

    /// Re-emits the valid cache in place of a refresh. Filters that pair
    /// their cached outputs with an always-rebuilt transient companion (the
    /// ion-colour bar) override this to append it on every delivery.
    fn emit_cached(&self, _self_id: FilterId) -> StreamList {
        self.cache().emit()
    }

    /// Stream kinds this filter consumes during refresh.
    fn use_mask(&self) -> StreamMask;
    /// Stream kinds this filter prevents from propagating to its children.
    fn block_mask(&self) -> StreamMask;
    /// Stream kinds this filter can emit.
    fn emit_mask(&self) -> StreamMask;

    /// True for filters that can run arbitrary commands or otherwise reach
    /// outside the process.
    fn is_hazardous(&self) -> bool {
        false
    }

    /// Key/value pairs persisted into state files.
    fn state_tags(&self) -> Vec<(&'static str, String)>;
    /// Restores one persisted key/value pair.
    fn restore_tag(&mut self, tag: &str, value: &str, state: &StateContext)
        -> Result<(), StateError>;
}

/// A filter node: the tagged union the tree stores directly.
#[derive(Debug, Clone)]
pub enum Filter {
    DataLoad(DataLoadFilter),
    Ranging(RangingFilter),
    Spectrum(SpectrumFilter),
    IonColour(IonColourFilter),
    ExternalProgram(ExternalProgramFilter),
}

impl Filter {
    pub fn ops(&self) -> &dyn FilterOps {
        match self {
            Filter::DataLoad(f) => f,
            Filter::Ranging(f) => f,
            Filter::Spectrum(f) => f,
            Filter::IonColour(f) => f,
            Filter::ExternalProgram(f) => f,
        }
    }

    pub fn ops_mut(&mut self) -> &mut dyn FilterOps {
        match self {
            Filter::DataLoad(f) => f,
            Filter::Ranging(f) => f,
            Filter::Spectrum(f) => f,
            Filter::IonColour(f) => f,
            Filter::ExternalProgram(f) => f,
        }
    }

    /// A default-configured filter of the given kind, used when loading
    /// persisted state.
    pub fn default_of_kind(kind: FilterKind) -> Filter {
        match kind {
            FilterKind::DataLoad => Filter::DataLoad(DataLoadFilter::new()),
            FilterKind::Ranging => Filter::Ranging(RangingFilter::new()),
            FilterKind::Spectrum => Filter::Spectrum(SpectrumFilter::new()),
            FilterKind::IonColour => Filter::IonColour(IonColourFilter::new()),
            FilterKind::ExternalProgram => Filter::ExternalProgram(ExternalProgramFilter::new()),
        }
    }

    pub fn kind(&self) -> FilterKind {
        self.ops().kind()
    }

    pub fn label(&self) -> &str {
        self.ops().label()
    }

    pub fn set_label(&mut self, label: &str) {
        self.ops_mut().set_label(label)
    }

    pub fn clone_uncached(&self) -> Filter {
        self.ops().clone_uncached()
    }

    pub fn cache_bytes(&self, n_objects: usize) -> Option<usize> {
        self.ops().cache_bytes(n_objects)
    }

    pub fn cache_enabled(&self) -> bool {
        self.ops().cache().enabled()
    }

    pub fn set_cache_enabled(&mut self, enabled: bool) {
        self.ops_mut().cache_mut().set_enabled(enabled)
    }

    pub fn cache_valid(&self) -> bool {
        self.ops().cache().is_valid()
    }

    pub fn clear_cache(&mut self) {
        self.ops_mut().cache_mut().clear()
    }

    pub fn init(&mut self, inputs: &[FilterStream], self_id: FilterId) -> StreamList {
        self.ops_mut().init(inputs, self_id)
    }

    pub fn refresh(
        &mut self,
        inputs: &[FilterStream],
        self_id: FilterId,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<StreamList, FilterError> {
        self.ops_mut().refresh(inputs, self_id, ctx)
    }

    pub fn properties(&self) -> Vec<PropertySet> {
        self.ops().properties()
    }

    pub fn set_property(&mut self, key: u32, value: &PropertyValue) -> PropertyOutcome {
        self.ops_mut().set_property(key, value)
    }

    pub fn emit_cached(&self, self_id: FilterId) -> StreamList {
        self.ops().emit_cached(self_id)
    }

    pub fn use_mask(&self) -> StreamMask {
        self.ops().use_mask()
    }

    pub fn block_mask(&self) -> StreamMask {
        self.ops().block_mask()
    }

    pub fn emit_mask(&self) -> StreamMask {
        self.ops().emit_mask()
    }

    pub fn is_hazardous(&self) -> bool {
        self.ops().is_hazardous()
    }

    pub fn state_tags(&self) -> Vec<(&'static str, String)> {
        self.ops().state_tags()
    }

    pub fn restore_tag(
        &mut self,
        tag: &str,
        value: &str,
        state: &StateContext,
    ) -> Result<(), StateError> {
        self.ops_mut().restore_tag(tag, value, state)
    }
}
