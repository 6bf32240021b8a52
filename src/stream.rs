//! The tagged payloads that flow between filters, and the kind masks the
//! engine uses to reason about them statically.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::plot::{PlotBounds, PlotRegionSeed};
use crate::range::RangeTable;
use crate::types::{BoundingBox, Colour, IonHit, Point3};

/// Stable identifier of a filter node within a tree. External consumers (a
/// UI, a plot region) refer to filters by this id rather than by reference;
/// the tree resolves ids back to nodes on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterId(pub(crate) u64);

impl Display for FilterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "filter#{}", self.0)
    }
}

impl FilterId {
    /// A placeholder id for streams synthesised outside any tree (tests,
    /// ad-hoc pipelines).
    pub const DETACHED: FilterId = FilterId(u64::MAX);
}

/// Discriminates the payload types a stream can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Ions,
    Plot,
    Draw,
    Range,
    Voxel,
}

bitflags! {
    /// A set of [`StreamKind`]s; filters advertise which kinds they consume,
    /// block and emit so the engine can route pass-through streams without
    /// invoking them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamMask: u32 {
        const IONS  = 1 << 0;
        const PLOT  = 1 << 1;
        const DRAW  = 1 << 2;
        const RANGE = 1 << 3;
        const VOXEL = 1 << 4;
    }
}

impl From<StreamKind> for StreamMask {
    fn from(kind: StreamKind) -> StreamMask {
        match kind {
            StreamKind::Ions => StreamMask::IONS,
            StreamKind::Plot => StreamMask::PLOT,
            StreamKind::Draw => StreamMask::DRAW,
            StreamKind::Range => StreamMask::RANGE,
            StreamKind::Voxel => StreamMask::VOXEL,
        }
    }
}

/// A set of ion hits with shared presentation attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct IonStream {
    pub data: Vec<IonHit>,
    pub colour: Colour,
    /// Point size hint for renderers.
    pub ion_size: f32,
    /// What the scalar value of each hit means, eg "Mass-to-Charge (amu/e)".
    pub value_label: String,
}

impl IonStream {
    pub fn new(data: Vec<IonHit>) -> IonStream {
        IonStream {
            data,
            colour: Colour::rgb(1.0, 0.0, 0.0),
            ion_size: 2.0,
            value_label: "Mass-to-Charge (amu/e)".to_string(),
        }
    }
}

/// Styles a 1-D plot trace can be drawn in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotStyle {
    Lines,
    Bars,
    Steps,
    Stem,
    Points,
}

impl PlotStyle {
    pub const ALL: [PlotStyle; 5] = [
        PlotStyle::Lines,
        PlotStyle::Bars,
        PlotStyle::Steps,
        PlotStyle::Stem,
        PlotStyle::Points,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            PlotStyle::Lines => "Lines",
            PlotStyle::Bars => "Bars",
            PlotStyle::Steps => "Steps",
            PlotStyle::Stem => "Stem",
            PlotStyle::Points => "Points",
        }
    }

    pub fn from_label(label: &str) -> Option<PlotStyle> {
        PlotStyle::ALL.iter().copied().find(|s| s.label() == label)
    }
}

/// One 1-D data series destined for the plot subsystem, with any region
/// annotations attached by upstream range filters.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotStream {
    pub xy: Vec<(f32, f32)>,
    pub y_err: Vec<f32>,
    pub x_label: String,
    pub y_label: String,
    pub title: String,
    pub colour: Colour,
    pub style: PlotStyle,
    pub log_y: bool,
    /// Hard display bounds; `min_y` is clamped to at most 1 when `log_y` is
    /// set so log(0) bins stay presentable.
    pub hard_bounds: PlotBounds,
    /// Which of the producer's plots this is, for stable UI identity.
    pub plot_index: usize,
    pub regions: Vec<PlotRegionSeed>,
}

impl PlotStream {
    pub fn new(xy: Vec<(f32, f32)>) -> PlotStream {
        PlotStream {
            xy,
            y_err: Vec::new(),
            x_label: String::new(),
            y_label: String::new(),
            title: String::new(),
            colour: Colour::rgb(0.0, 0.0, 1.0),
            style: PlotStyle::Lines,
            log_y: false,
            hard_bounds: PlotBounds::new_inverse(),
            plot_index: 0,
            regions: Vec::new(),
        }
    }
}

/// Geometric primitives handed to an external draw consumer. The pipeline
/// only transports these; rendering is out of scope.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawPrimitive {
    Point {
        origin: Point3,
        colour: Colour,
    },
    Line {
        start: Point3,
        end: Point3,
        colour: Colour,
    },
    /// An on-screen colour legend described by its colour steps.
    ColourBar {
        colours: Vec<Colour>,
        min: f32,
        max: f32,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DrawStream {
    pub primitives: Vec<DrawPrimitive>,
}

/// A const view of a range filter's table plus its enable bitmaps, so
/// downstream consumers (eg the spectrum filter) can draw region overlays.
/// Consumers must treat the table as immutable; it is owned by the producing
/// filter.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeStream {
    pub table: Arc<RangeTable>,
    pub enabled_ranges: Vec<bool>,
    pub enabled_ions: Vec<bool>,
}

/// A scalar field sampled on a regular grid.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelStream {
    pub data: Vec<f32>,
    pub dims: [usize; 3],
    pub bounds: BoundingBox,
}

/// The tagged union of pipeline payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPayload {
    Ions(Arc<IonStream>),
    Plot(Arc<PlotStream>),
    Draw(Arc<DrawStream>),
    Range(Arc<RangeStream>),
    Voxel(Arc<VoxelStream>),
}

impl StreamPayload {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamPayload::Ions(_) => StreamKind::Ions,
            StreamPayload::Plot(_) => StreamKind::Plot,
            StreamPayload::Draw(_) => StreamKind::Draw,
            StreamPayload::Range(_) => StreamKind::Range,
            StreamPayload::Voxel(_) => StreamKind::Voxel,
        }
    }

    /// Number of addressable elements in the payload, used for cache-budget
    /// projections and progress totals.
    pub fn num_elements(&self) -> usize {
        match self {
            StreamPayload::Ions(s) => s.data.len(),
            StreamPayload::Plot(s) => s.xy.len(),
            StreamPayload::Draw(s) => s.primitives.len(),
            StreamPayload::Range(s) => s.table.num_ranges(),
            StreamPayload::Voxel(s) => s.data.len(),
        }
    }
}

/// One value travelling down the tree: a payload, the id of the filter that
/// produced it, and whether the storage is owned by that filter's cache.
///
/// `cached` streams must be treated as immutable by consumers and survive the
/// refresh; uncached streams are transient and dropped by
/// [`crate::tree::FilterTree::safe_delete`].
#[derive(Debug, Clone, PartialEq)]
pub struct FilterStream {
    pub payload: StreamPayload,
    pub cached: bool,
    pub producer: FilterId,
}

impl FilterStream {
    pub fn transient(payload: StreamPayload, producer: FilterId) -> FilterStream {
        FilterStream {
            payload,
            cached: false,
            producer,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.payload.kind()
    }

    pub fn expect_ions(&self) -> Option<&IonStream> {
        match &self.payload {
            StreamPayload::Ions(ions) => Some(ions),
            _ => None,
        }
    }

    pub fn expect_plot(&self) -> Option<&PlotStream> {
        match &self.payload {
            StreamPayload::Plot(plot) => Some(plot),
            _ => None,
        }
    }

    pub fn expect_range(&self) -> Option<&RangeStream> {
        match &self.payload {
            StreamPayload::Range(range) => Some(range),
            _ => None,
        }
    }
}

/// The short list of streams a node emits or receives. Almost always a
/// handful of entries, so spill to the heap only past eight.
pub type StreamList = SmallVec<[FilterStream; 8]>;

/// Sums the ion counts across a set of streams.
pub fn total_ions(streams: &[FilterStream]) -> usize {
    streams
        .iter()
        .filter_map(|s| s.expect_ions())
        .map(|ions| ions.data.len())
        .sum()
}
