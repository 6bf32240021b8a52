//! A filter-graph analysis pipeline for atom probe tomography data.
//!
//! The crate covers the data backbone of an APT visualisation tool:
//!
//! - **Ion and range data**: binary POS / delimited-text ion loaders with
//!   uniform sampling, and readers/writers for the three legacy range-file
//!   dialects (ORNL `.rng`, Imago `.rrng`, Rouen `.env`) with format
//!   autodetection and strict post-parse consistency checks.
//! - **The filter tree**: a rooted forest of transformation nodes (data
//!   load, ranging, spectrum, spectral colouring, external program) that
//!   consume and produce typed streams, with per-node result caching,
//!   throttled progress reporting and cooperative cancellation.
//! - **Plots and regions**: 1-D plot models whose draggable regions write
//!   back into the ranging filter that owns them.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use aptflow::filter::{DataLoadFilter, Filter, RangingFilter, SpectrumFilter};
//! use aptflow::progress::run_unwatched;
//! use aptflow::range::RangeFile;
//! use aptflow::tree::FilterTree;
//!
//! # fn main() -> aptflow::AptResult<()> {
//! let ranges = RangeFile::open(Path::new("steel.rrng"), None)?;
//!
//! let mut tree = FilterTree::new();
//! let load = tree
//!     .add_filter(
//!         Filter::DataLoad(DataLoadFilter::for_file(Path::new("run042.pos"))),
//!         None,
//!     )
//!     .unwrap();
//! let ranging = tree
//!     .add_filter(Filter::Ranging(RangingFilter::from_range_file(ranges)), Some(load))
//!     .unwrap();
//! tree.add_filter(Filter::Spectrum(SpectrumFilter::new()), Some(ranging))
//!     .unwrap();
//!
//! let deliveries = run_unwatched(|ctx| tree.refresh(ctx))?;
//! for (leaf, streams) in &deliveries {
//!     println!("{leaf}: {} streams", streams.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod constants;
pub mod filter;
pub mod io;
pub mod plot;
pub mod progress;
pub mod range;
pub mod result;
pub mod state;
pub mod stream;
pub mod tree;
pub mod types;

use std::path::Path;

pub use crate::io::{append_pos, write_pos, ColumnMap};
pub use crate::range::{RangeFile, RangeFormat, RangeTable};
pub use crate::result::{AptError, AptResult};
pub use crate::stream::{FilterId, FilterStream, StreamKind, StreamMask};
pub use crate::tree::FilterTree;
pub use crate::types::{BoundingBox, Colour, IonHit, Point3};

use crate::progress::run_unwatched;
use crate::result::LoadError;

/// Loads a POS file without progress reporting: records of `input_cols`
/// big-endian f32 columns, remapped onto x/y/z/value by `selected`. With
/// `max_ions` below the file's record count, that many records are sampled
/// uniformly instead.
pub fn load_pos(
    path: &Path,
    input_cols: usize,
    selected: [usize; 4],
    max_ions: Option<usize>,
) -> AptResult<Vec<IonHit>> {
    let map = ColumnMap::new(input_cols, selected).ok_or(LoadError::ColumnSelection)?;
    let ions = run_unwatched(|ctx| io::load_pos(path, &map, max_ions, false, ctx))?;
    Ok(ions)
}

/// Loads a delimited text file without progress reporting; `delims` gives
/// the accepted field separators (see [`io::DEFAULT_TEXT_DELIMS`]).
pub fn load_text(
    path: &Path,
    delims: &str,
    input_cols: usize,
    selected: [usize; 4],
    max_ions: Option<usize>,
) -> AptResult<Vec<IonHit>> {
    let map = ColumnMap::new(input_cols, selected).ok_or(LoadError::ColumnSelection)?;
    let ions = run_unwatched(|ctx| io::load_text(path, delims, &map, max_ions, false, ctx))?;
    Ok(ions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convenience_loaders_validate_columns() {
        let err = load_pos(Path::new("/nonexistent"), 4, [0, 1, 2, 9], None).unwrap_err();
        assert!(matches!(
            err,
            AptError::Load(LoadError::ColumnSelection)
        ));
    }
}
