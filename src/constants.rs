/// Number of work items (ions, records, lines) processed between progress
/// updates and cancellation checks in long-running loops.
pub const PROGRESS_REDUCE: usize = 5000;

/// Loaders always produce 4-column records (x, y, z, value).
pub const POS_OUTPUT_COLS: usize = 4;

/// Default sampling limit for data-load filters: 5 MiB worth of records.
pub const MAX_IONS_LOAD_DEFAULT: usize = 5 * 1024 * 1024 / (4 * 4);

/// Hard cap on spectrum bin count when extrema are set by hand.
pub const SPECTRUM_MAX_BINS: usize = 1_000_000;

/// Lower bin cap used in auto-extrema mode, where a single stray data point
/// can otherwise blow out the plot domain.
pub const SPECTRUM_AUTO_MAX_BINS: usize = 25_000;

/// Maximum number of discrete colour steps in the ion-colour filter.
pub const MAX_COLOUR_STEPS: usize = 256;
