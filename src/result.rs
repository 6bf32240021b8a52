use std::io;

use thiserror::Error;

/// A unified `Result` type alias for operations that can fail anywhere in the
/// pipeline: file I/O, range parsing, filter refreshes or state persistence.
pub type AptResult<T> = Result<T, AptError>;

/// Crate-level error; each layer of the pipeline has its own more precise
/// error enum which converts into this one.
#[derive(Debug, Error)]
pub enum AptError {
    #[error("an I/O error occurred: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors produced by the ion loaders (binary POS and delimited text).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error opening ion file: {source}")]
    Open { source: io::Error },
    #[error("ion file is empty")]
    Empty,
    #[error("ion file size ({file_size} bytes) is not a whole number of {record_size}-byte records")]
    SizeModulus { file_size: u64, record_size: usize },
    #[error("error reading from ion file (after open): {source}")]
    Read { source: io::Error },
    #[error("error writing ion file: {source}")]
    Write { source: io::Error },
    #[error("found NaN value in ion file")]
    NanFound,
    #[error("column selection exceeds the input column count")]
    ColumnSelection,
    #[error("unable to allocate memory to store ion data")]
    Alloc,
    #[error("ion load aborted by interrupt")]
    Aborted,
    #[error("no numerical data found; file appears to be all header")]
    OnlyHeader,
    #[error("error interpreting field on line {line}")]
    BadField { line: usize },
    #[error("incorrect number of fields on line {line}")]
    FieldCount { line: usize },
}

impl LoadError {
    pub(crate) fn open(source: io::Error) -> LoadError {
        LoadError::Open { source }
    }

    pub(crate) fn read(source: io::Error) -> LoadError {
        LoadError::Read { source }
    }
}

/// Errors produced while parsing or manipulating range files.
///
/// The `Format*` variants are granular parse failures; the `Data*`-flavoured
/// variants (`Flipped` onward) are semantic rejections of data that parsed
/// cleanly.
#[derive(Debug, Error)]
pub enum RangeError {
    #[error("error opening file, check name and permissions: {source}")]
    Open { source: io::Error },
    #[error("error interpreting range file header, expecting ion count and range count")]
    Header,
    #[error("range file appears to be empty")]
    Empty,
    #[error("error reading the long name for an ion")]
    LongName,
    #[error("error reading the short name for an ion")]
    ShortName,
    #[error("error reading colour data, expecting 3 decimal values, space separated")]
    Colour,
    #[error("did not find the table separator line (line with dashes)")]
    TableSeparator,
    #[error("unexpected failure whilst skipping range row lead-in characters")]
    RangeLeadIn,
    #[error("unable to read range start and end values")]
    MassPair,
    #[error("unable to read range table entry")]
    TableEntry,
    #[error("unexpected format; are you sure this is a proper range file?")]
    Format,
    #[error("range start and end values are reversed or equal")]
    Flipped,
    #[error("range overlaps, nests or straddles another range")]
    Overlap,
    #[error("too many ranges had no usable data (eg, all-zero multiplicity)")]
    TooManyUselessRanges,
    #[error("range file is inconsistent (eg, overlapping ranges)")]
    Inconsistent,
    #[error("no ion name mapping found for multiple ion")]
    NoMappedIonName,
}

impl RangeError {
    pub(crate) fn open(source: io::Error) -> RangeError {
        RangeError::Open { source }
    }
}

/// Errors returned by a filter's `refresh`.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("refresh aborted by interrupt")]
    Aborted,
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("insufficient memory for filter output")]
    Alloc,
    #[error("command line is empty after substitution")]
    CommandLineEmpty,
    #[error("unrecognised substitution `%{token}` in command line")]
    Substitute { token: char },
    #[error("unable to create working directory: {source}")]
    WorkDir { source: io::Error },
    #[error("failed to launch external command: {source}")]
    Spawn { source: io::Error },
    #[error("external command exited with failure status {status}")]
    CommandFailed { status: i32 },
    #[error("unable to write intermediate file: {source}")]
    Intermediate { source: io::Error },
    #[error("unable to interpret file left by external program: {path}")]
    OutputRead { path: String },
}

/// Errors raised while saving or loading persisted filter-tree state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("an I/O error occurred: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
    #[error("malformed state XML: {source}")]
    Xml {
        #[from]
        source: quick_xml::Error,
    },
    #[error("malformed state file: {description}")]
    Malformed { description: String },
    #[error("state file names an unknown filter type `{name}`")]
    UnknownFilter { name: String },
}

/// Constructs a `StateError::Malformed` wrapped in `Err`; useful when a
/// deserialiser discovers structurally invalid input.
pub(crate) fn state_error<T, S: Into<String>>(description: S) -> Result<T, StateError> {
    Err(StateError::Malformed {
        description: description.into(),
    })
}
