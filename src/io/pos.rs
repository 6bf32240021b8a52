//! Reader and writer for binary POS ion files.
//!
//! A POS file is a headerless stream of records, each `n` big-endian IEEE-754
//! f32 values (`n` = 4 in the classic layout: x, y, z, mass-to-charge). The
//! reader can remap an arbitrary input column order onto the 4 output
//! columns, and can either stream the whole file or seek-read a uniform
//! sample of it.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::constants::POS_OUTPUT_COLS;
use crate::io::sample::select_indices;
use crate::progress::{ProgressTicker, RefreshContext};
use crate::result::LoadError;
use crate::types::IonHit;

/// Records streamed per read in the full-load path.
const RECORDS_PER_BLOCK: usize = 512;

/// Describes how input columns populate the four output columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    /// Number of f32 columns per input record.
    pub input_cols: usize,
    /// For each output column, the input column feeding it.
    pub selected: [usize; POS_OUTPUT_COLS],
}

impl ColumnMap {
    /// The classic 4-column x/y/z/mass layout.
    pub fn identity() -> ColumnMap {
        ColumnMap {
            input_cols: POS_OUTPUT_COLS,
            selected: [0, 1, 2, 3],
        }
    }

    /// Builds a map, rejecting any selection outside the input width.
    pub fn new(input_cols: usize, selected: [usize; POS_OUTPUT_COLS]) -> Option<ColumnMap> {
        if input_cols == 0 || selected.iter().any(|&s| s >= input_cols) {
            return None;
        }
        Some(ColumnMap {
            input_cols,
            selected,
        })
    }

    pub(crate) fn record_bytes(&self) -> usize {
        self.input_cols * 4
    }

    /// Highest input column index any output draws from.
    pub(crate) fn max_selected(&self) -> usize {
        *self.selected.iter().max().expect("selected is non-empty")
    }

    fn decode(&self, record: &[u8]) -> IonHit {
        let mut cols = [0.0f32; POS_OUTPUT_COLS];
        for (out, &src) in cols.iter_mut().zip(&self.selected) {
            let offset = src * 4;
            *out = f32::from_be_bytes([
                record[offset],
                record[offset + 1],
                record[offset + 2],
                record[offset + 3],
            ]);
        }
        IonHit::from_columns(cols)
    }
}

impl Default for ColumnMap {
    fn default() -> ColumnMap {
        ColumnMap::identity()
    }
}

/// Loads a POS file. With `limit` below the file's record count, a uniform
/// sample of exactly `limit` records is loaded instead of the whole file;
/// sampled indices are visited in ascending order so the disk access pattern
/// stays monotonic.
pub fn load_pos(
    path: &Path,
    map: &ColumnMap,
    limit: Option<usize>,
    strong_random: bool,
    ctx: &mut RefreshContext<'_>,
) -> Result<Vec<IonHit>, LoadError> {
    let mut file = File::open(path).map_err(LoadError::open)?;
    let file_size = file.metadata().map_err(LoadError::open)?.len();
    if file_size == 0 {
        return Err(LoadError::Empty);
    }
    let record_bytes = map.record_bytes();
    if file_size % record_bytes as u64 != 0 {
        return Err(LoadError::SizeModulus {
            file_size,
            record_size: record_bytes,
        });
    }
    let total = (file_size / record_bytes as u64) as usize;

    match limit {
        Some(limit) if limit < total => {
            load_sampled(&mut file, map, total, limit, strong_random, ctx)
        }
        _ => load_all(&mut file, map, total, ctx),
    }
}

fn load_all(
    file: &mut File,
    map: &ColumnMap,
    total: usize,
    ctx: &mut RefreshContext<'_>,
) -> Result<Vec<IonHit>, LoadError> {
    let record_bytes = map.record_bytes();
    let mut ions = Vec::new();
    ions.try_reserve_exact(total).map_err(|_| LoadError::Alloc)?;

    let mut buffer = vec![0u8; record_bytes * RECORDS_PER_BLOCK];
    let mut ticker = ProgressTicker::new(total);
    let mut remaining = total;
    while remaining > 0 {
        let batch = remaining.min(RECORDS_PER_BLOCK);
        let block = &mut buffer[..batch * record_bytes];
        file.read_exact(block).map_err(LoadError::read)?;
        for record in block.chunks_exact(record_bytes) {
            let ion = map.decode(record);
            if ion.has_nan() {
                return Err(LoadError::NanFound);
            }
            ions.push(ion);
            if !ticker.tick(ctx) {
                return Err(LoadError::Aborted);
            }
        }
        remaining -= batch;
    }
    Ok(ions)
}

fn load_sampled(
    file: &mut File,
    map: &ColumnMap,
    total: usize,
    want: usize,
    strong_random: bool,
    ctx: &mut RefreshContext<'_>,
) -> Result<Vec<IonHit>, LoadError> {
    let record_bytes = map.record_bytes();
    let indices = select_indices(total, want, strong_random);

    let mut ions = Vec::new();
    ions.try_reserve_exact(indices.len())
        .map_err(|_| LoadError::Alloc)?;

    let mut record = vec![0u8; record_bytes];
    let mut ticker = ProgressTicker::new(indices.len());
    let mut position = 0u64;
    for &index in &indices {
        let target = index as u64 * record_bytes as u64;
        if position != target {
            file.seek(SeekFrom::Start(target)).map_err(LoadError::read)?;
        }
        file.read_exact(&mut record).map_err(LoadError::read)?;
        position = target + record_bytes as u64;

        let ion = map.decode(&record);
        if ion.has_nan() {
            return Err(LoadError::NanFound);
        }
        ions.push(ion);
        if !ticker.tick(ctx) {
            return Err(LoadError::Aborted);
        }
    }
    Ok(ions)
}

/// Writes ions as classic 4-column big-endian POS records, replacing any
/// existing file.
pub fn write_pos(path: &Path, ions: &[IonHit]) -> Result<(), LoadError> {
    let file = File::create(path).map_err(|source| LoadError::Write { source })?;
    write_records(file, ions)
}

/// Appends ions to a POS file, creating it if needed.
pub fn append_pos(path: &Path, ions: &[IonHit]) -> Result<(), LoadError> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|source| LoadError::Write { source })?;
    write_records(file, ions)
}

fn write_records(file: File, ions: &[IonHit]) -> Result<(), LoadError> {
    let mut writer = BufWriter::new(file);
    for ion in ions {
        writer
            .write_all(&ion.to_be_record())
            .map_err(|source| LoadError::Write { source })?;
    }
    writer
        .flush()
        .map_err(|source| LoadError::Write { source })
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;
    use crate::progress::run_unwatched;
    use crate::types::Point3;

    fn counting_ions(n: usize) -> Vec<IonHit> {
        (0..n)
            .map(|i| {
                let v = i as f32;
                IonHit::new(Point3::new(v, v, v), v)
            })
            .collect()
    }

    #[test]
    fn round_trip_133_records() {
        let ions = counting_ions(133);
        let file = NamedTempFile::new().unwrap();
        write_pos(file.path(), &ions).unwrap();

        let loaded = run_unwatched(|ctx| {
            load_pos(file.path(), &ColumnMap::identity(), None, false, ctx)
        })
        .unwrap();
        assert_eq!(loaded, ions);

        // And the bytes on disk are exactly the big-endian records
        let raw = std::fs::read(file.path()).unwrap();
        assert_eq!(raw.len(), 133 * 16);
        assert_eq!(&raw[..16], &ions[0].to_be_record());
    }

    #[test]
    fn empty_file_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        let result =
            run_unwatched(|ctx| load_pos(file.path(), &ColumnMap::identity(), None, false, ctx));
        assert!(matches!(result, Err(LoadError::Empty)));
    }

    #[test]
    fn ragged_file_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [0u8; 16 * 3 + 5]).unwrap();
        let result =
            run_unwatched(|ctx| load_pos(file.path(), &ColumnMap::identity(), None, false, ctx));
        assert!(matches!(result, Err(LoadError::SizeModulus { .. })));
    }

    #[test]
    fn nan_is_rejected() {
        let mut ions = counting_ions(10);
        ions[7].mass = f32::NAN;
        let file = NamedTempFile::new().unwrap();
        write_pos(file.path(), &ions).unwrap();
        let result =
            run_unwatched(|ctx| load_pos(file.path(), &ColumnMap::identity(), None, false, ctx));
        assert!(matches!(result, Err(LoadError::NanFound)));
    }

    #[test]
    fn sampled_load_returns_exact_records() {
        let ions = counting_ions(1000);
        let file = NamedTempFile::new().unwrap();
        write_pos(file.path(), &ions).unwrap();

        let loaded = run_unwatched(|ctx| {
            load_pos(file.path(), &ColumnMap::identity(), Some(64), false, ctx)
        })
        .unwrap();
        assert_eq!(loaded.len(), 64);
        // Each sampled hit is bit-identical to the record at its index, and
        // the ascending visit order shows in the values.
        assert!(loaded.windows(2).all(|w| w[0].mass < w[1].mass));
        for ion in &loaded {
            assert_eq!(ions[ion.mass as usize], *ion);
        }
    }

    #[test]
    fn limit_at_or_above_total_loads_everything() {
        let ions = counting_ions(20);
        let file = NamedTempFile::new().unwrap();
        write_pos(file.path(), &ions).unwrap();
        let loaded = run_unwatched(|ctx| {
            load_pos(file.path(), &ColumnMap::identity(), Some(20), false, ctx)
        })
        .unwrap();
        assert_eq!(loaded, ions);
    }

    #[test]
    fn column_remap_selects_input_columns() {
        // 5-column records: [a, x, y, z, m]; select columns 1..=4
        let file = NamedTempFile::new().unwrap();
        let mut raw = Vec::new();
        for i in 0..4u32 {
            for col in 0..5u32 {
                raw.extend_from_slice(&((i * 10 + col) as f32).to_be_bytes());
            }
        }
        std::fs::write(file.path(), &raw).unwrap();

        let map = ColumnMap::new(5, [1, 2, 3, 4]).unwrap();
        let loaded = run_unwatched(|ctx| load_pos(file.path(), &map, None, false, ctx)).unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded[2].pos, Point3::new(21.0, 22.0, 23.0));
        assert_eq!(loaded[2].mass, 24.0);
    }

    #[test]
    fn bad_column_map_is_rejected() {
        assert!(ColumnMap::new(4, [0, 1, 2, 4]).is_none());
        assert!(ColumnMap::new(0, [0, 0, 0, 0]).is_none());
    }
}
