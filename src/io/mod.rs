//! Ion file I/O: the binary POS reader/writer and the delimited-text reader,
//! both with full and uniformly-sampled load modes.

mod pos;
mod sample;
mod text;

pub use pos::{append_pos, load_pos, write_pos, ColumnMap};
pub use sample::select_indices;
pub use text::{load_text, DEFAULT_TEXT_DELIMS};
