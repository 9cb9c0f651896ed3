//! Wire codecs: line scanning and the two message body framings.

pub mod bdat;
pub mod dot;
pub mod line;

pub use bdat::{BdatReader, BdatWriter, ChunkHeader, ChunkLimits, Progress};
pub use dot::{DotDecoder, DotEncoder, DotReader, DotWriter};
pub use line::{DEFAULT_MAX_LINE_LENGTH, copy_span, read_line};
