mod errors;
mod reader;
mod records;
mod writer;

pub use crate::errors::ReadError;
pub use crate::reader::RecordingReader;
pub use crate::records::{Header, Record, TimedRecord, FILE_EXTENSION, FORMAT_VERSION, MAGIC};
pub use crate::writer::RecordingWriter;
