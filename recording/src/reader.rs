use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;

use crate::errors::ReadError;
use crate::records::{Header, TimedRecord};

/// Streaming reader over a `.pixrec` file: validates the header up front,
/// then yields records one at a time. The replay driver sits on top of this.
pub struct RecordingReader<R: Read> {
    gz: GzDecoder<R>,
    pub header: Header,
}

impl RecordingReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> RecordingReader<R> {
    pub fn new(reader: R) -> Result<Self, ReadError> {
        let mut gz = GzDecoder::new(reader);
        let header = Header::decode_from(&mut gz)?;
        Ok(Self { gz, header })
    }

    /// The sanitized label the writer stored in the gzip member name.
    pub fn label(&self) -> Option<&str> {
        self.gz
            .header()
            .and_then(|h| h.filename())
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn comment(&self) -> Option<&str> {
        self.gz
            .header()
            .and_then(|h| h.comment())
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

impl<R: Read> Iterator for RecordingReader<R> {
    type Item = Result<TimedRecord, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        TimedRecord::decode_from(&mut self.gz).transpose()
    }
}
