use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use canvas::{Canvas, CanvasListener, Color, ListenerError, Point, Rect};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use image::RgbaImage;
use tracing::{info, warn};

use crate::records::{Header, Record, TimedRecord, FILE_EXTENSION};

const GZIP_COMMENT: &str = "pixrec canvas recording";

/// Subscribes to a canvas and appends every persisted event to a
/// gzip-compressed `.pixrec` file.
///
/// Handlers take the closed flag's read lock, so any number of them may run
/// concurrently with each other; `close` takes it exclusively once. The
/// compressor behind its own mutex is the single-writer boundary, and each
/// record goes through it as one framed write.
pub struct RecordingWriter {
    canvas: Arc<dyn Canvas>,
    path: PathBuf,
    closed: RwLock<bool>,
    zip: Mutex<Option<GzEncoder<File>>>,
}

impl RecordingWriter {
    /// Creates `recordings/<sanitized label>/<UTC time>.pixrec` and
    /// subscribes to the canvas. See [`RecordingWriter::create_in`].
    pub fn create(canvas: Arc<dyn Canvas>, label: &str) -> Result<Arc<Self>, ListenerError> {
        Self::create_in(Path::new("recordings"), canvas, label)
    }

    pub fn create_in(
        base: &Path,
        canvas: Arc<dyn Canvas>,
        label: &str,
    ) -> Result<Arc<Self>, ListenerError> {
        let label = sanitize_label(label);
        let dir = base.join(&label);
        // RFC3339-like, but with the colons dropped so the name is portable
        let file_name = format!(
            "{}.{}",
            Utc::now().format("%Y-%m-%dT%H%M%S"),
            FILE_EXTENSION
        );
        let path = dir.join(file_name);

        fs::create_dir_all(&dir).map_err(|source| ListenerError::Io {
            path: dir.clone(),
            source,
        })?;
        let file = File::create(&path).map_err(|source| ListenerError::Io {
            path: path.clone(),
            source,
        })?;

        let mut zip = GzBuilder::new()
            .filename(label.as_str())
            .comment(GZIP_COMMENT)
            .write(file, Compression::default());

        let (chunk_width, chunk_height) = canvas.chunk_size();
        let origin = canvas.origin();
        let header = Header {
            created_at_nanos: now_nanos(),
            chunk_width,
            chunk_height,
            origin_x: origin.x,
            origin_y: origin.y,
        };
        if let Err(source) = header.encode_into(&mut zip) {
            // closes the compressor and the partly written file
            drop(zip);
            return Err(ListenerError::Io { path, source });
        }

        let writer = Arc::new(RecordingWriter {
            canvas: canvas.clone(),
            path,
            closed: RwLock::new(false),
            zip: Mutex::new(Some(zip)),
        });

        let listener: Arc<dyn CanvasListener> = writer.clone();
        // raw events only, no canvas-managed virtual chunks
        canvas.subscribe_listener(listener, false);

        info!(path = %writer.path.display(), "recording started");
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forwards a rectangle-interest registration to the canvas.
    pub fn set_interest_rects(self: &Arc<Self>, rects: &[Rect]) -> Result<(), ListenerError> {
        let closed = self.closed.read().unwrap();
        if *closed {
            return Err(ListenerError::Closed);
        }
        let listener: Arc<dyn CanvasListener> = self.clone();
        self.canvas.register_rects(&listener, rects);
        Ok(())
    }

    /// Unsubscribes, writes one final InvalidateAll so a replay always ends
    /// in an invalidated state, then seals the file. Call exactly once.
    pub fn close(self: &Arc<Self>) {
        let listener: Arc<dyn CanvasListener> = self.clone();
        self.canvas.unsubscribe_listener(&listener);

        if let Err(err) = self.handle_invalidate_all() {
            warn!(path = %self.path.display(), error = %err, "final invalidate-all not written");
        }

        let mut closed = self.closed.write().unwrap();
        *closed = true;
        drop(closed);

        let zip = self.zip.lock().unwrap().take();
        if let Some(zip) = zip {
            match zip.finish() {
                Ok(file) => drop(file),
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "can't finish compressed stream");
                }
            }
        }
        info!(path = %self.path.display(), "recording closed");
    }

    fn check_open(&self) -> Result<(), ListenerError> {
        if *self.closed.read().unwrap() {
            Err(ListenerError::Closed)
        } else {
            Ok(())
        }
    }

    fn append(&self, record: Record) -> Result<(), ListenerError> {
        // Hold the read lock for the whole write so close can't seal the
        // stream between the check and the append.
        let closed = self.closed.read().unwrap();
        if *closed {
            return Err(ListenerError::Closed);
        }

        let timed = TimedRecord {
            time_nanos: now_nanos(),
            record,
        };
        let mut frame = Vec::new();
        timed
            .encode_into(&mut frame)
            .map_err(|source| self.io_error(source))?;

        let mut zip = self.zip.lock().unwrap();
        match zip.as_mut() {
            Some(zip) => zip
                .write_all(&frame)
                .map_err(|source| self.io_error(source)),
            None => Err(ListenerError::Closed),
        }
    }

    fn io_error(&self, source: io::Error) -> ListenerError {
        ListenerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CanvasListener for RecordingWriter {
    fn handle_set_pixel(&self, pos: Point, color: Color, _vc_id: i32) -> Result<(), ListenerError> {
        let (r, g, b) = color.to_rgb8();
        self.append(Record::SetPixel { pos, r, g, b })
    }

    fn handle_invalidate_rect(&self, rect: Rect, _vc_ids: &[i32]) -> Result<(), ListenerError> {
        self.append(Record::InvalidateRect { rect })
    }

    fn handle_invalidate_all(&self) -> Result<(), ListenerError> {
        self.append(Record::InvalidateAll)
    }

    fn handle_revalidate_rect(&self, rect: Rect, _vc_ids: &[i32]) -> Result<(), ListenerError> {
        self.append(Record::RevalidateRect { rect })
    }

    fn handle_signal_download(&self, _rect: Rect, _vc_ids: &[i32]) -> Result<(), ListenerError> {
        // Not persisted: a replay sees the downloaded data arrive and can
        // synthesize the signal itself.
        self.check_open()
    }

    fn handle_set_image(
        &self,
        origin: Point,
        image: &RgbaImage,
        valid: bool,
        _vc_ids: &[i32],
    ) -> Result<(), ListenerError> {
        self.check_open()?;

        // An out-of-sync image is skipped; a valid one follows later.
        if !valid {
            return Ok(());
        }

        let mut data = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut data), image::ImageOutputFormat::Bmp)
            .map_err(|err| self.io_error(io::Error::new(io::ErrorKind::Other, err)))?;
        self.append(Record::SetImage { origin, data })
    }

    fn handle_chunks_change(
        &self,
        _created: &HashMap<Rect, i32>,
        _removed: &HashMap<Rect, i32>,
    ) -> Result<(), ListenerError> {
        // Not persisted: chunk lifecycle is reconstructible from the
        // recorded events.
        self.check_open()
    }

    fn handle_set_time(&self, _time: DateTime<Utc>) -> Result<(), ListenerError> {
        // Not persisted: every record carries its own timestamp.
        self.check_open()
    }
}

/// Every character outside `[A-Za-z0-9.-]` becomes a `_`.
fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
