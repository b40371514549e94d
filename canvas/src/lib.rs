//! Shared canvas types and the listener contract.
//!
//! The chunked canvas itself lives outside this workspace; these are the
//! types and traits through which the live client and the recorder talk to
//! it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use image::RgbaImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Half-open rectangle: `min` is inside, `max` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub min: Point,
    pub max: Point,
}

impl Rect {
    pub fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min: Point::new(min_x, min_y),
            max: Point::new(max_x, max_y),
        }
    }
}

/// A color with 16 bits per channel, the precision events are delivered at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u16,
    pub g: u16,
    pub b: u16,
    pub a: u16,
}

impl Color {
    /// Widens each 8-bit channel into 16 bits (`c<<8 | c`), fully opaque.
    pub fn from_rgb8(r: u8, g: u8, b: u8) -> Self {
        fn widen(c: u8) -> u16 {
            (c as u16) << 8 | c as u16
        }
        Self {
            r: widen(r),
            g: widen(g),
            b: widen(b),
            a: u16::MAX,
        }
    }

    /// Reduces to 8 bits per channel by truncating the low byte, dropping
    /// alpha. Truncation, not rounding: recorded values must stay bit-exact.
    pub fn to_rgb8(self) -> (u8, u8, u8) {
        ((self.r >> 8) as u8, (self.g >> 8) as u8, (self.b >> 8) as u8)
    }
}

/// Why a listener refused or failed to handle an event.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listener was closed; the event is simply dropped.
    #[error("listener is closed")]
    Closed,
    #[error("can't write to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A subscriber to canvas events. The canvas invokes these sequentially for
/// any one listener; callers log errors and keep dispatching.
pub trait CanvasListener: Send + Sync {
    fn handle_set_pixel(&self, pos: Point, color: Color, vc_id: i32) -> Result<(), ListenerError>;

    fn handle_invalidate_rect(&self, rect: Rect, vc_ids: &[i32]) -> Result<(), ListenerError>;

    fn handle_invalidate_all(&self) -> Result<(), ListenerError>;

    fn handle_revalidate_rect(&self, rect: Rect, vc_ids: &[i32]) -> Result<(), ListenerError>;

    /// The canvas is about to (re)download the given region.
    fn handle_signal_download(&self, rect: Rect, vc_ids: &[i32]) -> Result<(), ListenerError>;

    /// A rectangular image placed with its top-left corner at `origin`.
    /// `valid` is false while the image is known to be out of sync.
    fn handle_set_image(
        &self,
        origin: Point,
        image: &RgbaImage,
        valid: bool,
        vc_ids: &[i32],
    ) -> Result<(), ListenerError>;

    fn handle_chunks_change(
        &self,
        created: &HashMap<Rect, i32>,
        removed: &HashMap<Rect, i32>,
    ) -> Result<(), ListenerError>;

    fn handle_set_time(&self, time: DateTime<Utc>) -> Result<(), ListenerError>;
}

/// The surface of the external chunked canvas that this workspace consumes:
/// subscription bookkeeping for listeners and the write side driven by the
/// live connection.
pub trait Canvas: Send + Sync {
    /// Width and height of one chunk in pixels.
    fn chunk_size(&self) -> (u32, u32);

    /// Origin offset of the chunk grid.
    fn origin(&self) -> Point;

    /// `manage_virtual_chunks` false means the listener receives raw events
    /// only, with no canvas-side chunk bookkeeping on its behalf.
    fn subscribe_listener(&self, listener: Arc<dyn CanvasListener>, manage_virtual_chunks: bool);

    fn unsubscribe_listener(&self, listener: &Arc<dyn CanvasListener>);

    /// Registers the rectangles the listener is interested in.
    fn register_rects(&self, listener: &Arc<dyn CanvasListener>, rects: &[Rect]);

    fn set_pixel(&self, pos: Point, color: Color);

    fn invalidate_all(&self);
}
