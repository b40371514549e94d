use std::sync::{Arc, Mutex};

use canvas::{Canvas, CanvasListener, Color, Point, Rect};
use tracing::warn;

/// Stand-in for the real chunked canvas: keeps the subscriber set and fans
/// events out sequentially, with no pixel storage of its own. Sequential
/// fan-out per listener is what keeps a recording's record order meaningful.
pub struct RelayCanvas {
    listeners: Mutex<Vec<Arc<dyn CanvasListener>>>,
}

impl RelayCanvas {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl Canvas for RelayCanvas {
    fn chunk_size(&self) -> (u32, u32) {
        session::CHUNK_SIZE
    }

    fn origin(&self) -> Point {
        Point::default()
    }

    fn subscribe_listener(&self, listener: Arc<dyn CanvasListener>, _manage_virtual_chunks: bool) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn unsubscribe_listener(&self, listener: &Arc<dyn CanvasListener>) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|other| !Arc::ptr_eq(other, listener));
    }

    fn register_rects(&self, _listener: &Arc<dyn CanvasListener>, _rects: &[Rect]) {
        // nothing tracks interest here; every listener sees every event
    }

    fn set_pixel(&self, pos: Point, color: Color) {
        for listener in self.listeners.lock().unwrap().iter() {
            if let Err(err) = listener.handle_set_pixel(pos, color, 0) {
                warn!(error = %err, "listener dropped a pixel event");
            }
        }
    }

    fn invalidate_all(&self) {
        for listener in self.listeners.lock().unwrap().iter() {
            if let Err(err) = listener.handle_invalidate_all() {
                warn!(error = %err, "listener dropped an invalidate-all event");
            }
        }
    }
}
