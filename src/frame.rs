//! Frame types, the per-stream frame slot, and grid composition.
//!
//! - `Frame`: one decoded RGB8 image with a sequence number.
//! - `FrameSlot`: single-writer/multi-reader holder of a stream's most recent
//!   frame. The writer swaps in a complete `Arc<Frame>`; readers clone the
//!   `Arc`. The lock is held only for the pointer swap, so a slow reader can
//!   never stall the capture loop and no reader can observe a torn frame.
//! - Grid composition: row-major tiling of the latest frame from every
//!   registered stream, with placeholder cells for streams that have no frame.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};

use crate::lock_unpoisoned;

const PLACEHOLDER_BG: [u8; 3] = [18, 18, 18];
const PLACEHOLDER_MARK: [u8; 3] = [176, 44, 44];

/// One decoded video frame. Pixel data is RGB8, row-major, no padding.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic per-source sequence number, for observability and tests.
    pub seq: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, seq: u64) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} RGB8",
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            seq,
        })
    }

    /// Frame filled with a single color.
    pub fn solid(color: [u8; 3], width: u32, height: u32, seq: u64) -> Self {
        let mut data = Vec::with_capacity((width as usize) * (height as usize) * 3);
        for _ in 0..(width as u64) * (height as u64) {
            data.extend_from_slice(&color);
        }
        Self {
            data,
            width,
            height,
            seq,
        }
    }

    /// Scale to the given dimensions. Returns a new frame; `self` keeps its
    /// native size.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        let img = image::RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))?;
        let scaled =
            image::imageops::resize(&img, width, height, image::imageops::FilterType::Triangle);
        Ok(Frame {
            data: scaled.into_raw(),
            width,
            height,
            seq: self.seq,
        })
    }

    /// Encode as JPEG (quality 80). Used by the recorder sink and the API
    /// grid endpoints.
    pub fn to_jpeg(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 80);
        encoder
            .encode(
                &self.data,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| anyhow!("jpeg encode failed: {e}"))?;
        Ok(out)
    }

    fn put_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = ((y as usize) * (self.width as usize) + (x as usize)) * 3;
        self.data[idx..idx + 3].copy_from_slice(&color);
    }
}

/// Placeholder shown for a stream with no frame available: dark background,
/// border, and a diagonal cross so a dead cell is obvious at a glance.
pub fn no_signal_placeholder(width: u32, height: u32) -> Frame {
    let mut frame = Frame::solid(PLACEHOLDER_BG, width.max(1), height.max(1), 0);
    let (w, h) = (frame.width, frame.height);
    for x in 0..w {
        let y = (((x as u64) * (h as u64) / (w as u64)) as u32).min(h - 1);
        frame.put_pixel(x, y, PLACEHOLDER_MARK);
        frame.put_pixel(x, h - 1 - y, PLACEHOLDER_MARK);
    }
    for x in 0..w {
        frame.put_pixel(x, 0, PLACEHOLDER_MARK);
        frame.put_pixel(x, h - 1, PLACEHOLDER_MARK);
    }
    for y in 0..h {
        frame.put_pixel(0, y, PLACEHOLDER_MARK);
        frame.put_pixel(w - 1, y, PLACEHOLDER_MARK);
    }
    frame
}

/// Tile `cells` row-major into a grid with `cols` columns. Cell size is the
/// maximum width/height across cells; smaller frames are blitted top-left and
/// the final row is padded with black filler so every row has equal width.
/// Returns `None` for an empty cell list.
pub fn compose_grid(cells: &[Arc<Frame>], cols: usize) -> Option<Frame> {
    if cells.is_empty() {
        return None;
    }
    let cols = cols.max(1);
    let rows = cells.len().div_ceil(cols);
    let cell_w = cells.iter().map(|f| f.width).max()? as usize;
    let cell_h = cells.iter().map(|f| f.height).max()? as usize;
    let grid_w = cell_w * cols;
    let grid_h = cell_h * rows;
    let seq = cells.iter().map(|f| f.seq).max().unwrap_or(0);

    let mut data = vec![0u8; grid_w * grid_h * 3];
    for (i, cell) in cells.iter().enumerate() {
        let origin_x = (i % cols) * cell_w;
        let origin_y = (i / cols) * cell_h;
        let src_row_bytes = (cell.width as usize) * 3;
        for row in 0..cell.height as usize {
            let src_start = row * src_row_bytes;
            let dst_start = ((origin_y + row) * grid_w + origin_x) * 3;
            data[dst_start..dst_start + src_row_bytes]
                .copy_from_slice(&cell.data[src_start..src_start + src_row_bytes]);
        }
    }

    Some(Frame {
        data,
        width: grid_w as u32,
        height: grid_h as u32,
        seq,
    })
}

/// Latest-frame exchange point between one capture loop and any number of
/// readers. Readers get an `Arc` snapshot; they never block the writer beyond
/// the pointer swap.
#[derive(Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Arc<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer side: replace the held frame. Only the capture loop calls this.
    pub fn publish(&self, frame: Frame) {
        let frame = Arc::new(frame);
        *lock_unpoisoned(&self.latest) = Some(frame);
    }

    /// Reader side: snapshot of the most recent frame, if any.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        lock_unpoisoned(&self.latest).clone()
    }

    /// Drop the held frame. Called on stream stop so a stopped source reads
    /// as "no frame".
    pub fn clear(&self) {
        *lock_unpoisoned(&self.latest) = None;
    }
}
