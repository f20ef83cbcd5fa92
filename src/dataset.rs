//! Output datasets and the tiles they are made of.
//!
//! A [`Dataset`] is never materialized as a whole. It only knows its shape
//! ([`OutputSchema`]) and how to obtain any rectangular region of itself on
//! demand: each call to [`Dataset::tile`] goes through the shared tile cache,
//! and on a miss asks the producing stage to compute the region, which may in
//! turn pull tiles from upstream datasets.

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::StageSlot;
use crate::error::TileComputationError;
use crate::tiles::{TileCache, TileKey};

const DEFAULT_TILE_SIZE: u32 = 512;

static NEXT_DATASET_ID: AtomicU64 = AtomicU64::new(1);

/// A rectangular region in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge. Widened so rects reaching `u32::MAX` don't overflow.
    pub fn right(&self) -> u64 {
        u64::from(self.x) + u64::from(self.width)
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u64 {
        u64::from(self.y) + u64::from(self.height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && u64::from(x) < self.right() && y >= self.y && u64::from(y) < self.bottom()
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && u64::from(self.x) < other.right()
            && u64::from(other.x) < self.right()
            && u64::from(self.y) < other.bottom()
            && u64::from(other.y) < self.bottom()
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[x={}, y={}, w={}, h={}]",
            self.x, self.y, self.width, self.height
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    UInt8,
    Int16,
    Int32,
    Float32,
    Float64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandInfo {
    pub name: String,
    pub data_type: DataType,
}

impl BandInfo {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// The declared shape of a stage's output: its extent, the tile grid used to
/// drive computation, and the bands every tile carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSchema {
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub bands: Vec<BandInfo>,
}

impl OutputSchema {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tile_width: DEFAULT_TILE_SIZE,
            tile_height: DEFAULT_TILE_SIZE,
            bands: Vec::new(),
        }
    }

    pub fn with_tile_size(mut self, tile_width: u32, tile_height: u32) -> Self {
        self.tile_width = tile_width;
        self.tile_height = tile_height;
        self
    }

    pub fn with_band(mut self, band: BandInfo) -> Self {
        self.bands.push(band);
        self
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    pub fn band_index(&self, name: &str) -> Option<usize> {
        self.bands.iter().position(|band| band.name == name)
    }

    /// Enumerates the tile grid covering the whole extent in row-major order.
    /// Tiles on the right and bottom edges are clipped to the extent.
    pub fn tile_rects(&self) -> Vec<Rect> {
        if self.width == 0 || self.height == 0 {
            return Vec::new();
        }

        let tw = if self.tile_width == 0 { self.width } else { self.tile_width };
        let th = if self.tile_height == 0 { self.height } else { self.tile_height };

        let mut rects = Vec::with_capacity(self.width.div_ceil(tw) as usize * self.height.div_ceil(th) as usize);
        let mut y = 0;
        while y < self.height {
            let h = th.min(self.height - y);
            let mut x = 0;
            while x < self.width {
                let w = tw.min(self.width - x);
                rects.push(Rect::new(x, y, w, h));
                x += w;
            }
            y += h;
        }

        rects
    }

    pub fn tile_count(&self) -> usize {
        self.tile_rects().len()
    }
}

/// The computed content of one tile: one sample buffer per band, each
/// holding `rect.area()` samples in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct TileData {
    pub rect: Rect,
    pub bands: Vec<Vec<f64>>,
}

impl TileData {
    pub fn new(rect: Rect, bands: Vec<Vec<f64>>) -> Self {
        Self { rect, bands }
    }

    /// A tile where every band holds the same constant value.
    pub fn filled(rect: Rect, band_count: usize, value: f64) -> Self {
        Self {
            rect,
            bands: vec![vec![value; rect.area()]; band_count],
        }
    }

    /// Looks up a sample by absolute pixel coordinates.
    pub fn sample(&self, band: usize, x: u32, y: u32) -> Option<f64> {
        if !self.rect.contains(x, y) {
            return None;
        }

        let offset = (y - self.rect.y) as usize * self.rect.width as usize + (x - self.rect.x) as usize;
        self.bands.get(band)?.get(offset).copied()
    }
}

/// A lazily computed, tile-addressable output of a node.
///
/// `Dataset` is a cheap handle: clones share the same producer and cache
/// entries. It stays usable until the owning node context is disposed, after
/// which every tile request fails with a `Disposed` error.
#[derive(Clone)]
pub struct Dataset {
    inner: Arc<DatasetInner>,
}

struct DatasetInner {
    id: u64,
    schema: OutputSchema,
    producer: Arc<StageSlot>,
    cache: Arc<TileCache>,
}

impl Dataset {
    pub(crate) fn new(schema: OutputSchema, producer: Arc<StageSlot>, cache: Arc<TileCache>) -> Self {
        Self {
            inner: Arc::new(DatasetInner {
                id: NEXT_DATASET_ID.fetch_add(1, Ordering::Relaxed),
                schema,
                producer,
                cache,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Id of the node which produces this dataset.
    pub fn node_id(&self) -> &str {
        self.inner.producer.node_id()
    }

    /// Stage type of the producing node.
    pub fn stage(&self) -> &str {
        self.inner.producer.stage_type()
    }

    pub fn schema(&self) -> &OutputSchema {
        &self.inner.schema
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.producer.is_disposed()
    }

    /// Returns the content of `rect`, computing it if it isn't cached.
    ///
    /// Concurrent requests for the same region of the same dataset share a
    /// single computation.
    pub fn tile(&self, rect: Rect) -> Result<Arc<TileData>, TileComputationError> {
        let producer = &self.inner.producer;
        if producer.is_disposed() {
            return Err(producer.disposed_error(rect));
        }

        let key = TileKey {
            dataset: self.inner.id,
            rect,
        };

        self.inner.cache.get_or_compute(key, || {
            producer
                .compute_tile(rect, &self.inner.schema)
                .map(Arc::new)
        })
    }
}

impl PartialEq for Dataset {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Dataset {}

impl Debug for Dataset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("node", &self.node_id())
            .field("stage", &self.stage())
            .field("width", &self.inner.schema.width)
            .field("height", &self.inner.schema.height)
            .field("bands", &self.inner.schema.bands.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_rects_cover_extent() {
        let schema = OutputSchema::new(10, 5).with_tile_size(4, 4);
        let rects = schema.tile_rects();

        assert_eq!(rects.len(), 6);
        assert_eq!(rects[0], Rect::new(0, 0, 4, 4));
        assert_eq!(rects[2], Rect::new(8, 0, 2, 4));
        assert_eq!(rects[5], Rect::new(8, 4, 2, 1));

        let covered: usize = rects.iter().map(Rect::area).sum();
        assert_eq!(covered, 50);
    }

    #[test]
    fn test_tile_rects_empty_extent() {
        assert!(OutputSchema::new(0, 10).tile_rects().is_empty());
    }

    #[test]
    fn test_tile_rects_zero_tile_size_is_whole_extent() {
        let schema = OutputSchema::new(7, 3).with_tile_size(0, 0);
        assert_eq!(schema.tile_rects(), vec![Rect::new(0, 0, 7, 3)]);
    }

    #[test]
    fn test_rect_intersects() {
        let a = Rect::new(0, 0, 4, 4);
        assert!(a.intersects(&Rect::new(3, 3, 2, 2)));
        assert!(!a.intersects(&Rect::new(4, 0, 2, 2)));
        assert!(!a.intersects(&Rect::new(1, 1, 0, 2)));
    }

    #[test]
    fn test_tile_sample() {
        let rect = Rect::new(2, 2, 2, 2);
        let tile = TileData::new(rect, vec![vec![1.0, 2.0, 3.0, 4.0]]);

        assert_eq!(tile.sample(0, 3, 3), Some(4.0));
        assert_eq!(tile.sample(0, 2, 3), Some(3.0));
        assert_eq!(tile.sample(0, 0, 0), None);
        assert_eq!(tile.sample(1, 2, 2), None);
    }

    #[test]
    fn test_rect_at_u32_limit() {
        let edge = Rect::new(u32::MAX - 1, u32::MAX - 1, 4, 4);
        assert_eq!(edge.right(), u64::from(u32::MAX) + 3);
        assert!(edge.contains(u32::MAX, u32::MAX));
        assert!(edge.intersects(&Rect::new(u32::MAX, 0, 1, u32::MAX)));

        let tile = TileData::new(Rect::new(0, 0, 2, 2), vec![vec![1.0; 4]]);
        assert_eq!(tile.sample(0, u32::MAX, u32::MAX), None);

        let far = TileData::filled(Rect::new(u32::MAX - 1, u32::MAX - 1, 2, 2), 1, 5.0);
        assert_eq!(far.sample(0, u32::MAX, u32::MAX), Some(5.0));
    }
}
