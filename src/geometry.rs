//! Block geometry, tile identifiers and resolution pyramids.
//!
//! A resolution level is partitioned into blocks. Block coordinates used by
//! the public API are the pixel position of the block's top-left corner, so
//! in a level with 256x256 tiles the second tile of the first row lives at
//! `(256, 0)`.

use crate::error::StorageError;

/// Bits per pixel values accepted by [`BlockGeometry::new`].
pub const SUPPORTED_BITS_PER_PIXEL: [u8; 7] = [1, 2, 4, 8, 16, 24, 32];

/// Number of bits of a [`TileId`] reserved for the block index.
const TILE_INDEX_BITS: u32 = 56;

const TILE_INDEX_MASK: u64 = (1 << TILE_INDEX_BITS) - 1;

// =============================================================================
// Block Layout
// =============================================================================

/// How a level is partitioned into blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockLayout {
    /// Full-width row groups; the last strip may hold fewer rows
    Strip,

    /// Rectangular blocks addressed by (x, y); edge tiles are padded
    Tile,
}

impl BlockLayout {
    pub fn to_u8(self) -> u8 {
        match self {
            BlockLayout::Strip => 0,
            BlockLayout::Tile => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BlockLayout::Strip),
            1 => Some(BlockLayout::Tile),
            _ => None,
        }
    }
}

// =============================================================================
// Tile Identifier
// =============================================================================

/// Largest block index a [`TileId`] can hold.
pub const MAX_TILE_INDEX: u64 = TILE_INDEX_MASK;

/// Opaque key of one block of one resolution level.
///
/// The id packs the level into the top 8 bits and the raster-order block
/// index into the low 56 bits, so it is a bijection over
/// `(level, column, row)` once the level's grid is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId(u64);

impl TileId {
    /// Build an id from a level and a raster-order block index.
    ///
    /// # Panics
    ///
    /// Panics if `index` exceeds [`MAX_TILE_INDEX`]. Use
    /// [`TileId::try_from_index`] for indices from untrusted input.
    pub fn from_index(level: u8, index: u64) -> Self {
        match Self::try_from_index(level, index) {
            Some(id) => id,
            None => panic!("tile index {index} out of range"),
        }
    }

    /// Like [`TileId::from_index`], `None` if `index` does not fit.
    pub fn try_from_index(level: u8, index: u64) -> Option<Self> {
        if index > TILE_INDEX_MASK {
            return None;
        }
        Some(TileId(((level as u64) << TILE_INDEX_BITS) | index))
    }

    pub fn from_raw(raw: u64) -> Self {
        TileId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn level(self) -> u8 {
        (self.0 >> TILE_INDEX_BITS) as u8
    }

    pub fn index(self) -> u64 {
        self.0 & TILE_INDEX_MASK
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.level(), self.index())
    }
}

// =============================================================================
// Block Geometry
// =============================================================================

/// Pixel and block dimensions of one resolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    width: u32,
    height: u32,
    block_width: u32,
    block_height: u32,
    layout: BlockLayout,
    bits_per_pixel: u8,
}

impl BlockGeometry {
    /// Create a geometry, checking its invariants.
    ///
    /// Block dimensions and image dimensions must be non-zero and a `Strip`
    /// layout must use full-width blocks.
    pub fn new(
        width: u32,
        height: u32,
        block_width: u32,
        block_height: u32,
        layout: BlockLayout,
        bits_per_pixel: u8,
    ) -> Result<Self, StorageError> {
        if width == 0 || height == 0 {
            return Err(StorageError::InvalidGeometry(format!(
                "image must be at least 1x1, got {width}x{height}"
            )));
        }
        if block_width == 0 || block_height == 0 {
            return Err(StorageError::InvalidGeometry(format!(
                "block must be non-empty, got {block_width}x{block_height}"
            )));
        }
        if layout == BlockLayout::Strip && block_width != width {
            return Err(StorageError::InvalidGeometry(format!(
                "strip width {block_width} must equal image width {width}"
            )));
        }
        if !SUPPORTED_BITS_PER_PIXEL.contains(&bits_per_pixel) {
            return Err(StorageError::InvalidGeometry(format!(
                "unsupported bits per pixel: {bits_per_pixel}"
            )));
        }

        Ok(Self {
            width,
            height,
            block_width,
            block_height,
            layout,
            bits_per_pixel,
        })
    }

    /// Strip geometry: full-width blocks of `rows_per_strip` rows.
    pub fn strips(
        width: u32,
        height: u32,
        rows_per_strip: u32,
        bits_per_pixel: u8,
    ) -> Result<Self, StorageError> {
        Self::new(
            width,
            height,
            width,
            rows_per_strip,
            BlockLayout::Strip,
            bits_per_pixel,
        )
    }

    /// Tile geometry with square or rectangular tiles.
    pub fn tiles(
        width: u32,
        height: u32,
        tile_width: u32,
        tile_height: u32,
        bits_per_pixel: u8,
    ) -> Result<Self, StorageError> {
        Self::new(
            width,
            height,
            tile_width,
            tile_height,
            BlockLayout::Tile,
            bits_per_pixel,
        )
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn block_width(&self) -> u32 {
        self.block_width
    }

    pub fn block_height(&self) -> u32 {
        self.block_height
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn bits_per_pixel(&self) -> u8 {
        self.bits_per_pixel
    }

    /// Number of blocks in each row of the grid.
    pub fn blocks_per_row(&self) -> u32 {
        self.width.div_ceil(self.block_width)
    }

    /// Number of blocks in each column of the grid.
    pub fn blocks_per_column(&self) -> u32 {
        self.height.div_ceil(self.block_height)
    }

    pub fn block_count(&self) -> u64 {
        self.blocks_per_row() as u64 * self.blocks_per_column() as u64
    }

    /// Bytes in one row of a block, rounded up to a whole byte.
    pub fn row_bytes(&self) -> usize {
        row_bytes(self.block_width, self.bits_per_pixel)
    }

    /// Pixel rows actually stored in the block starting at row `y`.
    ///
    /// Tiles are always stored padded to full height; strips stop at the
    /// image's last row.
    pub fn block_rows(&self, y: u32) -> u32 {
        match self.layout {
            BlockLayout::Tile => self.block_height,
            BlockLayout::Strip => self.block_height.min(self.height.saturating_sub(y)),
        }
    }

    /// Uncompressed size in bytes of the block starting at row `y`.
    pub fn raw_block_len(&self, y: u32) -> usize {
        self.row_bytes() * self.block_rows(y) as usize
    }

    /// Uncompressed size of a full block.
    pub fn full_block_len(&self) -> usize {
        self.row_bytes() * self.block_height as usize
    }

    /// Validate pixel coordinates of a block origin and return its raster index.
    pub fn block_index(&self, x: u32, y: u32) -> Result<u64, StorageError> {
        let invalid = |reason: String| StorageError::InvalidCoordinates { x, y, reason };

        if x >= self.width || y >= self.height {
            return Err(invalid(format!(
                "outside {}x{} level",
                self.width, self.height
            )));
        }
        if self.layout == BlockLayout::Strip && x != 0 {
            return Err(invalid("strip blocks start at x = 0".to_string()));
        }
        if x % self.block_width != 0 || y % self.block_height != 0 {
            return Err(invalid(format!(
                "not aligned to {}x{} blocks",
                self.block_width, self.block_height
            )));
        }

        let column = (x / self.block_width) as u64;
        let row = (y / self.block_height) as u64;
        Ok(row * self.blocks_per_row() as u64 + column)
    }

    /// Pixel origin of the block with raster index `index`.
    pub fn block_origin(&self, index: u64) -> Option<(u32, u32)> {
        if index >= self.block_count() {
            return None;
        }
        let per_row = self.blocks_per_row() as u64;
        let column = (index % per_row) as u32;
        let row = (index / per_row) as u32;
        Some((column * self.block_width, row * self.block_height))
    }

    /// Tile id for the block at pixel coordinates `(x, y)` of `level`.
    pub fn tile_id(&self, level: u8, x: u32, y: u32) -> Result<TileId, StorageError> {
        let index = self.block_index(x, y)?;
        TileId::try_from_index(level, index).ok_or_else(|| StorageError::InvalidCoordinates {
            x,
            y,
            reason: format!("block index {index} does not fit a tile id"),
        })
    }
}

/// Bytes needed to hold `pixels` pixels of `bits_per_pixel` bits.
pub fn row_bytes(pixels: u32, bits_per_pixel: u8) -> usize {
    (pixels as usize * bits_per_pixel as usize).div_ceil(8)
}

// =============================================================================
// Pyramid
// =============================================================================

/// Ordered resolution levels of one image; index 0 is full resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pyramid {
    levels: Vec<BlockGeometry>,
}

impl Pyramid {
    /// Build a pyramid, requiring every level to be no larger than the one before.
    pub fn new(levels: Vec<BlockGeometry>) -> Result<Self, StorageError> {
        if levels.is_empty() {
            return Err(StorageError::InvalidGeometry(
                "pyramid needs at least one level".to_string(),
            ));
        }
        if levels.len() > u8::MAX as usize + 1 {
            return Err(StorageError::InvalidGeometry(format!(
                "too many levels: {}",
                levels.len()
            )));
        }
        for (i, pair) in levels.windows(2).enumerate() {
            if pair[1].width() > pair[0].width() || pair[1].height() > pair[0].height() {
                return Err(StorageError::InvalidGeometry(format!(
                    "level {} is larger than level {}",
                    i + 1,
                    i
                )));
            }
        }
        Ok(Self { levels })
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> Option<&BlockGeometry> {
        self.levels.get(level)
    }

    pub fn levels(&self) -> &[BlockGeometry] {
        &self.levels
    }

    /// Downsample factor of `level` relative to level 0.
    pub fn downsample(&self, level: usize) -> Option<f64> {
        let base = self.levels.first()?;
        let geometry = self.levels.get(level)?;
        Some(base.width() as f64 / geometry.width() as f64)
    }
}
