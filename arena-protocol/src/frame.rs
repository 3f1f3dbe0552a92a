//! Panel frame encoding and decoding.
//!
//! A frame block is what one 20x20 panel needs to show a single image:
//! - HEADER (2 bytes): panel address, depth selector
//! - DATA (50 or 200 bytes): packed pixels, bottom panel row first
//!
//! Pixels are linearised as `pixel_index = row_from_bottom * 20 + col`.
//! The in-memory grid stores the panel's *top* row first, so the encoder
//! flips rows on the way out.
//!
//! - One-bit depth packs 8 pixels per byte, MSB first.
//! - Four-bit depth packs 2 pixels per byte, lower pixel index in the high nibble.

use core::fmt;

use heapless::Vec;

/// Panel edge length in pixels
pub const PANEL_SIZE: usize = 20;

/// Pixels per panel
pub const PANEL_PIXELS: usize = PANEL_SIZE * PANEL_SIZE;

/// Header length in bytes (panel address + depth selector)
pub const FRAME_HEADER_SIZE: usize = 2;

/// Data bytes for a one-bit frame
pub const ONE_BIT_DATA_SIZE: usize = PANEL_PIXELS / 8;

/// Data bytes for a four-bit frame
pub const FOUR_BIT_DATA_SIZE: usize = PANEL_PIXELS / 2;

/// Largest possible frame block
pub const MAX_FRAME_BLOCK_SIZE: usize = FRAME_HEADER_SIZE + FOUR_BIT_DATA_SIZE;

/// Depth selector byte for one-bit frames
pub const DEPTH_SELECTOR_ONE_BIT: u8 = 0x10;

/// Depth selector byte for four-bit frames
pub const DEPTH_SELECTOR_FOUR_BIT: u8 = 0x30;

/// Encoded frame block, owned by the caller
pub type FrameBlock = Vec<u8, MAX_FRAME_BLOCK_SIZE>;

/// Errors from frame encoding or decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// Bit depth is not one of the supported depths
    InvalidDepth(u8),
    /// Grid is not 20x20
    DimensionMismatch {
        /// Number of rows supplied
        rows: usize,
        /// Length of the first offending row (or 0 when rows are missing)
        cols: usize,
    },
    /// Block length does not match the header's depth
    LengthMismatch {
        /// Expected total length
        expected: usize,
        /// Actual total length
        actual: usize,
    },
    /// Header depth selector is not recognised
    InvalidSelector(u8),
    /// Pixel coordinates fall outside the panel
    OutOfBounds {
        /// Requested row
        row: usize,
        /// Requested column
        col: usize,
    },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::InvalidDepth(bits) => write!(f, "unsupported color depth: {} bits", bits),
            EncodeError::DimensionMismatch { rows, cols } => {
                write!(f, "grid must be 20x20, got {} rows (row width {})", rows, cols)
            }
            EncodeError::LengthMismatch { expected, actual } => {
                write!(f, "frame block length {} does not match expected {}", actual, expected)
            }
            EncodeError::InvalidSelector(sel) => write!(f, "unknown depth selector 0x{:02X}", sel),
            EncodeError::OutOfBounds { row, col } => {
                write!(f, "pixel ({}, {}) is outside the 20x20 panel", row, col)
            }
        }
    }
}

/// Grayscale depth of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorDepth {
    /// On/off pixels
    OneBit,
    /// 16 intensity levels
    FourBit,
}

impl ColorDepth {
    /// Parse a depth from its bit count
    pub fn from_bits(bits: u8) -> Result<Self, EncodeError> {
        match bits {
            1 => Ok(ColorDepth::OneBit),
            4 => Ok(ColorDepth::FourBit),
            other => Err(EncodeError::InvalidDepth(other)),
        }
    }

    /// Bits per pixel
    pub fn bits(self) -> u8 {
        match self {
            ColorDepth::OneBit => 1,
            ColorDepth::FourBit => 4,
        }
    }

    /// Number of data bytes in a frame of this depth
    pub fn data_len(self) -> usize {
        match self {
            ColorDepth::OneBit => ONE_BIT_DATA_SIZE,
            ColorDepth::FourBit => FOUR_BIT_DATA_SIZE,
        }
    }

    /// Total frame block length (header + data)
    pub fn block_len(self) -> usize {
        FRAME_HEADER_SIZE + self.data_len()
    }

    /// Largest pixel value representable at this depth
    pub fn max_value(self) -> u8 {
        match self {
            ColorDepth::OneBit => 1,
            ColorDepth::FourBit => 15,
        }
    }

    /// Header selector byte
    pub fn selector(self) -> u8 {
        match self {
            ColorDepth::OneBit => DEPTH_SELECTOR_ONE_BIT,
            ColorDepth::FourBit => DEPTH_SELECTOR_FOUR_BIT,
        }
    }

    /// Parse a header selector byte
    pub fn from_selector(selector: u8) -> Result<Self, EncodeError> {
        match selector {
            DEPTH_SELECTOR_ONE_BIT => Ok(ColorDepth::OneBit),
            DEPTH_SELECTOR_FOUR_BIT => Ok(ColorDepth::FourBit),
            other => Err(EncodeError::InvalidSelector(other)),
        }
    }
}

/// A 20x20 panel image
///
/// Row 0 of the grid is the top row of the panel as seen by the subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGrid {
    pixels: [[u8; PANEL_SIZE]; PANEL_SIZE],
}

impl Default for PixelGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelGrid {
    /// Create a grid with every pixel off
    pub const fn new() -> Self {
        Self {
            pixels: [[0; PANEL_SIZE]; PANEL_SIZE],
        }
    }

    /// Create a grid with every pixel set to `value`
    pub const fn filled(value: u8) -> Self {
        Self {
            pixels: [[value; PANEL_SIZE]; PANEL_SIZE],
        }
    }

    /// Build a grid from row slices (top row first)
    pub fn from_rows<R: AsRef<[u8]>>(rows: &[R]) -> Result<Self, EncodeError> {
        if rows.len() != PANEL_SIZE {
            let cols = rows.first().map(|r| r.as_ref().len()).unwrap_or(0);
            return Err(EncodeError::DimensionMismatch {
                rows: rows.len(),
                cols,
            });
        }

        let mut grid = Self::new();
        for (r, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != PANEL_SIZE {
                return Err(EncodeError::DimensionMismatch {
                    rows: rows.len(),
                    cols: row.len(),
                });
            }
            grid.pixels[r].copy_from_slice(row);
        }
        Ok(grid)
    }

    /// Get a pixel by memory coordinates (row 0 = top)
    pub fn get(&self, row: usize, col: usize) -> Option<u8> {
        self.pixels.get(row)?.get(col).copied()
    }

    /// Set a pixel by memory coordinates (row 0 = top)
    pub fn set(&mut self, row: usize, col: usize, value: u8) -> Result<(), EncodeError> {
        let pixel = self
            .pixels
            .get_mut(row)
            .and_then(|r| r.get_mut(col))
            .ok_or(EncodeError::OutOfBounds { row, col })?;
        *pixel = value;
        Ok(())
    }

    /// Set a pixel by panel coordinates (row 0 = bottom)
    pub fn set_panel(
        &mut self,
        row_from_bottom: usize,
        col: usize,
        value: u8,
    ) -> Result<(), EncodeError> {
        if row_from_bottom >= PANEL_SIZE {
            return Err(EncodeError::OutOfBounds {
                row: row_from_bottom,
                col,
            });
        }
        self.set(PANEL_SIZE - 1 - row_from_bottom, col, value)
    }

    /// Rows in memory order
    pub fn rows(&self) -> &[[u8; PANEL_SIZE]; PANEL_SIZE] {
        &self.pixels
    }

    /// Pixel value at a linear panel index
    fn at_index(&self, pixel_index: usize) -> u8 {
        let row_from_bottom = pixel_index / PANEL_SIZE;
        let col = pixel_index % PANEL_SIZE;
        self.pixels[PANEL_SIZE - 1 - row_from_bottom][col]
    }

    fn set_index(&mut self, pixel_index: usize, value: u8) {
        let row_from_bottom = pixel_index / PANEL_SIZE;
        let col = pixel_index % PANEL_SIZE;
        self.pixels[PANEL_SIZE - 1 - row_from_bottom][col] = value;
    }
}

/// Encode a grid into a frame block for one panel
pub fn encode_frame(grid: &PixelGrid, panel_address: u8, depth: ColorDepth) -> FrameBlock {
    let mut block = FrameBlock::new();
    // Capacity is sized for the largest depth, pushes cannot fail
    let _ = block.push(panel_address);
    let _ = block.push(depth.selector());

    match depth {
        ColorDepth::OneBit => {
            for byte_index in 0..ONE_BIT_DATA_SIZE {
                let mut byte = 0u8;
                for bit in 0..8 {
                    if grid.at_index(byte_index * 8 + bit) != 0 {
                        byte |= 1 << (7 - bit);
                    }
                }
                let _ = block.push(byte);
            }
        }
        ColorDepth::FourBit => {
            for byte_index in 0..FOUR_BIT_DATA_SIZE {
                let high = grid.at_index(byte_index * 2).min(15);
                let low = grid.at_index(byte_index * 2 + 1).min(15);
                let _ = block.push((high << 4) | low);
            }
        }
    }

    block
}

/// Validate raw rows and a bit count, then encode
pub fn encode_rows<R: AsRef<[u8]>>(
    rows: &[R],
    panel_address: u8,
    bits: u8,
) -> Result<FrameBlock, EncodeError> {
    let depth = ColorDepth::from_bits(bits)?;
    let grid = PixelGrid::from_rows(rows)?;
    Ok(encode_frame(&grid, panel_address, depth))
}

/// A frame block decoded back into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Panel address from the header
    pub panel_address: u8,
    /// Depth from the header selector
    pub depth: ColorDepth,
    /// Reconstructed image
    pub grid: PixelGrid,
}

/// Decode a frame block produced by [`encode_frame`]
///
/// One-bit frames decode to 0/1 pixel values.
pub fn decode_frame(block: &[u8]) -> Result<DecodedFrame, EncodeError> {
    if block.len() < FRAME_HEADER_SIZE {
        return Err(EncodeError::LengthMismatch {
            expected: FRAME_HEADER_SIZE,
            actual: block.len(),
        });
    }

    let panel_address = block[0];
    let depth = ColorDepth::from_selector(block[1])?;
    if block.len() != depth.block_len() {
        return Err(EncodeError::LengthMismatch {
            expected: depth.block_len(),
            actual: block.len(),
        });
    }

    let data = &block[FRAME_HEADER_SIZE..];
    let mut grid = PixelGrid::new();
    match depth {
        ColorDepth::OneBit => {
            for pixel_index in 0..PANEL_PIXELS {
                let byte = data[pixel_index / 8];
                let bit = (byte >> (7 - (pixel_index % 8))) & 1;
                grid.set_index(pixel_index, bit);
            }
        }
        ColorDepth::FourBit => {
            for (byte_index, &byte) in data.iter().enumerate() {
                grid.set_index(byte_index * 2, byte >> 4);
                grid.set_index(byte_index * 2 + 1, byte & 0x0F);
            }
        }
    }

    Ok(DecodedFrame {
        panel_address,
        depth,
        grid,
    })
}
