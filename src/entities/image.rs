//! Decoded image held by the caches

/// Decoded RGBA8 image ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
}

impl DecodedImage {
    /// Wrap an RGBA8 buffer. The buffer length is not validated against the
    /// dimensions; decoders are trusted to produce consistent data.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self { pixels, width, height }
    }

    /// Solid-color image, used by the synthetic decoder
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut pixels = vec![0u8; width as usize * height as usize * 4];
        for px in pixels.chunks_mut(4) {
            px.copy_from_slice(&rgba);
        }
        Self::new(pixels, width, height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Approximate decoded size in bytes: `width * height * 4`.
    ///
    /// Ignores real bit depth and alpha; only used to drive eviction.
    pub fn cost(&self) -> usize {
        estimate_cost(self.width, self.height)
    }
}

/// Cost heuristic shared by the cache and the memory-pressure logic
pub fn estimate_cost(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_is_rgba_bytes() {
        let img = DecodedImage::filled(64, 32, [0, 0, 0, 255]);
        assert_eq!(img.cost(), 64 * 32 * 4);
        assert_eq!(img.pixels().len(), img.cost());
    }
}
