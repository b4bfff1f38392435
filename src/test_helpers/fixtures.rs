/// Deterministic payload of `len` bytes.
///
/// The pattern cycles through every value below 251, so it contains SLIP
/// special bytes and the XMODEM fill byte.
pub fn test_image(len: usize) -> Vec<u8> {
    ImageBuilder::new(len).build()
}

/// Builder for test firmware images and config blobs
pub struct ImageBuilder {
    len: usize,
    seed: u8,
    patches: Vec<(usize, u8)>,
}

impl ImageBuilder {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            seed: 7,
            patches: Vec::new(),
        }
    }

    pub fn seed(mut self, seed: u8) -> Self {
        self.seed = seed;
        self
    }

    /// Overwrite the byte at `index` after generation.
    pub fn byte_at(mut self, index: usize, value: u8) -> Self {
        self.patches.push((index, value));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut image: Vec<u8> = (0..self.len)
            .map(|i| ((i * 31 + self.seed as usize) % 251) as u8)
            .collect();
        for (index, value) in self.patches {
            if index < image.len() {
                image[index] = value;
            }
        }
        image
    }
}

/// A short init packet as produced by the packaging tool.
pub fn init_packet() -> Vec<u8> {
    ImageBuilder::new(141).seed(42).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_contains_special_bytes() {
        let image = test_image(1000);
        assert!(image.contains(&0xC0));
        assert!(image.contains(&0xDB));
        assert!(image.contains(&0x1A));
    }

    #[test]
    fn test_builder_patches() {
        let image = ImageBuilder::new(10).byte_at(3, 0xFF).byte_at(50, 0x00).build();
        assert_eq!(image.len(), 10);
        assert_eq!(image[3], 0xFF);
        assert_ne!(ImageBuilder::new(10).seed(1).build(), test_image(10));
    }
}
