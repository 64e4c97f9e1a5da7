use image::DynamicImage;
use image_hasher::{Hasher, HasherConfig};
use std::fmt;

use crate::config::DedupConfig;

/// Perceptual fingerprint: a fixed-width bit vector packed into bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Box<[u8]>);

impl Fingerprint {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn bit_len(&self) -> usize {
        self.0.len() * 8
    }

    /// Number of differing bits. Fingerprints of different widths are maximally distant.
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        if self.0.len() != other.0.len() {
            return u32::MAX;
        }
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Computes perceptual fingerprints. Shareable across rayon workers.
pub struct Fingerprinter {
    hasher: Hasher,
}

impl Fingerprinter {
    pub fn new(config: &DedupConfig) -> Self {
        let mut hasher_config = HasherConfig::new()
            .hash_size(config.hash_size, config.hash_size)
            .hash_alg(config.algorithm.hash_alg());
        if config.dct {
            hasher_config = hasher_config.preproc_dct();
        }
        Self {
            hasher: hasher_config.to_hasher(),
        }
    }

    pub fn fingerprint(&self, image: &DynamicImage) -> Fingerprint {
        Fingerprint::from_bytes(self.hasher.hash_image(image).as_bytes())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(&DedupConfig::default())
    }
}
