//! Perceptual hashing and per-run image deduplication
//!
//! The hash is an average hash: the image is reduced to a small grayscale
//! grid and each cell becomes one bit, set when the cell is at least as bright
//! as the grid mean. Re-encodes and minor scaling keep the same hash, so a
//! logo repeated across slides is uploaded and analyzed once.

use crate::error::{Error, Result};
use image::imageops::FilterType;
use std::collections::HashMap;

/// An average hash of `size * size` bits
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageHash {
    bits: Vec<u8>,
}

impl ImageHash {
    /// Hex form used as the storage key and the `image_hash` column
    pub fn to_hex(&self) -> String {
        self.bits.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Number of differing bits, or `None` for hashes of different sizes
    pub fn distance(&self, other: &ImageHash) -> Option<u32> {
        if self.bits.len() != other.bits.len() {
            return None;
        }
        Some(
            self.bits
                .iter()
                .zip(&other.bits)
                .map(|(a, b)| (a ^ b).count_ones())
                .sum(),
        )
    }
}

impl std::fmt::Display for ImageHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute the average hash of encoded image bytes
pub fn perceptual_hash(bytes: &[u8], size: u32) -> Result<ImageHash> {
    if size == 0 {
        return Err(Error::Config("hash size must be positive".to_string()));
    }
    let image = image::load_from_memory(bytes)?;
    let gray = image.to_luma8();
    let resized = image::imageops::resize(&gray, size, size, FilterType::Triangle);

    let cells = (size * size) as usize;
    let total: u64 = resized.pixels().map(|p| p[0] as u64).sum();
    let avg = total / cells as u64;

    let mut bits = vec![0u8; cells.div_ceil(8)];
    for (idx, pixel) in resized.pixels().enumerate() {
        if pixel[0] as u64 >= avg {
            bits[idx / 8] |= 1u8 << (idx % 8);
        }
    }
    Ok(ImageHash { bits })
}

/// Where an already-seen image lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenImage {
    /// Hash of the first occurrence, shared by every duplicate row
    pub hash: String,
    pub location: String,
}

/// Hash → storage location map for one ingestion run
#[derive(Debug, Default)]
pub struct HashLocationMap {
    max_distance: u32,
    exact: HashMap<ImageHash, usize>,
    entries: Vec<(ImageHash, SeenImage)>,
}

impl HashLocationMap {
    pub fn new(max_distance: u32) -> Self {
        Self {
            max_distance,
            ..Default::default()
        }
    }

    /// Look up a previously recorded image with the same (or a near) hash
    pub fn resolve(&self, hash: &ImageHash) -> Option<&SeenImage> {
        if let Some(&idx) = self.exact.get(hash) {
            return Some(&self.entries[idx].1);
        }
        if self.max_distance == 0 {
            return None;
        }
        self.entries
            .iter()
            .filter_map(|(seen, entry)| {
                seen.distance(hash)
                    .filter(|d| *d <= self.max_distance)
                    .map(|d| (d, entry))
            })
            .min_by_key(|(d, _)| *d)
            .map(|(_, entry)| entry)
    }

    /// Record the upload location of a first occurrence
    pub fn record(&mut self, hash: ImageHash, location: String) -> &SeenImage {
        let entry = SeenImage {
            hash: hash.to_hex(),
            location,
        };
        let idx = self.entries.len();
        self.exact.insert(hash.clone(), idx);
        self.entries.push((hash, entry));
        &self.entries[idx].1
    }

    /// Number of distinct images recorded
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
