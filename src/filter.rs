//! # Membership Filter
//!
//! Fixed-size Bloom filter used to remember which candidate identifiers
//! have already been consumed. The filter never produces false negatives:
//! a key that was inserted always tests positive afterwards.
//!
//! Probes use double hashing over two independent 64-bit hashes of the
//! key's UTF-8 bytes (`h1 + i*h2`), each passed through a splitmix64
//! finaliser and reduced to the bit-array length (mask when the length is
//! a power of two, modulo otherwise).
//!
//! The binary form is big-endian:
//!
//! ```text
//! magic u32 | version u32 | size_bits u64 | k u32 | word_count u32 | words u64 * word_count
//! ```

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Magic number at the head of every serialized filter.
pub const FILTER_MAGIC: u32 = 0xB10F_600D;

/// Current serialization format version.
pub const FILTER_FORMAT_VERSION: u32 = 1;

/// Upper bound on probes per key.
pub const MAX_HASH_COUNT: u32 = 32;

const SEED_PRIMARY: u64 = 0x9E37_79B9_7F4A_7C15;
const SEED_SECONDARY: u64 = 0xC2B2_AE3D_27D4_EB4F;
const H2_FALLBACK: u64 = 0xBF58_476D_1CE4_E5B9;

/// Errors raised while building or decoding a filter.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid filter format: magic {magic:#010x}, version {version}")]
    Format { magic: u32, version: u32 },
    #[error(
        "filter size mismatch: file holds {stored_words} words but {size_bits} bits require {expected_words}"
    )]
    SizeMismatch {
        size_bits: u64,
        stored_words: u32,
        expected_words: u64,
    },
    #[error("invalid filter header: {size_bits} bits, k = {k}")]
    InvalidHeader { size_bits: u64, k: u32 },
    #[error("invalid filter parameters: {0}")]
    InvalidParameters(String),
}

/// Bloom filter over identifier strings with a persisted bit pattern.
#[derive(Clone)]
pub struct MembershipFilter {
    words: Vec<u64>,
    size_bits: u64,
    /// `size_bits - 1` when `size_bits` is a power of two.
    mask: Option<u64>,
    k: u32,
    /// Insertions since construction or load; telemetry only, not persisted.
    inserted: u64,
}

impl MembershipFilter {
    /// Size a filter for `expected` entries at `bits_per_entry` bits each.
    ///
    /// The bit array is `max(64, roundUp64(expected * bits_per_entry))` bits.
    pub fn create(expected: u64, bits_per_entry: u32, k: u32) -> Result<Self, FilterError> {
        if bits_per_entry == 0 {
            return Err(FilterError::InvalidParameters(
                "bits_per_entry must be positive".to_string(),
            ));
        }
        let bits = expected.checked_mul(u64::from(bits_per_entry)).ok_or_else(|| {
            FilterError::InvalidParameters(format!(
                "{expected} entries at {bits_per_entry} bits/entry overflows"
            ))
        })?;
        Self::with_size_bits(bits, k)
    }

    /// Build an empty filter with at least `size_bits` bits (rounded up to a multiple of 64).
    pub fn with_size_bits(size_bits: u64, k: u32) -> Result<Self, FilterError> {
        if k == 0 || k > MAX_HASH_COUNT {
            return Err(FilterError::InvalidParameters(format!(
                "k must be between 1 and {MAX_HASH_COUNT}, got {k}"
            )));
        }
        let size_bits = round_up_64(size_bits)?;
        let word_count = size_bits / 64;
        if word_count > u64::from(u32::MAX) {
            return Err(FilterError::InvalidParameters(format!(
                "{size_bits} bits exceeds the maximum serializable word count"
            )));
        }
        let word_count = usize::try_from(word_count).map_err(|_| {
            FilterError::InvalidParameters(format!("{size_bits} bits does not fit in memory"))
        })?;
        Ok(Self {
            words: vec![0; word_count],
            size_bits,
            mask: size_bits.is_power_of_two().then(|| size_bits - 1),
            k,
            inserted: 0,
        })
    }

    pub fn size_bits(&self) -> u64 {
        self.size_bits
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Bytes held by the bit array.
    pub fn memory_bytes(&self) -> u64 {
        self.words.len() as u64 * 8
    }

    /// Number of `insert` calls since this instance was created or loaded.
    pub fn insert_count(&self) -> u64 {
        self.inserted
    }

    /// Mark `key` as present.
    pub fn insert(&mut self, key: &str) {
        let (h1, h2) = hash_pair(key.as_bytes());
        for i in 0..self.k {
            let bit = self.probe(h1, h2, i);
            self.words[(bit >> 6) as usize] |= 1u64 << (bit & 63);
        }
        self.inserted += 1;
    }

    /// `false` means `key` was definitely never inserted.
    pub fn might_contain(&self, key: &str) -> bool {
        let (h1, h2) = hash_pair(key.as_bytes());
        (0..self.k).all(|i| {
            let bit = self.probe(h1, h2, i);
            self.words[(bit >> 6) as usize] & (1u64 << (bit & 63)) != 0
        })
    }

    /// Fraction of bits currently set.
    pub fn fill_ratio(&self) -> f64 {
        let ones: u64 = self.words.iter().map(|w| u64::from(w.count_ones())).sum();
        ones as f64 / self.size_bits as f64
    }

    /// Theoretical false positive probability at the current fill ratio.
    pub fn estimated_fpp(&self) -> f64 {
        self.fill_ratio().powi(self.k as i32)
    }

    #[inline]
    fn probe(&self, h1: u64, h2: u64, i: u32) -> u64 {
        let x = mix64(h1.wrapping_add(u64::from(i).wrapping_mul(h2)));
        match self.mask {
            Some(mask) => x & mask,
            None => x % self.size_bits,
        }
    }

    /// Serialize header and bit array to `writer`.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), FilterError> {
        writer.write_all(&FILTER_MAGIC.to_be_bytes())?;
        writer.write_all(&FILTER_FORMAT_VERSION.to_be_bytes())?;
        writer.write_all(&self.size_bits.to_be_bytes())?;
        writer.write_all(&self.k.to_be_bytes())?;
        // Constructors cap the word count at u32::MAX.
        writer.write_all(&(self.words.len() as u32).to_be_bytes())?;
        for word in &self.words {
            writer.write_all(&word.to_be_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Decode a filter previously written by [`MembershipFilter::write_to`].
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self, FilterError> {
        let magic = read_u32(&mut reader)?;
        let version = read_u32(&mut reader)?;
        if magic != FILTER_MAGIC || version != FILTER_FORMAT_VERSION {
            return Err(FilterError::Format { magic, version });
        }
        let size_bits = read_u64(&mut reader)?;
        let k = read_u32(&mut reader)?;
        let stored_words = read_u32(&mut reader)?;

        // Writers only ever store a rounded size; any other value would move probe positions.
        if size_bits == 0 || size_bits % 64 != 0 || k == 0 || k > MAX_HASH_COUNT {
            return Err(FilterError::InvalidHeader { size_bits, k });
        }
        // Check before allocating so a corrupt header cannot request a huge array.
        let expected_words = size_bits / 64;
        if expected_words != u64::from(stored_words) {
            return Err(FilterError::SizeMismatch {
                size_bits,
                stored_words,
                expected_words,
            });
        }
        let mut filter = Self::with_size_bits(size_bits, k)?;
        for word in filter.words.iter_mut() {
            *word = read_u64(&mut reader)?;
        }
        Ok(filter)
    }

    /// Write the filter to `path`, replacing it in place.
    ///
    /// Use [`crate::checkpoint::checkpoint`] for crash-safe persistence.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), FilterError> {
        let file = File::create(path)?;
        self.write_to(BufWriter::new(file))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FilterError> {
        let file = File::open(path)?;
        Self::read_from(BufReader::new(file))
    }
}

impl PartialEq for MembershipFilter {
    fn eq(&self, other: &Self) -> bool {
        self.size_bits == other.size_bits && self.k == other.k && self.words == other.words
    }
}

impl Eq for MembershipFilter {}

impl fmt::Debug for MembershipFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipFilter")
            .field("size_bits", &self.size_bits)
            .field("k", &self.k)
            .field("inserted", &self.inserted)
            .finish_non_exhaustive()
    }
}

fn round_up_64(bits: u64) -> Result<u64, FilterError> {
    bits.max(64).checked_next_multiple_of(64).ok_or_else(|| {
        FilterError::InvalidParameters(format!("{bits} bits cannot be rounded to a word boundary"))
    })
}

#[inline]
fn hash_pair(key: &[u8]) -> (u64, u64) {
    let h1 = xxh3_64_with_seed(key, SEED_PRIMARY);
    let h2 = match xxh3_64_with_seed(key, SEED_SECONDARY) {
        0 => H2_FALLBACK,
        h => h,
    };
    (h1, h2)
}

/// splitmix64 finaliser.
#[inline]
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}
