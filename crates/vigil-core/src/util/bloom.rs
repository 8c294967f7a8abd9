//! Bloom filters sized from an expected element count and a target
//! false-positive rate.
//!
//! Both variants derive the optimal bit-array size `m` and hash count
//! `k` at construction and use xxh3 double hashing (two 64-bit hashes
//! combined as `h1 + i * h2`) instead of k independent hash functions.

use std::hash::Hash;
use std::marker::PhantomData;

use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Default expected element count.
pub const DEFAULT_EXPECTED: usize = 10_000;
/// Default target false-positive rate.
pub const DEFAULT_FP_RATE: f64 = 0.01;

/// m = -n * ln(p) / (ln 2)^2, rounded up, at least 8 bits.
fn optimal_bits(expected: usize, fp_rate: f64) -> usize {
    let n = expected.max(1) as f64;
    let p = fp_rate.clamp(1e-9, 0.5);
    let m = -(n * p.ln()) / (std::f64::consts::LN_2 * std::f64::consts::LN_2);
    (m.ceil() as usize).max(8)
}

/// k = (m / n) * ln 2, rounded, clamped to [1, 16].
fn optimal_hashes(bits: usize, expected: usize) -> u32 {
    let k = (bits as f64 / expected.max(1) as f64) * std::f64::consts::LN_2;
    (k.round() as u32).clamp(1, 16)
}

fn hash_pair<T: Hash + ?Sized>(value: &T) -> (u64, u64) {
    // Hash the value through std's Hasher protocol into a small buffer,
    // then derive two seeds with xxh3. Avoids requiring AsRef<[u8]>.
    struct Collect(Vec<u8>);
    impl std::hash::Hasher for Collect {
        fn finish(&self) -> u64 {
            0
        }
        fn write(&mut self, bytes: &[u8]) {
            self.0.extend_from_slice(bytes);
        }
    }
    let mut c = Collect(Vec::with_capacity(32));
    value.hash(&mut c);
    let h1 = xxh3_64_with_seed(&c.0, 0x5eed);
    let h2 = xxh3_64_with_seed(&c.0, 0xfeed) | 1;
    (h1, h2)
}

/// Classical non-counting bloom filter.
#[derive(Clone, Debug)]
pub struct BloomFilter<T: Hash + ?Sized> {
    bits: Vec<u8>,
    bit_count: usize,
    hash_count: u32,
    expected: usize,
    fp_rate: f64,
    inserted: usize,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Hash + ?Sized> BloomFilter<T> {
    pub fn new(expected: usize, fp_rate: f64) -> Self {
        let bit_count = optimal_bits(expected, fp_rate);
        let hash_count = optimal_hashes(bit_count, expected);
        Self {
            bits: vec![0u8; bit_count.div_ceil(8)],
            bit_count,
            hash_count,
            expected,
            fp_rate,
            inserted: 0,
            _marker: PhantomData,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_EXPECTED, DEFAULT_FP_RATE)
    }

    pub fn add(&mut self, value: &T) {
        let (h1, h2) = hash_pair(value);
        for i in 0..self.hash_count as u64 {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count as u64) as usize;
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
        self.inserted += 1;
    }

    /// No false negatives; false positives at roughly the configured rate.
    pub fn contains(&self, value: &T) -> bool {
        let (h1, h2) = hash_pair(value);
        for i in 0..self.hash_count as u64 {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count as u64) as usize;
            if self.bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.inserted = 0;
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn memory_usage(&self) -> usize {
        self.bits.len() + std::mem::size_of::<Self>()
    }

    /// Serialize to a little-endian byte vector:
    /// `expected:u64, fp_rate:f64, inserted:u64, bit_count:u64, bits`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.bits.len());
        out.extend_from_slice(&(self.expected as u64).to_le_bytes());
        out.extend_from_slice(&self.fp_rate.to_le_bytes());
        out.extend_from_slice(&(self.inserted as u64).to_le_bytes());
        out.extend_from_slice(&(self.bit_count as u64).to_le_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    /// Inverse of [`serialize`](Self::serialize). Returns `None` on a
    /// truncated or inconsistent buffer.
    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < 32 {
            return None;
        }
        let expected = u64::from_le_bytes(data[0..8].try_into().ok()?) as usize;
        let fp_rate = f64::from_le_bytes(data[8..16].try_into().ok()?);
        let inserted = u64::from_le_bytes(data[16..24].try_into().ok()?) as usize;
        let bit_count = u64::from_le_bytes(data[24..32].try_into().ok()?) as usize;
        let byte_len = bit_count.div_ceil(8);
        if data.len() != 32 + byte_len {
            return None;
        }
        let mut filter = Self::new(expected, fp_rate);
        if filter.bit_count != bit_count {
            return None;
        }
        filter.bits.copy_from_slice(&data[32..]);
        filter.inserted = inserted;
        Some(filter)
    }
}

/// Counting variant with 4-bit saturating counters, supporting
/// `remove` at the cost of approximate-positive behavior. A counter
/// that saturates at 15 is never decremented back below 15.
#[derive(Clone, Debug)]
pub struct CountingBloomFilter<T: Hash + ?Sized> {
    // Two 4-bit counters per byte.
    counters: Vec<u8>,
    slot_count: usize,
    hash_count: u32,
    inserted: usize,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Hash + ?Sized> CountingBloomFilter<T> {
    pub fn new(expected: usize, fp_rate: f64) -> Self {
        let slot_count = optimal_bits(expected, fp_rate);
        let hash_count = optimal_hashes(slot_count, expected);
        Self {
            counters: vec![0u8; slot_count.div_ceil(2)],
            slot_count,
            hash_count,
            inserted: 0,
            _marker: PhantomData,
        }
    }

    fn get_counter(&self, slot: usize) -> u8 {
        let byte = self.counters[slot / 2];
        if slot % 2 == 0 { byte & 0x0f } else { byte >> 4 }
    }

    fn set_counter(&mut self, slot: usize, value: u8) {
        let value = value.min(15);
        let byte = &mut self.counters[slot / 2];
        if slot % 2 == 0 {
            *byte = (*byte & 0xf0) | value;
        } else {
            *byte = (*byte & 0x0f) | (value << 4);
        }
    }

    fn slots(&self, value: &T) -> impl Iterator<Item = usize> + use<T> {
        let (h1, h2) = hash_pair(value);
        let n = self.slot_count as u64;
        (0..self.hash_count as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % n) as usize)
    }

    pub fn add(&mut self, value: &T) {
        let slots: Vec<usize> = self.slots(value).collect();
        for slot in slots {
            let c = self.get_counter(slot);
            if c < 15 {
                self.set_counter(slot, c + 1);
            }
        }
        self.inserted += 1;
    }

    pub fn contains(&self, value: &T) -> bool {
        self.slots(value).all(|slot| self.get_counter(slot) > 0)
    }

    /// Decrement the element's counters. Removing a value that was
    /// never added can introduce false negatives for colliding values.
    pub fn remove(&mut self, value: &T) {
        let slots: Vec<usize> = self.slots(value).collect();
        for slot in slots {
            let c = self.get_counter(slot);
            if c > 0 && c < 15 {
                self.set_counter(slot, c - 1);
            }
        }
        self.inserted = self.inserted.saturating_sub(1);
    }

    pub fn clear(&mut self) {
        self.counters.fill(0);
        self.inserted = 0;
    }

    pub fn memory_usage(&self) -> usize {
        self.counters.len() + std::mem::size_of::<Self>()
    }
}
