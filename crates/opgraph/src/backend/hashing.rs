//! Structural fingerprints for IR nodes, program signatures and cache keys.
//!
//! Everything that participates in node identity goes through [`StructuralHash`], so metadata of
//! mixed types (extents, flags, floating point attributes, optional dtypes) folds into a single
//! `u64` the same way regardless of where the node was built.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;
const GOLDEN_RATIO: u64 = 0x9e3779b97f4a7c15;

/// Fixed-width structural fingerprint.
pub type Fingerprint = u64;

pub struct FingerprintHasher {
    inner: DefaultHasher,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            inner: DefaultHasher::new(),
        }
    }

    pub fn write<T: StructuralHash + ?Sized>(&mut self, value: &T) {
        value.structural_hash(self);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.inner.write_u8(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.inner.write_u64(value);
    }

    /// Floats are hashed by bit pattern; `-0.0` and `0.0` are distinct attributes.
    pub fn write_f64(&mut self, value: f64) {
        self.inner.write_u64(value.to_bits());
    }

    pub fn write_str(&mut self, value: &str) {
        value.hash(&mut self.inner);
    }

    pub fn finish(self) -> Fingerprint {
        self.inner.finish()
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Types that can contribute to a structural fingerprint.
pub trait StructuralHash {
    fn structural_hash(&self, hasher: &mut FingerprintHasher);
}

macro_rules! structural_hash_via_hash {
    ($($ty:ty),* $(,)?) => {
        $(
            impl StructuralHash for $ty {
                fn structural_hash(&self, hasher: &mut FingerprintHasher) {
                    self.hash(&mut hasher.inner);
                }
            }
        )*
    };
}

structural_hash_via_hash!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, bool, char);

impl StructuralHash for f32 {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        hasher.write_f64(f64::from(*self));
    }
}

impl StructuralHash for f64 {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        hasher.write_f64(*self);
    }
}

impl StructuralHash for str {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        hasher.write_str(self);
    }
}

impl StructuralHash for String {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        hasher.write_str(self);
    }
}

impl<T: StructuralHash> StructuralHash for [T] {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        hasher.write_u64(self.len() as u64);
        for item in self {
            item.structural_hash(hasher);
        }
    }
}

impl<T: StructuralHash> StructuralHash for Vec<T> {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        self.as_slice().structural_hash(hasher);
    }
}

impl<T: StructuralHash> StructuralHash for Option<T> {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        match self {
            Some(value) => {
                hasher.write_u8(1);
                value.structural_hash(hasher);
            }
            None => hasher.write_u8(0),
        }
    }
}

impl<T: StructuralHash + ?Sized> StructuralHash for &T {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        (**self).structural_hash(hasher);
    }
}

pub fn hash_value<T: StructuralHash + ?Sized>(value: &T) -> Fingerprint {
    let mut hasher = FingerprintHasher::new();
    hasher.write(value);
    hasher.finish()
}

/// Mixes `value` into `seed`. Order matters: `hash_combine(a, b) != hash_combine(b, a)`.
pub fn hash_combine(seed: Fingerprint, value: Fingerprint) -> Fingerprint {
    seed ^ value
        .wrapping_add(GOLDEN_RATIO)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

/// Folds every argument into one fingerprint.
///
/// ```
/// use opgraph::fingerprint;
/// let a = fingerprint!(vec![2usize, 3], true, 0.5f64);
/// let b = fingerprint!(vec![2usize, 3], true, 0.5f64);
/// assert_eq!(a, b);
/// ```
#[macro_export]
macro_rules! fingerprint {
    ($($value:expr),* $(,)?) => {{
        let mut hasher = $crate::backend::hashing::FingerprintHasher::new();
        $( hasher.write(&$value); )*
        hasher.finish()
    }};
}

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}
