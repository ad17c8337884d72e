//! Structured query keys and their canonical hashing.
//!
//! A [`QueryKey`] is an ordered sequence of [`KeyFragment`]s. Two keys address
//! the same cache entry iff their canonical hashes match: sequence order is
//! significant, while `Record` fragments hash their entries in sorted order so
//! object shape is order-insensitive by construction.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while constructing a key.
///
/// Key construction is the synchronous, fail-fast edge of the engine: a key
/// that cannot be canonically hashed is rejected before it reaches the cache.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KeyError {
    /// Non-finite floats have no canonical hash (`NaN != NaN`).
    #[error("key fragment must be a finite number, got {0}")]
    NonFiniteNumber(f64),
}

/// One element of a [`QueryKey`].
///
/// Fragments are restricted to shapes with a stable canonical form: scalars
/// and string-keyed records. Records use [`BTreeMap`] so their hash does not
/// depend on insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyFragment {
    /// Boolean fragment.
    Bool(bool),
    /// Integer fragment.
    Int(i64),
    /// Finite floating-point fragment. Construct via [`KeyFragment::float`].
    Float(f64),
    /// String fragment.
    Str(String),
    /// Object fragment with order-insensitive entries.
    Record(BTreeMap<String, KeyFragment>),
}

// NaN is rejected at construction, so total equality holds.
impl Eq for KeyFragment {}

impl Hash for KeyFragment {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            KeyFragment::Bool(b) => b.hash(state),
            KeyFragment::Int(i) => i.hash(state),
            KeyFragment::Float(f) => f.to_bits().hash(state),
            KeyFragment::Str(s) => s.hash(state),
            KeyFragment::Record(entries) => {
                entries.len().hash(state);
                for (name, value) in entries {
                    name.hash(state);
                    value.hash(state);
                }
            }
        }
    }
}

impl KeyFragment {
    /// Create a floating-point fragment, rejecting non-finite values.
    pub fn float(value: f64) -> Result<Self, KeyError> {
        if value.is_finite() {
            Ok(KeyFragment::Float(value))
        } else {
            Err(KeyError::NonFiniteNumber(value))
        }
    }

    /// Whether `other` satisfies this fragment when used as a match pattern.
    ///
    /// Scalars match by equality; a `Record` pattern matches any record that
    /// contains all of its entries (subset match), recursively.
    pub fn matches(&self, other: &KeyFragment) -> bool {
        match (self, other) {
            (KeyFragment::Record(pattern), KeyFragment::Record(target)) => pattern
                .iter()
                .all(|(name, value)| target.get(name).is_some_and(|t| value.matches(t))),
            (a, b) => a == b,
        }
    }
}

impl From<bool> for KeyFragment {
    fn from(value: bool) -> Self {
        KeyFragment::Bool(value)
    }
}

impl From<i64> for KeyFragment {
    fn from(value: i64) -> Self {
        KeyFragment::Int(value)
    }
}

impl From<i32> for KeyFragment {
    fn from(value: i32) -> Self {
        KeyFragment::Int(value.into())
    }
}

impl From<u32> for KeyFragment {
    fn from(value: u32) -> Self {
        KeyFragment::Int(value.into())
    }
}

impl From<&str> for KeyFragment {
    fn from(value: &str) -> Self {
        KeyFragment::Str(value.to_owned())
    }
}

impl From<String> for KeyFragment {
    fn from(value: String) -> Self {
        KeyFragment::Str(value)
    }
}

impl From<BTreeMap<String, KeyFragment>> for KeyFragment {
    fn from(value: BTreeMap<String, KeyFragment>) -> Self {
        KeyFragment::Record(value)
    }
}

/// Build a [`QueryKey`] from fragment expressions.
///
/// # Example
///
/// ```ignore
/// let key = query_key!["users", "detail", 7];
/// assert!(key.starts_with(&query_key!["users"]));
/// ```
#[macro_export]
macro_rules! query_key {
    () => { $crate::QueryKey::new(Vec::new()) };
    ($($fragment:expr),+ $(,)?) => {
        $crate::QueryKey::new(vec![$($crate::KeyFragment::from($fragment)),+])
    };
}

/// Stable hash identifying one cache entry.
///
/// Computed with fixed-seed hashing so the same key always maps to the same
/// hash, within and across runs of one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryHash(pub u64);

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// Arbitrary fixed seeds; determinism matters, the values do not.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x51ab_7037_1c59_2d1e,
    0x9e37_79b9_7f4a_7c15,
    0x2545_f491_4f6c_dd1d,
    0xda94_2042_e4dd_58b5,
);

/// Structured identifier for one cache entry.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey(Vec<KeyFragment>);

impl QueryKey {
    /// Create a key from its fragments.
    pub fn new(fragments: Vec<KeyFragment>) -> Self {
        Self(fragments)
    }

    /// The fragments of this key, in order.
    pub fn fragments(&self) -> &[KeyFragment] {
        &self.0
    }

    /// Number of fragments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this key has no fragments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical hash of this key.
    pub fn hash_value(&self) -> QueryHash {
        let (a, b, c, d) = HASH_SEEDS;
        let mut hasher = ahash::RandomState::with_seeds(a, b, c, d).build_hasher();
        self.hash(&mut hasher);
        QueryHash(hasher.finish())
    }

    /// Whether this key begins with `prefix`.
    ///
    /// Fragments are compared positionally; `Record` prefix fragments match by
    /// subset, everything else by equality. The empty prefix matches any key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.0.len() <= self.0.len()
            && prefix
                .0
                .iter()
                .zip(&self.0)
                .all(|(pattern, fragment)| pattern.matches(fragment))
    }

    /// Debug representation of this key.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.0).finish()
    }
}

impl FromIterator<KeyFragment> for QueryKey {
    fn from_iter<I: IntoIterator<Item = KeyFragment>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
