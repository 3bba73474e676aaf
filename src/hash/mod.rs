//! Content fingerprints used as job and cache identities.
//!
//! A fingerprint is the 128-bit MD5 digest of the ordered concatenation of its
//! items. File items contribute their contents; a file that cannot be read
//! contributes its path string instead. Collision resistance is not a goal, only
//! determinism across calls and restarts.
//!
//! # Example
//!
//! ```
//! use simcon::hash::{fingerprint, Fingerprint, HashItem};
//!
//! let a = fingerprint([HashItem::from("R1 1 0 50"), HashItem::from(300)]);
//! let b = Fingerprint::new().value("R1 1 0 50").value(300).finish();
//! assert_eq!(a, b);
//! assert_eq!(a.to_string().len(), 32);
//! ```

use crate::error::SimconError;
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A 128-bit content digest.
///
/// Displays (and serializes) as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest([u8; 16]);

impl Digest {
    /// Wraps raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns the first `len` hex characters, for log lines.
    #[must_use]
    pub fn short(&self, len: usize) -> String {
        let mut s = self.to_string();
        s.truncate(len);
        s
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Digest {
    type Err = SimconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| SimconError::Serialization(format!("invalid digest '{s}': {e}")))?;
        let bytes: [u8; 16] = bytes.try_into().map_err(|_| {
            SimconError::Serialization(format!("invalid digest '{s}': expected 16 bytes"))
        })?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Digest {
    type Error = SimconError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// One input to a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashItem {
    /// A file whose contents are hashed.
    File(PathBuf),
    /// A literal value hashed by its string form.
    Value(String),
}

impl HashItem {
    /// Resolves the item to the bytes that enter the digest.
    fn payload(&self) -> Vec<u8> {
        match self {
            Self::File(path) => {
                std::fs::read(path).unwrap_or_else(|_| path.display().to_string().into_bytes())
            }
            Self::Value(value) => value.clone().into_bytes(),
        }
    }
}

impl From<&Path> for HashItem {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

impl From<PathBuf> for HashItem {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&PathBuf> for HashItem {
    fn from(path: &PathBuf) -> Self {
        Self::File(path.clone())
    }
}

impl From<&str> for HashItem {
    fn from(value: &str) -> Self {
        Self::Value(value.to_string())
    }
}

impl From<String> for HashItem {
    fn from(value: String) -> Self {
        Self::Value(value)
    }
}

impl From<&String> for HashItem {
    fn from(value: &String) -> Self {
        Self::Value(value.clone())
    }
}

impl From<Digest> for HashItem {
    fn from(value: Digest) -> Self {
        Self::Value(value.to_string())
    }
}

macro_rules! hash_item_from_display {
    ($($t:ty),*) => {
        $(
            impl From<$t> for HashItem {
                fn from(value: $t) -> Self {
                    Self::Value(value.to_string())
                }
            }
        )*
    };
}

hash_item_from_display!(i32, i64, u32, u64, usize, f64, bool);

/// Fingerprints `items` in order.
pub fn fingerprint<I>(items: I) -> Digest
where
    I: IntoIterator,
    I::Item: Into<HashItem>,
{
    items
        .into_iter()
        .fold(Fingerprint::new(), |fp, item| fp.item(item))
        .finish()
}

/// Incremental fingerprint builder.
#[derive(Default)]
pub struct Fingerprint {
    hasher: Md5,
}

impl Fingerprint {
    /// Creates an empty fingerprint.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends any item.
    #[must_use]
    pub fn item(mut self, item: impl Into<HashItem>) -> Self {
        self.hasher.update(item.into().payload());
        self
    }

    /// Appends the contents of a file.
    #[must_use]
    pub fn file(self, path: impl Into<PathBuf>) -> Self {
        self.item(HashItem::File(path.into()))
    }

    /// Appends the string form of a value.
    #[must_use]
    pub fn value(self, value: impl fmt::Display) -> Self {
        self.item(HashItem::Value(value.to_string()))
    }

    /// Finalizes the digest.
    #[must_use]
    pub fn finish(self) -> Digest {
        let out = self.hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&out);
        Digest(bytes)
    }
}
