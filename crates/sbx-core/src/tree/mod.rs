//! Content-addressed directory tree model.
//!
//! A snapshot is a recursive [`Dir`] whose children are keyed by their
//! 16-byte md5 content checksum. A file's checksum covers its bytes; a
//! directory's checksum covers the concatenation of its children's checksums
//! in walk order, so an unchanged subtree reproduces the same root checksum.

mod build;

pub use build::build;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use md5::{Digest as _, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Width of a content checksum, in bytes.
pub const CHECKSUM_LEN: usize = 16;

/// 16-byte md5 fingerprint. Keys every child map and names every blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Checksum([u8; CHECKSUM_LEN]);

impl Checksum {
    /// Fingerprint of a byte string.
    pub fn of(content: &[u8]) -> Self {
        Self(Md5::digest(content).into())
    }

    pub fn from_bytes(bytes: [u8; CHECKSUM_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }

    /// Decimal rendering of the little-endian i64 in the first 8 bytes.
    ///
    /// This is the per-content object name in the blob store and the checksum
    /// column value in the reference database. An 8-byte truncation of md5:
    /// collisions are statistically negligible but not ruled out.
    pub fn to_num_string(&self) -> String {
        let mut first = [0u8; 8];
        first.copy_from_slice(&self.0[..8]);
        i64::from_le_bytes(first).to_string()
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(CHECKSUM_LEN * 2);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != CHECKSUM_LEN * 2 {
            return Err(Error::protocol(format!(
                "checksum hex must be {} chars, got {}",
                CHECKSUM_LEN * 2,
                hex.len()
            )));
        }
        let mut bytes = [0u8; CHECKSUM_LEN];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| Error::protocol("checksum hex is not ascii"))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::protocol(format!("bad checksum hex pair {pair:?}")))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// Hex strings everywhere in JSON, including as map keys.
impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Checksum::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Shared attributes of a tree node.
///
/// `walked` is a transient marker owned by the diff engine; it is never
/// serialized and must read false outside a running compare.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    pub is_dir: bool,
    /// Modification time, unix milliseconds.
    pub mod_time: i64,
    /// Permission bits as reported by the filesystem.
    pub mode: u32,
    pub name: String,
    pub size: u64,
    pub content_checksum: Checksum,
    /// Absolute path on the device the snapshot was built on.
    pub path: String,
    #[serde(skip)]
    walked: AtomicBool,
}

impl Object {
    pub(crate) fn mark_walked(&self) {
        self.walked.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_walked(&self) -> bool {
        self.walked.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_walked(&self) {
        self.walked.store(false, Ordering::Relaxed);
    }
}

impl Clone for Object {
    fn clone(&self) -> Self {
        Self {
            is_dir: self.is_dir,
            mod_time: self.mod_time,
            mode: self.mode,
            name: self.name.clone(),
            size: self.size,
            content_checksum: self.content_checksum,
            path: self.path.clone(),
            // the marker is transient state, a clone starts unwalked
            walked: AtomicBool::new(false),
        }
    }
}

/// A regular file node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    #[serde(flatten)]
    pub object: Object,
}

impl File {
    pub fn checksum(&self) -> Checksum {
        self.object.content_checksum
    }
}

/// A directory node with checksum-keyed children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dir {
    #[serde(flatten)]
    pub object: Object,
    pub files: HashMap<Checksum, File>,
    pub dirs: HashMap<Checksum, Dir>,
}

impl Dir {
    /// A zeroed directory, used before the first scan or sync.
    pub fn empty() -> Self {
        Self {
            object: Object {
                is_dir: true,
                mod_time: 0,
                mode: 0,
                name: String::new(),
                size: 0,
                content_checksum: Checksum::default(),
                path: String::new(),
                walked: AtomicBool::new(false),
            },
            files: HashMap::new(),
            dirs: HashMap::new(),
        }
    }

    pub fn checksum(&self) -> Checksum {
        self.object.content_checksum
    }

    pub fn mod_time(&self) -> i64 {
        self.object.mod_time
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Into::into)
    }

    /// Clear every walked marker in this subtree.
    pub fn reset_walked(&self) {
        self.object.clear_walked();
        for file in self.files.values() {
            file.object.clear_walked();
        }
        for dir in self.dirs.values() {
            dir.reset_walked();
        }
    }

    /// True if any walked marker in this subtree is set. Test support.
    pub fn any_walked(&self) -> bool {
        self.object.is_walked()
            || self.files.values().any(|f| f.object.is_walked())
            || self.dirs.values().any(|d| d.any_walked())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_hex_round_trip() {
        let checksum = Checksum::of(b"some content");
        let hex = checksum.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(Checksum::from_hex(&hex).unwrap(), checksum);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(Checksum::from_hex("abc").is_err());
        assert!(Checksum::from_hex(&"zz".repeat(16)).is_err());
    }

    #[test]
    fn num_string_is_little_endian_decimal() {
        let mut bytes = [0u8; CHECKSUM_LEN];
        bytes[0] = 1;
        assert_eq!(Checksum::from_bytes(bytes).to_num_string(), "1");

        bytes[0] = 0;
        bytes[7] = 0x80;
        // little-endian: sign bit set, renders negative
        assert_eq!(
            Checksum::from_bytes(bytes).to_num_string(),
            i64::MIN.to_string()
        );
    }

    #[test]
    fn known_md5_vector() {
        // md5("abc") = 900150983cd24fb0d6963f7d28e17f72
        assert_eq!(
            Checksum::of(b"abc").to_hex(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn checksum_keys_serialize_as_hex_strings() {
        let mut dir = Dir::empty();
        let mut file = File {
            object: Dir::empty().object.clone(),
        };
        file.object.is_dir = false;
        file.object.name = "a.txt".into();
        file.object.content_checksum = Checksum::of(b"A");
        dir.files.insert(file.checksum(), file);

        let json: serde_json::Value = serde_json::to_value(&dir).unwrap();
        let keys: Vec<&String> = json["files"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec![&Checksum::of(b"A").to_hex()]);
    }

    #[test]
    fn walked_is_not_serialized_and_clones_clean() {
        let dir = Dir::empty();
        dir.object.mark_walked();
        let json = serde_json::to_string(&dir).unwrap();
        assert!(!json.contains("walked"));

        let clone = dir.clone();
        assert!(!clone.object.is_walked());

        let restored = Dir::from_json(json.as_bytes()).unwrap();
        assert!(!restored.object.is_walked());
    }

    #[test]
    fn json_round_trip_preserves_checksums() {
        let mut dir = Dir::empty();
        dir.object.content_checksum = Checksum::of(b"root");
        dir.object.name = "root".into();
        let restored = Dir::from_json(&dir.to_json().unwrap()).unwrap();
        assert_eq!(restored.checksum(), dir.checksum());
        assert_eq!(restored.object.name, "root");
    }
}
