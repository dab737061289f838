//! Dedup keys: digests that collapse equivalent pending dispatches.

use sha2::{Digest as _, Sha256};
use serde_json::Value;

/// SHA-256 digest of a handler name and the canonical form of an input
/// payload.
///
/// Two dispatches carry the same key exactly when they name the same handler
/// and their inputs are semantically equal. Canonicalization rides on
/// `serde_json`'s object maps, which iterate in sorted key order at every
/// nesting depth, so key order in the source payload never changes the
/// digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey([u8; 32]);

impl DedupKey {
    /// Digest `name` together with the canonical serialization of `input`.
    pub fn compute(name: &str, input: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(b"-");
        // Serializing a Value cannot fail: map keys are always strings and
        // non-finite numbers cannot be represented in one.
        if let Ok(canonical) = serde_json::to_vec(input) {
            hasher.update(&canonical);
        }
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Debug for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DedupKey").field(&hex::encode(self.0)).finish()
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl serde::Serialize for DedupKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> serde::Deserialize<'de> for DedupKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("dedup key must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}
