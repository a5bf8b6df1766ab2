use serde_json::Value;

/// Canonical string form of a value, as used for index and uniqueness
/// buckets.
///
/// Strings hash as their raw text so that `"disk"` and the property value
/// `disk` land in the same bucket. Every other value uses its compact JSON
/// rendering (`42`, `true`, `null`, `[1,2]`).
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// BLAKE3 digest of a value's canonical string form.
///
/// The digest is domain-separated so that bucket hashes never collide with
/// hashes computed for other purposes in the same store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValueDigest([u8; 32]);

impl ValueDigest {
    const DOMAIN: &'static str = "hdal-value-v1";

    /// Digest a value.
    pub fn of(value: &Value) -> Self {
        Self::of_str(&canonical_string(value))
    }

    /// Digest an already canonical string.
    pub fn of_str(s: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(Self::DOMAIN.as_bytes());
        hasher.update(b":");
        hasher.update(s.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex form, as embedded in keys.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}
