use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};

/// Platform prefixes accepted on input and stripped during normalization.
const PLATFORM_PREFIXES: &[&str] = &["macos-", "android-", "ios-", "windows-", "linux-"];

/// Canonical device identifier: a lowercase UUID string.
///
/// Platform-prefixed forms (`macos-<uuid>`, `android-<uuid>`) are accepted on
/// input; comparison, hashing and serialization always use the stripped
/// lowercase form. The raw pre-normalization input is retained so stores can
/// fall back to it when looking up keys saved by older pairings.
#[derive(Debug, Clone)]
pub struct DeviceId {
    canonical: String,
    raw: String,
}

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        let raw = id.into();
        let canonical = Self::normalize(&raw);
        Self { canonical, raw }
    }

    /// Strip a known platform prefix and lowercase.
    fn normalize(s: &str) -> String {
        let lowered = s.trim().to_ascii_lowercase();
        for prefix in PLATFORM_PREFIXES {
            if let Some(rest) = lowered.strip_prefix(prefix) {
                if uuid::Uuid::parse_str(rest).is_ok() {
                    return rest.to_string();
                }
            }
        }
        lowered
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The identifier exactly as it was received, before normalization.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Whether the raw input differed from the canonical form.
    pub fn was_normalized(&self) -> bool {
        self.raw != self.canonical
    }

    pub fn into_inner(self) -> String {
        self.canonical
    }
}

impl PartialEq for DeviceId {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for DeviceId {}

impl std::hash::Hash for DeviceId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for DeviceId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.canonical
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercases_input() {
        let id = DeviceId::new("6BA7B810-9DAD-11D1-80B4-00C04FD430C8");
        assert_eq!(id.as_str(), "6ba7b810-9dad-11d1-80b4-00c04fd430c8");
    }

    #[test]
    fn test_strips_platform_prefix() {
        let id = DeviceId::new("macos-6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        assert_eq!(id.as_str(), "6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        assert!(id.was_normalized());
        assert_eq!(id.raw(), "macos-6ba7b810-9dad-11d1-80b4-00c04fd430c8");
    }

    #[test]
    fn test_prefix_without_uuid_is_kept() {
        // "android-pixel" is not a prefixed UUID, so it stays as-is (lowercased).
        let id = DeviceId::new("Android-Pixel");
        assert_eq!(id.as_str(), "android-pixel");
    }

    #[test]
    fn test_same_device_compares_equal_across_forms() {
        let a = DeviceId::new("ANDROID-6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        let b = DeviceId::new("6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        assert_eq!(a, b);
    }

    #[test]
    fn test_serializes_canonical_form() {
        let id = DeviceId::new("macos-6BA7B810-9dad-11d1-80b4-00c04fd430c8");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"6ba7b810-9dad-11d1-80b4-00c04fd430c8\"");
    }
}
