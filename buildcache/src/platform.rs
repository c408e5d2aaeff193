use serde::{Deserialize, Serialize};

/// A normalized platform tuple. Canonicalized for fingerprinting by sorting `os_features` and
/// serializing with sorted keys (see `canonical_json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
            os_version: None,
            os_features: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn with_os_version(mut self, os_version: impl Into<String>) -> Self {
        self.os_version = Some(os_version.into());
        self
    }

    pub fn with_os_features(mut self, features: Vec<String>) -> Self {
        self.os_features = Some(features);
        self
    }

    /// Canonical form used for fingerprinting: `os_features` sorted, everything else as-is.
    /// `serde_json` serializes struct fields in declaration order, not alphabetically, so we
    /// round-trip through a `BTreeMap` to get sorted-key canonical JSON.
    pub fn canonical_json(&self) -> String {
        let mut normalized = self.clone();
        if let Some(features) = normalized.os_features.as_mut() {
            features.sort();
        }
        let value = serde_json::to_value(&normalized).expect("platform is always serializable");
        let sorted: std::collections::BTreeMap<String, serde_json::Value> =
            serde_json::from_value(value).expect("object round-trips through BTreeMap");
        serde_json::to_string(&sorted).expect("BTreeMap is always serializable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_features_order_does_not_affect_canonical_form() {
        let a = Platform::new("linux", "arm64")
            .with_os_features(vec!["avx".into(), "sse4".into()]);
        let b = Platform::new("linux", "arm64")
            .with_os_features(vec!["sse4".into(), "avx".into()]);
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn differing_platform_fields_change_canonical_form() {
        let a = Platform::new("linux", "arm64");
        let b = Platform::new("linux", "amd64");
        assert_ne!(a.canonical_json(), b.canonical_json());
    }
}
