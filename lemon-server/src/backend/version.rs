//! Required-version registry and lenient version comparison.
//!
//! Release tags in the wild look like `v1.10`, `b6210`, `master-631-a1b2c3d`
//! or `32.0.203.311-foo`. Comparison keeps only the leading digit run of
//! each dot-separated segment and zero-pads missing trailing segments, so
//! `1.2` and `1.2.0` compare equal and `v1.10 > v1.9`.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// A parsed version usable only for ordering, not reconstruction of the tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    parts: Vec<u64>,
}

impl Version {
    pub fn parse(version_str: &str) -> Self {
        let working = version_str
            .strip_prefix('v')
            .or_else(|| version_str.strip_prefix('V'))
            .unwrap_or(version_str);

        let mut parts = Vec::new();
        for segment in working.split('.') {
            let digits: String = segment.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() {
                parts.push(digits.parse().unwrap_or(0));
            }
        }

        Self { parts }
    }

    /// True when `self >= other`. Two unparseable versions (no numeric
    /// segments, e.g. `b6210` vs `b6210`) compare equal; an unparseable
    /// version never satisfies a numeric gate, on either side.
    pub fn at_least(&self, other: &Version) -> bool {
        if self.parts.is_empty() && other.parts.is_empty() {
            return true;
        }
        if self.parts.is_empty() || other.parts.is_empty() {
            return false;
        }

        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            if a != b {
                return a > b;
            }
        }
        true
    }

    /// Equality under zero-padding: `1.2` == `1.2.0`.
    pub fn same_as(&self, other: &Version) -> bool {
        let len = self.parts.len().max(other.parts.len());
        (0..len).all(|i| {
            self.parts.get(i).copied().unwrap_or(0) == other.parts.get(i).copied().unwrap_or(0)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered: Vec<String> = self.parts.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", rendered.join("."))
    }
}

/// Canonical required version per (recipe, backend), loaded once at startup.
///
/// The table ships as a compiled-in resource; a `backend_versions.json` in
/// the config directory overrides it wholesale for operators pinning their
/// own builds.
#[derive(Debug, Clone)]
pub struct VersionRegistry {
    versions: HashMap<String, HashMap<String, String>>,
}

const BUNDLED_VERSIONS: &str = include_str!("../../resources/backend_versions.json");

impl VersionRegistry {
    pub fn load(override_path: &Path) -> Result<Self> {
        let raw = if override_path.exists() {
            std::fs::read_to_string(override_path).map_err(|e| {
                Error::Internal(format!(
                    "Failed to read {}: {e}",
                    override_path.display()
                ))
            })?
        } else {
            BUNDLED_VERSIONS.to_string()
        };

        let versions: HashMap<String, HashMap<String, String>> = serde_json::from_str(&raw)
            .map_err(|e| Error::Internal(format!("Malformed backend versions table: {e}")))?;

        Ok(Self { versions })
    }

    pub fn bundled() -> Self {
        Self {
            versions: serde_json::from_str(BUNDLED_VERSIONS)
                .expect("bundled backend_versions.json is valid"),
        }
    }

    /// Required version for a target. Missing entries are a hard error:
    /// installing an unpinned backend is never allowed.
    pub fn required(&self, recipe: &str, backend: &str) -> Result<String> {
        self.versions
            .get(recipe)
            .and_then(|backends| backends.get(backend))
            .cloned()
            .ok_or_else(|| {
                Error::Internal(format!(
                    "backend versions table is missing an entry for {recipe}:{backend}"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        assert_eq!(Version::parse("1.2.3").to_string(), "1.2.3");
    }

    #[test]
    fn test_parse_v_prefix() {
        assert_eq!(Version::parse("v1.10").to_string(), "1.10");
        assert_eq!(Version::parse("V2.0").to_string(), "2.0");
    }

    #[test]
    fn test_parse_truncates_at_non_digit() {
        // Segment suffixes after the digit run are dropped.
        assert_eq!(Version::parse("32.0.203.311-foo").to_string(), "32.0.203.311");
        assert_eq!(Version::parse("1.2rc1.5").to_string(), "1.2.5");
    }

    #[test]
    fn test_parse_skips_non_numeric_segments() {
        // "master-631-a1b2c3d" has no usable numeric segments before a digit run?
        // The leading segment "master-631-a1b2c3d" starts with letters, so it
        // contributes nothing and the version is empty.
        assert!(Version::parse("master-631-a1b2c3d").is_empty());
    }

    #[test]
    fn test_at_least_basic() {
        assert!(Version::parse("1.2.3").at_least(&Version::parse("1.2")));
        assert!(Version::parse("v1.10").at_least(&Version::parse("v1.9")));
        assert!(!Version::parse("1.9").at_least(&Version::parse("1.10")));
    }

    #[test]
    fn test_at_least_reflexive() {
        for s in ["1.2.3", "v1.10", "b6210", "32.0.203.311-foo"] {
            let v = Version::parse(s);
            assert!(v.at_least(&v), "{s} >= {s} must hold");
        }
    }

    #[test]
    fn test_at_least_empty_vs_numeric() {
        let empty = Version::parse("");
        let one = Version::parse("1");
        assert!(!empty.at_least(&one));
        assert!(!one.at_least(&empty));
        // Reflexivity holds even for tags with no numeric segments.
        assert!(empty.at_least(&empty));
        assert!(Version::parse("b6210").at_least(&Version::parse("b6210")));
    }

    #[test]
    fn test_zero_padding_equality() {
        assert!(Version::parse("1.2").same_as(&Version::parse("1.2.0")));
        assert!(Version::parse("1.2.0").at_least(&Version::parse("1.2")));
        assert!(Version::parse("1.2").at_least(&Version::parse("1.2.0")));
        assert!(!Version::parse("1.2.1").same_as(&Version::parse("1.2")));
    }

    #[test]
    fn test_registry_bundled_has_all_recipes() {
        let registry = VersionRegistry::bundled();
        for (recipe, backend) in [
            ("llamacpp", "vulkan"),
            ("llamacpp", "cpu"),
            ("whispercpp", "cpu"),
            ("sd-cpp", "cpu"),
            ("kokoro", "cpu"),
            ("ryzenai-llm", "npu"),
            ("flm", "npu"),
        ] {
            assert!(
                registry.required(recipe, backend).is_ok(),
                "missing version for {recipe}:{backend}"
            );
        }
    }

    #[test]
    fn test_registry_missing_entry_is_loud() {
        let registry = VersionRegistry::bundled();
        assert!(registry.required("llamacpp", "no-such-backend").is_err());
        assert!(registry.required("no-such-recipe", "cpu").is_err());
    }
}
