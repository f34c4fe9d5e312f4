//! Shared types for artifact resolution, download and caching.

use crate::error::Result;
use crate::rules::ArtifactKeyRules;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Version placeholder resolved to the highest available release.
pub const LATEST_VERSION: &str = "latest";

/// Which catalogue an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Model,
    Pipeline,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Model => "model",
            ArtifactKind::Pipeline => "pipeline",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifies a requested artifact.
///
/// Before caching, `version` must be a concrete version; `"latest"` only
/// appears in requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub name: String,
    pub language: String,
    pub version: String,
}

impl ArtifactKey {
    /// Create a key; `None` version means `"latest"`.
    pub fn new(name: impl Into<String>, language: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            name: name.into(),
            language: language.into(),
            version: version.unwrap_or(LATEST_VERSION).to_string(),
        }
    }

    /// Whether this key still needs version resolution.
    pub fn is_latest(&self) -> bool {
        self.version.eq_ignore_ascii_case(LATEST_VERSION)
    }

    /// The same key pinned to a concrete version.
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self {
            name: self.name.clone(),
            language: self.language.clone(),
            version: version.into(),
        }
    }

    /// Validate every component; they become path segments in the cache.
    pub fn validate(&self) -> Result<()> {
        let rules = ArtifactKeyRules::get();
        rules.name.validate(&self.name)?;
        rules.language.validate(&self.language)?;
        rules.version.validate(&self.version)?;
        Ok(())
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.name, self.language, self.version)
    }
}

/// A caller's resolution request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolveRequest {
    pub kind: ArtifactKind,
    pub key: ArtifactKey,
    /// Restricts models to those loadable by this reader.
    pub reader: Option<String>,
}

impl ResolveRequest {
    pub fn model(name: impl Into<String>, language: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            kind: ArtifactKind::Model,
            key: ArtifactKey::new(name, language, version),
            reader: None,
        }
    }

    pub fn pipeline(name: impl Into<String>, language: impl Into<String>, version: Option<&str>) -> Self {
        Self {
            kind: ArtifactKind::Pipeline,
            key: ArtifactKey::new(name, language, version),
            reader: None,
        }
    }

    /// Restrict the request to artifacts declaring `reader`.
    pub fn with_reader(mut self, reader: impl Into<String>) -> Self {
        self.reader = Some(reader.into());
        self
    }
}

/// Where a located artifact can be fetched from. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub url: String,
    /// Lowercase hex SHA-256.
    pub expected_checksum: String,
    /// Expected size; 0 when the registry does not report one.
    pub size_bytes: u64,
}

/// Result of locating a key: the concrete version and its location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedArtifact {
    pub resolved_version: String,
    pub location: ArtifactLocation,
}

/// Persisted cache metadata for one committed artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Key with `version` equal to `resolved_version`.
    pub key: ArtifactKey,
    pub kind: ArtifactKind,
    pub resolved_version: String,
    pub checksum: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Progress of an in-flight download. Exists only while the transfer runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadState {
    pub key: ArtifactKey,
    pub bytes_received: u64,
    pub total_bytes: Option<u64>,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl DownloadState {
    /// Fraction complete in `0.0..=1.0`, if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes.and_then(|total| {
            if total > 0 {
                Some((self.bytes_received as f64 / total as f64).min(1.0))
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_defaults_to_latest() {
        let key = ArtifactKey::new("pos_tagger", "en", None);
        assert_eq!(key.version, "latest");
        assert!(key.is_latest());
        assert!(!key.with_version("2.3.0").is_latest());
        assert_eq!(key.with_version("2.3.0").to_string(), "pos_tagger/en/2.3.0");
    }

    #[test]
    fn test_key_validation() {
        assert!(ArtifactKey::new("pos_tagger", "en", Some("2.3.0")).validate().is_ok());
        assert!(ArtifactKey::new("../../etc", "en", None).validate().is_err());
        assert!(ArtifactKey::new("pos", "en/../x", None).validate().is_err());
        assert!(ArtifactKey::new("pos", "en", Some("../1")).validate().is_err());
    }

    #[test]
    fn test_request_constructors() {
        let request = ResolveRequest::model("ner_dl", "en", Some("1.0.0")).with_reader("NerDLModel");
        assert_eq!(request.kind, ArtifactKind::Model);
        assert_eq!(request.reader.as_deref(), Some("NerDLModel"));

        let pipeline = ResolveRequest::pipeline("explain_document_ml", "en", None);
        assert_eq!(pipeline.kind, ArtifactKind::Pipeline);
        assert!(pipeline.key.is_latest());
    }

    #[test]
    fn test_kind_serde() {
        assert_eq!(serde_json::to_string(&ArtifactKind::Pipeline).unwrap(), "\"pipeline\"");
        let kind: ArtifactKind = serde_json::from_str("\"model\"").unwrap();
        assert_eq!(kind, ArtifactKind::Model);
    }

    #[test]
    fn test_download_state_fraction() {
        let state = DownloadState {
            key: ArtifactKey::new("a", "en", Some("1.0.0")),
            bytes_received: 50,
            total_bytes: Some(100),
            attempt: 1,
        };
        assert_eq!(state.fraction(), Some(0.5));

        let unknown = DownloadState {
            total_bytes: None,
            ..state
        };
        assert_eq!(unknown.fraction(), None);
    }
}
