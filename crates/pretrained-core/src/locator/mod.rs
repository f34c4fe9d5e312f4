//! Resolution of symbolic artifact requests to downloadable locations.
//!
//! [`ResourceLocator::locate`] maps `(kind, name, language, version?)` to the
//! concrete version and the URL/checksum to fetch. `"latest"` selects the
//! highest semantic version the registry lists for the pair. The locator has
//! no local side effects.

mod registry;

pub use registry::{
    parse_index, DynRegistryIndex, HttpRegistryIndex, IndexEntry, RegistryIndex,
    StaticRegistryIndex,
};

use crate::error::{PretrainedError, Result};
use crate::hashing::normalize_checksum;
use crate::rules::ArtifactKeyRules;
use crate::types::{ArtifactKey, ArtifactKind, ArtifactLocation, LocatedArtifact};
use tracing::{debug, warn};

/// Resolves requests against a registry index.
#[derive(Clone)]
pub struct ResourceLocator {
    index: DynRegistryIndex,
}

impl ResourceLocator {
    pub fn new(index: DynRegistryIndex) -> Self {
        Self { index }
    }

    /// Location of the underlying index.
    pub fn source(&self) -> &str {
        self.index.source()
    }

    /// Locate `key` in the `kind` catalogue.
    ///
    /// `reader` restricts candidates to entries declaring that reader;
    /// entries that declare none match any reader.
    ///
    /// # Errors
    ///
    /// - `Validation` if a key component is malformed
    /// - `RegistryUnavailable` if the index cannot be reached
    /// - `NotFound` if no entry matches
    pub async fn locate(
        &self,
        kind: ArtifactKind,
        key: &ArtifactKey,
        reader: Option<&str>,
    ) -> Result<LocatedArtifact> {
        key.validate()?;
        let entries = self.index.entries().await?;

        let candidates = entries.iter().filter(|entry| {
            entry.kind == kind
                && entry.name == key.name
                && entry.language == key.language
                && match (reader, entry.reader.as_deref()) {
                    (Some(wanted), Some(declared)) => wanted == declared,
                    _ => true,
                }
        });

        let chosen = if key.is_latest() {
            candidates
                .filter_map(|entry| parse_version(&entry.version).map(|v| (v, entry)))
                .filter(|(_, entry)| usable(entry))
                .max_by(|(a, _), (b, _)| a.cmp(b))
                .map(|(_, entry)| entry)
        } else {
            candidates
                .filter(|entry| entry.version == key.version)
                .find(|entry| usable(entry))
        };

        let entry = chosen.ok_or_else(|| PretrainedError::NotFound {
            kind: kind.to_string(),
            name: key.name.clone(),
            language: key.language.clone(),
            version: key.version.clone(),
        })?;

        // `usable` already checked the digest.
        let expected_checksum = normalize_checksum(&entry.sha256).unwrap_or_default();
        debug!(
            "Located {} {} as version {} at {}",
            kind, key, entry.version, entry.url
        );

        Ok(LocatedArtifact {
            resolved_version: entry.version.clone(),
            location: ArtifactLocation {
                url: entry.url.clone(),
                expected_checksum,
                size_bytes: entry.size,
            },
        })
    }
}

/// Parse a registry version as semver, tolerating a leading `v`.
fn parse_version(raw: &str) -> Option<semver::Version> {
    let trimmed = raw.strip_prefix('v').unwrap_or(raw);
    semver::Version::parse(trimmed).ok()
}

/// Whether an entry can be cached: a valid digest and a path-safe version.
fn usable(entry: &IndexEntry) -> bool {
    if normalize_checksum(&entry.sha256).is_none() {
        warn!(
            "Ignoring registry entry {}/{}/{}: malformed sha256",
            entry.name, entry.language, entry.version
        );
        return false;
    }
    if !ArtifactKeyRules::get().version.is_match(&entry.version) {
        warn!(
            "Ignoring registry entry {}/{}: unusable version {:?}",
            entry.name, entry.language, entry.version
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DIGEST: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn entry(name: &str, version: &str, kind: ArtifactKind, reader: Option<&str>) -> IndexEntry {
        IndexEntry {
            name: name.to_string(),
            language: "en".to_string(),
            version: version.to_string(),
            kind,
            url: format!("https://registry.example.com/{}-{}.zip", name, version),
            sha256: DIGEST.to_string(),
            size: 1024,
            reader: reader.map(str::to_string),
        }
    }

    fn locator(entries: Vec<IndexEntry>) -> ResourceLocator {
        ResourceLocator::new(Arc::new(StaticRegistryIndex::new(entries)))
    }

    #[tokio::test]
    async fn test_latest_selects_highest_semver() {
        let locator = locator(vec![
            entry("pos_tagger", "2.0.0", ArtifactKind::Model, None),
            entry("pos_tagger", "2.3.0", ArtifactKind::Model, None),
            entry("pos_tagger", "2.10.0-rc.1", ArtifactKind::Model, None),
            entry("pos_tagger", "2.2.9", ArtifactKind::Model, None),
            entry("pos_tagger", "nightly", ArtifactKind::Model, None),
        ]);

        let located = locator
            .locate(ArtifactKind::Model, &ArtifactKey::new("pos_tagger", "en", None), None)
            .await
            .unwrap();
        assert_eq!(located.resolved_version, "2.10.0-rc.1");
        assert_eq!(located.location.expected_checksum, DIGEST);
        assert_eq!(located.location.size_bytes, 1024);
    }

    #[tokio::test]
    async fn test_exact_version_including_non_semver() {
        let locator = locator(vec![
            entry("pos_tagger", "2.3.0", ArtifactKind::Model, None),
            entry("pos_tagger", "nightly", ArtifactKind::Model, None),
        ]);

        let located = locator
            .locate(
                ArtifactKind::Model,
                &ArtifactKey::new("pos_tagger", "en", Some("nightly")),
                None,
            )
            .await
            .unwrap();
        assert_eq!(located.resolved_version, "nightly");

        let err = locator
            .locate(
                ArtifactKind::Model,
                &ArtifactKey::new("pos_tagger", "en", Some("9.9.9")),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PretrainedError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_kind_separates_catalogues() {
        let locator = locator(vec![entry("explain_document_ml", "1.0.0", ArtifactKind::Pipeline, None)]);

        let key = ArtifactKey::new("explain_document_ml", "en", None);
        assert!(locator.locate(ArtifactKind::Pipeline, &key, None).await.is_ok());
        let err = locator.locate(ArtifactKind::Model, &key, None).await.unwrap_err();
        assert!(matches!(err, PretrainedError::NotFound { ref kind, .. } if kind == "model"));
    }

    #[tokio::test]
    async fn test_reader_filter() {
        let locator = locator(vec![
            entry("ner", "1.0.0", ArtifactKind::Model, Some("NerCrfModel")),
            entry("ner", "2.0.0", ArtifactKind::Model, Some("NerDLModel")),
            entry("generic", "1.0.0", ArtifactKind::Model, None),
        ]);

        let key = ArtifactKey::new("ner", "en", None);
        let located = locator
            .locate(ArtifactKind::Model, &key, Some("NerCrfModel"))
            .await
            .unwrap();
        assert_eq!(located.resolved_version, "1.0.0");

        let err = locator
            .locate(ArtifactKind::Model, &key, Some("SentimentModel"))
            .await
            .unwrap_err();
        assert!(matches!(err, PretrainedError::NotFound { .. }));

        assert!(locator
            .locate(ArtifactKind::Model, &ArtifactKey::new("generic", "en", None), Some("Any"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found() {
        let locator = locator(vec![entry("pos_tagger", "2.3.0", ArtifactKind::Model, None)]);
        let err = locator
            .locate(ArtifactKind::Model, &ArtifactKey::new("typo_model", "en", None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PretrainedError::NotFound { ref name, .. } if name == "typo_model"));
    }

    #[tokio::test]
    async fn test_malformed_entries_are_skipped() {
        let mut bad_digest = entry("pos_tagger", "3.0.0", ArtifactKind::Model, None);
        bad_digest.sha256 = "not-a-digest".to_string();
        let mut bad_version = entry("pos_tagger", "4.0.0", ArtifactKind::Model, None);
        bad_version.version = "4.0.0/../../x".to_string();

        let locator = locator(vec![
            entry("pos_tagger", "2.3.0", ArtifactKind::Model, None),
            bad_digest,
            bad_version,
        ]);
        let located = locator
            .locate(ArtifactKind::Model, &ArtifactKey::new("pos_tagger", "en", None), None)
            .await
            .unwrap();
        assert_eq!(located.resolved_version, "2.3.0");
    }

    #[tokio::test]
    async fn test_invalid_key_rejected_before_lookup() {
        let locator = locator(vec![]);
        let err = locator
            .locate(ArtifactKind::Model, &ArtifactKey::new("../etc", "en", None), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PretrainedError::Validation { .. }));
    }
}
