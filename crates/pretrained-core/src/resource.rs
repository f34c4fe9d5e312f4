//! Descriptions of local resources such as offline registry index files.

use crate::error::{PretrainedError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How the contents of a resource are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadAs {
    #[default]
    Text,
    Binary,
}

impl FromStr for ReadAs {
    type Err = PretrainedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(ReadAs::Text),
            "binary" => Ok(ReadAs::Binary),
            other => Err(PretrainedError::Validation {
                field: "read_as".to_string(),
                message: format!("unknown read mode {:?}, expected text or binary", other),
            }),
        }
    }
}

/// A file on the local filesystem plus options describing how to read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalResource {
    pub path: PathBuf,
    #[serde(default)]
    pub read_as: ReadAs,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl ExternalResource {
    /// Option naming the format of a structured resource.
    pub const FORMAT_OPTION: &'static str = "format";

    pub fn new(path: impl Into<PathBuf>, read_as: ReadAs) -> Self {
        Self {
            path: path.into(),
            read_as,
            options: HashMap::new(),
        }
    }

    /// Add an option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Declared format, lowercased. Defaults to `json`.
    pub fn format(&self) -> String {
        self.option(Self::FORMAT_OPTION)
            .unwrap_or("json")
            .to_ascii_lowercase()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the resource as UTF-8 text. Fails for binary resources.
    pub async fn read_text(&self) -> Result<String> {
        if self.read_as != ReadAs::Text {
            return Err(PretrainedError::Validation {
                field: "read_as".to_string(),
                message: format!("{} is declared binary", self.path.display()),
            });
        }
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| PretrainedError::disk("Failed to read resource", &self.path, e))
    }

    /// Read the raw bytes of the resource.
    pub async fn read_bytes(&self) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| PretrainedError::disk("Failed to read resource", &self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_as_parsing() {
        assert_eq!("TEXT".parse::<ReadAs>().unwrap(), ReadAs::Text);
        assert_eq!("binary".parse::<ReadAs>().unwrap(), ReadAs::Binary);
        assert!("lines".parse::<ReadAs>().is_err());
    }

    #[test]
    fn test_options_and_format() {
        let resource = ExternalResource::new("/tmp/index.json", ReadAs::Text);
        assert_eq!(resource.format(), "json");

        let resource = resource.with_option("format", "JSON").with_option("delimiter", ",");
        assert_eq!(resource.format(), "json");
        assert_eq!(resource.option("delimiter"), Some(","));
        assert_eq!(resource.option("missing"), None);
    }

    #[tokio::test]
    async fn test_read_text_and_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.json");
        std::fs::write(&path, "[]").unwrap();

        let text = ExternalResource::new(&path, ReadAs::Text);
        assert_eq!(text.read_text().await.unwrap(), "[]");

        let binary = ExternalResource::new(&path, ReadAs::Binary);
        assert!(binary.read_text().await.is_err());
        assert_eq!(binary.read_bytes().await.unwrap(), b"[]");
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let resource: ExternalResource =
            serde_json::from_str(r#"{"path": "/data/registry.json"}"#).unwrap();
        assert_eq!(resource.read_as, ReadAs::Text);
        assert!(resource.options.is_empty());
    }
}
