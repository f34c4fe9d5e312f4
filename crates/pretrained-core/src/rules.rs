//! Named regular-expression rules.
//!
//! A [`RegexRule`] pairs a pattern with an identifier so that a failed match
//! can be reported by name. Artifact key components are validated with the
//! rules in [`ArtifactKeyRules`] before they are ever used as path segments.

use crate::error::{PretrainedError, Result};
use regex::Regex;
use std::sync::OnceLock;

/// A compiled regex with an identifier.
#[derive(Debug, Clone)]
pub struct RegexRule {
    rule: String,
    identifier: String,
    regex: Regex,
}

impl RegexRule {
    /// Compile `rule` under the given identifier.
    pub fn new(rule: impl Into<String>, identifier: impl Into<String>) -> Result<Self> {
        let rule = rule.into();
        let identifier = identifier.into();
        let regex = Regex::new(&rule).map_err(|e| PretrainedError::Validation {
            field: identifier.clone(),
            message: format!("invalid rule {:?}: {}", rule, e),
        })?;
        Ok(Self {
            rule,
            identifier,
            regex,
        })
    }

    /// The source pattern.
    pub fn rule(&self) -> &str {
        &self.rule
    }

    /// The rule identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    /// Return `Validation` naming this rule when `value` does not match.
    pub fn validate(&self, value: &str) -> Result<()> {
        if self.is_match(value) {
            Ok(())
        } else {
            Err(PretrainedError::Validation {
                field: self.identifier.clone(),
                message: format!("{:?} does not match {}", value, self.rule),
            })
        }
    }
}

/// Rules applied to the components of an artifact key.
pub struct ArtifactKeyRules {
    pub name: RegexRule,
    pub language: RegexRule,
    pub version: RegexRule,
}

impl ArtifactKeyRules {
    /// The shared rule set.
    pub fn get() -> &'static ArtifactKeyRules {
        static RULES: OnceLock<ArtifactKeyRules> = OnceLock::new();
        RULES.get_or_init(|| ArtifactKeyRules {
            name: builtin(r"^[A-Za-z0-9][A-Za-z0-9_\-]{0,127}$", "artifact-name"),
            language: builtin(r"^[A-Za-z]{2,3}([_\-][A-Za-z0-9]{2,8})*$", "artifact-language"),
            version: builtin(r"^[0-9A-Za-z][0-9A-Za-z.+_\-]{0,63}$", "artifact-version"),
        })
    }
}

fn builtin(rule: &str, identifier: &str) -> RegexRule {
    match RegexRule::new(rule, identifier) {
        Ok(rule) => rule,
        Err(e) => panic!("BUG: built-in rule {} does not compile: {}", identifier, e),
    }
}
