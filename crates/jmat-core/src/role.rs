//! Target role family gate, applied before any concept scoring.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scoring::normalize_text;
use crate::JobPosting;

const BUILTIN_ROLE_FILTER_YAML: &str = include_str!("../../../config/role_filter.yaml");
const SUPPORTED_ROLE_FILTER_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RoleFilterError {
    #[error("unsupported role filter version {0}")]
    UnsupportedVersion(u32),
    #[error("role filter declares no title phrases")]
    NoTitlePhrases,
    #[error("reading role filter {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing role filter yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleFilterConfig {
    pub version: u32,
    pub title_phrases: Vec<String>,
    #[serde(default)]
    pub department_terms: Vec<String>,
    #[serde(default)]
    pub role_shape_words: Vec<String>,
}

impl RoleFilterConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, RoleFilterError> {
        let config: Self = serde_yaml::from_str(text)?;
        if config.version != SUPPORTED_ROLE_FILTER_VERSION {
            return Err(RoleFilterError::UnsupportedVersion(config.version));
        }
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RoleFilterError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RoleFilterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn builtin() -> Result<Self, RoleFilterError> {
        Self::from_yaml_str(BUILTIN_ROLE_FILTER_YAML)
    }
}

/// Compiled role filter. A posting passes when its title carries a role
/// phrase, or its department carries a domain term and its title a
/// role-shape word.
#[derive(Debug, Clone)]
pub struct RoleFilter {
    title_phrases: Vec<String>,
    department_terms: Vec<String>,
    role_shape_words: Vec<String>,
}

impl RoleFilter {
    pub fn new(config: &RoleFilterConfig) -> Result<Self, RoleFilterError> {
        let title_phrases = compile(&config.title_phrases);
        if title_phrases.is_empty() {
            return Err(RoleFilterError::NoTitlePhrases);
        }
        Ok(Self {
            title_phrases,
            department_terms: compile(&config.department_terms),
            role_shape_words: compile(&config.role_shape_words),
        })
    }

    pub fn builtin() -> Result<Self, RoleFilterError> {
        Self::new(&RoleFilterConfig::builtin()?)
    }

    pub fn matches(&self, posting: &JobPosting) -> bool {
        self.matches_fields(&posting.title, &posting.department)
    }

    pub fn matches_fields(&self, title: &str, department: &str) -> bool {
        let title = normalize_text(title);
        if contains_any(&title, &self.title_phrases) {
            return true;
        }
        let department = normalize_text(department);
        contains_any(&department, &self.department_terms)
            && contains_any(&title, &self.role_shape_words)
    }
}

fn compile(phrases: &[String]) -> Vec<String> {
    let mut compiled = Vec::with_capacity(phrases.len());
    for phrase in phrases {
        let normalized = normalize_text(phrase).trim().to_string();
        if !normalized.is_empty() && !compiled.contains(&normalized) {
            compiled.push(normalized);
        }
    }
    compiled
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle.as_str()))
}
