//! Concept taxonomy: phrase -> (profile, cluster) table, constructed once and
//! never mutated afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scoring::normalize_text;

const BUILTIN_TAXONOMY_YAML: &str = include_str!("../../../config/taxonomy.yaml");
const SUPPORTED_TAXONOMY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptEntry {
    pub phrase: String,
    pub profile: String,
    pub cluster: String,
}

impl ConceptEntry {
    pub fn new(phrase: &str, profile: &str, cluster: &str) -> Self {
        Self {
            phrase: phrase.to_string(),
            profile: profile.to_string(),
            cluster: cluster.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TaxonomyError {
    #[error("taxonomy declares no phrases")]
    Empty,
    #[error("phrase {phrase:?} in {profile}/{cluster} is empty after normalization")]
    EmptyPhrase {
        phrase: String,
        profile: String,
        cluster: String,
    },
    #[error("profile {0:?} is declared more than once")]
    DuplicateProfile(String),
    #[error("unsupported taxonomy version {0}")]
    UnsupportedVersion(u32),
    #[error("reading taxonomy {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing taxonomy yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
struct TaxonomyFile {
    version: u32,
    profiles: Vec<ProfileSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct ProfileSpec {
    id: String,
    #[serde(default)]
    label: Option<String>,
    clusters: Vec<ClusterSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct ClusterSpec {
    id: String,
    phrases: Vec<String>,
}

#[derive(Debug, Clone)]
struct ProfileDecl {
    id: String,
    label: Option<String>,
}

#[derive(Debug, Clone)]
struct ClusterDecl {
    profile: usize,
    id: String,
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledPhrase {
    pub(crate) normalized: String,
    pub(crate) cluster: usize,
}

/// Immutable concept table. Profile and cluster indices follow declaration
/// order, which the recommender relies on for tie-breaking.
#[derive(Debug, Clone)]
pub struct ConceptTaxonomy {
    profiles: Vec<ProfileDecl>,
    clusters: Vec<ClusterDecl>,
    phrases: Vec<CompiledPhrase>,
}

impl ConceptTaxonomy {
    /// Build from flat triples. Profiles and clusters are ordered by first
    /// appearance; a phrase repeated under the same cluster counts once.
    pub fn from_entries(
        entries: impl IntoIterator<Item = ConceptEntry>,
    ) -> Result<Self, TaxonomyError> {
        let mut taxonomy = Self {
            profiles: Vec::new(),
            clusters: Vec::new(),
            phrases: Vec::new(),
        };
        for entry in entries {
            let profile = taxonomy.profile_index_or_insert(&entry.profile, None);
            let cluster = taxonomy.cluster_index_or_insert(profile, &entry.cluster);
            taxonomy.push_phrase(&entry.phrase, cluster)?;
        }
        if taxonomy.phrases.is_empty() {
            return Err(TaxonomyError::Empty);
        }
        Ok(taxonomy)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, TaxonomyError> {
        let file: TaxonomyFile = serde_yaml::from_str(text)?;
        if file.version != SUPPORTED_TAXONOMY_VERSION {
            return Err(TaxonomyError::UnsupportedVersion(file.version));
        }

        let mut taxonomy = Self {
            profiles: Vec::new(),
            clusters: Vec::new(),
            phrases: Vec::new(),
        };
        for spec in file.profiles {
            if taxonomy.profile_index(&spec.id).is_some() {
                return Err(TaxonomyError::DuplicateProfile(spec.id));
            }
            let profile = taxonomy.profile_index_or_insert(&spec.id, spec.label);
            for cluster_spec in spec.clusters {
                let cluster = taxonomy.cluster_index_or_insert(profile, &cluster_spec.id);
                for phrase in &cluster_spec.phrases {
                    taxonomy.push_phrase(phrase, cluster)?;
                }
            }
        }
        if taxonomy.phrases.is_empty() {
            return Err(TaxonomyError::Empty);
        }
        Ok(taxonomy)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, TaxonomyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// The taxonomy shipped in `config/taxonomy.yaml`.
    pub fn builtin() -> Result<Self, TaxonomyError> {
        Self::from_yaml_str(BUILTIN_TAXONOMY_YAML)
    }

    pub fn profile_ids(&self) -> impl Iterator<Item = &str> {
        self.profiles.iter().map(|p| p.id.as_str())
    }

    pub fn profile_label(&self, profile_id: &str) -> Option<&str> {
        self.profile_index(profile_id)
            .and_then(|idx| self.profiles[idx].label.as_deref())
    }

    pub fn phrase_count(&self) -> usize {
        self.phrases.len()
    }

    pub(crate) fn profile_count(&self) -> usize {
        self.profiles.len()
    }

    pub(crate) fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub(crate) fn profile_id(&self, idx: usize) -> &str {
        &self.profiles[idx].id
    }

    pub(crate) fn cluster_id(&self, idx: usize) -> &str {
        &self.clusters[idx].id
    }

    pub(crate) fn cluster_profile(&self, idx: usize) -> usize {
        self.clusters[idx].profile
    }

    pub(crate) fn compiled_phrases(&self) -> &[CompiledPhrase] {
        &self.phrases
    }

    fn profile_index(&self, id: &str) -> Option<usize> {
        self.profiles.iter().position(|p| p.id == id)
    }

    fn profile_index_or_insert(&mut self, id: &str, label: Option<String>) -> usize {
        if let Some(idx) = self.profile_index(id) {
            return idx;
        }
        self.profiles.push(ProfileDecl {
            id: id.to_string(),
            label,
        });
        self.profiles.len() - 1
    }

    fn cluster_index_or_insert(&mut self, profile: usize, id: &str) -> usize {
        if let Some(idx) = self
            .clusters
            .iter()
            .position(|c| c.profile == profile && c.id == id)
        {
            return idx;
        }
        self.clusters.push(ClusterDecl {
            profile,
            id: id.to_string(),
        });
        self.clusters.len() - 1
    }

    fn push_phrase(&mut self, phrase: &str, cluster: usize) -> Result<(), TaxonomyError> {
        let normalized = normalize_text(phrase).trim().to_string();
        if normalized.is_empty() {
            let decl = &self.clusters[cluster];
            return Err(TaxonomyError::EmptyPhrase {
                phrase: phrase.to_string(),
                profile: self.profiles[decl.profile].id.clone(),
                cluster: decl.id.clone(),
            });
        }
        let duplicate = self
            .phrases
            .iter()
            .any(|p| p.cluster == cluster && p.normalized == normalized);
        if !duplicate {
            self.phrases.push(CompiledPhrase {
                normalized,
                cluster,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_taxonomy_loads_in_declaration_order() {
        let taxonomy = ConceptTaxonomy::builtin().expect("builtin taxonomy");
        let ids = taxonomy.profile_ids().collect::<Vec<_>>();
        assert_eq!(ids, vec!["Resume A", "Resume B", "Resume C", "Resume D"]);
        assert_eq!(taxonomy.profile_label("Resume C"), Some("Billing & Revenue Platform"));
        assert!(taxonomy.phrase_count() > 50);
    }

    #[test]
    fn phrases_are_normalized_at_construction() {
        let taxonomy = ConceptTaxonomy::from_entries([
            ConceptEntry::new("CI/CD", "A", "delivery"),
            ConceptEntry::new("ci-cd", "A", "delivery"),
        ])
        .unwrap();
        let phrases = taxonomy.compiled_phrases();
        assert_eq!(phrases.len(), 1);
        assert_eq!(phrases[0].normalized, "cicd");
    }

    #[test]
    fn same_phrase_may_feed_several_profiles() {
        let taxonomy = ConceptTaxonomy::from_entries([
            ConceptEntry::new("metrics", "A", "observability"),
            ConceptEntry::new("metrics", "B", "observability"),
        ])
        .unwrap();
        assert_eq!(taxonomy.phrase_count(), 2);
        assert_eq!(taxonomy.cluster_count(), 2);
    }

    #[test]
    fn rejects_empty_and_punctuation_only_phrases() {
        assert!(matches!(
            ConceptTaxonomy::from_entries(Vec::new()),
            Err(TaxonomyError::Empty)
        ));
        assert!(matches!(
            ConceptTaxonomy::from_entries([ConceptEntry::new("///", "A", "x")]),
            Err(TaxonomyError::EmptyPhrase { .. })
        ));
    }

    #[test]
    fn yaml_rejects_unknown_version_and_duplicate_profiles() {
        let v2 = "version: 2\nprofiles: []\n";
        assert!(matches!(
            ConceptTaxonomy::from_yaml_str(v2),
            Err(TaxonomyError::UnsupportedVersion(2))
        ));

        let dup = r#"
version: 1
profiles:
  - id: A
    clusters:
      - id: x
        phrases: [one]
  - id: A
    clusters:
      - id: y
        phrases: [two]
"#;
        assert!(matches!(
            ConceptTaxonomy::from_yaml_str(dup),
            Err(TaxonomyError::DuplicateProfile(p)) if p == "A"
        ));
    }
}
