//! Text normalization, concept scoring and profile recommendation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::taxonomy::ConceptTaxonomy;
use crate::JobPosting;

/// Four distinct concept hits saturate the score at 100%.
pub const DEFAULT_SATURATION_HITS: u32 = 4;

/// Lowercase and drop every character that is neither a word character
/// (alphanumeric or `_`) nor whitespace.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTally {
    pub cluster: String,
    pub hits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileTally {
    pub profile: String,
    pub clusters: Vec<ClusterTally>,
}

impl ProfileTally {
    pub fn total(&self) -> u32 {
        self.clusters.iter().map(|c| c.hits).sum()
    }
}

/// Per-profile, per-cluster hit counts for one job. Only profiles and clusters
/// with at least one hit appear, in taxonomy declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConceptScoreboard {
    profiles: Vec<ProfileTally>,
}

impl ConceptScoreboard {
    pub fn profiles(&self) -> &[ProfileTally] {
        &self.profiles
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn hits(&self, profile: &str, cluster: &str) -> u32 {
        self.profiles
            .iter()
            .find(|p| p.profile == profile)
            .and_then(|p| p.clusters.iter().find(|c| c.cluster == cluster))
            .map(|c| c.hits)
            .unwrap_or(0)
    }

    pub fn profile_total(&self, profile: &str) -> u32 {
        self.profiles
            .iter()
            .find(|p| p.profile == profile)
            .map(ProfileTally::total)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct ConceptScorer {
    taxonomy: Arc<ConceptTaxonomy>,
}

impl ConceptScorer {
    pub fn new(taxonomy: Arc<ConceptTaxonomy>) -> Self {
        Self { taxonomy }
    }

    pub fn taxonomy(&self) -> &ConceptTaxonomy {
        &self.taxonomy
    }

    /// Substring containment per phrase; each phrase counts at most once.
    pub fn score(&self, normalized_text: &str) -> ConceptScoreboard {
        let taxonomy = &self.taxonomy;
        let mut cluster_hits = vec![0u32; taxonomy.cluster_count()];
        for phrase in taxonomy.compiled_phrases() {
            if normalized_text.contains(phrase.normalized.as_str()) {
                cluster_hits[phrase.cluster] += 1;
            }
        }

        let mut profiles = Vec::new();
        for profile_idx in 0..taxonomy.profile_count() {
            let clusters = cluster_hits
                .iter()
                .enumerate()
                .filter(|(idx, hits)| **hits > 0 && taxonomy.cluster_profile(*idx) == profile_idx)
                .map(|(idx, hits)| ClusterTally {
                    cluster: taxonomy.cluster_id(idx).to_string(),
                    hits: *hits,
                })
                .collect::<Vec<_>>();
            if !clusters.is_empty() {
                profiles.push(ProfileTally {
                    profile: taxonomy.profile_id(profile_idx).to_string(),
                    clusters,
                });
            }
        }
        ConceptScoreboard { profiles }
    }

    pub fn score_posting(&self, posting: &JobPosting) -> ConceptScoreboard {
        self.score(&normalize_text(&posting.scoring_text()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub profile: Option<String>,
    pub raw_hits: u32,
    pub score: u32,
    pub matched_clusters: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ProfileRecommender {
    saturation_hits: u32,
}

impl Default for ProfileRecommender {
    fn default() -> Self {
        Self::new(DEFAULT_SATURATION_HITS)
    }
}

impl ProfileRecommender {
    pub fn new(saturation_hits: u32) -> Self {
        Self {
            saturation_hits: saturation_hits.max(1),
        }
    }

    pub fn saturation_hits(&self) -> u32 {
        self.saturation_hits
    }

    pub fn normalize(&self, raw_hits: u32) -> u32 {
        let scaled = u64::from(raw_hits) * 100 / u64::from(self.saturation_hits);
        scaled.min(100) as u32
    }

    /// Highest profile total wins; ties keep the first declared profile.
    pub fn recommend(&self, board: &ConceptScoreboard) -> Recommendation {
        let mut best: Option<&ProfileTally> = None;
        for tally in board.profiles() {
            match best {
                Some(current) if tally.total() <= current.total() => {}
                _ => best = Some(tally),
            }
        }

        let Some(best) = best else {
            return Recommendation {
                profile: None,
                raw_hits: 0,
                score: 0,
                matched_clusters: Vec::new(),
            };
        };

        let mut clusters = best.clusters.clone();
        // stable: equal hit counts stay in declaration order
        clusters.sort_by(|a, b| b.hits.cmp(&a.hits));
        let raw_hits = best.total();
        Recommendation {
            profile: Some(best.profile.clone()),
            raw_hits,
            score: self.normalize(raw_hits),
            matched_clusters: clusters.into_iter().map(|c| c.cluster).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::ConceptEntry;

    fn scorer(entries: Vec<ConceptEntry>) -> ConceptScorer {
        ConceptScorer::new(Arc::new(ConceptTaxonomy::from_entries(entries).unwrap()))
    }

    #[test]
    fn normalizer_lowercases_and_strips_punctuation() {
        assert_eq!(normalize_text("CI/CD, Kubernetes & APIs!"), "cicd kubernetes  apis");
        assert_eq!(normalize_text("snake_case stays"), "snake_case stays");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn worked_example_scores_fifty_for_profile_a() {
        let scorer = scorer(vec![
            ConceptEntry::new("platform infrastructure", "A", "platform"),
            ConceptEntry::new("api design", "A", "api"),
            ConceptEntry::new("billing platform", "C", "billing"),
        ]);
        let board = scorer.score("senior product manager platform infrastructure and api design");
        assert_eq!(board.profile_total("A"), 2);
        assert_eq!(board.profile_total("C"), 0);

        let rec = ProfileRecommender::new(4).recommend(&board);
        assert_eq!(rec.profile.as_deref(), Some("A"));
        assert_eq!(rec.raw_hits, 2);
        assert_eq!(rec.score, 50);
    }

    #[test]
    fn repeated_phrase_counts_once() {
        let scorer = scorer(vec![ConceptEntry::new("kubernetes", "A", "infra")]);
        let board = scorer.score("kubernetes kubernetes kubernetes");
        assert_eq!(board.hits("A", "infra"), 1);
    }

    #[test]
    fn scoreboard_only_reports_present_phrases() {
        let scorer = scorer(vec![
            ConceptEntry::new("graphql", "A", "api"),
            ConceptEntry::new("terraform", "A", "infra"),
            ConceptEntry::new("invoicing", "B", "billing"),
        ]);
        let text = "we use graphql heavily";
        let board = scorer.score(text);
        for profile in board.profiles() {
            for cluster in &profile.clusters {
                assert!(cluster.hits > 0);
            }
        }
        assert_eq!(board.hits("A", "api"), 1);
        assert_eq!(board.hits("A", "infra"), 0);
        assert_eq!(board.hits("B", "billing"), 0);
        assert_eq!(board.profiles().len(), 1);
    }

    #[test]
    fn containment_matches_inside_longer_words() {
        let scorer = scorer(vec![ConceptEntry::new("ARR", "C", "revenue")]);
        assert_eq!(scorer.score("carry the team").hits("C", "revenue"), 1);
    }

    #[test]
    fn ties_resolve_to_first_declared_profile_every_time() {
        let scorer = scorer(vec![
            ConceptEntry::new("monitoring", "B", "observability"),
            ConceptEntry::new("metrics", "A", "observability"),
        ]);
        let board = scorer.score("metrics and monitoring");
        let recommender = ProfileRecommender::default();
        for _ in 0..10 {
            let rec = recommender.recommend(&board);
            assert_eq!(rec.profile.as_deref(), Some("B"));
            assert_eq!(rec.score, 25);
        }
    }

    #[test]
    fn no_hits_yields_none_with_zero_score() {
        let scorer = scorer(vec![ConceptEntry::new("graphql", "A", "api")]);
        let rec = ProfileRecommender::default().recommend(&scorer.score("nothing relevant"));
        assert_eq!(rec.profile, None);
        assert_eq!(rec.score, 0);
        assert!(rec.matched_clusters.is_empty());
    }

    #[test]
    fn score_saturates_at_one_hundred() {
        let recommender = ProfileRecommender::new(4);
        assert_eq!(recommender.normalize(3), 75);
        assert_eq!(recommender.normalize(4), 100);
        assert_eq!(recommender.normalize(9), 100);
        assert_eq!(ProfileRecommender::new(0).saturation_hits(), 1);
        assert_eq!(ProfileRecommender::new(3).normalize(1), 33);
    }

    #[test]
    fn matched_clusters_sorted_by_hits_then_declaration() {
        let scorer = scorer(vec![
            ConceptEntry::new("logging", "A", "observability"),
            ConceptEntry::new("graphql", "A", "api"),
            ConceptEntry::new("rest api", "A", "api"),
            ConceptEntry::new("terraform", "A", "infra"),
        ]);
        let board = scorer.score("logging graphql rest api terraform");
        let rec = ProfileRecommender::default().recommend(&board);
        assert_eq!(rec.matched_clusters, vec!["api", "observability", "infra"]);
        assert_eq!(rec.raw_hits, 4);
        assert_eq!(rec.score, 100);
    }

    #[test]
    fn builtin_taxonomy_recommends_internal_tools_for_sample_posting() {
        let scorer = ConceptScorer::new(Arc::new(ConceptTaxonomy::builtin().unwrap()));
        let text = normalize_text(
            "We're looking for a Product Manager to lead our internal work management platform. \
             You'll improve productivity tooling, collaborate with engineering to scale internal \
             workflows, and drive adoption of self-serve solutions that improve developer efficiency.",
        );
        let rec = ProfileRecommender::default().recommend(&scorer.score(&text));
        assert_eq!(rec.profile.as_deref(), Some("Resume D"));
        assert_eq!(rec.raw_hits, 3);
        assert_eq!(rec.score, 75);
    }
}
