//! Match Pipeline: role filter -> concept scorer -> profile recommender ->
//! dedup ledger, one pass per batch of postings.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jmat_core::{
    ConceptScorer, ConceptTaxonomy, JobId, JobPosting, MatchDecision, MatchOutcome,
    ProfileRecommender, RoleFilter, RoleFilterConfig,
};
use jmat_storage::DedupLedger;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScoreError {
    #[error("posting {0} has neither a title nor a description")]
    BlankPosting(JobId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSettings {
    pub threshold: u32,
    pub saturation_hits: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub received: usize,
    pub duplicates: usize,
    pub already_seen: usize,
    pub filtered: usize,
    pub suppressed: usize,
    pub eligible: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineRun {
    pub notify: Vec<(JobPosting, MatchOutcome)>,
    /// Ids this run newly marked in the ledger.
    pub marked: Vec<JobId>,
    pub stats: PipelineStats,
}

#[derive(Debug, Clone)]
pub struct MatchPipeline {
    role_filter: RoleFilter,
    scorer: ConceptScorer,
    recommender: ProfileRecommender,
    threshold: u32,
}

impl MatchPipeline {
    pub fn new(
        taxonomy: Arc<ConceptTaxonomy>,
        role_filter: RoleFilter,
        settings: MatchSettings,
    ) -> Self {
        Self {
            role_filter,
            scorer: ConceptScorer::new(taxonomy),
            recommender: ProfileRecommender::new(settings.saturation_hits),
            threshold: settings.threshold,
        }
    }

    /// Taxonomy and role filter from `config_dir`, falling back to the
    /// built-in tables when a file is absent.
    pub fn from_config_dir(config_dir: &Path, settings: MatchSettings) -> anyhow::Result<Self> {
        let taxonomy_path = config_dir.join("taxonomy.yaml");
        let taxonomy = if taxonomy_path.exists() {
            ConceptTaxonomy::from_yaml_file(&taxonomy_path)
                .with_context(|| format!("loading taxonomy {}", taxonomy_path.display()))?
        } else {
            info!(path = %taxonomy_path.display(), "taxonomy file absent; using built-in taxonomy");
            ConceptTaxonomy::builtin().context("loading built-in taxonomy")?
        };

        let role_path = config_dir.join("role_filter.yaml");
        let role_config = if role_path.exists() {
            RoleFilterConfig::from_yaml_file(&role_path)
                .with_context(|| format!("loading role filter {}", role_path.display()))?
        } else {
            RoleFilterConfig::builtin().context("loading built-in role filter")?
        };
        let role_filter = RoleFilter::new(&role_config).context("compiling role filter")?;

        info!(
            phrases = taxonomy.phrase_count(),
            threshold = settings.threshold,
            saturation = settings.saturation_hits,
            "match pipeline ready"
        );
        Ok(Self::new(Arc::new(taxonomy), role_filter, settings))
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Pure evaluation of one posting; no ledger access.
    pub fn evaluate(&self, posting: &JobPosting) -> Result<MatchOutcome, ScoreError> {
        if posting.is_blank() {
            return Err(ScoreError::BlankPosting(posting.id.clone()));
        }
        if !self.role_filter.matches(posting) {
            return Ok(MatchOutcome::filtered_out(posting.id.clone()));
        }
        let board = self.scorer.score_posting(posting);
        let recommendation = self.recommender.recommend(&board);
        Ok(MatchOutcome::from_recommendation(
            posting.id.clone(),
            recommendation,
            self.threshold,
        ))
    }

    /// Score every unseen posting once and mark it in the ledger. Only
    /// notify-eligible outcomes are returned; postings that fail to score are
    /// left unmarked so the next cycle retries them. The caller flushes.
    pub async fn run(
        &self,
        postings: Vec<JobPosting>,
        ledger: &DedupLedger,
        now: DateTime<Utc>,
    ) -> PipelineRun {
        let mut run = PipelineRun::default();
        let mut in_batch: HashSet<JobId> = HashSet::new();

        for posting in postings {
            run.stats.received += 1;
            if !in_batch.insert(posting.id.clone()) {
                run.stats.duplicates += 1;
                continue;
            }
            if ledger.has_seen(&posting.id).await {
                run.stats.already_seen += 1;
                continue;
            }

            let outcome = match self.evaluate(&posting) {
                Ok(outcome) => outcome,
                Err(err) => {
                    run.stats.failed += 1;
                    warn!(job_id = %posting.id, error = %err, "skipping posting");
                    continue;
                }
            };

            if ledger.mark_seen(&posting.id, now).await {
                run.marked.push(posting.id.clone());
            }
            debug!(
                job_id = %outcome.job_id,
                decision = ?outcome.decision,
                score = outcome.score,
                profile = outcome.profile_label(),
                "posting evaluated"
            );
            match outcome.decision {
                MatchDecision::FilteredOut => run.stats.filtered += 1,
                MatchDecision::Suppressed => run.stats.suppressed += 1,
                MatchDecision::NotifyEligible => {
                    run.stats.eligible += 1;
                    run.notify.push((posting, outcome));
                }
            }
        }
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use jmat_core::ConceptEntry;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0)
            .single()
            .expect("valid ts")
    }

    fn pipeline(threshold: u32) -> MatchPipeline {
        let taxonomy = ConceptTaxonomy::from_entries([
            ConceptEntry::new("platform infrastructure", "A", "platform"),
            ConceptEntry::new("api design", "A", "api"),
            ConceptEntry::new("billing platform", "C", "billing"),
        ])
        .expect("taxonomy");
        MatchPipeline::new(
            Arc::new(taxonomy),
            RoleFilter::builtin().expect("role filter"),
            MatchSettings {
                threshold,
                saturation_hits: 4,
            },
        )
    }

    fn posting(id: &str, title: &str, department: &str, description: &str) -> JobPosting {
        JobPosting {
            id: JobId::new("greenhouse", id),
            title: title.to_string(),
            description: description.to_string(),
            company: "acme".to_string(),
            location: "Remote".to_string(),
            department: department.to_string(),
            url: format!("https://boards.greenhouse.io/acme/jobs/{id}"),
            source: "greenhouse".to_string(),
        }
    }

    async fn ledger(dir: &Path) -> DedupLedger {
        DedupLedger::open(dir.join("seen.json"), Duration::days(30), now())
            .await
            .expect("ledger")
            .0
    }

    #[test]
    fn worked_example_is_notify_eligible_for_profile_a() {
        let outcome = pipeline(15)
            .evaluate(&posting(
                "1",
                "Senior Product Manager",
                "Product",
                "Platform infrastructure and API design.",
            ))
            .expect("evaluate");
        assert_eq!(outcome.decision, MatchDecision::NotifyEligible);
        assert_eq!(outcome.recommended_profile.as_deref(), Some("A"));
        assert_eq!(outcome.score, 50);
    }

    #[tokio::test]
    async fn role_filtered_posting_is_recorded_with_zero_score_and_not_returned() {
        let dir = tempdir().expect("tempdir");
        let ledger = ledger(dir.path()).await;
        let engineer = posting(
            "2",
            "Software Engineer",
            "Product",
            "platform infrastructure and api design",
        );

        let outcome = pipeline(15).evaluate(&engineer).expect("evaluate");
        assert_eq!(outcome.decision, MatchDecision::FilteredOut);
        assert_eq!(outcome.score, 0);

        let run = pipeline(15).run(vec![engineer.clone()], &ledger, now()).await;
        assert!(run.notify.is_empty());
        assert_eq!(run.stats.filtered, 1);
        assert!(ledger.has_seen(&engineer.id).await);
    }

    #[tokio::test]
    async fn duplicates_within_and_across_batches_score_once() {
        let dir = tempdir().expect("tempdir");
        let ledger = ledger(dir.path()).await;
        let pipeline = pipeline(15);
        let pm = posting("3", "Product Manager", "", "platform infrastructure");

        let first = pipeline
            .run(vec![pm.clone(), pm.clone(), pm.clone()], &ledger, now())
            .await;
        assert_eq!(first.notify.len(), 1);
        assert_eq!(first.stats.duplicates, 2);
        assert_eq!(first.marked, vec![pm.id.clone()]);

        let later = now() + Duration::hours(1);
        let second = pipeline.run(vec![pm.clone()], &ledger, later).await;
        assert!(second.notify.is_empty());
        assert!(second.marked.is_empty());
        assert_eq!(second.stats.already_seen, 1);
        assert_eq!(ledger.first_seen(&pm.id).await, Some(now()));
    }

    #[tokio::test]
    async fn below_threshold_is_suppressed_but_marked() {
        let dir = tempdir().expect("tempdir");
        let ledger = ledger(dir.path()).await;
        let pm = posting("4", "Product Manager", "", "billing platform");

        let run = pipeline(30).run(vec![pm.clone()], &ledger, now()).await;
        assert!(run.notify.is_empty());
        assert_eq!(run.stats.suppressed, 1);
        assert!(ledger.has_seen(&pm.id).await);
    }

    #[tokio::test]
    async fn blank_posting_is_skipped_without_marking() {
        let dir = tempdir().expect("tempdir");
        let ledger = ledger(dir.path()).await;
        let blank = posting("5", "  ", "Product", "");
        let good = posting("6", "Product Manager", "", "api design");

        let run = pipeline(15)
            .run(vec![blank.clone(), good.clone()], &ledger, now())
            .await;
        assert_eq!(run.stats.failed, 1);
        assert_eq!(run.notify.len(), 1);
        assert_eq!(run.marked, vec![good.id.clone()]);
        assert!(!ledger.has_seen(&blank.id).await);
        assert!(ledger.has_seen(&good.id).await);
        assert_eq!(
            pipeline(15).evaluate(&blank),
            Err(ScoreError::BlankPosting(blank.id.clone()))
        );
    }

    #[test]
    fn loads_shipped_config_directory() {
        let config_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config");
        let pipeline = MatchPipeline::from_config_dir(
            &config_dir,
            MatchSettings {
                threshold: 15,
                saturation_hits: 4,
            },
        )
        .expect("pipeline from config dir");
        assert_eq!(pipeline.threshold(), 15);
    }
}
