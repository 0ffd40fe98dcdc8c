use chrono::NaiveDate;
use std::time::Duration;

use crate::config::Config;
use crate::error::DigestError;
use crate::layers::delivery::{Mailer, OutgoingMail};
use crate::layers::digest::{Digest, DigestConfig};
use crate::layers::discovery::PaperSource;
use crate::layers::prefilter::KeywordFilter;
use crate::layers::profile::InterestProfile;
use crate::layers::scoring::{score_all, Scorer};

/// Counters for one run, logged at the end.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunReport {
    pub fetched: usize,
    pub candidates: usize,
    pub scored: usize,
    pub scoring_failures: usize,
    pub digest_len: usize,
    pub delivered: bool,
}

/// Fetch -> pre-filter -> score -> assemble -> deliver, once.
pub struct Pipeline<'a> {
    config: &'a Config,
    source: &'a dyn PaperSource,
    scorer: &'a dyn Scorer,
    mailer: &'a dyn Mailer,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        source: &'a dyn PaperSource,
        scorer: &'a dyn Scorer,
        mailer: &'a dyn Mailer,
    ) -> Self {
        Self { config, source, scorer, mailer }
    }

    pub async fn run(&self, profile: &InterestProfile, today: NaiveDate) -> Result<RunReport, DigestError> {
        let mut report = RunReport::default();

        // 1. Fetch
        let categories = self.config.categories();
        tracing::info!("--- Fetching {} ---", categories.join(", "));
        let papers = self.source.fetch(&categories).await?;
        report.fetched = papers.len();

        // 2. Pre-filter
        let filter = KeywordFilter::new(&self.config.arxiv.keywords);
        let candidates = filter.apply(papers);
        report.candidates = candidates.len();
        if filter.is_noop() {
            tracing::info!("No keywords configured, scoring all {} papers", report.candidates);
        } else {
            tracing::info!("{} of {} papers matched keywords", report.candidates, report.fetched);
        }

        // 3. Score
        tracing::info!("--- Scoring {} candidates ---", candidates.len());
        let outcome = score_all(
            self.scorer,
            &candidates,
            profile,
            self.config.openai.max_workers,
            Duration::from_secs(self.config.openai.run_timeout_secs),
        )
        .await?;
        report.scored = outcome.scored.len();
        report.scoring_failures = outcome.failures.len();
        if !candidates.is_empty() && outcome.scored.is_empty() {
            return Err(DigestError::AllScoringFailed { attempted: candidates.len() });
        }
        if report.scoring_failures > 0 {
            tracing::warn!("{} candidates could not be scored and were left out", report.scoring_failures);
        }

        // 4. Assemble
        let digest_config = DigestConfig {
            threshold: self.config.threshold,
            max_papers: self.config.max_papers,
        };
        let digest = Digest::assemble(outcome.scored, &digest_config, today);
        report.digest_len = digest.len();
        tracing::info!(
            "Digest holds {} papers (threshold {:.1}, cap {})",
            report.digest_len,
            digest_config.threshold,
            digest_config.max_papers
        );

        // 5. Deliver
        if digest.is_empty() && !self.config.email.send_when_empty {
            tracing::info!("No matches today and send_when_empty is off, not sending");
            return Ok(report);
        }
        let mail = OutgoingMail::from_digest(&digest);
        if let Err(e) = self.mailer.send(&mail).await {
            tracing::error!("Delivery failed, digest follows so it is not lost:\n{}", mail.text);
            return Err(e);
        }
        report.delivered = true;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::scoring::ScoreFailure;
    use crate::layers::{test_paper, PaperRecord, ScoredCandidate};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedSource(Result<Vec<PaperRecord>, String>);

    #[async_trait]
    impl PaperSource for FixedSource {
        async fn fetch(&self, _categories: &[String]) -> Result<Vec<PaperRecord>, DigestError> {
            self.0.clone().map_err(DigestError::FetchUnavailable)
        }
    }

    struct FixedScorer(HashMap<String, Result<f64, ScoreFailure>>);

    #[async_trait]
    impl Scorer for FixedScorer {
        async fn score(
            &self,
            paper: &PaperRecord,
            _profile: &InterestProfile,
        ) -> Result<ScoredCandidate, ScoreFailure> {
            let score = self
                .0
                .get(&paper.id)
                .cloned()
                .unwrap_or_else(|| Err(ScoreFailure::Rejected("unknown".to_string())))?;
            Ok(ScoredCandidate {
                paper: paper.clone(),
                score,
                rationale: "fits".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<OutgoingMail>>,
        fail: bool,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, mail: &OutgoingMail) -> Result<(), DigestError> {
            if self.fail {
                return Err(DigestError::DeliveryFailed("auth refused".to_string()));
            }
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    fn config() -> Config {
        Config::from_toml(
            r#"
threshold = 7.0
max_papers = 10

[openai]
api_key = "sk-test"
run_timeout_secs = 5

[arxiv]
categories = ["cs.LG"]

[interests]
description = "sparse attention"
"#,
        )
        .unwrap()
    }

    fn scorer(entries: &[(&str, Result<f64, ScoreFailure>)]) -> FixedScorer {
        FixedScorer(entries.iter().map(|(id, r)| (id.to_string(), r.clone())).collect())
    }

    fn papers(ids: &[&str]) -> FixedSource {
        FixedSource(Ok(ids.iter().map(|id| test_paper(id)).collect()))
    }

    fn profile() -> InterestProfile {
        InterestProfile::new("sparse attention", vec![], 30)
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 16).unwrap()
    }

    #[tokio::test]
    async fn test_isolated_scoring_failure_does_not_abort_run() {
        let cfg = config();
        let source = papers(&["p1", "p2", "p3"]);
        let scorer = scorer(&[
            ("p1", Ok(9.0)),
            ("p2", Err(ScoreFailure::Transient("retries exhausted".to_string()))),
            ("p3", Ok(8.0)),
        ]);
        let mailer = RecordingMailer::default();

        let report = Pipeline::new(&cfg, &source, &scorer, &mailer)
            .run(&profile(), today())
            .await
            .unwrap();

        assert_eq!(report.scored, 2);
        assert_eq!(report.scoring_failures, 1);
        assert_eq!(report.digest_len, 2);
        assert!(report.delivered);
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("Paper p1"));
        assert!(sent[0].text.contains("Paper p3"));
    }

    #[tokio::test]
    async fn test_no_matches_still_sends_notice_by_default() {
        let cfg = config();
        let source = papers(&["p1", "p2"]);
        let scorer = scorer(&[("p1", Ok(2.0)), ("p2", Ok(6.5))]);
        let mailer = RecordingMailer::default();

        let report = Pipeline::new(&cfg, &source, &scorer, &mailer)
            .run(&profile(), today())
            .await
            .unwrap();

        assert_eq!(report.digest_len, 0);
        assert!(report.delivered);
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent[0].subject, "arXiv digest 2024-01-16: no matches");
    }

    #[tokio::test]
    async fn test_no_matches_can_be_suppressed() {
        let mut cfg = config();
        cfg.email.send_when_empty = false;
        let source = papers(&["p1"]);
        let scorer = scorer(&[("p1", Ok(1.0))]);
        let mailer = RecordingMailer::default();

        let report = Pipeline::new(&cfg, &source, &scorer, &mailer)
            .run(&profile(), today())
            .await
            .unwrap();

        assert!(!report.delivered);
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keywords_limit_scored_candidates() {
        let cfg = Config {
            arxiv: crate::config::ArxivConfig {
                keywords: vec!["p2".to_string()],
                ..config().arxiv
            },
            ..config()
        };
        let source = papers(&["p1", "p2"]);
        let scorer = scorer(&[("p1", Ok(9.0)), ("p2", Ok(9.0))]);
        let mailer = RecordingMailer::default();

        let report = Pipeline::new(&cfg, &source, &scorer, &mailer)
            .run(&profile(), today())
            .await
            .unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.candidates, 1);
        assert_eq!(report.digest_len, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_fatal_and_nothing_is_sent() {
        let cfg = config();
        let source = FixedSource(Err("503".to_string()));
        let scorer = scorer(&[]);
        let mailer = RecordingMailer::default();

        let err = Pipeline::new(&cfg, &source, &scorer, &mailer)
            .run(&profile(), today())
            .await
            .unwrap_err();

        assert!(matches!(err, DigestError::FetchUnavailable(_)));
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_all_scoring_failed_is_fatal() {
        let cfg = config();
        let source = papers(&["p1", "p2"]);
        let scorer = scorer(&[]);
        let mailer = RecordingMailer::default();

        let err = Pipeline::new(&cfg, &source, &scorer, &mailer)
            .run(&profile(), today())
            .await
            .unwrap_err();

        assert!(matches!(err, DigestError::AllScoringFailed { attempted: 2 }));
    }

    #[tokio::test]
    async fn test_empty_listing_sends_no_matches() {
        let cfg = config();
        let source = papers(&[]);
        let scorer = scorer(&[]);
        let mailer = RecordingMailer::default();

        let report = Pipeline::new(&cfg, &source, &scorer, &mailer)
            .run(&profile(), today())
            .await
            .unwrap();

        assert_eq!(report.fetched, 0);
        assert!(report.delivered);
    }

    #[tokio::test]
    async fn test_delivery_failure_propagates() {
        let cfg = config();
        let source = papers(&["p1"]);
        let scorer = scorer(&[("p1", Ok(9.5))]);
        let mailer = RecordingMailer { fail: true, ..Default::default() };

        let err = Pipeline::new(&cfg, &source, &scorer, &mailer)
            .run(&profile(), today())
            .await
            .unwrap_err();

        assert!(matches!(err, DigestError::DeliveryFailed(_)));
    }

    #[tokio::test]
    async fn test_max_papers_from_config() {
        let cfg = Config { max_papers: 1, ..config() };
        let source = papers(&["p1", "p2", "p3"]);
        let scorer = scorer(&[("p1", Ok(8.0)), ("p2", Ok(9.0)), ("p3", Ok(7.5))]);
        let mailer = RecordingMailer::default();

        Pipeline::new(&cfg, &source, &scorer, &mailer)
            .run(&profile(), today())
            .await
            .unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert!(sent[0].text.contains("Paper p2"));
        assert!(!sent[0].text.contains("Paper p1"));
    }
}
