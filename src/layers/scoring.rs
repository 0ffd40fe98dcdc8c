use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, direct::NotKeyed};

use crate::config::OpenAiConfig;
use crate::error::DigestError;
use crate::layers::profile::InterestProfile;
use crate::layers::{PaperRecord, ScoredCandidate};

pub const MAX_SCORE: f64 = 10.0;
const VERBOSE_SAMPLES: usize = 3;

const SYSTEM_PROMPT: &str = "You are an academic research assistant. \
Evaluate the relevance of papers to the user's research interests.";

/// Why a single scoring call did not produce a score.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScoreFailure {
    /// Worth another attempt: network trouble, 5xx, rate limiting, unparseable reply.
    #[error("transient: {0}")]
    Transient(String),
    /// The API refused this particular request; retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Credentials or quota problem; every other call will fail the same way.
    #[error("fatal: {0}")]
    Fatal(String),
}

#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(
        &self,
        paper: &PaperRecord,
        profile: &InterestProfile,
    ) -> Result<ScoredCandidate, ScoreFailure>;
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiScorer {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    max_retries: u32,
    retry_backoff: Duration,
    verbose: bool,
    samples_shown: AtomicUsize,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl OpenAiScorer {
    pub fn new(config: &OpenAiConfig, verbose: bool) -> Result<Self, DigestError> {
        let endpoint = Url::parse(&format!(
            "{}/chat/completions",
            config.base_url.trim_end_matches('/')
        ))
        .map_err(|e| DigestError::config(format!("openai.base_url: {}", e)))?;
        let per_minute = NonZeroU32::new(config.requests_per_minute)
            .ok_or_else(|| DigestError::config("openai.requests_per_minute must be at least 1"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| DigestError::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            verbose,
            samples_shown: AtomicUsize::new(0),
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
        })
    }

    async fn score_once(&self, paper: &PaperRecord, prompt: &str) -> Result<(f64, String), ScoreFailure> {
        self.limiter.until_ready().await;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "max_completion_tokens": 200,
        });

        let resp = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ScoreFailure::Transient(format!("request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ScoreFailure::Transient(format!("unreadable completion: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let Some((score, reason)) = parse_response(&content) else {
            tracing::debug!("No score in reply for '{}': {}", paper.title, content);
            return Err(ScoreFailure::Transient("reply contained no score".to_string()));
        };

        if self.verbose && self.samples_shown.fetch_add(1, Ordering::Relaxed) < VERBOSE_SAMPLES {
            tracing::info!(
                "Sample reply for '{}':\n{}\nparsed score={} reason={}",
                paper.title,
                content,
                score,
                reason
            );
        }

        Ok((score, reason))
    }
}

#[async_trait]
impl Scorer for OpenAiScorer {
    async fn score(
        &self,
        paper: &PaperRecord,
        profile: &InterestProfile,
    ) -> Result<ScoredCandidate, ScoreFailure> {
        let prompt_text = build_prompt(paper, profile);
        let prompt = prompt_text.as_str();
        let (score, rationale) = with_retries(self.max_retries, self.retry_backoff, move |attempt| {
            if attempt > 0 {
                tracing::debug!("Retrying {} (attempt {})", paper.id, attempt + 1);
            }
            self.score_once(paper, prompt)
        })
        .await?;

        Ok(ScoredCandidate {
            paper: paper.clone(),
            score,
            rationale,
        })
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or `max_retries`
/// retries are used up. Backoff doubles after every attempt.
pub async fn with_retries<T, F, Fut>(
    max_retries: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, ScoreFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ScoreFailure>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Err(ScoreFailure::Transient(reason)) if attempt < max_retries => {
                let delay = backoff * 2u32.saturating_pow(attempt);
                tracing::debug!("Transient scoring failure ({}), retrying in {:?}", reason, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

pub fn classify_status(status: StatusCode, body: &str) -> ScoreFailure {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ScoreFailure::Fatal(format!("authentication rejected ({})", status))
        }
        StatusCode::TOO_MANY_REQUESTS if body.contains("insufficient_quota") => {
            ScoreFailure::Fatal("API quota exhausted".to_string())
        }
        StatusCode::TOO_MANY_REQUESTS => ScoreFailure::Transient("rate limited".to_string()),
        s if s.is_server_error() => ScoreFailure::Transient(format!("server error {}", s)),
        s => {
            let snip: String = body.chars().take(200).collect();
            ScoreFailure::Rejected(format!("{}: {}", s, snip))
        }
    }
}

pub fn build_prompt(paper: &PaperRecord, profile: &InterestProfile) -> String {
    format!(
        "Given the following research background and interests, evaluate the relevance of this new arXiv paper.

{context}

CURRENT SPECIFIC INTERESTS:
{interests}

NEW PAPER TO EVALUATE:
Title: {title}
Abstract: {abstract_text}

Rate the relevance of this paper on a scale of 0-10:
- 0-3: Not relevant
- 4-6: Somewhat relevant
- 7-8: Relevant
- 9-10: Highly relevant

Respond in the format:
SCORE: [0-10]
REASON: [One sentence explanation]",
        context = profile.research_context(),
        interests = profile.description,
        title = paper.title,
        abstract_text = paper.abstract_text,
    )
}

static SCORE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)SCORE:\s*(\d+\.?\d*)").expect("valid regex"));
static SCORE_LOOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:score|rating)[\s:]+(\d+\.?\d*)").expect("valid regex"));
static BARE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([0-9]|10)(?:\.\d+)?\b").expect("valid regex"));
static REASON_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)REASON:\s*([^\n]+)").expect("valid regex"));
static SENTENCE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+").expect("valid regex"));

/// Pulls `(score, reason)` out of a model reply. `None` when no score can be
/// found at all.
pub fn parse_response(content: &str) -> Option<(f64, String)> {
    let capture = |re: &Regex| {
        re.captures(content)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    };
    let score = capture(&SCORE_LINE)
        .or_else(|| capture(&SCORE_LOOSE))
        .or_else(|| capture(&BARE_NUMBER))?
        .clamp(0.0, MAX_SCORE);

    let reason = match REASON_LINE.captures(content).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim().to_string(),
        None => {
            let sentences: Vec<&str> = SENTENCE_BREAK.split(content).collect();
            let pick = if sentences.len() > 1 { sentences[1] } else { content };
            pick.chars().take(100).collect::<String>().trim().to_string()
        }
    };

    Some((score, reason))
}

/// Result of scoring one run's candidates, in fetch order.
#[derive(Debug, Default)]
pub struct ScoringOutcome {
    pub scored: Vec<ScoredCandidate>,
    pub failures: Vec<DigestError>,
}

/// Scores every paper with at most `concurrency` calls in flight. Calls still
/// running at `run_timeout` are dropped and counted as unavailable. A fatal
/// failure aborts the whole batch.
pub async fn score_all<S>(
    scorer: &S,
    papers: &[PaperRecord],
    profile: &InterestProfile,
    concurrency: usize,
    run_timeout: Duration,
) -> Result<ScoringOutcome, DigestError>
where
    S: Scorer + ?Sized,
{
    let total = papers.len();
    let deadline = tokio::time::Instant::now() + run_timeout;
    let mut slots: Vec<Option<Result<ScoredCandidate, ScoreFailure>>> = vec![None; total];

    let pending = stream::iter(papers.iter().enumerate())
        .map(|(i, paper)| async move { (i, scorer.score(paper, profile).await) })
        .buffer_unordered(concurrency.max(1));
    tokio::pin!(pending);

    let mut done = 0;
    loop {
        match tokio::time::timeout_at(deadline, pending.next()).await {
            Ok(Some((i, result))) => {
                done += 1;
                if let Err(ScoreFailure::Fatal(reason)) = &result {
                    tracing::error!("Scoring aborted on {}: {}", papers[i].id, reason);
                    return Err(DigestError::ScoringAborted(reason.clone()));
                }
                tracing::debug!("Scored {}/{}: {}", done, total, papers[i].id);
                slots[i] = Some(result);
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(
                    "Scoring timed out after {:?} with {} of {} candidates finished",
                    run_timeout,
                    done,
                    total
                );
                break;
            }
        }
    }

    let mut outcome = ScoringOutcome::default();
    for (paper, slot) in papers.iter().zip(slots) {
        match slot {
            Some(Ok(candidate)) => outcome.scored.push(candidate),
            Some(Err(failure)) => {
                tracing::warn!("Could not score '{}': {}", paper.title, failure);
                outcome.failures.push(DigestError::ScoringUnavailable {
                    id: paper.id.clone(),
                    reason: failure.to_string(),
                });
            }
            None => outcome.failures.push(DigestError::ScoringUnavailable {
                id: paper.id.clone(),
                reason: "cancelled by run timeout".to_string(),
            }),
        }
    }
    Ok(outcome)
}
