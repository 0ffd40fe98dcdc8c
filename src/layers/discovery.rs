use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use std::collections::HashSet;
use std::time::Duration as StdDuration;

use crate::error::DigestError;
use crate::layers::PaperRecord;

use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, direct::NotKeyed};
use nonzero_ext::nonzero;
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

pub const ARXIV_API: &str = "https://export.arxiv.org/api/query";

/// Where the run's raw listing comes from.
#[async_trait]
pub trait PaperSource: Send + Sync {
    /// Returns recent papers for `categories`, merged so every id appears once.
    async fn fetch(&self, categories: &[String]) -> Result<Vec<PaperRecord>, DigestError>;
}

pub struct ArxivClient {
    client: Client,
    base_url: String,
    max_results: u32,
    lookback_days: u32,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl ArxivClient {
    pub fn new(max_results: u32, lookback_days: u32) -> Result<Self, DigestError> {
        Self::with_timeout(max_results, lookback_days, StdDuration::from_secs(60))
    }

    fn with_timeout(
        max_results: u32,
        lookback_days: u32,
        timeout: StdDuration,
    ) -> Result<Self, DigestError> {
        // arXiv asks API users for no more than one request every three seconds
        let quota = Quota::per_minute(nonzero!(20u32)).allow_burst(nonzero!(1u32));
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(StdDuration::from_secs(10))
            .build()
            .map_err(|e| DigestError::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: ARXIV_API.to_string(),
            max_results,
            lookback_days,
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn query_url(&self, category: &str) -> String {
        let query = format!("cat:{}", category);
        format!(
            "{}?search_query={}&sortBy=submittedDate&sortOrder=descending&start=0&max_results={}",
            self.base_url,
            urlencoding::encode(&query),
            self.max_results
        )
    }

    pub async fn fetch_category(&self, category: &str) -> Result<Vec<PaperRecord>, DigestError> {
        self.limiter.until_ready().await;

        let url = self.query_url(category);
        tracing::info!("Querying arXiv: {}", url);

        let resp = self.client.get(&url).send().await.map_err(|e| {
            DigestError::FetchUnavailable(format!("arXiv request for {} failed: {}", category, e))
        })?;
        if !resp.status().is_success() {
            return Err(DigestError::FetchUnavailable(format!(
                "arXiv API error for {}: {}",
                category,
                resp.status()
            )));
        }
        let text = resp.text().await.map_err(|e| {
            DigestError::FetchUnavailable(format!("arXiv response for {} unreadable: {}", category, e))
        })?;

        parse_feed(&text, category)
    }

    pub async fn fetch_recent(
        &self,
        categories: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<PaperRecord>, DigestError> {
        let cutoff = lookback_cutoff(now, self.lookback_days);
        let mut listings = Vec::with_capacity(categories.len());
        for category in categories {
            let papers = self.fetch_category(category).await?;
            let total = papers.len();
            let recent = keep_recent(papers, now, self.lookback_days);
            tracing::info!(
                "{}: {} entries, {} published since {}",
                category,
                total,
                recent.len(),
                cutoff.format("%Y-%m-%d %H:%M")
            );
            if page_may_be_truncated(total, recent.len(), self.max_results) {
                tracing::warn!(
                    "{}: every one of the {} returned entries is inside the window, older ones may be missing; raise arxiv.max_results",
                    category,
                    total
                );
            }
            listings.push(recent);
        }
        Ok(merge_listings(listings))
    }
}

#[async_trait]
impl PaperSource for ArxivClient {
    async fn fetch(&self, categories: &[String]) -> Result<Vec<PaperRecord>, DigestError> {
        self.fetch_recent(categories, Utc::now()).await
    }
}

fn lookback_cutoff(now: DateTime<Utc>, lookback_days: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(lookback_days))
}

/// A full page with nothing outside the window means older in-window papers
/// could sit past `max_results`.
fn page_may_be_truncated(returned: usize, in_window: usize, max_results: u32) -> bool {
    returned > 0 && returned == max_results as usize && in_window == returned
}

/// Keeps papers published at or after `now - lookback_days`.
pub fn keep_recent(papers: Vec<PaperRecord>, now: DateTime<Utc>, lookback_days: u32) -> Vec<PaperRecord> {
    let cutoff = lookback_cutoff(now, lookback_days);
    papers.into_iter().filter(|p| p.published >= cutoff).collect()
}

/// Flattens per-category listings in order, keeping the first record seen for
/// each id so cross-listed papers retain their first category.
pub fn merge_listings(listings: Vec<Vec<PaperRecord>>) -> Vec<PaperRecord> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for paper in listings.into_iter().flatten() {
        if seen.insert(paper.id.clone()) {
            merged.push(paper);
        } else {
            tracing::debug!("Dropping duplicate {} from {}", paper.id, paper.category);
        }
    }
    merged
}

/// `http://arxiv.org/abs/2401.01234v2` -> `2401.01234`
fn arxiv_id_from_url(raw: &str) -> String {
    let id = raw.trim();
    let id = id.rsplit_once("/abs/").map(|(_, tail)| tail).unwrap_or(id);
    match id.rfind('v') {
        Some(pos) if pos + 1 < id.len() && id[pos + 1..].chars().all(|c| c.is_ascii_digit()) => {
            id[..pos].to_string()
        }
        _ => id.to_string(),
    }
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(PartialEq, Clone, Copy)]
enum TagState { None, Title, Summary, Published, AuthorName, Id }

/// Text collected for the `<entry>` currently being read. Text arrives in
/// pieces around entity references, so every field is appended to.
#[derive(Default)]
struct EntryBuilder {
    title: String,
    summary: String,
    published: String,
    authors: Vec<String>,
    id: String,
}

impl EntryBuilder {
    fn push(&mut self, state: TagState, txt: &str) {
        match state {
            TagState::Title => self.title.push_str(txt),
            TagState::Summary => self.summary.push_str(txt),
            TagState::Published => self.published.push_str(txt),
            TagState::AuthorName => {
                if let Some(last) = self.authors.last_mut() {
                    last.push_str(txt);
                }
            }
            TagState::Id => self.id.push_str(txt),
            TagState::None => {}
        }
    }

    fn finish(self, category: &str) -> Result<Option<PaperRecord>, DigestError> {
        let id = self.id.trim();
        if id.contains("/api/errors") {
            return Err(DigestError::FetchUnavailable(format!(
                "arXiv rejected the query for {}: {}",
                category,
                normalize_whitespace(&self.summary)
            )));
        }
        if id.is_empty() {
            tracing::warn!("Skipping arXiv entry without id: '{}'", normalize_whitespace(&self.title));
            return Ok(None);
        }
        let Ok(published) = DateTime::parse_from_rfc3339(self.published.trim()) else {
            tracing::warn!("Skipping arXiv entry {} with unparseable date '{}'", id, self.published.trim());
            return Ok(None);
        };

        tracing::debug!("Parsed arXiv entry: title='{}', id='{}'", normalize_whitespace(&self.title), id);
        Ok(Some(PaperRecord {
            id: arxiv_id_from_url(id),
            title: normalize_whitespace(&self.title),
            abstract_text: normalize_whitespace(&self.summary),
            authors: self
                .authors
                .iter()
                .map(|a| normalize_whitespace(a))
                .filter(|a| !a.is_empty())
                .collect(),
            category: category.to_string(),
            published: published.with_timezone(&Utc),
        }))
    }
}

/// Parses an arXiv Atom feed into records tagged with `category`.
pub fn parse_feed(xml: &str, category: &str) -> Result<Vec<PaperRecord>, DigestError> {
    let mut reader = Reader::from_str(xml);

    let mut papers = Vec::new();
    let mut buf = Vec::new();
    let mut entry: Option<EntryBuilder> = None;
    let mut state = TagState::None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"entry" => entry = Some(EntryBuilder::default()),
                b"title" if entry.is_some() => state = TagState::Title,
                b"summary" if entry.is_some() => state = TagState::Summary,
                b"published" if entry.is_some() => state = TagState::Published,
                b"name" => {
                    if let Some(current) = entry.as_mut() {
                        current.authors.push(String::new());
                        state = TagState::AuthorName;
                    }
                }
                b"id" if entry.is_some() => state = TagState::Id,
                _ => state = TagState::None,
            },
            Ok(Event::Text(e)) => {
                if let Some(current) = entry.as_mut() {
                    let txt = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    current.push(state, &txt);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(current) = entry.as_mut() {
                    let txt = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    current.push(state, &txt);
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if let Some(current) = entry.as_mut() {
                    let resolved = match e.resolve_char_ref() {
                        Ok(Some(ch)) => Some(ch.to_string()),
                        _ => e
                            .decode()
                            .ok()
                            .and_then(|name| quick_xml::escape::resolve_predefined_entity(&name))
                            .map(str::to_string),
                    };
                    if let Some(txt) = resolved {
                        current.push(state, &txt);
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"entry" {
                    if let Some(done) = entry.take() {
                        if let Some(paper) = done.finish(category)? {
                            papers.push(paper);
                        }
                    }
                }
                state = TagState::None;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(DigestError::FetchUnavailable(format!(
                    "malformed arXiv feed for {} at position {}: {}",
                    category,
                    reader.buffer_position(),
                    e
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(papers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::test_paper;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <title type="html">ArXiv Query: search_query=cat:cs.LG</title>
  <id>http://arxiv.org/api/abc</id>
  <entry>
    <id>http://arxiv.org/abs/2401.01234v2</id>
    <published>2024-01-15T18:00:00Z</published>
    <title>Sparse Attention
      for Long Documents</title>
    <summary>  We propose Q&amp;A models
  with &lt;linear&gt; cost.  </summary>
    <author><name>Ada Lovelace</name></author>
    <author><name>Alan Turing</name></author>
    <link href="http://arxiv.org/pdf/2401.01234v2" rel="related" title="pdf" type="application/pdf"/>
    <arxiv:primary_category term="cs.LG" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/hep-th/0601001v1</id>
    <published>2006-01-01T00:00:00Z</published>
    <title>Old style id</title>
    <summary>Strings.</summary>
    <author><name>Ed Witten</name></author>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2401.09999v1</id>
    <published>not a date</published>
    <title>Broken</title>
    <summary>Skipped.</summary>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_feed_extracts_entries() {
        let papers = parse_feed(FEED, "cs.LG").unwrap();
        assert_eq!(papers.len(), 2);

        let first = &papers[0];
        assert_eq!(first.id, "2401.01234");
        assert_eq!(first.title, "Sparse Attention for Long Documents");
        assert_eq!(first.abstract_text, "We propose Q&A models with <linear> cost.");
        assert_eq!(first.authors, vec!["Ada Lovelace", "Alan Turing"]);
        assert_eq!(first.category, "cs.LG");
        assert_eq!(first.published.to_rfc3339(), "2024-01-15T18:00:00+00:00");
        assert_eq!(first.abs_url(), "https://arxiv.org/abs/2401.01234");

        assert_eq!(papers[1].id, "hep-th/0601001");
    }

    #[test]
    fn test_parse_feed_reports_api_error_entry() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
  <entry>
    <id>http://arxiv.org/api/errors#incorrect_id_format</id>
    <title>Error</title>
    <summary>incorrect id format</summary>
    <published>2024-01-01T00:00:00Z</published>
  </entry>
</feed>"#;
        let err = parse_feed(xml, "cs.XX").unwrap_err();
        assert!(matches!(err, DigestError::FetchUnavailable(ref m) if m.contains("incorrect id format")));
    }

    #[test]
    fn test_parse_feed_rejects_malformed_xml() {
        let xml = "<feed><entry><id>x</wrong></entry></feed>";
        assert!(matches!(parse_feed(xml, "cs.LG"), Err(DigestError::FetchUnavailable(_))));
    }

    #[test]
    fn test_empty_feed_yields_no_papers() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>empty</title></feed>"#;
        assert!(parse_feed(xml, "cs.LG").unwrap().is_empty());
    }

    #[test]
    fn test_arxiv_id_from_url() {
        assert_eq!(arxiv_id_from_url("http://arxiv.org/abs/2401.01234v12"), "2401.01234");
        assert_eq!(arxiv_id_from_url("2401.01234"), "2401.01234");
        assert_eq!(arxiv_id_from_url("http://arxiv.org/abs/solv-int/9901001v1"), "solv-int/9901001");
    }

    #[test]
    fn test_merge_keeps_first_seen_category() {
        let lg = vec![test_paper("a"), test_paper("b")];
        let cl = vec![
            PaperRecord { category: "cs.CL".to_string(), ..test_paper("b") },
            PaperRecord { category: "cs.CL".to_string(), ..test_paper("c") },
        ];
        let merged = merge_listings(vec![lg, cl]);
        let ids: Vec<(&str, &str)> = merged.iter().map(|p| (p.id.as_str(), p.category.as_str())).collect();
        assert_eq!(ids, vec![("a", "cs.LG"), ("b", "cs.LG"), ("c", "cs.CL")]);
    }

    #[test]
    fn test_query_url_encodes_category() {
        let client = ArxivClient::new(50, 1).unwrap().with_base_url("http://localhost/api/query");
        assert_eq!(
            client.query_url("cs.LG"),
            "http://localhost/api/query?search_query=cat%3Acs.LG&sortBy=submittedDate&sortOrder=descending&start=0&max_results=50"
        );
    }

    #[test]
    fn test_limiter_spaces_out_requests() {
        let client = ArxivClient::new(10, 1).unwrap();
        assert!(client.limiter.check().is_ok());
        assert!(client.limiter.check().is_err());
        assert!(client.limiter.check().is_err());
    }

    fn published_at(id: &str, rfc3339: &str) -> PaperRecord {
        PaperRecord {
            published: DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc),
            ..test_paper(id)
        }
    }

    #[test]
    fn test_keep_recent_window_is_inclusive() {
        let now = DateTime::parse_from_rfc3339("2024-01-16T06:00:00Z").unwrap().with_timezone(&Utc);
        let papers = vec![
            published_at("on-cutoff", "2024-01-15T06:00:00Z"),
            published_at("just-before", "2024-01-15T05:59:59Z"),
            published_at("fresh", "2024-01-16T01:00:00Z"),
            published_at("two-days", "2024-01-14T07:00:00Z"),
        ];

        let ids = |kept: Vec<PaperRecord>| kept.into_iter().map(|p| p.id).collect::<Vec<_>>();
        assert_eq!(ids(keep_recent(papers.clone(), now, 1)), vec!["on-cutoff", "fresh"]);
        assert_eq!(
            ids(keep_recent(papers, now, 2)),
            vec!["on-cutoff", "just-before", "fresh", "two-days"]
        );
    }

    #[tokio::test]
    async fn test_stalled_server_times_out_as_fetch_unavailable() {
        // accepts the connection but never answers
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}/api/query", listener.local_addr().unwrap());
        let client = ArxivClient::with_timeout(10, 1, StdDuration::from_millis(200))
            .unwrap()
            .with_base_url(base);

        let err = client.fetch_category("cs.LG").await.unwrap_err();
        assert!(matches!(err, DigestError::FetchUnavailable(ref m) if m.contains("cs.LG")));
        drop(listener);
    }

    #[test]
    fn test_full_page_inside_window_is_flagged() {
        assert!(page_may_be_truncated(200, 200, 200));
        assert!(!page_may_be_truncated(200, 150, 200));
        assert!(!page_may_be_truncated(120, 120, 200));
        assert!(!page_may_be_truncated(0, 0, 0));
    }
}
