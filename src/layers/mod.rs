use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct PaperRecord {
    /// arXiv identifier without the version suffix, e.g. `2401.01234`.
    pub id: String,
    pub title: String,
    pub abstract_text: String,
    pub authors: Vec<String>,
    /// Configured category the paper was first fetched under.
    pub category: String,
    pub published: DateTime<Utc>,
}

impl PaperRecord {
    pub fn abs_url(&self) -> String {
        format!("https://arxiv.org/abs/{}", self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub paper: PaperRecord,
    pub score: f64,
    pub rationale: String,
}

pub mod delivery;
pub mod digest;
pub mod discovery;
pub mod prefilter;
pub mod profile;
pub mod scoring;

#[cfg(test)]
pub(crate) fn test_paper(id: &str) -> PaperRecord {
    PaperRecord {
        id: id.to_string(),
        title: format!("Paper {}", id),
        abstract_text: String::new(),
        authors: vec!["A. Author".to_string()],
        category: "cs.LG".to_string(),
        published: DateTime::parse_from_rfc3339("2024-01-15T18:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
    }
}
