use biblatex::{Bibliography, ChunksExt};
use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::error::DigestError;

/// One item of the user's reference library.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BibEntry {
    pub title: String,
    pub abstract_text: String,
    pub authors: String,
    pub year: String,
    pub keywords: String,
}

/// What the scorer is told about the reader: the interest description plus
/// whatever their Zotero library says about their background.
#[derive(Debug, Clone)]
pub struct InterestProfile {
    pub description: String,
    pub bibliography: Vec<BibEntry>,
    detailed_papers: usize,
}

impl InterestProfile {
    pub fn new(description: impl Into<String>, bibliography: Vec<BibEntry>, detailed_papers: usize) -> Self {
        Self {
            description: description.into(),
            bibliography,
            detailed_papers,
        }
    }

    pub fn load(
        description: &str,
        library_file: Option<&Path>,
        detailed_papers: usize,
    ) -> Result<Self, DigestError> {
        let bibliography = match library_file {
            Some(path) if path.exists() => {
                let entries = load_library(path)?;
                tracing::info!("Loaded {} library entries from {}", entries.len(), path.display());
                entries
            }
            Some(path) => {
                tracing::warn!("Library file {} not found, scoring without it", path.display());
                Vec::new()
            }
            None => Vec::new(),
        };
        Ok(Self::new(description, bibliography, detailed_papers))
    }

    /// Text block describing the library, most recent entries in detail and
    /// the rest as bare titles.
    pub fn research_context(&self) -> String {
        if self.bibliography.is_empty() {
            return "No Zotero library provided.".to_string();
        }

        let mut lines = vec![
            format!("Research Background from Zotero library ({} papers):", self.bibliography.len()),
            String::new(),
        ];

        let detailed = self.detailed_papers.min(self.bibliography.len());
        if detailed > 0 {
            lines.push(format!("Recent papers with details (most recent {}):", self.detailed_papers));
            lines.push(String::new());
            for (i, entry) in self.bibliography[..detailed].iter().enumerate() {
                let mut heading = format!("{}. {}", i + 1, title_or_placeholder(&entry.title));
                if !entry.year.is_empty() {
                    heading.push_str(&format!(" ({})", entry.year));
                }
                lines.push(heading);
                if !entry.authors.is_empty() {
                    lines.push(format!("   Authors: {}", entry.authors));
                }
                if !entry.keywords.is_empty() {
                    lines.push(format!("   Keywords: {}", entry.keywords));
                }
                if !entry.abstract_text.is_empty() {
                    lines.push(format!("   Abstract: {}", truncate_chars(&entry.abstract_text, 200)));
                }
                lines.push(String::new());
            }
        }

        let remaining = &self.bibliography[detailed..];
        if !remaining.is_empty() {
            lines.push(String::new());
            lines.push(format!("Additional papers in library ({} more):", remaining.len()));
            lines.push(String::new());
            for entry in remaining {
                lines.push(format!("- {}", title_or_placeholder(&entry.title)));
            }
        }

        lines.join("\n")
    }
}

fn title_or_placeholder(title: &str) -> &str {
    if title.is_empty() { "No title" } else { title }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{}...", cut)
}

fn load_library(path: &Path) -> Result<Vec<BibEntry>, DigestError> {
    let text = fs::read_to_string(path)
        .map_err(|e| DigestError::config(format!("cannot read {}: {}", path.display(), e)))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("bib") => parse_bibtex(&text),
        Some("json") => parse_zotero_json(&text),
        other => Err(DigestError::config(format!(
            "unsupported library format {:?}, use .bib or .json",
            other.unwrap_or("")
        ))),
    }
}

/// Zotero JSON exports come either as a bare array of items or wrapped in
/// `{ "items": [...] }`.
pub fn parse_zotero_json(text: &str) -> Result<Vec<BibEntry>, DigestError> {
    let data: Value = serde_json::from_str(text)
        .map_err(|e| DigestError::config(format!("library JSON is malformed: {}", e)))?;

    let items: &[Value] = match &data {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => obj
            .get("items")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };

    Ok(items.iter().map(zotero_item).collect())
}

fn zotero_item(item: &Value) -> BibEntry {
    let field = |name: &str| item.get(name).and_then(Value::as_str).unwrap_or("").trim().to_string();

    let authors = item
        .get("creators")
        .and_then(Value::as_array)
        .map(|creators| {
            creators
                .iter()
                .filter_map(|c| {
                    if let Some(last) = c.get("lastName").and_then(Value::as_str) {
                        let first = c.get("firstName").and_then(Value::as_str).unwrap_or("");
                        Some(format!("{} {}", first, last).trim().to_string())
                    } else {
                        c.get("name").and_then(Value::as_str).map(str::to_string)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    let keywords = item
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.as_str().or_else(|| t.get("tag").and_then(Value::as_str)))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    BibEntry {
        title: field("title"),
        abstract_text: field("abstractNote"),
        authors,
        year: field("date").chars().take(4).collect(),
        keywords,
    }
}

/// Reads a BibTeX export. Field values go through `biblatex`, so `#`
/// concatenation, `@string` abbreviations and TeX accents resolve to text.
pub fn parse_bibtex(text: &str) -> Result<Vec<BibEntry>, DigestError> {
    let bibliography = Bibliography::parse(text)
        .map_err(|e| DigestError::config(format!("library BibTeX is malformed: {}", e)))?;
    Ok(bibliography.iter().map(bib_entry).collect())
}

fn bib_entry(entry: &biblatex::Entry) -> BibEntry {
    let field = |name: &str| {
        entry
            .get(name)
            .map(|chunks| normalize_whitespace(&chunks.format_verbatim()))
            .unwrap_or_default()
    };

    let authors = entry
        .author()
        .map(|people| people.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", "))
        .unwrap_or_default();

    let mut year = field("year");
    if year.is_empty() {
        year = field("date").chars().take(4).collect();
    }

    BibEntry {
        title: field("title"),
        abstract_text: field("abstract"),
        authors,
        year,
        keywords: field("keywords"),
    }
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
