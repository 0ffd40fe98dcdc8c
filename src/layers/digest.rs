use chrono::NaiveDate;
use quick_xml::escape::escape;
use std::collections::HashSet;

use crate::layers::ScoredCandidate;

/// Inclusion rules applied to a run's scored candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestConfig {
    pub threshold: f64,
    pub max_papers: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Digest {
    pub date: NaiveDate,
    pub entries: Vec<ScoredCandidate>,
}

impl Digest {
    /// Dedup by id (first wins), drop anything under the threshold, stable
    /// sort by score descending, cap the length.
    pub fn assemble(candidates: Vec<ScoredCandidate>, config: &DigestConfig, date: NaiveDate) -> Self {
        let mut seen = HashSet::new();
        let mut entries: Vec<ScoredCandidate> = candidates
            .into_iter()
            .filter(|c| seen.insert(c.paper.id.clone()))
            .filter(|c| c.score >= config.threshold)
            .collect();

        // Vec::sort_by is stable, equal scores keep fetch order
        entries.sort_by(|a, b| b.score.total_cmp(&a.score));
        entries.truncate(config.max_papers);

        Self { date, entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn subject(&self) -> String {
        match self.entries.len() {
            0 => format!("arXiv digest {}: no matches", self.date),
            1 => format!("arXiv digest {}: 1 relevant paper", self.date),
            n => format!("arXiv digest {}: {} relevant papers", self.date, n),
        }
    }

    pub fn render_text(&self) -> String {
        if self.is_empty() {
            return format!(
                "No new arXiv papers cleared your relevance threshold on {}.\n\
                 The digest ran normally; there is simply nothing to report today.\n",
                self.date
            );
        }

        let mut out = format!("{} relevant arXiv papers for {}\n\n", self.entries.len(), self.date);
        for (rank, c) in self.entries.iter().enumerate() {
            out.push_str(&format!("{}. {} [{:.1}/10]\n", rank + 1, c.paper.title, c.score));
            if !c.paper.authors.is_empty() {
                out.push_str(&format!("   {}\n", c.paper.authors.join(", ")));
            }
            out.push_str(&format!("   {} | {}\n", c.paper.category, c.paper.abs_url()));
            out.push_str(&format!("   Why: {}\n\n", c.rationale));
        }
        out
    }

    pub fn render_html(&self) -> String {
        let mut out = String::from("<html><body style=\"font-family: sans-serif;\">\n");
        if self.is_empty() {
            out.push_str(&format!(
                "<p>No new arXiv papers cleared your relevance threshold on {}.</p>\n",
                self.date
            ));
        } else {
            out.push_str(&format!(
                "<h2>{} relevant arXiv papers for {}</h2>\n<ol>\n",
                self.entries.len(),
                self.date
            ));
            for c in &self.entries {
                let url = c.paper.abs_url();
                out.push_str(&format!(
                    "<li><p><a href=\"{}\"><strong>{}</strong></a> <em>({:.1}/10)</em><br/>\n",
                    escape(&url),
                    escape(&c.paper.title),
                    c.score
                ));
                if !c.paper.authors.is_empty() {
                    out.push_str(&format!("{}<br/>\n", escape(&c.paper.authors.join(", "))));
                }
                out.push_str(&format!(
                    "<small>{} &middot; {}</small><br/>\n{}</p></li>\n",
                    escape(&c.paper.category),
                    escape(&c.paper.id),
                    escape(&c.rationale)
                ));
            }
            out.push_str("</ol>\n");
        }
        out.push_str("</body></html>\n");
        out
    }
}
