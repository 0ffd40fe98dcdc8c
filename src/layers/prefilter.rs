// Cheap local keyword pass run before any paid scoring call
use crate::layers::PaperRecord;

pub struct KeywordFilter {
    keywords: Vec<String>,
}

impl KeywordFilter {
    pub fn new(keywords: &[String]) -> Self {
        let keywords = keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { keywords }
    }

    pub fn is_noop(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn matches(&self, paper: &PaperRecord) -> bool {
        if self.is_noop() {
            return true;
        }
        let title = paper.title.to_lowercase();
        let abstract_text = paper.abstract_text.to_lowercase();
        self.keywords
            .iter()
            .any(|k| title.contains(k.as_str()) || abstract_text.contains(k.as_str()))
    }

    /// Keeps records whose title or abstract mentions any keyword. Without
    /// keywords the input comes back untouched.
    pub fn apply(&self, papers: Vec<PaperRecord>) -> Vec<PaperRecord> {
        if self.is_noop() {
            return papers;
        }
        papers.into_iter().filter(|p| self.matches(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::test_paper;

    fn paper(id: &str, title: &str, abstract_text: &str) -> PaperRecord {
        PaperRecord {
            title: title.to_string(),
            abstract_text: abstract_text.to_string(),
            ..test_paper(id)
        }
    }

    fn sample() -> Vec<PaperRecord> {
        vec![
            paper("1", "Sparse Transformers at Scale", "We study attention."),
            paper("2", "Protein folding", "A DIFFUSION model for structures."),
            paper("3", "Graph coloring", "Combinatorics."),
        ]
    }

    #[test]
    fn test_empty_keywords_is_noop() {
        let filter = KeywordFilter::new(&[]);
        assert_eq!(filter.apply(sample()), sample());
    }

    #[test]
    fn test_blank_keywords_are_ignored() {
        let filter = KeywordFilter::new(&["  ".to_string(), String::new()]);
        assert!(filter.is_noop());
        assert_eq!(filter.apply(sample()).len(), 3);
    }

    #[test]
    fn test_case_insensitive_title_and_abstract_match() {
        let filter = KeywordFilter::new(&["transformer".to_string(), "Diffusion".to_string()]);
        let kept: Vec<String> = filter.apply(sample()).into_iter().map(|p| p.id).collect();
        assert_eq!(kept, vec!["1", "2"]);
    }

    #[test]
    fn test_no_match_drops_everything() {
        let filter = KeywordFilter::new(&["quantum".to_string()]);
        assert!(filter.apply(sample()).is_empty());
    }
}
