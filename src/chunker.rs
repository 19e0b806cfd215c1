//! Language-aware recursive text splitting.
//!
//! Content is split against an ordered separator table (per language),
//! recursing to finer separators for oversized pieces and greedily merging
//! small pieces back into chunks of at most `chunk_size` characters with up
//! to `chunk_overlap` characters of overlap between adjacent chunks.
//! Content shorter than `chunk_size` yields a single chunk equal to input.

use std::collections::VecDeque;

/// Source language of the content being split. Unknown identifiers fall
/// back to plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkLanguage {
    Text,
    Markdown,
    Html,
    Rust,
    Python,
    JavaScript,
    Go,
}

impl ChunkLanguage {
    /// Map common language identifiers onto a separator table.
    pub fn parse(name: &str) -> ChunkLanguage {
        match name.to_lowercase().as_str() {
            "rust" => ChunkLanguage::Rust,
            "python" => ChunkLanguage::Python,
            "javascript" | "typescript" | "js" | "ts" => ChunkLanguage::JavaScript,
            "go" => ChunkLanguage::Go,
            "markdown" | "md" | "json" | "yaml" => ChunkLanguage::Markdown,
            "html" | "xml" => ChunkLanguage::Html,
            _ => ChunkLanguage::Text,
        }
    }

    fn separators(self) -> &'static [&'static str] {
        match self {
            ChunkLanguage::Text => &["\n\n", "\n", ". ", " ", ""],
            ChunkLanguage::Markdown => &["\n## ", "\n### ", "\n\n", "\n", ". ", " ", ""],
            ChunkLanguage::Html => &["</div>", "</p>", "<br>", "\n\n", "\n", " ", ""],
            ChunkLanguage::Rust => &[
                "\nfn ", "\nimpl ", "\nstruct ", "\nenum ", "\nmod ", "\n\n", "\n", " ", "",
            ],
            ChunkLanguage::Python => &["\nclass ", "\ndef ", "\n\tdef ", "\n\n", "\n", " ", ""],
            ChunkLanguage::JavaScript => &[
                "\nfunction ", "\nclass ", "\nconst ", "\nexport ", "\n\n", "\n", " ", "",
            ],
            ChunkLanguage::Go => &["\nfunc ", "\ntype ", "\nvar ", "\nconst ", "\n\n", "\n", " ", ""],
        }
    }
}

/// Recursive splitter with configurable size and overlap.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Chunker {
            chunk_size: chunk_size.max(1),
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    /// Split `content` into an ordered list of non-empty chunks.
    pub fn split(&self, content: &str, language: ChunkLanguage) -> Vec<String> {
        if content.is_empty() {
            return Vec::new();
        }
        if char_len(content) <= self.chunk_size {
            return vec![content.to_string()];
        }

        self.split_recursive(content, language.separators())
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        // Pick the first separator actually present; "" always matches.
        let mut separator = *separators.last().unwrap_or(&"");
        let mut remaining: &[&str] = &[];
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() || text.contains(sep) {
                separator = sep;
                remaining = &separators[i + 1..];
                break;
            }
        }

        let splits: Vec<String> = if separator.is_empty() {
            text.chars().map(|c| c.to_string()).collect()
        } else {
            text.split(separator)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        };

        let mut chunks = Vec::new();
        let mut good_splits: Vec<String> = Vec::new();

        for piece in splits {
            if char_len(&piece) < self.chunk_size {
                good_splits.push(piece);
            } else {
                if !good_splits.is_empty() {
                    chunks.extend(self.merge_splits(&good_splits, separator));
                    good_splits.clear();
                }
                if remaining.is_empty() {
                    chunks.push(piece);
                } else {
                    chunks.extend(self.split_recursive(&piece, remaining));
                }
            }
        }

        if !good_splits.is_empty() {
            chunks.extend(self.merge_splits(&good_splits, separator));
        }

        chunks.retain(|c| !c.trim().is_empty());
        chunks
    }

    /// Greedily merge small pieces into chunks, keeping an overlap tail
    /// when a chunk is emitted.
    fn merge_splits(&self, splits: &[String], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut docs = Vec::new();
        let mut current: VecDeque<&String> = VecDeque::new();
        let mut total = 0usize;

        for piece in splits {
            let piece_len = char_len(piece);
            let extra = if current.is_empty() { 0 } else { sep_len };

            if total + piece_len + extra > self.chunk_size && !current.is_empty() {
                let joined = join_pieces(&current, separator);
                if !joined.trim().is_empty() {
                    docs.push(joined);
                }

                // Shrink the window down to the overlap allowance.
                while total > self.chunk_overlap
                    || (total + piece_len + if current.is_empty() { 0 } else { sep_len }
                        > self.chunk_size
                        && total > 0)
                {
                    if let Some(front) = current.pop_front() {
                        total -= char_len(front) + if current.is_empty() { 0 } else { sep_len };
                    } else {
                        break;
                    }
                }
            }

            let extra = if current.is_empty() { 0 } else { sep_len };
            total += piece_len + extra;
            current.push_back(piece);
        }

        let joined = join_pieces(&current, separator);
        if !joined.trim().is_empty() {
            docs.push(joined);
        }
        docs
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn join_pieces(pieces: &VecDeque<&String>, separator: &str) -> String {
    let mut out = String::new();
    for (i, piece) in pieces.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        out.push_str(piece);
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_content_single_chunk_equals_input() {
        let chunker = Chunker::new(1000, 100);
        let content = "short note that fits in one chunk";
        let chunks = chunker.split(content, ChunkLanguage::Text);
        assert_eq!(chunks, vec![content.to_string()]);
    }

    #[test]
    fn test_empty_content_yields_nothing() {
        let chunker = Chunker::new(100, 10);
        assert!(chunker.split("", ChunkLanguage::Text).is_empty());
    }

    #[test]
    fn test_paragraphs_split_before_sentences() {
        let chunker = Chunker::new(40, 0);
        let content = "first paragraph with several words\n\nsecond paragraph with more words";
        let chunks = chunker.split(content, ChunkLanguage::Text);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].contains("first paragraph"));
        assert!(chunks.last().unwrap().contains("second paragraph"));
    }

    #[test]
    fn test_chunks_respect_size_bound() {
        let chunker = Chunker::new(50, 10);
        let content = "word ".repeat(200);
        let chunks = chunker.split(&content, ChunkLanguage::Text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 50, "oversized chunk: {chunk:?}");
            assert!(!chunk.trim().is_empty());
        }
    }

    #[test]
    fn test_adjacent_chunks_overlap() {
        let chunker = Chunker::new(30, 12);
        let content = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let chunks = chunker.split(content, ChunkLanguage::Text);
        assert!(chunks.len() > 1);

        // Each chunk after the first starts with a word seen at the end of
        // its predecessor.
        for pair in chunks.windows(2) {
            let tail_word = pair[0].split_whitespace().last().unwrap();
            assert!(
                pair[1].contains(tail_word),
                "no overlap between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_rust_separators_split_on_items() {
        let chunker = Chunker::new(60, 0);
        let content = "\nfn alpha() { body body body body }\nfn beta() { body body body body }\nfn gamma() { body body body body }";
        let chunks = chunker.split(content, ChunkLanguage::Rust);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn test_unknown_language_falls_back_to_text() {
        assert_eq!(ChunkLanguage::parse("cobol"), ChunkLanguage::Text);
        assert_eq!(ChunkLanguage::parse("rust"), ChunkLanguage::Rust);
        assert_eq!(ChunkLanguage::parse("TypeScript"), ChunkLanguage::JavaScript);
    }

    #[test]
    fn test_giant_unbreakable_token_hard_splits() {
        let chunker = Chunker::new(20, 0);
        let content = "a".repeat(100);
        let chunks = chunker.split(&content, ChunkLanguage::Text);
        assert!(chunks.len() >= 5);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 20);
        }
    }

    #[test]
    fn test_multibyte_content_is_not_mangled() {
        let chunker = Chunker::new(10, 2);
        let content = "привет мир это длинная строка из кириллицы для теста";
        let chunks = chunker.split(content, ChunkLanguage::Text);
        assert!(!chunks.is_empty());
        let rejoined: String = chunks.concat();
        // Every chunk is valid UTF-8 drawn from the original text.
        for chunk in &chunks {
            assert!(content.contains(chunk.trim()), "chunk not in source: {chunk:?}");
        }
        assert!(!rejoined.is_empty());
    }
}
