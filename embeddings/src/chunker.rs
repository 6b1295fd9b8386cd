use crate::Chunker;

/// One contiguous span of a source file, the unit of embedding and
/// retrieval. Line numbers are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub content: String,
    pub start_line: u32,
    pub end_line: u32,
    pub symbol: Option<String>,
}

/// Line-window chunker with overlap. Default settings: 60-line windows
/// with 10 lines of overlap, which keeps typical functions intact.
pub struct LineChunker {
    max_lines: usize,
    overlap: usize,
}

impl LineChunker {
    pub fn new() -> Self {
        Self {
            max_lines: 60,
            overlap: 10,
        }
    }

    pub fn with_config(max_lines: usize, overlap: usize) -> Self {
        // Overlap must leave room to advance or chunking would never terminate.
        let overlap = overlap.min(max_lines.saturating_sub(1));
        Self { max_lines, overlap }
    }
}

impl Default for LineChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunker for LineChunker {
    fn chunk(&self, _relative_path: &str, content: &str) -> Vec<TextChunk> {
        let lines: Vec<&str> = content.lines().collect();
        let mut chunks = Vec::new();

        if lines.is_empty() || content.trim().is_empty() {
            return chunks;
        }

        let mut start = 0;
        while start < lines.len() {
            let end = (start + self.max_lines).min(lines.len());
            let body = lines[start..end].join("\n");
            if !body.trim().is_empty() {
                chunks.push(TextChunk {
                    content: body,
                    start_line: start as u32 + 1,
                    end_line: end as u32,
                    symbol: None,
                });
            }

            if end >= lines.len() {
                break;
            }
            start = end - self.overlap;
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> String {
        (1..=n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn single_window() {
        let chunker = LineChunker::with_config(10, 2);
        let chunks = chunker.chunk("a.rs", &numbered(5));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 5);
    }

    #[test]
    fn windows_overlap() {
        let chunker = LineChunker::with_config(10, 2);
        let chunks = chunker.chunk("a.rs", &numbered(25));
        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 10));
        assert_eq!((chunks[1].start_line, chunks[1].end_line), (9, 18));
        assert_eq!((chunks[2].start_line, chunks[2].end_line), (17, 25));
        assert!(chunks[1].content.starts_with("line 9"));
    }

    #[test]
    fn empty_input() {
        let chunker = LineChunker::new();
        assert!(chunker.chunk("a.rs", "").is_empty());
        assert!(chunker.chunk("a.rs", "  \n\t\n").is_empty());
    }

    #[test]
    fn degenerate_overlap_still_terminates() {
        let chunker = LineChunker::with_config(4, 10);
        let chunks = chunker.chunk("a.rs", &numbered(9));
        assert!(chunks.len() >= 2);
        assert_eq!(chunks.last().unwrap().end_line, 9);
    }
}
