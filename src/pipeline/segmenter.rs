//! Sentence segmentation of a streaming token sequence

use std::sync::LazyLock;

use regex::Regex;

/// Terminal punctuation, a newline, or a comma followed by whitespace
static BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[。！？.!?]+|\n|[，,]\s").expect("valid regex"));

/// A fragment ready for synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Emission order within the response, starting at 0
    pub ordinal: u32,
    pub text: String,
}

/// Splits a rolling token buffer into sentence-sized fragments
///
/// A boundary whose fragment is too short is not emitted on its own; the
/// text is carried forward and merged into the next fragment.
#[derive(Debug)]
pub struct SentenceSegmenter {
    buffer: String,
    scan_from: usize,
    min_chars: usize,
    next_ordinal: u32,
}

impl SentenceSegmenter {
    /// Fragments must exceed `min_chars` characters (after trimming)
    #[must_use]
    pub const fn new(min_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            scan_from: 0,
            min_chars,
            next_ordinal: 0,
        }
    }

    /// Append a token and return every fragment it completes
    pub fn push(&mut self, token: &str) -> Vec<Segment> {
        self.buffer.push_str(token);
        let mut out = Vec::new();

        while let Some(m) = BOUNDARY.find_at(&self.buffer, self.scan_from) {
            let end = m.end();
            let candidate = self.buffer[..end].trim();

            if candidate.is_empty() {
                self.buffer.drain(..end);
                self.scan_from = 0;
            } else if candidate.chars().count() > self.min_chars {
                let text = candidate.to_string();
                self.buffer.drain(..end);
                self.scan_from = 0;
                out.push(self.emit(text));
            } else {
                self.scan_from = end;
            }
        }

        out
    }

    /// Flush whatever remains once the token stream has ended
    pub fn finish(&mut self) -> Option<Segment> {
        let rest = std::mem::take(&mut self.buffer);
        self.scan_from = 0;
        let text = rest.trim();
        (!text.is_empty()).then(|| self.emit(text.to_string()))
    }

    /// Number of fragments emitted so far
    #[must_use]
    pub const fn emitted(&self) -> u32 {
        self.next_ordinal
    }

    fn emit(&mut self, text: String) -> Segment {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        Segment { ordinal, text }
    }
}
