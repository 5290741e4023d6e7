//! Greedy boundary-aware text segmentation.
//!
//! Text is cut into chunks of at most `max_chunk_chars` characters. Inside
//! each window the cut lands on the last boundary of the best available tier:
//!
//! 1. sentence terminals (and line breaks), plus any closing quotes after them
//! 2. clause terminals
//! 3. whitespace
//! 4. a hard cut at the window edge
//!
//! Lengths are counted in `char`s, not bytes.

use serde::{Deserialize, Serialize};

use super::Language;
use crate::error::{Result, VoiceCloneError};

/// Default window; keeps Qwen3-TTS generations well inside their stable range.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 180;

/// One bounded slice of target text. `index` defines output order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
}

impl TextChunk {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Upper bound on characters per chunk
    pub max_chunk_chars: usize,
    /// Segment each non-empty line on its own; lines never share a chunk
    pub split_lines: bool,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: DEFAULT_MAX_CHUNK_CHARS,
            split_lines: false,
        }
    }
}

/// Splits target text into ordered [`TextChunk`]s.
#[derive(Debug, Clone)]
pub struct TextSegmenter {
    config: SegmenterConfig,
    language: Language,
}

impl TextSegmenter {
    pub fn new(config: SegmenterConfig, language: Language) -> Self {
        Self { config, language }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Segment `full_text`.
    ///
    /// # Errors
    ///
    /// [`VoiceCloneError::InvalidInput`] when the text is blank or the
    /// configured maximum is zero.
    pub fn segment(&self, full_text: &str) -> Result<Vec<TextChunk>> {
        let max = self.config.max_chunk_chars;
        if max == 0 {
            return Err(VoiceCloneError::InvalidInput(
                "max_chunk_chars must be greater than zero".into(),
            ));
        }
        if full_text.trim().is_empty() {
            return Err(VoiceCloneError::InvalidInput(
                "target text is empty".into(),
            ));
        }

        let mut pieces = Vec::new();
        if self.config.split_lines {
            for line in full_text.lines() {
                let chars: Vec<char> = line.chars().collect();
                self.split_span(&chars, max, &mut pieces);
            }
        } else {
            let chars: Vec<char> = full_text.chars().collect();
            self.split_span(&chars, max, &mut pieces);
        }

        let chunks: Vec<TextChunk> = pieces
            .into_iter()
            .filter(|p| !p.is_empty())
            .enumerate()
            .map(|(index, text)| TextChunk { index, text })
            .collect();

        tracing::debug!(
            "Segmented {} chars into {} chunk(s) (max {} chars)",
            full_text.chars().count(),
            chunks.len(),
            max
        );
        Ok(chunks)
    }

    fn split_span(&self, chars: &[char], max: usize, out: &mut Vec<String>) {
        let n = chars.len();
        let mut start = 0;

        loop {
            while start < n && chars[start].is_whitespace() {
                start += 1;
            }
            if start >= n {
                break;
            }

            let mut end = n;
            while end > start && chars[end - 1].is_whitespace() {
                end -= 1;
            }
            if end - start <= max {
                out.push(chars[start..end].iter().collect());
                break;
            }

            let cut = self.find_cut(chars, start, max);
            out.push(chars[start..cut].iter().collect::<String>().trim().to_string());
            start = cut;
        }
    }

    /// Exclusive end of the next chunk; always in `(start, start + max]`.
    /// Caller guarantees at least `max + 1` non-trailing chars remain.
    fn find_cut(&self, chars: &[char], start: usize, max: usize) -> usize {
        let limit = start + max;
        let lang = self.language;

        let sentence = last_boundary(start, limit, |i| {
            chars[i] == '\n' || (lang.is_sentence_terminal(chars[i]) && !inside_token(chars, i))
        });
        if let Some(cut) = sentence {
            return extend_over_closers(chars, cut, limit, lang);
        }

        let clause = last_boundary(start, limit, |i| {
            lang.is_clause_terminal(chars[i]) && !inside_token(chars, i)
        });
        if let Some(cut) = clause {
            return extend_over_closers(chars, cut, limit, lang);
        }

        if let Some(ws) = (start + 1..=limit).rev().find(|&i| chars[i].is_whitespace()) {
            return ws;
        }

        limit
    }
}

/// Position just after the last char in `[start, limit)` matching `is_boundary`.
fn last_boundary(start: usize, limit: usize, is_boundary: impl Fn(usize) -> bool) -> Option<usize> {
    (start..limit).rev().find(|&i| is_boundary(i)).map(|i| i + 1)
}

/// Pull trailing terminals (`?!`, `...`) and closing quotes into the chunk while they fit.
fn extend_over_closers(chars: &[char], mut cut: usize, limit: usize, lang: Language) -> usize {
    while cut < limit
        && cut < chars.len()
        && (Language::is_closer(chars[cut]) || lang.is_sentence_terminal(chars[cut]))
    {
        cut += 1;
    }
    cut
}

/// `.` or `,` glued between alphanumerics (`3.14`, `1,000`, `e.g`) is not a boundary.
fn inside_token(chars: &[char], i: usize) -> bool {
    if !matches!(chars[i], '.' | ',') {
        return false;
    }
    let before = i > 0 && chars[i - 1].is_alphanumeric();
    let after = chars.get(i + 1).map(|c| c.is_alphanumeric()).unwrap_or(false);
    before && after
}

/// Segment with default settings and a custom maximum.
pub fn segment_text(full_text: &str, max_chunk_chars: usize) -> Result<Vec<TextChunk>> {
    TextSegmenter::new(
        SegmenterConfig {
            max_chunk_chars,
            ..Default::default()
        },
        Language::Auto,
    )
    .segment(full_text)
}

/// Split a piece of text into two non-empty halves near its midpoint.
///
/// Prefers the whitespace closest to the middle, then the closest
/// punctuation boundary, then the middle character. Returns `None` when the
/// trimmed text is shorter than two characters.
pub fn split_in_half(text: &str, language: Language) -> Option<(String, String)> {
    let chars: Vec<char> = text.trim().chars().collect();
    let n = chars.len();
    if n < 2 {
        return None;
    }
    let mid = n / 2;

    let nearest = |pred: &dyn Fn(usize) -> bool| -> Option<usize> {
        (0..n).find_map(|d| {
            [mid.checked_sub(d), Some(mid + d)]
                .into_iter()
                .flatten()
                .find(|&pos| pos > 0 && pos < n && pred(pos))
        })
    };

    let cut = nearest(&|pos| chars[pos].is_whitespace())
        .or_else(|| {
            nearest(&|pos| {
                let c = chars[pos - 1];
                language.is_sentence_terminal(c) || language.is_clause_terminal(c)
            })
        })
        .unwrap_or(mid);

    let left: String = chars[..cut].iter().collect::<String>().trim().to_string();
    let right: String = chars[cut..].iter().collect::<String>().trim().to_string();
    if left.is_empty() || right.is_empty() {
        let left: String = chars[..mid].iter().collect();
        let right: String = chars[mid..].iter().collect();
        return Some((left, right));
    }
    Some((left, right))
}
