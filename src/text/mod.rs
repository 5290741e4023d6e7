//! Target-text handling: language metadata and chunk segmentation.

mod language;
pub mod segmenter;

use std::path::Path;

pub use language::Language;
pub use segmenter::{
    segment_text, split_in_half, SegmenterConfig, TextChunk, TextSegmenter,
    DEFAULT_MAX_CHUNK_CHARS,
};

use crate::error::{Result, VoiceCloneError};

/// Read a UTF-8 text file, stripping a leading BOM and normalizing CRLF.
pub fn load_text(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| VoiceCloneError::io(path, e))?;
    let text = raw.strip_prefix('\u{feff}').unwrap_or(&raw);
    Ok(text.replace("\r\n", "\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_text_normalizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("script.txt");
        std::fs::write(&path, "\u{feff}line one\r\nline two\r\n").unwrap();
        assert_eq!(load_text(&path).unwrap(), "line one\nline two\n");
    }

    #[test]
    fn test_load_text_missing_file() {
        let err = load_text("/nonexistent/script.txt").unwrap_err();
        assert!(matches!(err, VoiceCloneError::Io { .. }));
    }
}
