//! Target languages and their chunk-boundary punctuation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Languages the Qwen3-TTS Base models accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Let the model detect the language
    Auto,
    Chinese,
    English,
    #[default]
    Japanese,
    Korean,
    German,
    French,
    Russian,
    Portuguese,
    Spanish,
    Italian,
}

/// Sentence terminals accepted for every language. Full-width CJK marks are
/// included unconditionally so mixed-script text still splits cleanly.
const SENTENCE_TERMINALS: &[char] = &['.', '!', '?', '…', '。', '！', '？', '．'];

const CLAUSE_TERMINALS: &[char] = &[',', ';', ':', '、', '，', '；', '：'];

/// Closing marks that stay attached to the sentence they end.
const CLOSERS: &[char] = &['"', '\'', ')', ']', '}', '”', '’', '」', '』', '）', '】', '》'];

impl Language {
    pub const ALL: [Language; 11] = [
        Language::Auto,
        Language::Chinese,
        Language::English,
        Language::Japanese,
        Language::Korean,
        Language::German,
        Language::French,
        Language::Russian,
        Language::Portuguese,
        Language::Spanish,
        Language::Italian,
    ];

    /// Name passed to the model (`"Japanese"`, `"Auto"`, ...).
    pub fn model_name(&self) -> &'static str {
        match self {
            Language::Auto => "Auto",
            Language::Chinese => "Chinese",
            Language::English => "English",
            Language::Japanese => "Japanese",
            Language::Korean => "Korean",
            Language::German => "German",
            Language::French => "French",
            Language::Russian => "Russian",
            Language::Portuguese => "Portuguese",
            Language::Spanish => "Spanish",
            Language::Italian => "Italian",
        }
    }

    pub fn is_sentence_terminal(&self, c: char) -> bool {
        if SENTENCE_TERMINALS.contains(&c) {
            return true;
        }
        matches!(self, Language::Chinese | Language::Japanese) && c == '‥'
    }

    pub fn is_clause_terminal(&self, c: char) -> bool {
        if CLAUSE_TERMINALS.contains(&c) {
            return true;
        }
        match self {
            Language::Japanese | Language::Chinese => matches!(c, '・' | '〜'),
            Language::Korean => c == '·',
            _ => false,
        }
    }

    pub fn is_closer(c: char) -> bool {
        CLOSERS.contains(&c)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.model_name())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        let lang = match lowered.as_str() {
            "auto" => Language::Auto,
            "chinese" | "zh" => Language::Chinese,
            "english" | "en" => Language::English,
            "japanese" | "ja" | "jp" => Language::Japanese,
            "korean" | "ko" => Language::Korean,
            "german" | "de" => Language::German,
            "french" | "fr" => Language::French,
            "russian" | "ru" => Language::Russian,
            "portuguese" | "pt" => Language::Portuguese,
            "spanish" | "es" => Language::Spanish,
            "italian" | "it" => Language::Italian,
            _ => {
                return Err(format!(
                    "unknown language '{s}'. Supported: {}",
                    Language::ALL
                        .iter()
                        .map(|l| l.model_name().to_lowercase())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            }
        };
        Ok(lang)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_language() {
        assert_eq!("Japanese".parse::<Language>().unwrap(), Language::Japanese);
        assert_eq!("en".parse::<Language>().unwrap(), Language::English);
        assert_eq!(" AUTO ".parse::<Language>().unwrap(), Language::Auto);
        assert!("klingon".parse::<Language>().is_err());
    }

    #[test]
    fn test_model_name_round_trips() {
        for lang in Language::ALL {
            assert_eq!(lang.model_name().parse::<Language>().unwrap(), lang);
        }
    }

    #[test]
    fn test_terminals() {
        let en = Language::English;
        assert!(en.is_sentence_terminal('.'));
        assert!(en.is_sentence_terminal('。'));
        assert!(!en.is_sentence_terminal(','));
        assert!(en.is_clause_terminal(','));
        assert!(en.is_clause_terminal('、'));
        assert!(!en.is_clause_terminal('・'));
        assert!(Language::Japanese.is_clause_terminal('・'));
    }
}
