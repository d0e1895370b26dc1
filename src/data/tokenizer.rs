use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Trait for tokenization
pub trait Tokenizer: Send + Sync {
    /// Encode text to token IDs
    fn encode(&self, text: &str) -> Vec<i64>;

    /// Decode token IDs to text, dropping special tokens
    fn decode(&self, tokens: &[i64]) -> String;

    fn vocab_size(&self) -> usize;

    fn unk_id(&self) -> i64;

    fn pad_id(&self) -> i64;

    fn eos_id(&self) -> i64;
}

const PAD_ID: i64 = 0;
const UNK_ID: i64 = 1;
const EOS_ID: i64 = 2;
const FIRST_CHAR_ID: i64 = 3;

/// Character-level tokenizer with `pad`, `unk` and `eos` reserved at ids 0..3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharTokenizer {
    chars: Vec<char>,
    #[serde(skip)]
    char_to_id: HashMap<char, i64>,
}

impl CharTokenizer {
    /// Printable ASCII plus newline and tab.
    pub fn ascii() -> Self {
        let mut chars: Vec<char> = (' '..='~').collect();
        chars.push('\n');
        chars.push('\t');
        Self::from_vocab(chars)
    }

    /// Build from a character list; duplicates are ignored.
    pub fn from_vocab<I: IntoIterator<Item = char>>(vocab: I) -> Self {
        let mut chars = Vec::new();
        for ch in vocab {
            if !chars.contains(&ch) {
                chars.push(ch);
            }
        }
        let mut tokenizer = Self {
            chars,
            char_to_id: HashMap::new(),
        };
        tokenizer.index();
        tokenizer
    }

    fn index(&mut self) {
        self.char_to_id = self
            .chars
            .iter()
            .enumerate()
            .map(|(i, ch)| (*ch, FIRST_CHAR_ID + i as i64))
            .collect();
    }

    /// Save tokenizer to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .with_context(|| "Failed to serialize tokenizer")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write tokenizer to {:?}", path))?;
        Ok(())
    }

    /// Load tokenizer from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read tokenizer from {:?}", path))?;
        let mut tokenizer: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to deserialize tokenizer {:?}", path))?;
        tokenizer.index();
        Ok(tokenizer)
    }
}

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Vec<i64> {
        text.chars()
            .map(|ch| *self.char_to_id.get(&ch).unwrap_or(&UNK_ID))
            .collect()
    }

    fn decode(&self, tokens: &[i64]) -> String {
        tokens
            .iter()
            .filter(|&&id| id >= FIRST_CHAR_ID)
            .filter_map(|&id| self.chars.get((id - FIRST_CHAR_ID) as usize))
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.chars.len() + FIRST_CHAR_ID as usize
    }

    fn unk_id(&self) -> i64 {
        UNK_ID
    }

    fn pad_id(&self) -> i64 {
        PAD_ID
    }

    fn eos_id(&self) -> i64 {
        EOS_ID
    }
}

impl fmt::Display for CharTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CharTokenizer(vocab_size={})", self.vocab_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_ascii_encode_decode() {
        let tokenizer = CharTokenizer::ascii();
        let text = "Review: great film. Sentiment: positive";
        assert_eq!(tokenizer.decode(&tokenizer.encode(text)), text);
        assert_eq!(tokenizer.vocab_size(), 95 + 2 + 3);
    }

    #[test]
    fn test_unknown_characters() {
        let tokenizer = CharTokenizer::from_vocab("abc".chars());
        let encoded = tokenizer.encode("xyz");
        assert!(encoded.iter().all(|&id| id == tokenizer.unk_id()));
        assert_eq!(tokenizer.decode(&encoded), "");
    }

    #[test]
    fn test_save_and_load_keep_ids() {
        let tokenizer = CharTokenizer::from_vocab("hello world".chars());
        let file = NamedTempFile::new().unwrap();
        tokenizer.save(file.path()).unwrap();
        let loaded = CharTokenizer::load(file.path()).unwrap();
        assert_eq!(loaded.encode("low"), tokenizer.encode("low"));
        assert_eq!(loaded.vocab_size(), tokenizer.vocab_size());
    }
}
