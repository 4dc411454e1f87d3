//! Text chunker for speech synthesis
//!
//! Providers cap the input length of a single call, so long text is split at
//! sentence boundaries and, for sentences that are too long on their own, at
//! word boundaries. Lengths are counted in chars.

use crate::error::Result;
use regex::Regex;

/// Default max chars per synthesis call
pub const DEFAULT_CHUNK_MAX_LEN: usize = 300;

/// Sentence splitter that packs sentences greedily into bounded chunks
#[derive(Debug, Clone)]
pub struct SpeechChunker {
    max_len: usize,
    sentence_end: Regex,
}

impl SpeechChunker {
    pub fn new(max_len: usize) -> Result<Self> {
        // Terminal punctuation, optional closing quotes/brackets, then whitespace or end.
        // "3.14" and "e.g.x" are not boundaries.
        let sentence_end = Regex::new(r#"[.!?]+["'”’)\]]*(?:\s+|$)"#)?;
        Ok(Self {
            max_len: max_len.max(1),
            sentence_end,
        })
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Split `text` into chunks of `1..=max_len` chars
    ///
    /// Joining the chunks with single spaces gives back the input with its
    /// whitespace normalized.
    pub fn split(&self, text: &str) -> Vec<String> {
        let normalized = normalize_whitespace(text);
        if normalized.is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut current = String::new();

        for sentence in self.sentences(&normalized) {
            if char_len(sentence) > self.max_len {
                flush(&mut chunks, &mut current);
                self.split_words(sentence, &mut chunks);
            } else {
                push_piece(&mut chunks, &mut current, sentence, self.max_len);
            }
        }
        flush(&mut chunks, &mut current);

        chunks
    }

    fn sentences<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut sentences = Vec::new();
        let mut start = 0;
        for m in self.sentence_end.find_iter(text) {
            let sentence = text[start..m.end()].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = m.end();
        }
        let tail = text[start..].trim();
        if !tail.is_empty() {
            sentences.push(tail);
        }
        sentences
    }

    /// Word-boundary fallback for one oversized sentence
    fn split_words(&self, sentence: &str, chunks: &mut Vec<String>) {
        let mut current = String::new();
        for word in sentence.split_whitespace() {
            if char_len(word) > self.max_len {
                // A single word longer than a whole chunk has no word boundary to use
                flush(chunks, &mut current);
                chunks.extend(hard_split(word, self.max_len));
            } else {
                push_piece(chunks, &mut current, word, self.max_len);
            }
        }
        flush(chunks, &mut current);
    }
}

/// Split `text` with a one-off chunker
pub fn split_into_chunks(text: &str, max_len: usize) -> Result<Vec<String>> {
    Ok(SpeechChunker::new(max_len)?.split(text))
}

/// Collapse all whitespace runs to single spaces and trim
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn push_piece(chunks: &mut Vec<String>, current: &mut String, piece: &str, max_len: usize) {
    if current.is_empty() {
        current.push_str(piece);
    } else if char_len(current) + 1 + char_len(piece) <= max_len {
        current.push(' ');
        current.push_str(piece);
    } else {
        chunks.push(std::mem::take(current));
        current.push_str(piece);
    }
}

fn flush(chunks: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        chunks.push(std::mem::take(current));
    }
}

fn hard_split(word: &str, max_len: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    chars
        .chunks(max_len)
        .map(|piece| piece.iter().collect())
        .collect()
}
