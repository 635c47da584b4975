//! Word lists for the first-letter task.
//!
//! Words are filtered from a frequency-ordered corpus file: alphabetic,
//! at least two characters, lowercased, deduplicated in first-seen order.

use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while building or reading word lists
#[derive(Error, Debug)]
pub enum WordListError {
    #[error("Corpus file not found: {0}")]
    CorpusNotFound(String),

    #[error("No usable words in corpus")]
    Empty,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Default candidate pool drawn from the top of the corpus
pub const DEFAULT_TOP_N: usize = 20_000;

/// Default list size
pub const DEFAULT_COUNT: usize = 7_500;

/// Filter candidate tokens into a word list.
///
/// Keeps alphabetic tokens of two or more characters, lowercased, first
/// occurrence wins, truncated to `count`.
#[must_use]
pub fn filter_words<'a, I>(candidates: I, count: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|w| w.chars().count() >= 2 && w.chars().all(char::is_alphabetic))
        .map(str::to_lowercase)
        .filter(|w| seen.insert(w.clone()))
        .take(count)
        .collect()
}

/// Read the first `top_n` tokens of a frequency corpus.
///
/// Each line holds a word, optionally followed by whitespace and a count;
/// blank lines are skipped.
///
/// # Errors
///
/// Returns an error if the corpus cannot be read.
pub fn read_corpus<P: AsRef<Path>>(path: P, top_n: usize) -> Result<Vec<String>, WordListError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(WordListError::CorpusNotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .take(top_n)
        .map(String::from)
        .collect())
}

/// Build a word list from a corpus file
///
/// # Errors
///
/// Returns an error if the corpus cannot be read or yields no words.
pub fn build_word_list<P: AsRef<Path>>(
    corpus: P,
    top_n: usize,
    count: usize,
) -> Result<Vec<String>, WordListError> {
    let candidates = read_corpus(corpus, top_n)?;
    let words = filter_words(candidates.iter().map(String::as_str), count);
    if words.is_empty() {
        return Err(WordListError::Empty);
    }
    if words.len() < count {
        tracing::warn!(
            requested = count,
            produced = words.len(),
            "Corpus yielded fewer words than requested"
        );
    }
    Ok(words)
}

/// Write one word per line, creating parent directories
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_word_list<P: AsRef<Path>>(path: P, words: &[String]) -> Result<(), WordListError> {
    let path = path.as_ref();
    crate::records::ensure_parent_dir(path)?;
    let mut content = words.join("\n");
    content.push('\n');
    std::fs::write(path, content)?;
    Ok(())
}

/// Load a word list, skipping blank lines
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn load_word_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>, WordListError> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}
