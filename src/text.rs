//! Text frontend: cleaning, word normalisation and conversion into padded symbol-index
//! sequences. Everything the data loader and the inference drivers need to turn a transcript
//! into model input lives here.
use crate::dict::CmuDictionary;
use crate::error::Error;
use crate::symbols::{Punctuation, Symbol, SymbolTable};
use deunicode::deunicode;
use ndarray::{Array1, Array2};
use num2words::Num2Words;
use once_cell::sync::OnceCell;
use rand::Rng;
use regex::Regex;

/// Normalise a word the way dictionary keys are stored: ASCII transliteration, duplicate
/// pronunciation markers like `BATH(2)` stripped, punctuation dropped, uppercased.
pub fn normalise_word(word: &str) -> String {
    static VERSION_REGEX: OnceCell<Regex> = OnceCell::new();
    let version_regex = VERSION_REGEX.get_or_init(|| Regex::new(r"\(\d+\)$").unwrap());

    let mut s = deunicode(&version_regex.replace_all(word, ""));
    s.retain(|c: char| c.is_ascii_alphanumeric() || c == '\'');
    s.make_ascii_uppercase();
    s
}

fn expand_numbers(text: &str) -> String {
    static NUMBER_REGEX: OnceCell<Regex> = OnceCell::new();
    let number_regex = NUMBER_REGEX.get_or_init(|| Regex::new(r"\d+").unwrap());

    number_regex
        .replace_all(text, |caps: &regex::Captures| {
            let digits = &caps[0];
            digits
                .parse::<i64>()
                .ok()
                .and_then(|n| Num2Words::new(n).to_words().ok())
                .unwrap_or_else(|| digits.to_string())
        })
        .into_owned()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Run the configured cleaner pipeline over a transcript. Unknown cleaner names are a
/// configuration error so a typo dies at startup rather than mid-epoch.
pub fn apply_cleaners(text: &str, cleaners: &[String]) -> Result<String, Error> {
    let mut out = text.to_string();
    for cleaner in cleaners {
        out = match cleaner.as_str() {
            "basic_cleaners" => collapse_whitespace(&deunicode(&out)),
            "english_cleaners" => {
                let transliterated = deunicode(&out).to_lowercase();
                collapse_whitespace(&expand_numbers(&transliterated))
            }
            other => return Err(Error::Config(format!("unknown text cleaner: {other}"))),
        };
    }
    Ok(out)
}

fn punctuation_for(c: char) -> Option<Punctuation> {
    let p = match c {
        '.' => Punctuation::FullStop,
        ',' => Punctuation::Comma,
        '?' => Punctuation::QuestionMark,
        '!' => Punctuation::ExclamationMark,
        '-' => Punctuation::Dash,
        '(' => Punctuation::OpenBracket,
        ')' => Punctuation::CloseBracket,
        ':' => Punctuation::Colon,
        ';' => Punctuation::SemiColon,
        '\'' => Punctuation::Apostrophe,
        _ => return None,
    };
    Some(p)
}

fn push_word_characters(word: &str, symbols: &mut Vec<Symbol>) {
    for c in word.chars() {
        if let Some(p) = punctuation_for(c) {
            symbols.push(Symbol::Punct(p));
        } else if !c.is_whitespace() && c.is_ascii() {
            symbols.push(Symbol::Character(c));
        }
    }
}

/// The text frontend owns the symbol table, the cleaner pipeline and (optionally) a
/// pronunciation dictionary with the probability of using it per word.
#[derive(Debug, Clone)]
pub struct TextFrontend {
    table: SymbolTable,
    cleaners: Vec<String>,
    dictionary: Option<CmuDictionary>,
    p_arpabet: f32,
}

impl TextFrontend {
    pub fn new(cleaners: Vec<String>) -> Result<Self, Error> {
        // Validate cleaner names eagerly.
        apply_cleaners("", &cleaners)?;
        Ok(Self {
            table: SymbolTable::nvidia_taco2(),
            cleaners,
            dictionary: None,
            p_arpabet: 0.0,
        })
    }

    pub fn with_dictionary(mut self, dictionary: CmuDictionary, p_arpabet: f32) -> Self {
        self.dictionary = Some(dictionary);
        self.p_arpabet = p_arpabet;
        self
    }

    pub fn table(&self) -> &SymbolTable {
        &self.table
    }

    /// Clean a transcript and convert it to symbols. Each word is swapped for its dictionary
    /// pronunciation with probability `p_arpabet` when a dictionary is attached.
    pub fn text_to_symbols<R: Rng>(&self, text: &str, rng: &mut R) -> Result<Vec<Symbol>, Error> {
        let cleaned = apply_cleaners(text, &self.cleaners)?;
        let mut symbols = Vec::new();
        for word in cleaned.split_whitespace() {
            if !symbols.is_empty() {
                symbols.push(Symbol::Space);
            }
            let pronunciation = self.dictionary.as_ref().and_then(|dict| {
                if self.p_arpabet > 0.0 && rng.gen::<f32>() < self.p_arpabet {
                    dict.get_pronunciations(word)
                        .and_then(|all| all.first())
                } else {
                    None
                }
            });
            match pronunciation {
                Some(phonemes) => {
                    symbols.extend(phonemes.iter().map(|p| Symbol::Phone(*p)));
                    // Keep trailing punctuation the dictionary lookup stripped.
                    if let Some(p) = word.chars().last().and_then(punctuation_for) {
                        symbols.push(Symbol::Punct(p));
                    }
                }
                None => push_word_characters(word, &mut symbols),
            }
        }
        Ok(symbols)
    }

    /// Symbols the table has no ID for are silently dropped, there is no UNK in the Tacotron2
    /// inventory.
    pub fn text_to_sequence<R: Rng>(&self, text: &str, rng: &mut R) -> Result<Vec<i64>, Error> {
        let symbols = self.text_to_symbols(text, rng)?;
        Ok(symbols
            .iter()
            .filter_map(|s| self.table.best_match(s))
            .collect())
    }
}

/// Sequences padded into one dense batch, sorted by decreasing length. `order[i]` is the index
/// of row `i` in the caller's original line order.
#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub sequences: Array2<i64>,
    pub lengths: Array1<i64>,
    pub order: Vec<usize>,
}

/// Turn raw text lines into a padded index batch plus lengths, used by both the inference
/// drivers and sample-inference diagnostics.
pub fn prepare_input_sequence<R: Rng, S: AsRef<str>>(
    lines: &[S],
    frontend: &TextFrontend,
    rng: &mut R,
) -> anyhow::Result<PreparedInput> {
    if lines.is_empty() {
        anyhow::bail!("no lines to prepare");
    }
    let mut sequences = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let seq = frontend.text_to_sequence(line.as_ref(), rng)?;
        if seq.is_empty() {
            anyhow::bail!("line {} produced no input symbols: {:?}", i, line.as_ref());
        }
        sequences.push((i, seq));
    }
    sequences.sort_by_key(|(_, seq)| std::cmp::Reverse(seq.len()));

    let max_len = sequences[0].1.len();
    let mut padded = Array2::zeros((sequences.len(), max_len));
    let mut lengths = Array1::zeros(sequences.len());
    let mut order = Vec::with_capacity(sequences.len());
    for (row, (original, seq)) in sequences.iter().enumerate() {
        lengths[row] = seq.len() as i64;
        order.push(*original);
        for (col, id) in seq.iter().enumerate() {
            padded[[row, col]] = *id;
        }
    }
    Ok(PreparedInput {
        sequences: padded,
        lengths,
        order,
    })
}

const UTTERANCE_POOL: &[&str] = &[
    "The quick brown fox jumps over the lazy dog.",
    "She sells sea shells by the sea shore.",
    "It was a bright cold day in April, and the clocks were striking thirteen.",
    "I am a completely operational text to speech system.",
    "The north wind and the sun were disputing which was the stronger.",
];

/// A fixed pool of sentences for sampling diagnostics, varied enough to catch obvious
/// regressions in prosody or alignment.
pub fn random_utterance<R: Rng>(rng: &mut R) -> &'static str {
    UTTERANCE_POOL[rng.gen_range(0..UTTERANCE_POOL.len())]
}
