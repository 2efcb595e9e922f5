//! Pronunciation dictionary. A thin map from normalised word to its CMU dict pronunciations,
//! used when the text frontend is asked to emit phones instead of characters. Homograph
//! disambiguation is out of scope, the first listed pronunciation wins.
use crate::symbols::{Phoneme, Pronunciation};
use crate::text::normalise_word;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use std::str::FromStr;
use tracing::error;

#[derive(Debug, Default, Clone)]
pub struct CmuDictionary {
    /// One word may have multiple pronunciations
    dictionary: BTreeMap<String, Vec<Pronunciation>>,
}

impl CmuDictionary {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        let reader = io::BufReader::new(file);
        Self::from_reader(reader)
    }

    /// Works from any reader so tests can use in-memory dictionaries.
    pub fn from_reader(reader: impl BufRead) -> io::Result<Self> {
        let mut dictionary: BTreeMap<String, Vec<Pronunciation>> = BTreeMap::new();

        'outer: for line in reader
            .lines()
            .filter_map(|x| x.ok())
            .filter(|x| !x.starts_with(";;;"))
        {
            let mut data = line.split("  ");
            let word = match data.next() {
                Some(s) => normalise_word(s),
                None => continue,
            };
            let phonemes = match data.next() {
                Some(s) => s.split(' '),
                None => continue,
            };
            let mut pronounce = vec![];
            for (i, phoneme) in phonemes
                .filter(|x| !x.is_empty())
                .map(Phoneme::from_str)
                .enumerate()
            {
                match phoneme {
                    Ok(s) => pronounce.push(s),
                    Err(e) => {
                        error!("Unable to parse phoneme {} of word {}: {}", i, word, e);
                        continue 'outer;
                    }
                }
            }
            dictionary.entry(word).or_default().push(pronounce);
        }
        Ok(Self { dictionary })
    }

    /// Merge in extra entries, typically user supplied custom pronunciations kept separate from
    /// the stock dictionary so their provenance isn't lost.
    pub fn merge(&mut self, other: CmuDictionary) {
        for (word, mut pronunciations) in other.dictionary.into_iter() {
            let existing = self.dictionary.entry(word).or_default();
            for pronunciation in pronunciations.drain(..) {
                if !existing.contains(&pronunciation) {
                    existing.push(pronunciation);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.dictionary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dictionary.is_empty()
    }

    /// Lookup for input that has already been through `normalise_word`.
    #[inline(always)]
    pub fn get_pronunciations_normalised(&self, word: &str) -> Option<&Vec<Pronunciation>> {
        self.dictionary.get(word)
    }

    pub fn get_pronunciations(&self, word: &str) -> Option<&Vec<Pronunciation>> {
        self.get_pronunciations_normalised(&normalise_word(word))
    }
}
