//! The symbol inventory the acoustic models consume. A symbol is anything that can be given an
//! input ID: padding, punctuation, space, a raw character or an ARPA phone with optional stress.
//! Character and phone symbols coexist in one table because the NVIDIA Tacotron2 symbol set mixes
//! them, with characters used by default and phones when a dictionary pronunciation is available.
use anyhow::Error;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Pronunciation of a word as used by the CMU dictionary.
pub type Pronunciation = Vec<Phoneme>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Symbol {
    Padding,
    Punct(Punctuation),
    Space,
    /// Case sensitive, some models use capitalisation for emphasis.
    Character(char),
    Phone(Phoneme),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Punctuation {
    FullStop,
    Comma,
    QuestionMark,
    ExclamationMark,
    Dash,
    OpenBracket,
    CloseBracket,
    Colon,
    SemiColon,
    Apostrophe,
}

/// An ARPA phone plus the stress marker CMU dict attaches to vowels.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Phoneme {
    pub phone: Phone,
    pub stress: Option<Stress>,
}

/// Two letter ARPABET, the subset CMU dict actually uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[rustfmt::skip]
pub enum Phone {
    Aa, Ae, Ah, Ao, Aw, Ay, B, Ch, D, Dh, Eh, Er, Ey, F, G, Hh, Ih, Iy, Jh, K,
    L, M, N, Ng, Ow, Oy, P, R, S, Sh, T, Th, Uh, Uw, V, W, Y, Z, Zh,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Stress {
    None,
    Primary,
    Secondary,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Padding => write!(f, "<PAD>"),
            Self::Punct(p) => write!(f, "{}", p),
            Self::Space => write!(f, " "),
            Self::Character(c) => write!(f, "{}", c),
            Self::Phone(p) => write!(f, "{}", p),
        }
    }
}

impl fmt::Display for Punctuation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let c = match self {
            Self::FullStop => '.',
            Self::Comma => ',',
            Self::QuestionMark => '?',
            Self::ExclamationMark => '!',
            Self::Dash => '-',
            Self::OpenBracket => '(',
            Self::CloseBracket => ')',
            Self::Colon => ':',
            Self::SemiColon => ';',
            Self::Apostrophe => '\'',
        };
        write!(f, "{}", c)
    }
}

impl fmt::Display for Phoneme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.phone)?;
        match self.stress {
            Some(Stress::None) => write!(f, "0"),
            Some(Stress::Primary) => write!(f, "1"),
            Some(Stress::Secondary) => write!(f, "2"),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Phone {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Aa => "AA",
            Self::Ae => "AE",
            Self::Ah => "AH",
            Self::Ao => "AO",
            Self::Aw => "AW",
            Self::Ay => "AY",
            Self::B => "B",
            Self::Ch => "CH",
            Self::D => "D",
            Self::Dh => "DH",
            Self::Eh => "EH",
            Self::Er => "ER",
            Self::Ey => "EY",
            Self::F => "F",
            Self::G => "G",
            Self::Hh => "HH",
            Self::Ih => "IH",
            Self::Iy => "IY",
            Self::Jh => "JH",
            Self::K => "K",
            Self::L => "L",
            Self::M => "M",
            Self::N => "N",
            Self::Ng => "NG",
            Self::Ow => "OW",
            Self::Oy => "OY",
            Self::P => "P",
            Self::R => "R",
            Self::S => "S",
            Self::Sh => "SH",
            Self::T => "T",
            Self::Th => "TH",
            Self::Uh => "UH",
            Self::Uw => "UW",
            Self::V => "V",
            Self::W => "W",
            Self::Y => "Y",
            Self::Z => "Z",
            Self::Zh => "ZH",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Phone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let phone = match s {
            "AA" => Self::Aa,
            "AE" => Self::Ae,
            "AH" => Self::Ah,
            "AO" => Self::Ao,
            "AW" => Self::Aw,
            "AY" => Self::Ay,
            "B" => Self::B,
            "CH" => Self::Ch,
            "D" => Self::D,
            "DH" => Self::Dh,
            "EH" => Self::Eh,
            "ER" => Self::Er,
            "EY" => Self::Ey,
            "F" => Self::F,
            "G" => Self::G,
            "HH" => Self::Hh,
            "IH" => Self::Ih,
            "IY" => Self::Iy,
            "JH" => Self::Jh,
            "K" => Self::K,
            "L" => Self::L,
            "M" => Self::M,
            "N" => Self::N,
            "NG" => Self::Ng,
            "OW" => Self::Ow,
            "OY" => Self::Oy,
            "P" => Self::P,
            "R" => Self::R,
            "S" => Self::S,
            "SH" => Self::Sh,
            "T" => Self::T,
            "TH" => Self::Th,
            "UH" => Self::Uh,
            "UW" => Self::Uw,
            "V" => Self::V,
            "W" => Self::W,
            "Y" => Self::Y,
            "Z" => Self::Z,
            "ZH" => Self::Zh,
            _ => anyhow::bail!("invalid ARPA phone: {}", s),
        };
        Ok(phone)
    }
}

impl FromStr for Phoneme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            anyhow::bail!("no symbols provided");
        }
        let (phone, stress) = match s.as_bytes().last() {
            Some(b'0') => (&s[..s.len() - 1], Some(Stress::None)),
            Some(b'1') => (&s[..s.len() - 1], Some(Stress::Primary)),
            Some(b'2') => (&s[..s.len() - 1], Some(Stress::Secondary)),
            _ => (s, None),
        };
        Ok(Self {
            phone: Phone::from_str(phone)?,
            stress,
        })
    }
}

impl FromStr for Symbol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let res = match s.trim() {
            "" if !s.is_empty() => Symbol::Space,
            "<PAD>" => Symbol::Padding,
            "." => Symbol::Punct(Punctuation::FullStop),
            "," => Symbol::Punct(Punctuation::Comma),
            "?" => Symbol::Punct(Punctuation::QuestionMark),
            "!" => Symbol::Punct(Punctuation::ExclamationMark),
            "-" => Symbol::Punct(Punctuation::Dash),
            "(" => Symbol::Punct(Punctuation::OpenBracket),
            ")" => Symbol::Punct(Punctuation::CloseBracket),
            ":" => Symbol::Punct(Punctuation::Colon),
            ";" => Symbol::Punct(Punctuation::SemiColon),
            "'" => Symbol::Punct(Punctuation::Apostrophe),
            trimmed => {
                // ARPA and single characters overlap ("B" etc), ARPA wins.
                match Phoneme::from_str(trimmed) {
                    Ok(phoneme) => Symbol::Phone(phoneme),
                    Err(e) => {
                        let chars = trimmed.chars().collect::<Vec<_>>();
                        if chars.len() == 1 {
                            Symbol::Character(chars[0])
                        } else {
                            return Err(e.context("failed to fall back to a character symbol"));
                        }
                    }
                }
            }
        };
        Ok(res)
    }
}

/// Ordered symbol inventory. A symbol's position in the table is the input ID the acoustic model
/// sees for it.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    index: BTreeMap<Symbol, i64>,
}

impl SymbolTable {
    /// The symbol ordering of the NVIDIA Tacotron2 checkpoints: padding, punctuation, space,
    /// case-sensitive characters, then every ARPA phone in plain and stressed variants.
    pub fn nvidia_taco2() -> Self {
        let mut symbols = vec![
            Symbol::Padding,
            Symbol::Punct(Punctuation::Dash),
            Symbol::Punct(Punctuation::ExclamationMark),
            Symbol::Punct(Punctuation::Apostrophe),
            Symbol::Punct(Punctuation::OpenBracket),
            Symbol::Punct(Punctuation::CloseBracket),
            Symbol::Punct(Punctuation::Comma),
            Symbol::Punct(Punctuation::FullStop),
            Symbol::Punct(Punctuation::Colon),
            Symbol::Punct(Punctuation::SemiColon),
            Symbol::Punct(Punctuation::QuestionMark),
            Symbol::Space,
        ];
        symbols.extend(
            "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz"
                .chars()
                .map(Symbol::Character),
        );
        #[rustfmt::skip]
        let phones = [
            Phone::Aa, Phone::Ae, Phone::Ah, Phone::Ao, Phone::Aw, Phone::Ay, Phone::B,
            Phone::Ch, Phone::D, Phone::Dh, Phone::Eh, Phone::Er, Phone::Ey, Phone::F,
            Phone::G, Phone::Hh, Phone::Ih, Phone::Iy, Phone::Jh, Phone::K, Phone::L,
            Phone::M, Phone::N, Phone::Ng, Phone::Ow, Phone::Oy, Phone::P, Phone::R,
            Phone::S, Phone::Sh, Phone::T, Phone::Th, Phone::Uh, Phone::Uw, Phone::V,
            Phone::W, Phone::Y, Phone::Z, Phone::Zh,
        ];
        for phone in phones {
            let vowel = matches!(
                phone,
                Phone::Aa
                    | Phone::Ae
                    | Phone::Ah
                    | Phone::Ao
                    | Phone::Aw
                    | Phone::Ay
                    | Phone::Eh
                    | Phone::Er
                    | Phone::Ey
                    | Phone::Ih
                    | Phone::Iy
                    | Phone::Ow
                    | Phone::Oy
                    | Phone::Uh
                    | Phone::Uw
            );
            symbols.push(Symbol::Phone(Phoneme { phone, stress: None }));
            if vowel {
                for stress in [Stress::None, Stress::Primary, Stress::Secondary] {
                    symbols.push(Symbol::Phone(Phoneme {
                        phone,
                        stress: Some(stress),
                    }));
                }
            }
        }
        Self::from_symbols(symbols)
    }

    pub fn from_symbols(symbols: Vec<Symbol>) -> Self {
        let index = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (*s, i as i64))
            .collect();
        Self { symbols, index }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn id(&self, symbol: &Symbol) -> Option<i64> {
        self.index.get(symbol).copied()
    }

    /// Exact lookup, falling back through stress variants for phones the table doesn't carry in
    /// the requested stress. There is no UNK in the Tacotron2 inventory so a symbol with no match
    /// at all yields `None` and is dropped by callers.
    pub fn best_match(&self, symbol: &Symbol) -> Option<i64> {
        if let Some(id) = self.id(symbol) {
            return Some(id);
        }
        if let Symbol::Phone(phoneme) = symbol {
            let fallbacks = [
                Some(Stress::Primary),
                Some(Stress::None),
                Some(Stress::Secondary),
                None,
            ];
            for stress in fallbacks {
                let candidate = Symbol::Phone(Phoneme {
                    phone: phoneme.phone,
                    stress,
                });
                if let Some(id) = self.id(&candidate) {
                    return Some(id);
                }
            }
        }
        None
    }
}
