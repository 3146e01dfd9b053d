use std::fmt::Display;

use crate::{IfuError, Result};

/// A single header value.
#[derive(Clone, Debug, PartialEq)]
pub enum Keyword {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl Keyword {
    /// numeric value, if the keyword holds a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Keyword::Int(a) => Some(*a as f64),
            Keyword::Float(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Keyword::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<f64> for Keyword {
    fn from(value: f64) -> Self {
        Keyword::Float(value)
    }
}

impl From<i64> for Keyword {
    fn from(value: i64) -> Self {
        Keyword::Int(value)
    }
}

impl From<usize> for Keyword {
    fn from(value: usize) -> Self {
        Keyword::Int(value as i64)
    }
}

impl From<&str> for Keyword {
    fn from(value: &str) -> Self {
        Keyword::Text(value.to_string())
    }
}

impl From<String> for Keyword {
    fn from(value: String) -> Self {
        Keyword::Text(value)
    }
}

impl From<bool> for Keyword {
    fn from(value: bool) -> Self {
        Keyword::Bool(value)
    }
}

impl Display for Keyword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Keyword::Int(a) => write!(f, "{}", a),
            Keyword::Float(a) => write!(f, "{}", a),
            Keyword::Text(s) => write!(f, "'{}'", s),
            Keyword::Bool(b) => write!(f, "{}", if *b { "T" } else { "F" }),
        }
    }
}

/// Ordered keyword store describing one cube, image or spectrum.
///
/// Keys are kept upper case, in insertion order, and are unique.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Header {
    cards: Vec<(String, Keyword)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Keyword> {
        let key = key.to_ascii_uppercase();
        self.cards.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// insert or overwrite a keyword, keeping the position of an existing card
    pub fn set<V: Into<Keyword>>(&mut self, key: &str, value: V) {
        let key = key.to_ascii_uppercase();
        let value = value.into();
        match self.cards.iter_mut().find(|(k, _)| *k == key) {
            Some(card) => card.1 = value,
            None => self.cards.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Keyword> {
        let key = key.to_ascii_uppercase();
        let idx = self.cards.iter().position(|(k, _)| *k == key)?;
        Some(self.cards.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Keyword)> {
        self.cards.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> Vec<String> {
        self.cards.iter().map(|(k, _)| k.clone()).collect()
    }

    /// required numeric keyword
    pub fn float(&self, key: &str) -> Result<f64> {
        match self.get(key) {
            Some(value) => value.as_f64().ok_or(IfuError::InvalidFITS(format!(
                "{} has invalid datatype, must be float or int",
                key
            ))),
            None => Err(IfuError::MissingKeyword(key.to_string())),
        }
    }

    /// optional numeric keyword
    pub fn float_opt(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Keyword::as_f64)
    }

    pub fn float_or(&self, key: &str, default: f64) -> f64 {
        self.float_opt(key).unwrap_or(default)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Keyword::as_str)
    }

    /// number of axes
    pub fn naxis(&self) -> Result<usize> {
        let naxis = self.float("NAXIS")?;
        if naxis < 0.0 {
            return Err(IfuError::InvalidFITS(format!("invalid NAXIS {}", naxis)));
        }
        Ok(naxis as usize)
    }

    /// length of axis `i` (1-based, FITS order)
    pub fn axis_len(&self, i: usize) -> Result<usize> {
        let key = format!("NAXIS{}", i);
        let n = self.float(&key)?;
        if n <= 0.0 {
            return Err(IfuError::InvalidFITS(format!("invalid {}", key)));
        }
        Ok(n as usize)
    }
}
