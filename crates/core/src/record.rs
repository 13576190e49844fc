//! Spreadsheet row model.
//!
//! A [`Record`] is one row of a client or caretaker sheet: an insertion-ordered list of
//! field names and values. Order matters because the first appearance of a field decides
//! its column position when the sheet is rewritten.

use std::fmt;

/// A single cell value as it is held in memory between read and write.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
}

impl FieldValue {
    /// Returns `true` for empty text. Numbers are never empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, FieldValue::Text(s) if s.is_empty())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(_) => None,
        }
    }
}

impl Default for FieldValue {
    fn default() -> Self {
        FieldValue::Text(String::new())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            // Integral values print without a fractional part, like the sheet shows them.
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            FieldValue::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

/// One spreadsheet row keyed by column header.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a record from `(field, value)` pairs, later duplicates overwriting earlier ones.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        let mut record = Self::new();
        for (k, v) in pairs {
            record.set(k, v);
        }
        record
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    /// Display string of a field; missing fields read as `""`.
    pub fn get_str(&self, field: &str) -> String {
        self.get(field).map(ToString::to_string).unwrap_or_default()
    }

    /// `true` when the field is missing or holds empty text.
    pub fn is_blank(&self, field: &str) -> bool {
        self.get(field).map_or(true, FieldValue::is_empty)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Sets a field, keeping its column position if it already exists.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        let field = field.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((field, value)),
        }
    }

    /// Replaces a field's value in place; unknown fields are left alone.
    pub fn update_existing(&mut self, field: &str, f: impl FnOnce(&FieldValue) -> FieldValue) {
        if let Some((_, slot)) = self.fields.iter_mut().find(|(name, _)| name == field) {
            *slot = f(slot);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Copies every field of `changes` into this record.
    pub fn merge(&mut self, changes: &Record) {
        for (name, value) in changes.iter() {
            self.set(name, value.clone());
        }
    }

    /// The record without empty-text fields.
    ///
    /// Writing pads every row to the union of all columns; comparing records with the
    /// padding stripped tells whether any real content changed.
    pub fn without_padding(&self) -> Record {
        Record {
            fields: self
                .fields
                .iter()
                .filter(|(_, value)| !value.is_empty())
                .cloned()
                .collect(),
        }
    }
}
