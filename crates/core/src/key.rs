//! Record identity.
//!
//! Records are addressed by a key derived from their name fields, never by their
//! position in a list. Clients and caretakers build the key in opposite name order;
//! existing data depends on both orders so they are kept as they are.

use crate::constants::{
    ARCHIVED_CARETAKERS_FILENAME, ARCHIVED_CLIENTS_FILENAME, CARETAKERS_FILENAME,
    CLIENTS_FILENAME,
};
use crate::record::Record;
use std::fmt;

/// Client surname column.
pub const CLIENT_SURNAME_FIELD: &str = "kfname";
/// Client first-name column.
pub const CLIENT_FIRST_NAME_FIELD: &str = "kvname";
/// Caretaker first-name column.
pub const CARETAKER_FIRST_NAME_FIELD: &str = "Vor.Nam";
/// Caretaker surname column.
pub const CARETAKER_SURNAME_FIELD: &str = "Fam. Nam";

/// The two kinds of records kept by the office.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Client,
    Caretaker,
}

impl EntityKind {
    /// The two name fields in key order.
    pub fn key_fields(self) -> (&'static str, &'static str) {
        match self {
            EntityKind::Client => (CLIENT_SURNAME_FIELD, CLIENT_FIRST_NAME_FIELD),
            EntityKind::Caretaker => (CARETAKER_FIRST_NAME_FIELD, CARETAKER_SURNAME_FIELD),
        }
    }

    pub fn first_name_field(self) -> &'static str {
        match self {
            EntityKind::Client => CLIENT_FIRST_NAME_FIELD,
            EntityKind::Caretaker => CARETAKER_FIRST_NAME_FIELD,
        }
    }

    pub fn surname_field(self) -> &'static str {
        match self {
            EntityKind::Client => CLIENT_SURNAME_FIELD,
            EntityKind::Caretaker => CARETAKER_SURNAME_FIELD,
        }
    }

    pub fn active_filename(self) -> &'static str {
        match self {
            EntityKind::Client => CLIENTS_FILENAME,
            EntityKind::Caretaker => CARETAKERS_FILENAME,
        }
    }

    pub fn archive_filename(self) -> &'static str {
        match self {
            EntityKind::Client => ARCHIVED_CLIENTS_FILENAME,
            EntityKind::Caretaker => ARCHIVED_CARETAKERS_FILENAME,
        }
    }

    /// German label used in operator-facing messages.
    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Client => "Kunde",
            EntityKind::Caretaker => "Betreuer",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of a record within one spreadsheet: `lower(a) + "__" + lower(b)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(String);

impl RecordKey {
    /// Derives the key of `record` according to `kind`'s key field order.
    pub fn derive(record: &Record, kind: EntityKind) -> Self {
        let (a, b) = kind.key_fields();
        Self::from_parts(&record.get_str(a), &record.get_str(b))
    }

    /// Builds a key from the two name parts, already in key order.
    pub fn from_parts(a: &str, b: &str) -> Self {
        Self(format!("{}__{}", a.to_lowercase(), b.to_lowercase()))
    }

    /// Accepts a key typed by an operator, e.g. `huber__anna`.
    pub fn parse(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position and key lookup over a loaded record list.
pub fn find_index(records: &[Record], kind: EntityKind, key: &RecordKey) -> Option<usize> {
    records
        .iter()
        .position(|record| RecordKey::derive(record, kind) == *key)
}
