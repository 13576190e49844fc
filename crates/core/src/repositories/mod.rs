//! Services working on the client and caretaker spreadsheets.
//!
//! `records` covers the archive lifecycle of either entity; `reassignment` covers the
//! caretaker change on a client record.

pub mod reassignment;
pub mod records;
