//! # Homecare Core
//!
//! Business logic for the home-care record manager.
//!
//! Clients ("Kunden") and caretakers ("Betreuer") live as rows of spreadsheet files. This
//! crate reads and rewrites those files and builds the office workflows on top:
//! - Add, update, archive and restore records ([`repositories::records`])
//! - Move a client's caretaker into the history slots ([`repositories::reassignment`])
//! - Render `[[Field]]` Word templates into documents and invoices ([`template`],
//!   [`documents`], [`invoice`])
//! - Send mail with a delivery log ([`mail`])
//!
//! Every operation reads the whole file, changes it in memory and writes it back. Services
//! receive the resolved [`config::CoreConfig`]; [`config::ConfigStore`] owns the persisted
//! settings. Questions to the operator go through the [`prompt::Prompt`] trait.
//!
//! **No UI concerns**: terminal interaction belongs in the `homecare-cli` crate.

pub mod config;
pub mod constants;
pub mod convert;
pub mod dates;
pub mod documents;
pub mod error;
pub mod fields;
pub mod invoice;
pub mod key;
pub mod mail;
pub mod prompt;
pub mod record;
pub mod repositories;
pub mod store;
pub mod template;
pub mod validation;

pub use config::{ConfigStore, CoreConfig};
pub use error::{CareError, CareResult};
pub use key::{EntityKind, RecordKey};
pub use record::{FieldValue, Record};
pub use repositories::reassignment::ReassignmentService;
pub use repositories::records::{Caretakers, Clients, RecordService};
