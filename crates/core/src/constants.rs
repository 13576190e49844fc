//! Constants used throughout the homecare core crate.
//!
//! File names here must match what operators already have on disk; they are
//! part of the on-disk contract, not cosmetic.

/// Active client spreadsheet inside `datenDir`.
pub const CLIENTS_FILENAME: &str = "Kundendaten.xlsx";

/// Active caretaker spreadsheet inside `datenDir`.
pub const CARETAKERS_FILENAME: &str = "Betreuerinnendaten.xlsx";

/// Archived client spreadsheet inside `altDatenDir`.
pub const ARCHIVED_CLIENTS_FILENAME: &str = "ALTkundendaten.xlsx";

/// Archived caretaker spreadsheet inside `altDatenDir`.
pub const ARCHIVED_CARETAKERS_FILENAME: &str = "ALTbetreuerinnendaten.xlsx";

/// Sheet name used when a spreadsheet is rewritten.
pub const SHEET_NAME: &str = "Sheet1";

/// Configuration file inside the per-user configuration directory.
pub const CONFIG_FILENAME: &str = "config.json";

/// Mail delivery log inside the per-user configuration directory.
pub const MAIL_LOG_FILENAME: &str = "mail-log.json";

/// Default directory names, relative to the configuration directory.
pub const DEFAULT_DATA_DIR: &str = "Daten";
pub const DEFAULT_ARCHIVE_DIR: &str = "AlteDaten";
pub const DEFAULT_TEMPLATE_DIR: &str = "Vorlagen";
pub const DEFAULT_INVOICE_TEMPLATE_DIR: &str = "RechnungsVorlagen";

/// Number of `Altbetreuer {n}` history slots on a client record.
pub const HISTORY_SLOTS: usize = 7;

/// Days between the outgoing caretaker's end date and the new caretaker's start.
pub const HANDOVER_GAP_DAYS: i64 = 14;

/// Spreadsheet serial number of 1970-01-01 (epoch 1899-12-30).
pub const SERIAL_UNIX_EPOCH: f64 = 25569.0;

/// Gross-to-net divisor for invoices (20 % VAT included in the gross amount).
pub const VAT_GROSS_DIVISOR: f64 = 1.2;

/// VAT rate applied to the net amount.
pub const VAT_RATE: f64 = 0.2;

/// Mail log entries shown to the operator.
pub const MAIL_LOG_DISPLAY_LIMIT: usize = 200;

/// Delivery attempts per mail.
pub const MAIL_MAX_ATTEMPTS: u32 = 3;

/// Linear backoff step between mail attempts, in milliseconds.
pub const MAIL_BACKOFF_STEP_MS: u64 = 500;

/// Prefix marking Office lock files that must never be treated as templates.
pub const OFFICE_LOCK_PREFIX: &str = "~$";

/// Font color used for unresolved placeholders in rendered documents.
pub const UNRESOLVED_PLACEHOLDER_COLOR: &str = "FF0000";
