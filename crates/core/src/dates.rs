//! Date handling for spreadsheet values.
//!
//! Spreadsheets hand dates back as serial day numbers counted from 1899-12-30. Everything
//! the office sees or types uses `DD.MM.YYYY`. This module converts between the two and
//! knows which columns of each record kind hold dates.

use crate::constants::SERIAL_UNIX_EPOCH;
use crate::key::EntityKind;
use crate::record::{FieldValue, Record};
use crate::{CareError, CareResult};
use chrono::{DateTime, NaiveDate};
use regex::Regex;
use std::sync::OnceLock;

/// Display format for every date shown to or entered by the operator.
pub const DISPLAY_FORMAT: &str = "%d.%m.%Y";

const ISO_FORMAT: &str = "%Y-%m-%d";
const MILLIS_PER_DAY: f64 = 86_400_000.0;

const CLIENT_DATE_FIELDS: &[&str] = &["kgebdat", "Geburtsdatum"];
const CARETAKER_DATE_FIELDS: &[&str] = &["Geburtsdatum", "IdentDat"];

fn client_slot_date_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)^(b\d*(anfang|ende)|betreuer ?\d+ (anfang|ende))$").ok())
        .as_ref()
}

/// Whether column `field` of a `kind` record holds a date.
pub fn is_date_field(kind: EntityKind, field: &str) -> bool {
    match kind {
        EntityKind::Client => {
            CLIENT_DATE_FIELDS.contains(&field)
                || client_slot_date_pattern().is_some_and(|re| re.is_match(field))
        }
        EntityKind::Caretaker => CARETAKER_DATE_FIELDS.contains(&field),
    }
}

/// Converts a spreadsheet serial number to a calendar date.
///
/// The fractional part is rounded to the nearest millisecond and interpreted in UTC,
/// so `45000.0` is `2023-03-15`.
pub fn serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() {
        return None;
    }
    let millis = ((serial - SERIAL_UNIX_EPOCH) * MILLIS_PER_DAY).round();
    DateTime::from_timestamp_millis(millis as i64).map(|dt| dt.date_naive())
}

/// Inverse of [`serial_to_date`] for whole days.
pub fn date_to_serial(date: NaiveDate) -> f64 {
    let days = date
        .signed_duration_since(DateTime::UNIX_EPOCH.date_naive())
        .num_days();
    days as f64 + SERIAL_UNIX_EPOCH
}

/// Formats a date as `DD.MM.YYYY`.
pub fn to_display_date(date: NaiveDate) -> String {
    date.format(DISPLAY_FORMAT).to_string()
}

/// Parses a `DD.MM.YYYY` string.
///
/// # Errors
///
/// Returns `CareError::InvalidDate` if the input is not a valid date in that format.
pub fn parse_display_date(input: &str) -> CareResult<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), DISPLAY_FORMAT)
        .map_err(|_| CareError::InvalidDate(input.to_owned()))
}

/// Parses either `DD.MM.YYYY` or `YYYY-MM-DD`.
///
/// Dates arrive in both shapes: typed by the operator, or from a date picker.
pub fn parse_flexible_date(input: &str) -> CareResult<NaiveDate> {
    let trimmed = input.trim();
    NaiveDate::parse_from_str(trimmed, DISPLAY_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(trimmed, ISO_FORMAT))
        .map_err(|_| CareError::InvalidDate(input.to_owned()))
}

/// Replaces serial numbers in the date columns of `record` with display dates.
///
/// Text values, including already formatted dates, are left untouched, so applying this
/// twice is the same as applying it once.
pub fn normalize_date_fields(record: &mut Record, kind: EntityKind) {
    let date_fields: Vec<String> = record
        .keys()
        .filter(|field| is_date_field(kind, field))
        .map(str::to_owned)
        .collect();

    for field in date_fields {
        record.update_existing(&field, |value| match value {
            FieldValue::Number(serial) => match serial_to_date(*serial) {
                Some(date) => FieldValue::Text(to_display_date(date)),
                None => value.clone(),
            },
            FieldValue::Text(_) => value.clone(),
        });
    }
}

/// Normalised copies of a loaded record list, for display and document generation.
pub fn normalized(records: &[Record], kind: EntityKind) -> Vec<Record> {
    records
        .iter()
        .cloned()
        .map(|mut record| {
            normalize_date_fields(&mut record, kind);
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::RecordKey;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn test_serial_45000_is_mid_march_2023() {
        assert_eq!(serial_to_date(45000.0), Some(ymd(2023, 3, 15)));
        assert_eq!(date_to_serial(ymd(2023, 3, 15)), 45000.0);
    }

    #[test]
    fn test_serial_fraction_rounds_within_the_day() {
        assert_eq!(serial_to_date(45000.75), Some(ymd(2023, 3, 15)));
    }

    #[test]
    fn test_display_date_round_trip() {
        for input in ["01.06.2024", "29.02.2024", "31.12.1999"] {
            let parsed = parse_display_date(input).expect("valid display date");
            assert_eq!(to_display_date(parsed), input);
        }
    }

    #[test]
    fn test_parse_display_date_rejects_garbage() {
        assert!(matches!(
            parse_display_date("31.02.2024"),
            Err(CareError::InvalidDate(_))
        ));
        assert!(parse_display_date("morgen").is_err());
    }

    #[test]
    fn test_parse_flexible_date_accepts_iso() {
        assert_eq!(
            parse_flexible_date("2024-06-15").expect("iso date"),
            ymd(2024, 6, 15)
        );
        assert_eq!(
            parse_flexible_date("15.06.2024").expect("display date"),
            ymd(2024, 6, 15)
        );
    }

    #[test]
    fn test_client_date_fields() {
        for field in [
            "kgebdat",
            "Geburtsdatum",
            "b1anfang",
            "BANFANG",
            "b2ende",
            "Betreuer 1 Anfang",
            "betreuer2 ende",
        ] {
            assert!(is_date_field(EntityKind::Client, field), "{field}");
        }
        assert!(!is_date_field(EntityKind::Client, "Betreuer 1 Vorname"));
        assert!(!is_date_field(EntityKind::Client, "IdentDat"));
    }

    #[test]
    fn test_caretaker_date_fields() {
        assert!(is_date_field(EntityKind::Caretaker, "IdentDat"));
        assert!(is_date_field(EntityKind::Caretaker, "Geburtsdatum"));
        assert!(!is_date_field(EntityKind::Caretaker, "kgebdat"));
    }

    #[test]
    fn test_normalize_converts_only_numeric_date_fields() {
        let mut record = Record::from_pairs([
            ("kfname", FieldValue::from("Huber")),
            ("kvname", FieldValue::from("Anna")),
            ("kgebdat", FieldValue::Number(45000.0)),
            ("Betreuer 1 Anfang", FieldValue::from("01.03.2024")),
            ("Money", FieldValue::Number(50.0)),
        ]);

        normalize_date_fields(&mut record, EntityKind::Client);

        assert_eq!(record.get_str("kgebdat"), "15.03.2023");
        assert_eq!(record.get_str("Betreuer 1 Anfang"), "01.03.2024");
        assert_eq!(record.get("Money"), Some(&FieldValue::Number(50.0)));
    }

    #[test]
    fn test_key_is_invariant_under_normalization() {
        let mut record = Record::from_pairs([
            ("kfname", FieldValue::from("Huber")),
            ("kvname", FieldValue::from("Anna")),
            ("kgebdat", FieldValue::Number(20000.0)),
        ]);
        let before = RecordKey::derive(&record, EntityKind::Client);
        normalize_date_fields(&mut record, EntityKind::Client);
        assert_eq!(RecordKey::derive(&record, EntityKind::Client), before);
    }
}
