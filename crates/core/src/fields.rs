//! Helpers for individual record fields: social-insurance numbers, phone numbers, search
//! and sort.

use crate::dates::parse_flexible_date;
use crate::record::Record;
use chrono::NaiveDate;
use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;

/// Client field holding the social-insurance number.
pub const CLIENT_SV_FIELD: &str = "ksvn";

// ============================================================================
// SOCIAL-INSURANCE NUMBER
// ============================================================================

/// Whether `field` holds a social-insurance number (`ksvn`, `SV-Nummer`, `SV - Nummer`, …).
pub fn is_sv_field(field: &str) -> bool {
    if field == CLIENT_SV_FIELD {
        return true;
    }
    let compact: String = field.chars().filter(|c| !c.is_whitespace()).collect();
    compact.to_lowercase() == "sv-nummer"
}

/// The `DDMMYY` part of a social-insurance number.
pub fn sv_birth_segment(birth_date: NaiveDate) -> String {
    birth_date.format("%d%m%y").to_string()
}

/// Joins the serial part and the birth part as `NNNN DDMMYY`. A missing part leaves just
/// the other one.
pub fn compose_sv_number(serial: &str, birth: &str) -> String {
    let (serial, birth) = (serial.trim(), birth.trim());
    match (serial.is_empty(), birth.is_empty()) {
        (false, false) => format!("{serial} {birth}"),
        (false, true) => serial.to_owned(),
        _ => birth.to_owned(),
    }
}

/// Builds a social-insurance number. An entered birth part wins; otherwise it is derived
/// from `birth_date` (`DD.MM.YYYY` or `YYYY-MM-DD`) when that parses.
pub fn sv_number_from_birth_date(
    serial: &str,
    entered_birth: Option<&str>,
    birth_date: Option<&str>,
) -> String {
    let birth = entered_birth
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_owned)
        .or_else(|| {
            birth_date
                .and_then(|d| parse_flexible_date(d).ok())
                .map(sv_birth_segment)
        })
        .unwrap_or_default();
    compose_sv_number(serial, &birth)
}

/// Splits a stored number into serial and birth part.
///
/// Accepts `1234 567890` and `1234567890` (whitespace anywhere); anything else yields `None`.
pub fn split_sv_number(value: &str) -> Option<(String, String)> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() != 10 || !compact.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (serial, birth) = compact.split_at(4);
    Some((serial.to_owned(), birth.to_owned()))
}

// ============================================================================
// PHONE NUMBERS
// ============================================================================

fn phone_field_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)mobil.*ausland|telefon|fest.*ausland|mobil.*inland").ok())
        .as_ref()
}

fn phone_value_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(\+\d{1,4})\s*(.*)$").ok())
        .as_ref()
}

/// Whether `field` holds a phone number stored as `<vorwahl> <number>`.
pub fn is_phone_field(field: &str) -> bool {
    phone_field_pattern().is_some_and(|re| re.is_match(field))
}

/// Splits `"+43 6641234"` into `(Some("+43"), "6641234")`. Values without a leading
/// international prefix come back whole.
pub fn split_phone(value: &str) -> (Option<String>, String) {
    let value = value.trim();
    match phone_value_pattern().and_then(|re| re.captures(value)) {
        Some(caps) => (
            caps.get(1).map(|m| m.as_str().to_owned()),
            caps.get(2).map(|m| m.as_str().to_owned()).unwrap_or_default(),
        ),
        None => (None, value.to_owned()),
    }
}

/// Joins prefix and number. Without a number the prefix is dropped too.
pub fn join_phone(prefix: Option<&str>, number: &str) -> String {
    let number = number.trim();
    match prefix.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prefix) if !number.is_empty() => format!("{prefix} {number}"),
        _ => number.to_owned(),
    }
}

// ============================================================================
// SEARCH AND SORT
// ============================================================================

/// Records with any value containing `needle`, ignoring case. An empty needle matches all.
pub fn filter_records<'a>(records: &'a [Record], needle: &str) -> Vec<&'a Record> {
    let needle = needle.trim().to_lowercase();
    if needle.is_empty() {
        return records.iter().collect();
    }
    records
        .iter()
        .filter(|record| {
            record
                .iter()
                .any(|(_, value)| value.to_string().to_lowercase().contains(&needle))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Sorts by `field`, ignoring case. Records missing the field sort as empty; ties keep
/// their order.
pub fn sort_records(records: &mut [Record], field: &str, order: SortOrder) {
    records.sort_by(|a, b| {
        let ordering = compare_by_field(a, b, field);
        match order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    });
}

/// Compares two records the way [`sort_records`] orders them ascending.
pub fn compare_by_field(a: &Record, b: &Record, field: &str) -> Ordering {
    a.get_str(field)
        .to_lowercase()
        .cmp(&b.get_str(field).to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sv_birth_segment_and_compose() {
        let birth = NaiveDate::from_ymd_opt(1968, 3, 7).expect("valid date");
        assert_eq!(sv_birth_segment(birth), "070368");
        assert_eq!(compose_sv_number("1234", "070368"), "1234 070368");
        assert_eq!(compose_sv_number(" 1234 ", ""), "1234");
        assert_eq!(compose_sv_number("", "070368"), "070368");
    }

    #[test]
    fn test_entered_birth_part_overrides_birth_date() {
        assert_eq!(
            sv_number_from_birth_date("1234", None, Some("07.03.1968")),
            "1234 070368"
        );
        assert_eq!(
            sv_number_from_birth_date("1234", None, Some("1968-03-07")),
            "1234 070368"
        );
        assert_eq!(
            sv_number_from_birth_date("1234", Some("010170"), Some("07.03.1968")),
            "1234 010170"
        );
        assert_eq!(sv_number_from_birth_date("1234", None, Some("irgendwann")), "1234");
    }

    #[test]
    fn test_split_sv_number() {
        assert_eq!(
            split_sv_number("1234 070368"),
            Some(("1234".into(), "070368".into()))
        );
        assert_eq!(
            split_sv_number("12 34070 368"),
            Some(("1234".into(), "070368".into()))
        );
        assert_eq!(split_sv_number("1234"), None);
        assert_eq!(split_sv_number("abcd070368"), None);
    }

    #[test]
    fn test_sv_field_names() {
        assert!(is_sv_field("ksvn"));
        assert!(is_sv_field("SV-Nummer"));
        assert!(is_sv_field("SV - Nummer"));
        assert!(!is_sv_field("SV"));
    }

    #[test]
    fn test_split_and_join_phone() {
        assert_eq!(
            split_phone("+43 6641234"),
            (Some("+43".into()), "6641234".into())
        );
        assert_eq!(split_phone("+4366412"), (Some("+4366".into()), "412".into()));
        assert_eq!(split_phone("0664 1234"), (None, "0664 1234".into()));
        assert_eq!(join_phone(Some("+43"), "6641234"), "+43 6641234");
        assert_eq!(join_phone(Some("+43"), ""), "");
        assert_eq!(join_phone(None, "0664 1234"), "0664 1234");
    }

    #[test]
    fn test_phone_field_names() {
        assert!(is_phone_field("Telefon"));
        assert!(is_phone_field("Mobil Ausland"));
        assert!(is_phone_field("Festnetz Ausland"));
        assert!(!is_phone_field("ktel"));
    }

    #[test]
    fn test_filter_records_ignores_case() {
        let records = vec![
            Record::from_pairs([("kfname", "Huber"), ("Ort", "Linz")]),
            Record::from_pairs([("kfname", "Meier"), ("Ort", "Wien")]),
        ];
        let hits = filter_records(&records, "LINZ");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get_str("kfname"), "Huber");
        assert_eq!(filter_records(&records, "  ").len(), 2);
        assert!(filter_records(&records, "graz").is_empty());
    }

    #[test]
    fn test_filter_records_matches_numbers() {
        let mut record = Record::from_pairs([("kfname", "Huber")]);
        record.set("Money", 55.0);
        let records = vec![record];
        assert_eq!(filter_records(&records, "55").len(), 1);
    }

    #[test]
    fn test_sort_records_both_directions() {
        let mut records = vec![
            Record::from_pairs([("kfname", "meier")]),
            Record::from_pairs([("kfname", "Huber")]),
            Record::from_pairs([("kvname", "ohne Nachname")]),
        ];
        sort_records(&mut records, "kfname", SortOrder::Ascending);
        let names: Vec<String> = records.iter().map(|r| r.get_str("kfname")).collect();
        assert_eq!(names, vec!["", "Huber", "meier"]);

        sort_records(&mut records, "kfname", SortOrder::Descending);
        let names: Vec<String> = records.iter().map(|r| r.get_str("kfname")).collect();
        assert_eq!(names, vec!["meier", "Huber", ""]);
    }
}
