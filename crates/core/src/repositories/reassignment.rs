//! Caretaker change ("Betreuerwechsel").
//!
//! A client has two active caretaker slots (`Betreuer 1`, `Betreuer 2`) and seven history
//! slots (`Altbetreuer 1` to `Altbetreuer 7`). Replacing the caretaker in an active slot
//! moves the outgoing caretaker into the first completely empty history slot and closes
//! their period two weeks before the newcomer starts.
//!
//! The record manipulation itself ([`plan_handover`], [`apply_handover`]) is pure.
//! [`ReassignmentService`] adds the operator dialogue and the file round trip.

use crate::config::CoreConfig;
use crate::constants::{HANDOVER_GAP_DAYS, HISTORY_SLOTS};
use crate::dates::{parse_flexible_date, serial_to_date, to_display_date};
use crate::key::{find_index, EntityKind, RecordKey, CARETAKER_FIRST_NAME_FIELD, CARETAKER_SURNAME_FIELD};
use crate::prompt::{Prompt, PromptSession};
use crate::record::{FieldValue, Record};
use crate::store::{read_records, write_records};
use crate::{CareError, CareResult};
use chrono::{Duration, NaiveDate};
use std::sync::Arc;

/// Number of active caretaker slots on a client record.
pub const ACTIVE_SLOTS: u8 = 2;

/// Field names of active caretaker slot `slot`.
pub fn active_slot_fields(slot: u8) -> [String; 3] {
    [
        format!("Betreuer {slot} Vorname"),
        format!("Betreuer {slot} Nachname"),
        format!("Betreuer {slot} Anfang"),
    ]
}

/// Field names of history slot `index`.
pub fn history_slot_fields(index: usize) -> [String; 4] {
    [
        format!("Altbetreuer {index} Vorname"),
        format!("Altbetreuer {index} Nachname"),
        format!("Altbetreuer {index} Von"),
        format!("Altbetreuer {index} Bis"),
    ]
}

/// The first history slot whose four fields are all empty.
pub fn free_history_slot(client: &Record) -> Option<usize> {
    (1..=HISTORY_SLOTS).find(|&index| {
        history_slot_fields(index)
            .iter()
            .all(|field| client.is_blank(field))
    })
}

/// What a caretaker change will do, computed before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoverPlan {
    /// Active slot being replaced (1 or 2).
    pub slot: u8,
    /// History slot receiving the outgoing caretaker (1 to 7).
    pub history_index: usize,
    /// Start date of the incoming caretaker.
    pub start: NaiveDate,
    /// Proposed end date of the outgoing caretaker.
    pub suggested_end: NaiveDate,
}

/// Works out the target history slot and the suggested end date.
///
/// # Errors
///
/// Returns `CareError::InvalidCaretakerSlot` unless `slot` is 1 or 2, and
/// `CareError::HistoryFull` if all history slots are taken.
pub fn plan_handover(client: &Record, slot: u8, start: NaiveDate) -> CareResult<HandoverPlan> {
    if !(1..=ACTIVE_SLOTS).contains(&slot) {
        return Err(CareError::InvalidCaretakerSlot(slot));
    }
    let history_index = free_history_slot(client).ok_or(CareError::HistoryFull(HISTORY_SLOTS))?;
    Ok(HandoverPlan {
        slot,
        history_index,
        start,
        suggested_end: start - Duration::days(HANDOVER_GAP_DAYS),
    })
}

/// Moves the outgoing caretaker into history and installs the incoming one.
///
/// An empty active slot is still moved, leaving a history entry with only dates.
pub fn apply_handover(client: &mut Record, plan: &HandoverPlan, end: NaiveDate, incoming: &Record) {
    let [first, last, anfang] = active_slot_fields(plan.slot);
    let [hist_first, hist_last, hist_von, hist_bis] = history_slot_fields(plan.history_index);

    let outgoing_start = match client.get(&anfang) {
        Some(FieldValue::Number(serial)) => serial_to_date(*serial)
            .map(to_display_date)
            .map(FieldValue::Text)
            .unwrap_or(FieldValue::Number(*serial)),
        Some(value) => value.clone(),
        None => FieldValue::default(),
    };

    client.set(hist_first, client.get(&first).cloned().unwrap_or_default());
    client.set(hist_last, client.get(&last).cloned().unwrap_or_default());
    client.set(hist_von, outgoing_start);
    client.set(hist_bis, to_display_date(end));

    client.set(first, incoming.get_str(CARETAKER_FIRST_NAME_FIELD));
    client.set(last, incoming.get_str(CARETAKER_SURNAME_FIELD));
    client.set(anfang, to_display_date(plan.start));
}

/// Result of [`ReassignmentService::reassign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassignOutcome {
    /// The client file was rewritten.
    Reassigned { history_index: usize, end_date: String },
    /// The operator cancelled; nothing was written.
    Cancelled,
}

/// Caretaker change on the active client file.
#[derive(Clone, Debug)]
pub struct ReassignmentService {
    cfg: Arc<CoreConfig>,
}

impl ReassignmentService {
    pub fn new(cfg: Arc<CoreConfig>) -> Self {
        Self { cfg }
    }

    /// Replaces the caretaker in `slot` of the client `client_key`.
    ///
    /// The operator first confirms the suggested end date (start minus 14 days). Declining
    /// asks for a date instead; unreadable input is asked again, and cancelling aborts
    /// without writing.
    ///
    /// # Arguments
    ///
    /// * `client_key` - Active client to change
    /// * `slot` - Active caretaker slot, 1 or 2
    /// * `caretaker_key` - Active caretaker taking over
    /// * `start` - First day of the incoming caretaker
    /// * `prompt` - Answers the end-date questions
    ///
    /// # Errors
    ///
    /// Returns `CareError::RecordNotFound` if either key is unknown, plus the errors of
    /// [`plan_handover`] and the store.
    pub fn reassign(
        &self,
        client_key: &RecordKey,
        slot: u8,
        caretaker_key: &RecordKey,
        start: NaiveDate,
        prompt: &mut dyn Prompt,
    ) -> CareResult<ReassignOutcome> {
        let clients_path = self.cfg.active_file(EntityKind::Client);
        let mut clients = read_records(&clients_path)?;
        let idx = find_index(&clients, EntityKind::Client, client_key)
            .ok_or_else(|| CareError::RecordNotFound(client_key.to_string()))?;

        let caretakers = read_records(&self.cfg.active_file(EntityKind::Caretaker))?;
        let incoming = find_index(&caretakers, EntityKind::Caretaker, caretaker_key)
            .map(|i| &caretakers[i])
            .ok_or_else(|| CareError::RecordNotFound(caretaker_key.to_string()))?;

        let plan = plan_handover(&clients[idx], slot, start)?;

        let mut session = PromptSession::new(prompt);
        let Some(end) = confirm_end_date(&mut session, plan.suggested_end) else {
            tracing::info!("caretaker change for {} cancelled", client_key);
            return Ok(ReassignOutcome::Cancelled);
        };

        apply_handover(&mut clients[idx], &plan, end, incoming);
        write_records(&clients_path, &clients)?;

        tracing::info!(
            "caretaker slot {} of {} handed to {}, previous caretaker in history slot {}",
            slot,
            client_key,
            caretaker_key,
            plan.history_index
        );
        Ok(ReassignOutcome::Reassigned {
            history_index: plan.history_index,
            end_date: to_display_date(end),
        })
    }
}

fn confirm_end_date(session: &mut PromptSession<'_>, suggested: NaiveDate) -> Option<NaiveDate> {
    let message = format!(
        "Das Enddatum des Altbetreuers wird automatisch auf {} gesetzt (2 Wochen vor Beginn des neuen Betreuers). Übernehmen?",
        to_display_date(suggested)
    );
    if session.confirm(&message) {
        return Some(suggested);
    }

    loop {
        let input = session.ask_date("Bitte Enddatum des Altbetreuers eingeben (TT.MM.JJJJ):")?;
        let date = match parse_flexible_date(&input) {
            Ok(date) => date,
            Err(_) => {
                tracing::warn!("unreadable end date '{}', asking again", input);
                continue;
            }
        };
        let message = format!(
            "Enddatum des Altbetreuers auf {} setzen?",
            to_display_date(date)
        );
        if session.confirm(&message) {
            return Some(date);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{AutoConfirm, Decline, Scripted};
    use tempfile::TempDir;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn maria_klein() -> Record {
        Record::from_pairs([("Vor.Nam", "Maria"), ("Fam. Nam", "Klein")])
    }

    fn client_with_maria() -> Record {
        Record::from_pairs([
            ("kfname", "Huber"),
            ("kvname", "Anna"),
            ("Betreuer 1 Vorname", "Maria"),
            ("Betreuer 1 Nachname", "Klein"),
            ("Betreuer 1 Anfang", "01.01.2024"),
        ])
    }

    fn fill_history(record: &mut Record, slots: usize) {
        for index in 1..=slots {
            record.set(format!("Altbetreuer {index} Vorname"), "X");
        }
    }

    #[test]
    fn test_plan_suggests_end_two_weeks_before_start() {
        let plan = plan_handover(&client_with_maria(), 1, ymd(2024, 6, 15)).expect("plan");
        assert_eq!(plan.history_index, 1);
        assert_eq!(to_display_date(plan.suggested_end), "01.06.2024");
    }

    #[test]
    fn test_apply_moves_outgoing_into_history() {
        let mut client = client_with_maria();
        let incoming = Record::from_pairs([("Vor.Nam", "Jana"), ("Fam. Nam", "Novak")]);
        let plan = plan_handover(&client, 1, ymd(2024, 6, 15)).expect("plan");

        apply_handover(&mut client, &plan, plan.suggested_end, &incoming);

        assert_eq!(client.get_str("Altbetreuer 1 Vorname"), "Maria");
        assert_eq!(client.get_str("Altbetreuer 1 Nachname"), "Klein");
        assert_eq!(client.get_str("Altbetreuer 1 Von"), "01.01.2024");
        assert_eq!(client.get_str("Altbetreuer 1 Bis"), "01.06.2024");
        assert_eq!(client.get_str("Betreuer 1 Vorname"), "Jana");
        assert_eq!(client.get_str("Betreuer 1 Nachname"), "Novak");
        assert_eq!(client.get_str("Betreuer 1 Anfang"), "15.06.2024");
    }

    #[test]
    fn test_plan_skips_partially_filled_history_slots() {
        let mut client = client_with_maria();
        client.set("Altbetreuer 1 Bis", "31.12.2023");
        client.set("Altbetreuer 2 Vorname", "");
        let plan = plan_handover(&client, 2, ymd(2024, 6, 15)).expect("plan");
        assert_eq!(plan.history_index, 2);
    }

    #[test]
    fn test_plan_refuses_when_history_is_full() {
        let mut client = client_with_maria();
        fill_history(&mut client, HISTORY_SLOTS);
        assert!(matches!(
            plan_handover(&client, 1, ymd(2024, 6, 15)),
            Err(CareError::HistoryFull(7))
        ));
    }

    #[test]
    fn test_plan_rejects_unknown_slot() {
        assert!(matches!(
            plan_handover(&client_with_maria(), 3, ymd(2024, 6, 15)),
            Err(CareError::InvalidCaretakerSlot(3))
        ));
    }

    #[test]
    fn test_empty_outgoing_slot_is_still_recorded() {
        let mut client = Record::from_pairs([("kfname", "Huber"), ("kvname", "Anna")]);
        let plan = plan_handover(&client, 2, ymd(2024, 6, 15)).expect("plan");
        apply_handover(&mut client, &plan, plan.suggested_end, &maria_klein());

        assert_eq!(client.get_str("Altbetreuer 1 Vorname"), "");
        assert_eq!(client.get_str("Altbetreuer 1 Bis"), "01.06.2024");
        assert_eq!(client.get_str("Betreuer 2 Vorname"), "Maria");
    }

    #[test]
    fn test_numeric_start_date_is_moved_as_display_date() {
        let mut client = client_with_maria();
        client.set("Betreuer 1 Anfang", 45000.0);
        let plan = plan_handover(&client, 1, ymd(2024, 6, 15)).expect("plan");
        apply_handover(&mut client, &plan, plan.suggested_end, &maria_klein());
        assert_eq!(client.get_str("Altbetreuer 1 Von"), "15.03.2023");
    }

    fn setup(temp_dir: &TempDir) -> ReassignmentService {
        let cfg = Arc::new(CoreConfig::new(
            temp_dir.path().to_path_buf(),
            temp_dir.path().join("Daten"),
            temp_dir.path().join("AlteDaten"),
        ));
        write_records(&cfg.active_file(EntityKind::Client), &[client_with_maria()])
            .expect("seed clients");
        write_records(
            &cfg.active_file(EntityKind::Caretaker),
            &[Record::from_pairs([("Vor.Nam", "Jana"), ("Fam. Nam", "Novak")])],
        )
        .expect("seed caretakers");
        ReassignmentService::new(cfg)
    }

    #[test]
    fn test_reassign_with_suggested_date_writes_client_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = setup(&temp_dir);

        let outcome = service
            .reassign(
                &RecordKey::parse("huber__anna"),
                1,
                &RecordKey::parse("jana__novak"),
                ymd(2024, 6, 15),
                &mut AutoConfirm,
            )
            .expect("reassign");
        assert_eq!(
            outcome,
            ReassignOutcome::Reassigned {
                history_index: 1,
                end_date: "01.06.2024".into()
            }
        );

        let clients =
            read_records(&temp_dir.path().join("Daten/Kundendaten.xlsx")).expect("read back");
        assert_eq!(clients[0].get_str("Altbetreuer 1 Vorname"), "Maria");
        assert_eq!(clients[0].get_str("Betreuer 1 Vorname"), "Jana");
    }

    #[test]
    fn test_reassign_with_manual_date_reprompts_on_garbage() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = setup(&temp_dir);
        let mut prompt = Scripted {
            confirms: [false, true].into(),
            dates: [Some("irgendwann".to_owned()), Some("2024-05-31".to_owned())].into(),
            ..Scripted::default()
        };

        let outcome = service
            .reassign(
                &RecordKey::parse("huber__anna"),
                1,
                &RecordKey::parse("jana__novak"),
                ymd(2024, 6, 15),
                &mut prompt,
            )
            .expect("reassign");
        assert_eq!(
            outcome,
            ReassignOutcome::Reassigned {
                history_index: 1,
                end_date: "31.05.2024".into()
            }
        );
        assert_eq!(prompt.asked.len(), 4);
    }

    #[test]
    fn test_reassign_cancel_writes_nothing() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = setup(&temp_dir);
        let path = temp_dir.path().join("Daten/Kundendaten.xlsx");
        let before = read_records(&path).expect("read before");

        let outcome = service
            .reassign(
                &RecordKey::parse("huber__anna"),
                1,
                &RecordKey::parse("jana__novak"),
                ymd(2024, 6, 15),
                &mut Decline,
            )
            .expect("reassign");
        assert_eq!(outcome, ReassignOutcome::Cancelled);
        assert_eq!(read_records(&path).expect("read after"), before);
    }

    #[test]
    fn test_reassign_unknown_caretaker_is_an_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = setup(&temp_dir);
        let result = service.reassign(
            &RecordKey::parse("huber__anna"),
            1,
            &RecordKey::parse("niemand__da"),
            ymd(2024, 6, 15),
            &mut AutoConfirm,
        );
        assert!(matches!(result, Err(CareError::RecordNotFound(_))));
    }
}
