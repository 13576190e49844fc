//! Active and archived record management.
//!
//! Every record kind has two spreadsheets: the active file in the data directory and the
//! archive file in the archive directory. This module moves records between them.
//!
//! ## Lifecycle
//!
//! ```text
//!   add ──► Active ──delete──► Archived ──purge──► (gone)
//!             ▲                   │
//!             └──────restore──────┘
//! ```
//!
//! Each operation is a full read-modify-write of the files involved. Moving a record
//! reads both files before writing either and writes the destination first, so a failure
//! between the two writes can leave the record in both files but never in neither.
//!
//! Records are always located by [`RecordKey`], never by list position.

use crate::config::CoreConfig;
use crate::dates::normalized;
use crate::key::{find_index, EntityKind, RecordKey};
use crate::prompt::{Prompt, PromptSession};
use crate::record::Record;
use crate::store::{read_records, write_records};
use crate::{CareError, CareResult};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

// ============================================================================
// KIND MARKERS
// ============================================================================

/// Binds a marker type to the record kind it manages.
pub trait RecordKind {
    const KIND: EntityKind;
}

/// Marker type: the service manages client records.
#[derive(Clone, Copy, Debug)]
pub struct Clients;

/// Marker type: the service manages caretaker records.
#[derive(Clone, Copy, Debug)]
pub struct Caretakers;

impl RecordKind for Clients {
    const KIND: EntityKind = EntityKind::Client;
}

impl RecordKind for Caretakers {
    const KIND: EntityKind = EntityKind::Caretaker;
}

/// Result of [`RecordService::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// No archived record has the key. Nothing was written.
    NotFound,
    /// A record with the same key is already active and the operator declined.
    /// The archive is back in its original order.
    Declined,
    /// The record moved from the archive to the active file.
    Restored,
}

// ============================================================================
// RECORD SERVICE
// ============================================================================

/// Service for one kind of record.
///
/// Generic parameter `K` is either [`Clients`] or [`Caretakers`], so a client key can never
/// be used against the caretaker files by accident.
#[derive(Clone, Debug)]
pub struct RecordService<K> {
    cfg: Arc<CoreConfig>,
    kind: PhantomData<K>,
}

impl<K: RecordKind> RecordService<K> {
    /// Creates a new record service.
    ///
    /// # Arguments
    ///
    /// * `cfg` - Core configuration containing the data and archive directories
    pub fn new(cfg: Arc<CoreConfig>) -> Self {
        Self {
            cfg,
            kind: PhantomData,
        }
    }

    pub fn kind(&self) -> EntityKind {
        K::KIND
    }

    fn active_path(&self) -> PathBuf {
        self.cfg.active_file(K::KIND)
    }

    fn archive_path(&self) -> PathBuf {
        self.cfg.archive_file(K::KIND)
    }

    /// Active records exactly as stored, date columns still as serial numbers.
    pub fn load_active(&self) -> CareResult<Vec<Record>> {
        read_records(&self.active_path())
    }

    /// Archived records exactly as stored.
    pub fn load_archived(&self) -> CareResult<Vec<Record>> {
        read_records(&self.archive_path())
    }

    /// Active records with date columns formatted for display.
    pub fn list_active(&self) -> CareResult<Vec<Record>> {
        Ok(normalized(&self.load_active()?, K::KIND))
    }

    /// Archived records with date columns formatted for display.
    pub fn list_archived(&self) -> CareResult<Vec<Record>> {
        Ok(normalized(&self.load_archived()?, K::KIND))
    }

    /// Looks up one active record, date columns formatted for display.
    pub fn find_active(&self, key: &RecordKey) -> CareResult<Option<Record>> {
        let records = self.list_active()?;
        Ok(find_index(&records, K::KIND, key).map(|idx| records[idx].clone()))
    }

    /// Appends a new record to the active file.
    ///
    /// # Returns
    ///
    /// The key of the new record.
    ///
    /// # Errors
    ///
    /// Returns `CareError::InvalidInput` if both name fields are blank, or a store error if
    /// the file cannot be read or written.
    pub fn add(&self, record: Record) -> CareResult<RecordKey> {
        let (a, b) = K::KIND.key_fields();
        if record.is_blank(a) && record.is_blank(b) {
            return Err(CareError::InvalidInput(format!(
                "a new {} needs at least '{}' or '{}'",
                K::KIND,
                a,
                b
            )));
        }

        let key = RecordKey::derive(&record, K::KIND);
        let mut records = self.load_active()?;
        if find_index(&records, K::KIND, &key).is_some() {
            tracing::warn!("adding {} with duplicate key {}", K::KIND, key);
        }
        records.push(record);
        write_records(&self.active_path(), &records)?;
        tracing::info!("added {} {}", K::KIND, key);
        Ok(key)
    }

    /// Merges `changes` into the active record with `key`.
    ///
    /// # Returns
    ///
    /// `false` if no active record has the key; nothing is written in that case.
    pub fn update(&self, key: &RecordKey, changes: &Record) -> CareResult<bool> {
        let mut records = self.load_active()?;
        let Some(idx) = find_index(&records, K::KIND, key) else {
            return Ok(false);
        };
        records[idx].merge(changes);
        write_records(&self.active_path(), &records)?;
        tracing::info!("updated {} {}", K::KIND, key);
        Ok(true)
    }

    /// Moves the active record with `key` to the end of the archive.
    ///
    /// Both files are read before anything is written. The archive is written first, so a
    /// failing second write leaves the record in both files rather than in neither.
    ///
    /// # Returns
    ///
    /// `false` if no active record has the key; nothing is written in that case.
    pub fn delete(&self, key: &RecordKey) -> CareResult<bool> {
        let mut active = self.load_active()?;
        let Some(idx) = find_index(&active, K::KIND, key) else {
            return Ok(false);
        };
        let mut archived = self.load_archived()?;

        archived.push(active.remove(idx));
        write_records(&self.archive_path(), &archived)?;
        write_records(&self.active_path(), &active)?;

        tracing::info!("archived {} {}", K::KIND, key);
        Ok(true)
    }

    /// Moves the archived record with `key` back to the active file.
    ///
    /// If an active record already has the same key the operator is asked whether to
    /// restore anyway. Declining leaves both files untouched. Both files are read before
    /// anything is written and the active file is written first.
    ///
    /// # Arguments
    ///
    /// * `key` - Key of the archived record
    /// * `prompt` - Answers the duplicate question
    pub fn restore(&self, key: &RecordKey, prompt: &mut dyn Prompt) -> CareResult<RestoreOutcome> {
        let mut archived = self.load_archived()?;
        let Some(idx) = find_index(&archived, K::KIND, key) else {
            return Ok(RestoreOutcome::NotFound);
        };
        let mut active = self.load_active()?;

        if find_index(&active, K::KIND, key).is_some() {
            let mut session = PromptSession::new(prompt);
            let message = format!(
                "Ein {} mit diesem Namen existiert bereits. Trotzdem wiederherstellen?",
                K::KIND
            );
            if !session.confirm(&message) {
                tracing::info!("restore of {} {} declined", K::KIND, key);
                return Ok(RestoreOutcome::Declined);
            }
            tracing::warn!("restoring {} {} next to an existing record", K::KIND, key);
        }

        active.push(archived.remove(idx));
        write_records(&self.active_path(), &active)?;
        write_records(&self.archive_path(), &archived)?;
        tracing::info!("restored {} {}", K::KIND, key);
        Ok(RestoreOutcome::Restored)
    }

    /// Permanently removes the archived record with `key`.
    ///
    /// # Returns
    ///
    /// `false` if no archived record has the key.
    pub fn purge(&self, key: &RecordKey) -> CareResult<bool> {
        let mut archived = self.load_archived()?;
        let Some(idx) = find_index(&archived, K::KIND, key) else {
            return Ok(false);
        };
        archived.remove(idx);
        write_records(&self.archive_path(), &archived)?;
        tracing::info!("purged archived {} {}", K::KIND, key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{AutoConfirm, Decline, Scripted};
    use crate::record::FieldValue;
    use std::fs;
    use tempfile::TempDir;

    fn service<K: RecordKind>(temp_dir: &TempDir) -> RecordService<K> {
        let cfg = CoreConfig::new(
            temp_dir.path().to_path_buf(),
            temp_dir.path().join("Daten"),
            temp_dir.path().join("AlteDaten"),
        );
        RecordService::new(Arc::new(cfg))
    }

    fn client(surname: &str, first: &str) -> Record {
        Record::from_pairs([("kfname", surname), ("kvname", first)])
    }

    fn seed(clients: &RecordService<Clients>, records: &[Record]) {
        for record in records {
            clients.add(record.clone()).expect("seed add");
        }
    }

    #[test]
    fn test_add_and_find_by_key() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clients = service::<Clients>(&temp_dir);

        let mut anna = client("Huber", "Anna");
        anna.set("kgebdat", 45000.0);
        let key = clients.add(anna).expect("add should succeed");
        assert_eq!(key.as_str(), "huber__anna");

        let found = clients
            .find_active(&key)
            .expect("find should succeed")
            .expect("record should exist");
        assert_eq!(found.get_str("kgebdat"), "15.03.2023");

        let raw = clients.load_active().expect("load should succeed");
        assert_eq!(raw[0].get("kgebdat"), Some(&FieldValue::Number(45000.0)));
    }

    #[test]
    fn test_add_rejects_nameless_record() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clients = service::<Clients>(&temp_dir);
        let result = clients.add(Record::from_pairs([("ktel", "123")]));
        assert!(matches!(result, Err(CareError::InvalidInput(_))));
    }

    #[test]
    fn test_update_merges_fields() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clients = service::<Clients>(&temp_dir);
        seed(&clients, &[client("Huber", "Anna")]);

        let key = RecordKey::parse("huber__anna");
        let changes = Record::from_pairs([("ktel", "+43 6641234")]);
        assert!(clients.update(&key, &changes).expect("update"));
        assert!(!clients
            .update(&RecordKey::parse("nobody__here"), &changes)
            .expect("update of unknown key"));

        let records = clients.list_active().expect("list");
        assert_eq!(records[0].get_str("ktel"), "+43 6641234");
    }

    #[test]
    fn test_delete_moves_record_to_archive() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clients = service::<Clients>(&temp_dir);
        seed(&clients, &[client("Berger", "Karl"), client("Huber", "Anna")]);

        assert!(clients.delete(&RecordKey::parse("huber__anna")).expect("delete"));

        let active = clients.list_active().expect("list active");
        let archived = clients.list_archived().expect("list archived");
        assert_eq!(active.len(), 1);
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].get_str("kfname"), "Huber");
        assert!(temp_dir.path().join("AlteDaten/ALTkundendaten.xlsx").exists());
    }

    #[test]
    fn test_delete_unknown_key_is_a_no_op() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clients = service::<Clients>(&temp_dir);
        seed(&clients, &[client("Huber", "Anna")]);

        assert!(!clients.delete(&RecordKey::parse("nobody__here")).expect("delete"));
        assert!(!temp_dir.path().join("AlteDaten/ALTkundendaten.xlsx").exists());
    }

    #[test]
    fn test_delete_with_unreadable_archive_keeps_active_record() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clients = service::<Clients>(&temp_dir);
        seed(&clients, &[client("Huber", "Anna")]);
        fs::create_dir_all(temp_dir.path().join("AlteDaten")).expect("create archive dir");
        fs::write(clients.archive_path(), b"not a workbook").expect("corrupt archive");

        let result = clients.delete(&RecordKey::parse("huber__anna"));
        assert!(matches!(result, Err(CareError::SpreadsheetRead { .. })));

        let active = clients.load_active().expect("active file still readable");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].get_str("kfname"), "Huber");
        assert_eq!(
            fs::read(clients.archive_path()).expect("archive untouched"),
            b"not a workbook"
        );
    }

    #[test]
    fn test_restore_with_unreadable_active_file_keeps_archived_record() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clients = service::<Clients>(&temp_dir);
        let key = RecordKey::parse("huber__anna");
        seed(&clients, &[client("Huber", "Anna")]);
        clients.delete(&key).expect("delete");
        fs::write(clients.active_path(), b"not a workbook").expect("corrupt active file");

        let result = clients.restore(&key, &mut AutoConfirm);
        assert!(matches!(result, Err(CareError::SpreadsheetRead { .. })));

        let archived = clients.load_archived().expect("archive still readable");
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].get_str("kvname"), "Anna");
    }

    #[test]
    fn test_delete_then_restore_returns_to_original_content() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clients = service::<Clients>(&temp_dir);
        let mut anna = client("Huber", "Anna");
        anna.set("Money", 50.0);
        seed(&clients, &[client("Berger", "Karl"), anna.clone()]);

        let key = RecordKey::parse("huber__anna");
        clients.delete(&key).expect("delete");
        let outcome = clients.restore(&key, &mut Decline).expect("restore");
        assert_eq!(outcome, RestoreOutcome::Restored);

        let active = clients.load_active().expect("load");
        let restored: Vec<Record> = active.iter().map(Record::without_padding).collect();
        assert!(restored.contains(&anna));
        assert_eq!(active.len(), 2);
        assert!(clients.load_archived().expect("load archive").is_empty());
    }

    #[test]
    fn test_restore_conflict_declined_leaves_counts_unchanged() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clients = service::<Clients>(&temp_dir);
        let key = RecordKey::parse("huber__anna");

        seed(&clients, &[client("Huber", "Anna"), client("Maier", "Eva")]);
        clients.delete(&RecordKey::parse("maier__eva")).expect("delete");
        clients.delete(&key).expect("delete");
        clients.add(client("Huber", "Anna")).expect("re-add");

        let mut prompt = Scripted::default();
        let outcome = clients.restore(&key, &mut prompt).expect("restore");
        assert_eq!(outcome, RestoreOutcome::Declined);
        assert_eq!(prompt.asked.len(), 1);

        let archived = clients.list_archived().expect("list archived");
        assert_eq!(clients.list_active().expect("list active").len(), 1);
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[1].get_str("kfname"), "Huber");
    }

    #[test]
    fn test_restore_conflict_confirmed_appends_duplicate() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clients = service::<Clients>(&temp_dir);
        let key = RecordKey::parse("huber__anna");

        seed(&clients, &[client("Huber", "Anna")]);
        clients.delete(&key).expect("delete");
        clients.add(client("Huber", "Anna")).expect("re-add");

        let outcome = clients.restore(&key, &mut AutoConfirm).expect("restore");
        assert_eq!(outcome, RestoreOutcome::Restored);
        assert_eq!(clients.list_active().expect("list").len(), 2);
    }

    #[test]
    fn test_restore_unknown_key_is_not_found() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clients = service::<Clients>(&temp_dir);
        let outcome = clients
            .restore(&RecordKey::parse("nobody__here"), &mut AutoConfirm)
            .expect("restore");
        assert_eq!(outcome, RestoreOutcome::NotFound);
    }

    #[test]
    fn test_purge_removes_from_archive_only() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let caretakers = service::<Caretakers>(&temp_dir);
        caretakers
            .add(Record::from_pairs([("Vor.Nam", "Maria"), ("Fam. Nam", "Klein")]))
            .expect("add");
        let key = RecordKey::parse("maria__klein");

        assert!(!caretakers.purge(&key).expect("purge active-only key"));
        caretakers.delete(&key).expect("delete");
        assert!(caretakers.purge(&key).expect("purge"));
        assert!(caretakers.list_archived().expect("list").is_empty());
        assert!(temp_dir
            .path()
            .join("AlteDaten/ALTbetreuerinnendaten.xlsx")
            .exists());
    }
}
