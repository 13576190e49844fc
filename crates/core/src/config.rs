//! Application configuration.
//!
//! The office's settings live in a single `config.json` in the per-user configuration
//! directory. [`ConfigStore`] is the only thing that reads or writes that file. Services never
//! look at it directly; they receive a [`CoreConfig`], a resolved and immutable snapshot with
//! every default already applied.
//!
//! Key names in the file are camelCase and shared with older installations, so unknown keys
//! are carried through untouched when the file is saved again.

use crate::constants::{
    CONFIG_FILENAME, DEFAULT_ARCHIVE_DIR, DEFAULT_DATA_DIR, DEFAULT_INVOICE_TEMPLATE_DIR,
    DEFAULT_TEMPLATE_DIR,
};
use crate::key::EntityKind;
use crate::validation::{validate_billing_month, validate_billing_year, validate_invoice_counter};
use crate::{CareError, CareResult};
use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable naming an alternative configuration directory.
pub const CONFIG_DIR_ENV: &str = "HOMECARE_CONFIG_DIR";

const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
const DEFAULT_SMTP_PORT: u16 = 465;

/// OAuth tokens as stored by the consent flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Access-token expiry in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The contents of `config.json`, exactly as persisted.
///
/// Every field is optional because older files only contain a subset; defaults are applied
/// when a [`CoreConfig`] is resolved, not here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daten_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_daten_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vorlagen_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rechnungsvorlage_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_rechnungsnummer: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verrechnungsmonat: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verrechnungsjahr: Option<i32>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_groups: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_group_order: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_secret: Option<String>,
    #[serde(
        rename = "googleOAuthTokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub google_oauth_tokens: Option<OAuthTokens>,
    /// Older files keep the refresh token at the top level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_refresh_token: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Directories the office can relocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    Data,
    Archive,
    Templates,
    InvoiceTemplates,
}

// ============================================================================
// RESOLVED CONFIGURATION
// ============================================================================

/// Mail settings after defaults are applied. Credentials stay optional; the mail service
/// reports what is missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailSettings {
    pub from_name: Option<String>,
    pub from_address: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub access_token: Option<String>,
    /// Milliseconds since the Unix epoch; `None` when unknown.
    pub token_expiry: Option<i64>,
    pub refresh_token: Option<String>,
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    config_dir: PathBuf,
    data_dir: PathBuf,
    archive_dir: PathBuf,
    template_dir: PathBuf,
    invoice_template_dir: PathBuf,
    invoice_counter: u64,
    billing_month: u32,
    billing_year: i32,
    mail: MailSettings,
}

impl CoreConfig {
    /// Create a `CoreConfig` with explicit directories and the current month as billing period.
    ///
    /// Mainly useful in tests; production code resolves one through [`ConfigStore::core_config`].
    pub fn new(config_dir: PathBuf, data_dir: PathBuf, archive_dir: PathBuf) -> Self {
        let today = Local::now().date_naive();
        Self {
            template_dir: config_dir.join(DEFAULT_TEMPLATE_DIR),
            invoice_template_dir: config_dir.join(DEFAULT_INVOICE_TEMPLATE_DIR),
            config_dir,
            data_dir,
            archive_dir,
            invoice_counter: 1,
            billing_month: today.month(),
            billing_year: today.year(),
            mail: MailSettings {
                smtp_host: DEFAULT_SMTP_HOST.to_owned(),
                smtp_port: DEFAULT_SMTP_PORT,
                ..MailSettings::default()
            },
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    pub fn invoice_template_dir(&self) -> &Path {
        &self.invoice_template_dir
    }

    /// Active spreadsheet of `kind`.
    pub fn active_file(&self, kind: EntityKind) -> PathBuf {
        self.data_dir.join(kind.active_filename())
    }

    /// Archive spreadsheet of `kind`.
    pub fn archive_file(&self, kind: EntityKind) -> PathBuf {
        self.archive_dir.join(kind.archive_filename())
    }

    pub fn invoice_counter(&self) -> u64 {
        self.invoice_counter
    }

    pub fn billing_month(&self) -> u32 {
        self.billing_month
    }

    pub fn billing_year(&self) -> i32 {
        self.billing_year
    }

    pub fn mail(&self) -> &MailSettings {
        &self.mail
    }

    /// Same configuration with other template directories.
    pub fn with_template_dirs(mut self, templates: PathBuf, invoice_templates: PathBuf) -> Self {
        self.template_dir = templates;
        self.invoice_template_dir = invoice_templates;
        self
    }

    /// Same configuration with other mail settings.
    pub fn with_mail(mut self, mail: MailSettings) -> Self {
        self.mail = mail;
        self
    }
}

// ============================================================================
// CONFIG STORE
// ============================================================================

/// Resolve the configuration directory.
///
/// An explicit override wins (the CLI passes `--config-dir` or `HOMECARE_CONFIG_DIR`);
/// otherwise the platform's per-user configuration directory is used.
///
/// # Errors
///
/// Returns `CareError::InvalidInput` if no home directory can be determined.
pub fn resolve_config_dir(override_dir: Option<PathBuf>) -> CareResult<PathBuf> {
    if let Some(dir) = override_dir {
        return Ok(dir);
    }
    directories::ProjectDirs::from("at", "Homecare", "homecare")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| {
            CareError::InvalidInput("could not determine a per-user configuration directory".into())
        })
}

/// Owner of `config.json`.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
    config: AppConfig,
}

impl ConfigStore {
    /// Load the configuration from `dir`.
    ///
    /// A missing file yields defaults. A file that is not valid JSON is logged and also
    /// yields defaults; it is only overwritten by the next explicit save.
    ///
    /// # Errors
    ///
    /// Returns `CareError::FileRead` if the file exists but cannot be read.
    pub fn load(dir: impl Into<PathBuf>) -> CareResult<Self> {
        let dir = dir.into();
        let path = dir.join(CONFIG_FILENAME);

        let config = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(CareError::FileRead)?;
            match serde_json::from_str::<AppConfig>(&raw) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("ignoring malformed {}: {}", path.display(), e);
                    AppConfig::default()
                }
            }
        } else {
            AppConfig::default()
        };

        Ok(Self { dir, config })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILENAME)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Apply `change` to the configuration and persist it.
    pub fn update(&mut self, change: impl FnOnce(&mut AppConfig)) -> CareResult<()> {
        change(&mut self.config);
        self.save()
    }

    /// Write the configuration to disk, creating the directory if needed.
    pub fn save(&self) -> CareResult<()> {
        fs::create_dir_all(&self.dir).map_err(|source| CareError::DirCreation {
            path: self.dir.clone(),
            source,
        })?;
        let json =
            serde_json::to_string_pretty(&self.config).map_err(CareError::ConfigSerialization)?;
        fs::write(self.path(), json).map_err(CareError::FileWrite)?;
        tracing::debug!("saved configuration to {}", self.path().display());
        Ok(())
    }

    /// Resolve every setting against its default.
    ///
    /// Relative directories are taken relative to the configuration directory.
    pub fn core_config(&self) -> Arc<CoreConfig> {
        let cfg = &self.config;
        let resolve = |value: &Option<PathBuf>, default: &str| -> PathBuf {
            match value {
                Some(p) if p.is_absolute() => p.clone(),
                Some(p) if !p.as_os_str().is_empty() => self.dir.join(p),
                _ => self.dir.join(default),
            }
        };
        let today = Local::now().date_naive();
        let tokens = cfg.google_oauth_tokens.clone().unwrap_or_default();
        let non_blank = |value: &Option<String>| value.clone().filter(|s| !s.trim().is_empty());

        Arc::new(CoreConfig {
            config_dir: self.dir.clone(),
            data_dir: resolve(&cfg.daten_dir, DEFAULT_DATA_DIR),
            archive_dir: resolve(&cfg.alt_daten_dir, DEFAULT_ARCHIVE_DIR),
            template_dir: resolve(&cfg.vorlagen_dir, DEFAULT_TEMPLATE_DIR),
            invoice_template_dir: resolve(&cfg.rechnungsvorlage_dir, DEFAULT_INVOICE_TEMPLATE_DIR),
            invoice_counter: cfg.current_rechnungsnummer.filter(|n| *n >= 1).unwrap_or(1),
            billing_month: cfg
                .verrechnungsmonat
                .filter(|m| (1..=12).contains(m))
                .unwrap_or_else(|| today.month()),
            billing_year: cfg.verrechnungsjahr.unwrap_or_else(|| today.year()),
            mail: MailSettings {
                from_name: non_blank(&cfg.from_name),
                from_address: non_blank(&cfg.from_address),
                smtp_host: non_blank(&cfg.smtp_host).unwrap_or_else(|| DEFAULT_SMTP_HOST.to_owned()),
                smtp_port: cfg.smtp_port.unwrap_or(DEFAULT_SMTP_PORT),
                smtp_user: non_blank(&cfg.smtp_user),
                smtp_password: non_blank(&cfg.smtp_password),
                google_client_id: non_blank(&cfg.google_client_id),
                google_client_secret: non_blank(&cfg.google_client_secret),
                access_token: non_blank(&tokens.access_token),
                token_expiry: tokens.expiry_date,
                refresh_token: non_blank(&tokens.refresh_token)
                    .or_else(|| non_blank(&cfg.google_refresh_token)),
            },
        })
    }

    /// Point one of the managed directories somewhere else.
    pub fn set_directory(&mut self, kind: DirectoryKind, path: PathBuf) -> CareResult<()> {
        if path.as_os_str().is_empty() {
            return Err(CareError::InvalidInput("directory path cannot be empty".into()));
        }
        tracing::info!("setting {:?} directory to {}", kind, path.display());
        self.update(|cfg| {
            let slot = match kind {
                DirectoryKind::Data => &mut cfg.daten_dir,
                DirectoryKind::Archive => &mut cfg.alt_daten_dir,
                DirectoryKind::Templates => &mut cfg.vorlagen_dir,
                DirectoryKind::InvoiceTemplates => &mut cfg.rechnungsvorlage_dir,
            };
            *slot = Some(path);
        })
    }

    /// Set the next invoice number.
    ///
    /// # Errors
    ///
    /// Returns `CareError::InvalidInput` if `counter` is zero.
    pub fn set_invoice_counter(&mut self, counter: u64) -> CareResult<()> {
        validate_invoice_counter(counter)?;
        self.update(|cfg| cfg.current_rechnungsnummer = Some(counter))
    }

    /// Store a freshly issued OAuth access token next to the refresh token.
    pub fn set_access_token(
        &mut self,
        access_token: String,
        expiry_date: Option<i64>,
    ) -> CareResult<()> {
        self.update(|cfg| {
            let tokens = cfg.google_oauth_tokens.get_or_insert_with(OAuthTokens::default);
            tokens.access_token = Some(access_token);
            tokens.expiry_date = expiry_date;
        })
    }

    /// Set the default billing month and year.
    ///
    /// # Errors
    ///
    /// Returns `CareError::InvalidInput` if the month is outside 1–12 or the year outside
    /// 2000–2100.
    pub fn set_billing_period(&mut self, month: u32, year: i32) -> CareResult<()> {
        validate_billing_month(month)?;
        validate_billing_year(year)?;
        self.update(|cfg| {
            cfg.verrechnungsmonat = Some(month);
            cfg.verrechnungsjahr = Some(year);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = ConfigStore::load(temp_dir.path()).expect("load should succeed");
        let cfg = store.core_config();

        assert_eq!(cfg.data_dir(), temp_dir.path().join("Daten"));
        assert_eq!(cfg.archive_dir(), temp_dir.path().join("AlteDaten"));
        assert_eq!(cfg.template_dir(), temp_dir.path().join("Vorlagen"));
        assert_eq!(
            cfg.invoice_template_dir(),
            temp_dir.path().join("RechnungsVorlagen")
        );
        assert_eq!(cfg.invoice_counter(), 1);
        assert!((1..=12).contains(&cfg.billing_month()));
        assert_eq!(cfg.mail().smtp_host, "smtp.gmail.com");
    }

    #[test]
    fn test_malformed_config_falls_back_to_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join(CONFIG_FILENAME), "{ not json").expect("fixture write");

        let store = ConfigStore::load(temp_dir.path()).expect("malformed file is recovered");
        assert_eq!(store.config(), &AppConfig::default());
    }

    #[test]
    fn test_unknown_keys_survive_save() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(
            temp_dir.path().join(CONFIG_FILENAME),
            r#"{"datenDir": "/srv/daten", "windowBounds": {"w": 800}, "currentRechnungsnummer": 17}"#,
        )
        .expect("fixture write");

        let mut store = ConfigStore::load(temp_dir.path()).expect("load should succeed");
        assert_eq!(store.core_config().data_dir(), Path::new("/srv/daten"));
        assert_eq!(store.core_config().invoice_counter(), 17);

        store.set_invoice_counter(18).expect("valid counter");

        let raw = fs::read_to_string(temp_dir.path().join(CONFIG_FILENAME)).expect("read back");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(value["windowBounds"]["w"], 800);
        assert_eq!(value["currentRechnungsnummer"], 18);
        assert_eq!(value["datenDir"], "/srv/daten");
    }

    #[test]
    fn test_oauth_tokens_and_legacy_refresh_token() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(
            temp_dir.path().join(CONFIG_FILENAME),
            r#"{"googleClientId": "id", "googleOAuthTokens": {"access_token": "at"}, "googleRefreshToken": "rt"}"#,
        )
        .expect("fixture write");

        let store = ConfigStore::load(temp_dir.path()).expect("load should succeed");
        let cfg = store.core_config();
        assert_eq!(cfg.mail().access_token.as_deref(), Some("at"));
        assert_eq!(cfg.mail().refresh_token.as_deref(), Some("rt"));
        assert_eq!(cfg.mail().google_client_id.as_deref(), Some("id"));
    }

    #[test]
    fn test_set_access_token_keeps_refresh_token() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(
            temp_dir.path().join(CONFIG_FILENAME),
            r#"{"googleOAuthTokens": {"refresh_token": "rt", "scope": "mail"}}"#,
        )
        .expect("fixture write");

        let mut store = ConfigStore::load(temp_dir.path()).expect("load should succeed");
        store
            .set_access_token("neu".into(), Some(1_700_000_000_000))
            .expect("save should succeed");

        let reloaded = ConfigStore::load(temp_dir.path()).expect("reload should succeed");
        let mail = reloaded.core_config().mail().clone();
        assert_eq!(mail.access_token.as_deref(), Some("neu"));
        assert_eq!(mail.token_expiry, Some(1_700_000_000_000));
        assert_eq!(mail.refresh_token.as_deref(), Some("rt"));
        let tokens = reloaded.config().google_oauth_tokens.clone().expect("tokens");
        assert_eq!(tokens.extra.get("scope"), Some(&serde_json::json!("mail")));
    }

    #[test]
    fn test_set_billing_period_validates() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = ConfigStore::load(temp_dir.path()).expect("load should succeed");

        assert!(store.set_billing_period(13, 2024).is_err());
        assert!(store.set_billing_period(2, 1999).is_err());
        assert!(store.set_invoice_counter(0).is_err());

        store.set_billing_period(2, 2024).expect("valid period");
        let cfg = store.core_config();
        assert_eq!((cfg.billing_month(), cfg.billing_year()), (2, 2024));
    }

    #[test]
    fn test_relative_directory_is_resolved_against_config_dir() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = ConfigStore::load(temp_dir.path()).expect("load should succeed");
        store
            .set_directory(DirectoryKind::Archive, PathBuf::from("Archiv"))
            .expect("set directory");

        let reloaded = ConfigStore::load(temp_dir.path()).expect("reload");
        assert_eq!(
            reloaded.core_config().archive_file(EntityKind::Client),
            temp_dir.path().join("Archiv").join("ALTkundendaten.xlsx")
        );
    }

    #[test]
    fn test_resolve_config_dir_prefers_override() {
        let dir = resolve_config_dir(Some(PathBuf::from("/tmp/homecare-test")))
            .expect("override is accepted");
        assert_eq!(dir, PathBuf::from("/tmp/homecare-test"));
    }
}
