//! Outgoing mail with a delivery log.
//!
//! Mail goes out over SMTP. Gmail accounts authenticate with XOAUTH2; a missing or expired
//! access token is renewed from the refresh token before the first attempt. Other accounts
//! use `smtpUser`/`smtpPassword`. Sending never returns an
//! error to the caller: every problem ends up in the [`MailOutcome`] and in
//! `mail-log.json` next to the configuration.
//!
//! A send makes up to three attempts and sleeps `attempt × 500 ms` after each failed one.

use crate::config::{ConfigStore, CoreConfig, MailSettings};
use crate::constants::{
    MAIL_BACKOFF_STEP_MS, MAIL_LOG_DISPLAY_LIMIT, MAIL_LOG_FILENAME, MAIL_MAX_ATTEMPTS,
};
use crate::{CareError, CareResult};
use chrono::{SecondsFormat, Utc};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const IMPLICIT_TLS_PORT: u16 = 465;

// ============================================================================
// TYPES
// ============================================================================

/// A file to attach. Without a file name the path's base name is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAttachment {
    pub path: PathBuf,
    pub filename: Option<String>,
}

impl MailAttachment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            filename: None,
        }
    }

    fn display_name(&self) -> String {
        self.filename
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| {
                self.path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "Anhang".to_owned())
    }
}

/// One mail to send. Sender fields override the configured ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailRequest {
    /// One or more recipients, comma separated.
    pub to: String,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<MailAttachment>,
    pub from_name: Option<String>,
    pub from_address: Option<String>,
}

/// Result of a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MailOutcome {
    fn sent(id: Option<String>) -> Self {
        Self {
            ok: true,
            id,
            message: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id: None,
            message: Some(message.into()),
        }
    }
}

/// One line of the delivery log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailLogEntry {
    pub time: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl MailLogEntry {
    fn now(ok: bool) -> Self {
        Self {
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ok,
            to: None,
            subject: None,
            error: None,
            id: None,
            attempt: None,
        }
    }

    fn failure(request: &MailRequest, error: impl Into<String>) -> Self {
        Self {
            to: Some(request.to.clone()),
            subject: Some(request.subject.clone()),
            error: Some(error.into()),
            ..Self::now(false)
        }
    }
}

// ============================================================================
// OAUTH TOKENS
// ============================================================================

/// Google's OAuth2 token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Tokens this close to expiry are renewed before use.
const TOKEN_EXPIRY_MARGIN_MS: i64 = 60_000;

/// An access token issued for a refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    /// Milliseconds since the Unix epoch.
    pub expiry_date: Option<i64>,
}

impl AccessToken {
    fn is_usable(&self) -> bool {
        !token_expired(self.expiry_date)
    }
}

fn token_expired(expiry_date: Option<i64>) -> bool {
    expiry_date.is_some_and(|ms| ms <= Utc::now().timestamp_millis() + TOKEN_EXPIRY_MARGIN_MS)
}

/// Exchanges a refresh token for a new access token.
pub trait TokenSource {
    fn refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> CareResult<AccessToken>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Refreshes tokens at an OAuth2 token endpoint (Google by default).
pub struct GoogleTokenClient {
    client: reqwest::blocking::Client,
    token_url: String,
}

impl GoogleTokenClient {
    /// # Errors
    ///
    /// Returns `CareError::Mail` if the HTTP client cannot be set up.
    pub fn new() -> CareResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CareError::Mail(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            token_url: GOOGLE_TOKEN_URL.to_owned(),
        })
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }
}

impl TokenSource for GoogleTokenClient {
    fn refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> CareResult<AccessToken> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .map_err(|e| CareError::Mail(format!("Token-Erneuerung fehlgeschlagen: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(CareError::Mail(format!(
                "Token-Erneuerung abgelehnt ({status}): {body}"
            )));
        }
        let body: TokenResponse = response
            .json()
            .map_err(|e| CareError::Mail(format!("unlesbare Token-Antwort: {e}")))?;
        tracing::info!("renewed OAuth access token");
        Ok(AccessToken {
            token: body.access_token,
            expiry_date: body
                .expires_in
                .map(|secs| Utc::now().timestamp_millis() + secs * 1000),
        })
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// How the SMTP session authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpLogin {
    /// XOAUTH2 for the sending account.
    OAuth { user: String, access_token: String },
    Password { user: String, password: String },
}

/// Delivers a finished message.
pub trait MailTransport {
    fn send(&self, message: &Message, login: &SmtpLogin) -> CareResult<()>;
}

/// SMTP delivery to the configured host.
#[derive(Debug, Clone)]
pub struct SmtpMailer {
    host: String,
    port: u16,
}

impl SmtpMailer {
    pub fn new(settings: &MailSettings) -> Self {
        Self {
            host: settings.smtp_host.clone(),
            port: settings.smtp_port,
        }
    }

    fn transport(&self, login: &SmtpLogin) -> CareResult<SmtpTransport> {
        let builder = if self.port == IMPLICIT_TLS_PORT {
            SmtpTransport::relay(&self.host)
        } else {
            SmtpTransport::starttls_relay(&self.host)
        }
        .map_err(|e| CareError::Mail(format!("invalid SMTP host {}: {}", self.host, e)))?
        .port(self.port);

        let builder = match login {
            SmtpLogin::OAuth { user, access_token } => builder
                .credentials(Credentials::new(user.clone(), access_token.clone()))
                .authentication(vec![Mechanism::Xoauth2]),
            SmtpLogin::Password { user, password } => {
                builder.credentials(Credentials::new(user.clone(), password.clone()))
            }
        };
        Ok(builder.build())
    }
}

impl MailTransport for SmtpMailer {
    fn send(&self, message: &Message, login: &SmtpLogin) -> CareResult<()> {
        let response = self
            .transport(login)?
            .send(message)
            .map_err(|e| CareError::Mail(e.to_string()))?;
        tracing::debug!("SMTP server answered {}", response.code());
        Ok(())
    }
}

/// Whether `settings` hold a usable login: a complete Google OAuth2 client with refresh
/// token, or SMTP user and password.
pub fn credentials_complete(settings: &MailSettings) -> bool {
    oauth_client(settings).is_some()
        || (settings.smtp_user.is_some() && settings.smtp_password.is_some())
}

fn oauth_client(settings: &MailSettings) -> Option<(&str, &str, &str)> {
    Some((
        settings.google_client_id.as_deref()?,
        settings.google_client_secret.as_deref()?,
        settings.refresh_token.as_deref()?,
    ))
}

// ============================================================================
// SERVICE
// ============================================================================

/// Sends mail and keeps the delivery log.
pub struct MailService {
    cfg: Arc<CoreConfig>,
    transport: Box<dyn MailTransport>,
    tokens: Option<Box<dyn TokenSource>>,
    refreshed: Option<AccessToken>,
    backoff_step: Duration,
}

impl MailService {
    pub fn new(cfg: Arc<CoreConfig>, transport: Box<dyn MailTransport>) -> Self {
        Self {
            cfg,
            transport,
            tokens: None,
            refreshed: None,
            backoff_step: Duration::from_millis(MAIL_BACKOFF_STEP_MS),
        }
    }

    /// SMTP delivery with the account from `cfg`, renewing OAuth tokens at Google.
    ///
    /// # Errors
    ///
    /// Returns `CareError::Mail` if the HTTP client for token renewal cannot be set up.
    pub fn smtp(cfg: Arc<CoreConfig>) -> CareResult<Self> {
        let mailer = SmtpMailer::new(cfg.mail());
        let tokens = GoogleTokenClient::new()?;
        Ok(Self::new(cfg, Box::new(mailer)).with_token_source(Box::new(tokens)))
    }

    /// Renew missing or expired OAuth access tokens through `tokens`.
    pub fn with_token_source(mut self, tokens: Box<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Change the linear backoff step between attempts.
    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.cfg.config_dir().join(MAIL_LOG_FILENAME)
    }

    /// The access token renewed during this service's sends, if any.
    pub fn refreshed_token(&self) -> Option<&AccessToken> {
        self.refreshed.as_ref()
    }

    /// Write a renewed access token back to the configuration.
    ///
    /// # Returns
    ///
    /// `false` if no token was renewed.
    pub fn persist_refreshed_token(&self, store: &mut ConfigStore) -> CareResult<bool> {
        let Some(token) = &self.refreshed else {
            return Ok(false);
        };
        store.set_access_token(token.token.clone(), token.expiry_date)?;
        Ok(true)
    }

    /// Send `request`.
    ///
    /// Missing credentials, a failed token renewal, a missing sender or a message that
    /// cannot be built fail immediately; only delivery errors are retried. Attachments that
    /// do not exist or are not regular files are dropped and logged.
    pub fn send(&mut self, request: &MailRequest) -> MailOutcome {
        let settings = self.cfg.mail().clone();
        if !credentials_complete(&settings) {
            return self.fail(request, "Mail-Zugang nicht vollständig konfiguriert");
        }

        let from_address = request
            .from_address
            .clone()
            .filter(|a| !a.trim().is_empty())
            .or_else(|| settings.from_address.clone());
        let Some(from_address) = from_address else {
            return self.fail(request, "Absender-Adresse fehlt");
        };
        let from_name = request
            .from_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| settings.from_name.clone());

        let login = match self.login(&settings, &from_address) {
            Ok(login) => login,
            Err(e) => return self.fail(request, e.to_string()),
        };

        let attachments = self.usable_attachments(request);
        let message = match build_message(request, from_name, &from_address, &attachments) {
            Ok(message) => message,
            Err(e) => return self.fail(request, e.to_string()),
        };
        let id = message.headers().get_raw("Message-ID").map(str::to_owned);

        let mut last_error = String::new();
        for attempt in 1..=MAIL_MAX_ATTEMPTS {
            match self.transport.send(&message, &login) {
                Ok(()) => {
                    tracing::info!("mail to {} sent on attempt {}", request.to, attempt);
                    self.append_log(MailLogEntry {
                        to: Some(request.to.clone()),
                        subject: Some(request.subject.clone()),
                        id: id.clone(),
                        attempt: Some(attempt),
                        ..MailLogEntry::now(true)
                    });
                    return MailOutcome::sent(id);
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!("mail attempt {} to {} failed: {}", attempt, request.to, e);
                    self.append_log(MailLogEntry {
                        error: Some(last_error.clone()),
                        attempt: Some(attempt),
                        ..MailLogEntry::now(false)
                    });
                    if attempt < MAIL_MAX_ATTEMPTS {
                        std::thread::sleep(self.backoff_step * attempt);
                    }
                }
            }
        }
        MailOutcome::failed(last_error)
    }

    /// OAuth wins over password login. A stored access token is used while it is valid;
    /// otherwise the refresh token is exchanged once and the result kept for later sends.
    fn login(&mut self, settings: &MailSettings, from_address: &str) -> CareResult<SmtpLogin> {
        let Some((client_id, client_secret, refresh_token)) = oauth_client(settings) else {
            return match (&settings.smtp_user, &settings.smtp_password) {
                (Some(user), Some(password)) => Ok(SmtpLogin::Password {
                    user: user.clone(),
                    password: password.clone(),
                }),
                _ => Err(CareError::Mail(
                    "Mail-Zugang nicht vollständig konfiguriert".into(),
                )),
            };
        };
        let oauth = |access_token: String| SmtpLogin::OAuth {
            user: from_address.to_owned(),
            access_token,
        };

        if let Some(token) = self.refreshed.as_ref().filter(|t| t.is_usable()) {
            return Ok(oauth(token.token.clone()));
        }
        if let Some(token) = &settings.access_token {
            if !token_expired(settings.token_expiry) {
                return Ok(oauth(token.clone()));
            }
        }
        let Some(tokens) = &self.tokens else {
            return Err(CareError::Mail(
                "kein gültiges Access-Token und keine Token-Erneuerung eingerichtet".into(),
            ));
        };
        let fresh = tokens.refresh(client_id, client_secret, refresh_token)?;
        let login = oauth(fresh.token.clone());
        self.refreshed = Some(fresh);
        Ok(login)
    }

    fn fail(&self, request: &MailRequest, message: impl Into<String>) -> MailOutcome {
        let message = message.into();
        tracing::warn!("mail to {} not sent: {}", request.to, message);
        self.append_log(MailLogEntry::failure(request, message.clone()));
        MailOutcome::failed(message)
    }

    fn usable_attachments(&self, request: &MailRequest) -> Vec<MailAttachment> {
        request
            .attachments
            .iter()
            .filter(|att| {
                let problem = match fs::metadata(&att.path) {
                    Ok(meta) if meta.is_file() => return true,
                    Ok(_) => format!("Anhang ist keine Datei: {}", att.path.display()),
                    Err(_) => format!("Anhang-Datei nicht gefunden: {}", att.path.display()),
                };
                tracing::warn!("{}", problem);
                self.append_log(MailLogEntry::failure(request, problem));
                false
            })
            .cloned()
            .collect()
    }

    fn append_log(&self, entry: MailLogEntry) {
        if let Err(e) = append_log_entry(&self.log_path(), entry) {
            tracing::warn!("could not write mail log: {}", e);
        }
    }

    /// The newest `limit` log entries, oldest first.
    pub fn recent_log(&self, limit: usize) -> Vec<MailLogEntry> {
        let mut entries = read_log(&self.log_path());
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
        entries
    }

    /// The entries shown to the operator.
    pub fn display_log(&self) -> Vec<MailLogEntry> {
        self.recent_log(MAIL_LOG_DISPLAY_LIMIT)
    }
}

fn content_type_for(path: &Path) -> CareResult<ContentType> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    };
    ContentType::parse(mime).map_err(|e| CareError::Mail(e.to_string()))
}

fn parse_mailbox(input: &str) -> CareResult<Mailbox> {
    input
        .trim()
        .parse()
        .map_err(|e| CareError::Mail(format!("invalid address {}: {}", input.trim(), e)))
}

fn build_message(
    request: &MailRequest,
    from_name: Option<String>,
    from_address: &str,
    attachments: &[MailAttachment],
) -> CareResult<Message> {
    let from = Mailbox::new(from_name, parse_mailbox(from_address)?.email);
    let mut builder = Message::builder()
        .message_id(None)
        .from(from)
        .subject(request.subject.clone());
    let mut recipients = 0;
    for to in request.to.split(',').filter(|t| !t.trim().is_empty()) {
        builder = builder.to(parse_mailbox(to)?);
        recipients += 1;
    }
    if recipients == 0 {
        return Err(CareError::Mail("no recipient".into()));
    }

    let text = request.text.clone().filter(|t| !t.is_empty());
    let html = request.html.clone().filter(|h| !h.is_empty());
    let body = match (text, html) {
        (Some(text), Some(html)) => MultiPart::alternative_plain_html(text, html),
        (None, Some(html)) => MultiPart::mixed().singlepart(SinglePart::html(html)),
        (text, None) => {
            MultiPart::mixed().singlepart(SinglePart::plain(text.unwrap_or_default()))
        }
    };

    let mut content = MultiPart::mixed().multipart(body);
    for att in attachments {
        let bytes = fs::read(&att.path).map_err(CareError::FileRead)?;
        let part = Attachment::new(att.display_name()).body(bytes, content_type_for(&att.path)?);
        content = content.singlepart(part);
    }
    builder
        .multipart(content)
        .map_err(|e| CareError::Mail(e.to_string()))
}

// ============================================================================
// LOG FILE
// ============================================================================

fn read_log(path: &Path) -> Vec<MailLogEntry> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str(&contents) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("ignoring malformed mail log {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

fn append_log_entry(path: &Path, entry: MailLogEntry) -> CareResult<()> {
    let mut entries = read_log(path);
    entries.push(entry);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| CareError::DirCreation {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_string_pretty(&entries).map_err(CareError::MailLogSerialization)?;
    fs::write(path, json).map_err(CareError::FileWrite)
}
