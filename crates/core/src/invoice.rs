//! Invoice calculation and generation.
//!
//! An invoice is a rendered template whose data context is the client record plus a set of
//! billing fields: the invoice number, billing month and year, the billed period, the number
//! of days and the amounts. The client's `Money` field holds the rate per day; the gross total
//! is split into net amount and 20 % VAT.
//!
//! Every generated document consumes one invoice number. The counter lives in the
//! configuration and is written back once after the batch.

use crate::config::ConfigStore;
use crate::constants::{VAT_GROSS_DIVISOR, VAT_RATE};
use crate::dates::{normalize_date_fields, to_display_date};
use crate::documents::is_template_file;
use crate::key::{find_index, EntityKind, RecordKey, CLIENT_SURNAME_FIELD};
use crate::record::{FieldValue, Record};
use crate::store::read_records;
use crate::template::{render, resolve_filename, DataContext};
use crate::validation::{validate_billing_month, validate_billing_year};
use crate::{CareError, CareResult};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Field holding the rate per day.
pub const RATE_FIELD: &str = "Money";

const MONTH_NAMES: [&str; 12] = [
    "Januar",
    "Februar",
    "März",
    "April",
    "Mai",
    "Juni",
    "Juli",
    "August",
    "September",
    "Oktober",
    "November",
    "Dezember",
];

// ============================================================================
// CALENDAR
// ============================================================================

/// German name of `month` (1–12). Out-of-range months yield an empty string.
pub fn german_month_name(month: u32) -> &'static str {
    month
        .checked_sub(1)
        .and_then(|i| MONTH_NAMES.get(i as usize))
        .copied()
        .unwrap_or("")
}

fn first_of_month(month: u32, year: i32) -> CareResult<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| CareError::InvalidDate(format!("{month:02}.{year}")))
}

fn last_of_month(month: u32, year: i32) -> CareResult<NaiveDate> {
    let first = first_of_month(month, year)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.and_then(|d| d.pred_opt())
        .ok_or_else(|| CareError::InvalidDate(first.to_string()))
}

/// Number of calendar days in `month` of `year`.
///
/// # Errors
///
/// Returns `CareError::InvalidDate` for a month outside 1–12.
pub fn days_in_month(month: u32, year: i32) -> CareResult<u32> {
    Ok(last_of_month(month, year)?.day())
}

/// The last Monday–Friday on or before the end of the month.
///
/// # Errors
///
/// Returns `CareError::InvalidDate` for a month outside 1–12.
pub fn period_end_workday(month: u32, year: i32) -> CareResult<NaiveDate> {
    let mut day = last_of_month(month, year)?;
    while matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
        day -= Duration::days(1);
    }
    Ok(day)
}

// ============================================================================
// BILLING PERIOD
// ============================================================================

/// The span an invoice covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingPeriod {
    /// A whole calendar month.
    Month { month: u32, year: i32 },
    /// An explicit range, both ends inclusive.
    Range { von: NaiveDate, bis: NaiveDate },
}

impl BillingPeriod {
    /// A whole-month period.
    ///
    /// # Errors
    ///
    /// Returns `CareError::InvalidInput` if the month is outside 1–12 or the year outside
    /// 2000–2100.
    pub fn month(month: u32, year: i32) -> CareResult<Self> {
        validate_billing_month(month)?;
        validate_billing_year(year)?;
        Ok(Self::Month { month, year })
    }

    /// An explicit period.
    ///
    /// # Errors
    ///
    /// Returns `CareError::InvalidInput` if `bis` lies before `von`.
    pub fn range(von: NaiveDate, bis: NaiveDate) -> CareResult<Self> {
        if bis < von {
            return Err(CareError::InvalidInput(format!(
                "period end {} is before its start {}",
                to_display_date(bis),
                to_display_date(von)
            )));
        }
        Ok(Self::Range { von, bis })
    }

    /// First and last day of the period.
    pub fn bounds(&self) -> CareResult<(NaiveDate, NaiveDate)> {
        match *self {
            BillingPeriod::Month { month, year } => {
                Ok((first_of_month(month, year)?, last_of_month(month, year)?))
            }
            BillingPeriod::Range { von, bis } => Ok((von, bis)),
        }
    }

    /// Billed days, counting both ends.
    pub fn days(&self) -> CareResult<i64> {
        let (von, bis) = self.bounds()?;
        Ok((bis - von).num_days() + 1)
    }

    /// `DD.MM.YYYY-DD.MM.YYYY`.
    pub fn label(&self) -> CareResult<String> {
        let (von, bis) = self.bounds()?;
        Ok(format!("{}-{}", to_display_date(von), to_display_date(bis)))
    }
}

// ============================================================================
// AMOUNTS
// ============================================================================

/// Reads the leading decimal number of `text`, ignoring leading whitespace.
///
/// `"50 EUR"` gives 50, `"50,5"` gives 50 and text without a leading number gives `None`.
fn leading_number(text: &str) -> Option<f64> {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let int_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    let mut digits = end - int_start;
    if bytes.get(end) == Some(&b'.') {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while bytes.get(frac_end).is_some_and(u8::is_ascii_digit) {
            frac_end += 1;
        }
        if frac_end > frac_start || digits > 0 {
            digits += frac_end - frac_start;
            end = frac_end;
        }
    }
    if digits == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while bytes.get(exp_end).is_some_and(u8::is_ascii_digit) {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }
    text[..end].parse().ok()
}

/// The client's rate per day. Missing or unparsable values count as 0.
pub fn parse_rate(client: &Record) -> f64 {
    let rate = match client.get(RATE_FIELD) {
        Some(FieldValue::Number(n)) => Some(*n),
        Some(FieldValue::Text(s)) => leading_number(s),
        None => None,
    };
    rate.filter(|r| r.is_finite()).unwrap_or(0.0)
}

/// Gross total with its net and tax parts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvoiceAmounts {
    pub total: f64,
    pub vorsteuer: f64,
    pub steuer: f64,
}

impl InvoiceAmounts {
    pub fn calculate(rate: f64, days: i64) -> Self {
        let total = rate * days as f64;
        let vorsteuer = total / VAT_GROSS_DIVISOR;
        Self {
            total,
            vorsteuer,
            steuer: vorsteuer * VAT_RATE,
        }
    }
}

fn money(amount: f64) -> String {
    format!("{amount:.2}")
}

/// Billing fields of one invoice document.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceFields {
    pub number: u64,
    pub billing_month: u32,
    pub billing_year: i32,
    pub period: BillingPeriod,
    pub amounts: InvoiceAmounts,
}

impl InvoiceFields {
    /// Computes the fields for `client` over `period`.
    pub fn for_client(
        client: &Record,
        number: u64,
        billing_month: u32,
        billing_year: i32,
        period: BillingPeriod,
    ) -> CareResult<Self> {
        let amounts = InvoiceAmounts::calculate(parse_rate(client), period.days()?);
        Ok(Self {
            number,
            billing_month,
            billing_year,
            period,
            amounts,
        })
    }

    /// Adds the billing fields to `ctx`, replacing client fields of the same name.
    pub fn apply(&self, ctx: &mut DataContext) -> CareResult<()> {
        ctx.insert("Rechnungsnummer", self.number.to_string());
        ctx.insert("Verrechnungsmonat", german_month_name(self.billing_month));
        ctx.insert("Verrechnungsjahr", self.billing_year.to_string());
        ctx.insert("Verrechnungszeitraum", self.period.label()?);
        ctx.insert("Monatstage", self.period.days()?.to_string());
        ctx.insert("Gesamtsumme", money(self.amounts.total));
        ctx.insert("Vorsteuer", money(self.amounts.vorsteuer));
        ctx.insert("Steuer", money(self.amounts.steuer));
        ctx.insert(
            "Monatende",
            to_display_date(period_end_workday(self.billing_month, self.billing_year)?),
        );
        Ok(())
    }
}

// ============================================================================
// INVOICE TEMPLATES
// ============================================================================

/// A `.docx` file in the invoice template directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceTemplate {
    pub file_name: String,
    pub display_name: String,
    pub path: PathBuf,
}

fn display_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"(?i)Wimmer", "Rechnung Wimmer"),
            (r"(?i)\[\[kfname\]\] - \[\[afname\]\]", "Rechnung Personenvertretung"),
            (r"(?i)Vermittlungsprovision", "Rechnung Vermittlungsprovision"),
            (r"(?i)\[\[kfname\]\]", "Rechnung Kunde"),
        ]
        .into_iter()
        .filter_map(|(pattern, name)| Regex::new(pattern).ok().map(|re| (re, name)))
        .collect()
    })
}

/// Display name of an invoice template. The first matching rule wins; files matching no
/// rule are shown under their own name.
pub fn invoice_display_name(file_name: &str) -> String {
    display_rules()
        .iter()
        .find(|(re, _)| re.is_match(file_name))
        .map(|(_, name)| (*name).to_owned())
        .unwrap_or_else(|| file_name.to_owned())
}

/// `.docx` files directly in `dir`, sorted by file name. Sub-folders are not searched.
///
/// A missing directory yields an empty list.
pub fn list_invoice_templates(dir: &Path) -> CareResult<Vec<InvoiceTemplate>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut templates = Vec::new();
    for entry in fs::read_dir(dir).map_err(CareError::FileRead)? {
        let entry = entry.map_err(CareError::FileRead)?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !is_template_file(&file_name) {
            continue;
        }
        if !entry.file_type().map_err(CareError::FileRead)?.is_file() {
            continue;
        }
        templates.push(InvoiceTemplate {
            display_name: invoice_display_name(&file_name),
            path: entry.path(),
            file_name,
        });
    }
    templates.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(templates)
}

// ============================================================================
// GENERATION
// ============================================================================

/// A client to invoice. Without a period the whole billing month is billed.
#[derive(Debug, Clone)]
pub struct InvoiceSelection {
    pub client: RecordKey,
    pub period: Option<BillingPeriod>,
}

/// What to invoice.
#[derive(Debug, Clone)]
pub struct InvoiceRequest {
    pub clients: Vec<InvoiceSelection>,
    /// File names inside the invoice template directory.
    pub templates: Vec<String>,
    pub target_dir: PathBuf,
    /// Overrides the configured billing month.
    pub month: Option<u32>,
    /// Overrides the configured billing year.
    pub year: Option<i32>,
}

/// Outcome of an invoice batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvoiceReport {
    pub written: Vec<PathBuf>,
    pub warnings: Vec<String>,
    /// `"<client> - <template>: <reason>"` for every document that was not written.
    pub failures: Vec<String>,
    /// The invoice number the next document will get.
    pub next_number: u64,
}

fn client_surname(client: &Record) -> String {
    client.get_str(CLIENT_SURNAME_FIELD).to_lowercase()
}

fn client_label(client: &Record) -> String {
    let (surname, first) = EntityKind::Client.key_fields();
    format!("{} {}", client.get_str(first), client.get_str(surname))
        .trim()
        .to_owned()
}

/// Renders every selected invoice template for every selected client.
///
/// Clients are processed in surname order. Each written document takes the next invoice
/// number; the counter is saved to `store` after the batch.
///
/// # Errors
///
/// Returns `CareError::InvalidInput` if no client or no template was selected or the billing
/// month or year is invalid; `CareError::DirCreation` if the target directory cannot be
/// created. Unknown clients and failing templates are reported in the [`InvoiceReport`].
pub fn generate_invoices(
    store: &mut ConfigStore,
    request: &InvoiceRequest,
) -> CareResult<InvoiceReport> {
    if request.clients.is_empty() {
        return Err(CareError::InvalidInput("select at least one client".into()));
    }
    if request.templates.is_empty() {
        return Err(CareError::InvalidInput(
            "select at least one invoice template".into(),
        ));
    }

    let cfg = store.core_config();
    let month = request.month.unwrap_or_else(|| cfg.billing_month());
    let year = request.year.unwrap_or_else(|| cfg.billing_year());
    let month_period = BillingPeriod::month(month, year)?;

    fs::create_dir_all(&request.target_dir).map_err(|source| CareError::DirCreation {
        path: request.target_dir.clone(),
        source,
    })?;

    let records = read_records(&cfg.active_file(EntityKind::Client))?;
    let mut report = InvoiceReport::default();
    let mut selected = Vec::new();
    for selection in &request.clients {
        match find_index(&records, EntityKind::Client, &selection.client) {
            Some(idx) => {
                let mut client = records[idx].clone();
                normalize_date_fields(&mut client, EntityKind::Client);
                selected.push((client, selection.period.unwrap_or(month_period)));
            }
            None => report
                .failures
                .push(format!("{}: Kunde nicht gefunden", selection.client)),
        }
    }
    selected.sort_by_key(|(client, _)| client_surname(client));

    let mut number = cfg.invoice_counter();
    for (client, period) in &selected {
        for template in &request.templates {
            let fields = InvoiceFields::for_client(client, number, month, year, *period)?;
            let written = write_invoice(
                cfg.invoice_template_dir(),
                template,
                client,
                &fields,
                &request.target_dir,
                &mut report,
            );
            match written {
                Ok(path) => {
                    report.written.push(path);
                    number += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "invoice {} for {} failed: {}",
                        template,
                        client_label(client),
                        e
                    );
                    report
                        .failures
                        .push(format!("{} - {}: {}", client_label(client), template, e));
                }
            }
        }
    }

    report.next_number = number;
    if number != cfg.invoice_counter() {
        store.set_invoice_counter(number)?;
    }
    tracing::info!(
        "generated {} invoices in {} ({} failed), next number {}",
        report.written.len(),
        request.target_dir.display(),
        report.failures.len(),
        number
    );
    Ok(report)
}

fn write_invoice(
    template_dir: &Path,
    template: &str,
    client: &Record,
    fields: &InvoiceFields,
    target_dir: &Path,
    report: &mut InvoiceReport,
) -> CareResult<PathBuf> {
    let file_name = Path::new(template)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| CareError::InvalidInput(format!("invalid template name: {template}")))?;
    if file_name != template {
        return Err(CareError::InvalidInput(format!(
            "invoice templates must be plain file names: {template}"
        )));
    }

    let mut ctx = DataContext::from_record(client);
    fields.apply(&mut ctx)?;

    let bytes = fs::read(template_dir.join(&file_name)).map_err(CareError::FileRead)?;
    let rendered = render(&bytes, &ctx)?;
    for name in &rendered.missing {
        report.warnings.push(format!(
            "{} - {}: Platzhalter [[{}]] ohne Wert",
            client_label(client),
            template,
            name
        ));
    }

    let (output_name, missing) = resolve_filename(&file_name, &ctx);
    for name in missing {
        report.warnings.push(format!(
            "{} - {}: Platzhalter [[{}]] im Dateinamen konnte nicht ersetzt werden",
            client_label(client),
            template,
            name
        ));
    }
    let path = target_dir.join(output_name);
    fs::write(&path, &rendered.bytes).map_err(CareError::FileWrite)?;
    Ok(path)
}
