mod prompt;

use anyhow::{anyhow, bail, Context};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use homecare_core::config::{resolve_config_dir, DirectoryKind, CONFIG_DIR_ENV};
use homecare_core::convert::OfficeConverter;
use homecare_core::dates::{parse_display_date, parse_flexible_date};
use homecare_core::documents::{
    create_group, delete_group, list_groups, rename_group, set_group_order, set_group_templates,
    template_files, template_tree, DocumentService, GenerationRequest, TemplateNode,
};
use homecare_core::fields::{
    filter_records, sort_records, split_phone, split_sv_number, sv_number_from_birth_date,
    SortOrder,
};
use homecare_core::invoice::{
    generate_invoices, list_invoice_templates, BillingPeriod, InvoiceRequest, InvoiceSelection,
};
use homecare_core::mail::{MailAttachment, MailRequest, MailService};
use homecare_core::repositories::reassignment::ReassignOutcome;
use homecare_core::repositories::records::{RecordKind, RestoreOutcome};
use homecare_core::{
    Caretakers, Clients, ConfigStore, Record, RecordKey, RecordService, ReassignmentService,
};
use homecare_types::NonEmptyText;
use prompt::TerminalPrompt;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "homecare")]
#[command(about = "Home-care client and caretaker records")]
struct Cli {
    /// Configuration directory (default: HOMECARE_CONFIG_DIR or the per-user config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Answer every confirmation with yes
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage clients (Kunden)
    #[command(subcommand)]
    Client(RecordCommand),
    /// Manage caretakers (Betreuer)
    #[command(subcommand)]
    Caretaker(RecordCommand),
    /// Hand a client's caretaker slot to another caretaker (Betreuerwechsel)
    Reassign {
        /// Client key (surname__first name)
        #[arg(long)]
        client: String,
        /// Active caretaker slot (1 or 2)
        #[arg(long)]
        slot: u8,
        /// Caretaker key (first name__surname)
        #[arg(long)]
        caretaker: String,
        /// Start date of the new caretaker (DD.MM.YYYY or YYYY-MM-DD)
        #[arg(long)]
        start: String,
    },
    /// Document templates and template groups
    #[command(subcommand)]
    Templates(TemplateCommand),
    /// Generate documents from templates
    Generate(GenerateArgs),
    /// Invoices
    #[command(subcommand)]
    Invoice(InvoiceCommand),
    /// Show or change the configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Send mail and read the delivery log
    #[command(subcommand)]
    Mail(MailCommand),
    /// Field helpers
    #[command(subcommand)]
    Field(FieldCommand),
}

#[derive(Subcommand)]
enum RecordCommand {
    /// List records
    List {
        /// List the archive instead of the active records
        #[arg(long)]
        archived: bool,
        /// Only records with a value containing this text
        #[arg(long)]
        search: Option<String>,
        /// Sort by this field
        #[arg(long)]
        sort: Option<String>,
        /// Sort descending
        #[arg(long)]
        desc: bool,
    },
    /// Show every field of an active record
    Show { key: String },
    /// Add a record from FIELD=VALUE pairs
    Add {
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Change fields of an active record
    Update {
        key: String,
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Move an active record to the archive
    Delete { key: String },
    /// Move an archived record back
    Restore { key: String },
    /// Remove an archived record for good
    Purge { key: String },
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// Show the template tree
    Tree,
    /// List template groups
    Groups,
    /// Create an empty template group
    CreateGroup { name: String },
    /// Delete a template group
    DeleteGroup { name: String },
    /// Rename a template group
    RenameGroup { old: String, new: String },
    /// Replace the templates of a group
    SetGroup {
        name: String,
        /// Template paths relative to the template directory
        templates: Vec<String>,
    },
    /// Set the display order of the groups
    OrderGroups { names: Vec<String> },
}

#[derive(Args)]
struct GenerateArgs {
    /// Client key
    #[arg(long)]
    client: Option<String>,
    /// Caretaker key
    #[arg(long)]
    caretaker: Option<String>,
    /// Template path relative to the template directory (repeatable)
    #[arg(long = "template")]
    templates: Vec<String>,
    /// Use the templates of this group
    #[arg(long)]
    group: Option<String>,
    /// Directory in which the output folder is created
    #[arg(long)]
    target: PathBuf,
    /// Name of the output folder
    #[arg(long)]
    folder: String,
    /// Convert the documents to PDF
    #[arg(long)]
    pdf: bool,
}

#[derive(Subcommand)]
enum InvoiceCommand {
    /// List invoice templates
    Templates,
    /// Generate invoices
    Generate {
        /// Client key, optionally with its own period: KEY=DD.MM.YYYY-DD.MM.YYYY (repeatable)
        #[arg(long = "client", value_parser = parse_invoice_client)]
        clients: Vec<InvoiceSelection>,
        /// Invoice template file name (repeatable)
        #[arg(long = "template")]
        templates: Vec<String>,
        /// Output directory
        #[arg(long)]
        target: PathBuf,
        /// Billing month (default: configured month)
        #[arg(long)]
        month: Option<u32>,
        /// Billing year (default: configured year)
        #[arg(long)]
        year: Option<i32>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DirArg {
    Data,
    Archive,
    Templates,
    InvoiceTemplates,
}

impl From<DirArg> for DirectoryKind {
    fn from(arg: DirArg) -> Self {
        match arg {
            DirArg::Data => DirectoryKind::Data,
            DirArg::Archive => DirectoryKind::Archive,
            DirArg::Templates => DirectoryKind::Templates,
            DirArg::InvoiceTemplates => DirectoryKind::InvoiceTemplates,
        }
    }
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Show the resolved configuration
    Show,
    /// Point a directory somewhere else
    SetDir { kind: DirArg, path: PathBuf },
    /// Set the next invoice number
    SetCounter { number: u64 },
    /// Set the default billing month and year
    SetPeriod { month: u32, year: i32 },
    /// Set mail account fields
    SetMail {
        #[arg(long)]
        from_name: Option<String>,
        #[arg(long)]
        from_address: Option<String>,
        #[arg(long)]
        smtp_host: Option<String>,
        #[arg(long)]
        smtp_port: Option<u16>,
        #[arg(long)]
        smtp_user: Option<String>,
        #[arg(long)]
        smtp_password: Option<String>,
    },
}

#[derive(Subcommand)]
enum MailCommand {
    /// Send a mail
    Send {
        /// Recipients, comma separated
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        html: Option<String>,
        /// File to attach (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
    /// Show the newest delivery log entries
    Log {
        #[arg(long, default_value_t = 200)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum FieldCommand {
    /// Build a social-insurance number
    Sv {
        /// First four digits
        serial: String,
        /// Birth part DDMMYY, overrides the birth date
        #[arg(long)]
        birth_part: Option<String>,
        /// Birth date (DD.MM.YYYY or YYYY-MM-DD)
        #[arg(long)]
        birth_date: Option<String>,
    },
    /// Split a stored social-insurance number
    SplitSv { value: String },
    /// Split a stored phone number into prefix and number
    SplitPhone { value: String },
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=VALUE, got '{raw}'"))?;
    if field.trim().is_empty() {
        return Err("field name cannot be empty".into());
    }
    Ok((field.trim().to_owned(), value.trim().to_owned()))
}

fn parse_invoice_client(raw: &str) -> Result<InvoiceSelection, String> {
    let Some((key, range)) = raw.split_once('=') else {
        return Ok(InvoiceSelection {
            client: RecordKey::parse(raw),
            period: None,
        });
    };
    let (von, bis) = range
        .rsplit_once('-')
        .ok_or_else(|| format!("expected DD.MM.YYYY-DD.MM.YYYY, got '{range}'"))?;
    let von = parse_display_date(von.trim()).map_err(|e| e.to_string())?;
    let bis = parse_display_date(bis.trim()).map_err(|e| e.to_string())?;
    let period = BillingPeriod::range(von, bis).map_err(|e| e.to_string())?;
    Ok(InvoiceSelection {
        client: RecordKey::parse(key),
        period: Some(period),
    })
}

fn record_from_fields(fields: Vec<(String, String)>) -> Record {
    Record::from_pairs(fields)
}

fn record_label(record: &Record, kind_fields: (&str, &str)) -> String {
    format!(
        "{} {}",
        record.get_str(kind_fields.0),
        record.get_str(kind_fields.1)
    )
    .trim()
    .to_owned()
}

fn run_records<K: RecordKind>(
    service: RecordService<K>,
    command: RecordCommand,
    prompt: &mut TerminalPrompt,
) -> anyhow::Result<()> {
    let kind = service.kind();
    match command {
        RecordCommand::List {
            archived,
            search,
            sort,
            desc,
        } => {
            let mut records = if archived {
                service.list_archived()?
            } else {
                service.list_active()?
            };
            if let Some(field) = sort {
                let order = if desc {
                    SortOrder::Descending
                } else {
                    SortOrder::Ascending
                };
                sort_records(&mut records, &field, order);
            }
            let hits = filter_records(&records, search.as_deref().unwrap_or(""));
            if hits.is_empty() {
                println!("No {} records found.", kind);
            }
            for record in hits {
                println!(
                    "{:<40} {}",
                    RecordKey::derive(record, kind).to_string(),
                    record_label(record, (kind.first_name_field(), kind.surname_field()))
                );
            }
        }
        RecordCommand::Show { key } => {
            let key = RecordKey::parse(&key);
            let record = service
                .find_active(&key)?
                .ok_or_else(|| anyhow!("no active {} with key {}", kind, key))?;
            for (field, value) in record.iter().filter(|(_, v)| !v.is_empty()) {
                println!("{field}: {value}");
            }
        }
        RecordCommand::Add { fields } => {
            let key = service.add(record_from_fields(fields))?;
            println!("Added {} {}", kind, key);
        }
        RecordCommand::Update { key, fields } => {
            let key = RecordKey::parse(&key);
            if service.update(&key, &record_from_fields(fields))? {
                println!("Updated {} {}", kind, key);
            } else {
                bail!("no active {} with key {}", kind, key);
            }
        }
        RecordCommand::Delete { key } => {
            let key = RecordKey::parse(&key);
            if service.delete(&key)? {
                println!("Archived {} {}", kind, key);
            } else {
                bail!("no active {} with key {}", kind, key);
            }
        }
        RecordCommand::Restore { key } => {
            let key = RecordKey::parse(&key);
            match service.restore(&key, prompt)? {
                RestoreOutcome::Restored => println!("Restored {} {}", kind, key),
                RestoreOutcome::Declined => println!("Restore of {} {} cancelled", kind, key),
                RestoreOutcome::NotFound => bail!("no archived {} with key {}", kind, key),
            }
        }
        RecordCommand::Purge { key } => {
            let key = RecordKey::parse(&key);
            if service.purge(&key)? {
                println!("Removed archived {} {}", kind, key);
            } else {
                bail!("no archived {} with key {}", kind, key);
            }
        }
    }
    Ok(())
}

fn print_tree(nodes: &[TemplateNode], depth: usize) {
    for node in nodes {
        match node {
            TemplateNode::Folder { name, children, .. } => {
                println!("{}{}/", "  ".repeat(depth), name);
                print_tree(children, depth + 1);
            }
            TemplateNode::File { name, .. } => println!("{}{}", "  ".repeat(depth), name),
        }
    }
}

fn run_templates(store: &mut ConfigStore, command: TemplateCommand) -> anyhow::Result<()> {
    let cfg = store.core_config();
    match command {
        TemplateCommand::Tree => {
            let tree = template_tree(cfg.template_dir())?;
            if tree.is_empty() {
                println!("No templates in {}", cfg.template_dir().display());
            }
            print_tree(&tree, 0);
        }
        TemplateCommand::Groups => {
            let tree = template_tree(cfg.template_dir())?;
            for group in list_groups(store, &template_files(&tree)) {
                println!("{} ({} templates)", group.name, group.templates.len());
                for template in group.templates {
                    println!("  {template}");
                }
            }
        }
        TemplateCommand::CreateGroup { name } => {
            create_group(store, &NonEmptyText::new(&name)?)?;
            println!("Created group {}", name.trim());
        }
        TemplateCommand::DeleteGroup { name } => {
            if !delete_group(store, &name)? {
                bail!("no template group named {name}");
            }
            println!("Deleted group {name}");
        }
        TemplateCommand::RenameGroup { old, new } => {
            if !rename_group(store, &old, &NonEmptyText::new(&new)?)? {
                bail!("no template group named {old}");
            }
            println!("Renamed group {} to {}", old, new.trim());
        }
        TemplateCommand::SetGroup { name, templates } => {
            set_group_templates(store, &name, templates)?;
            println!("Updated group {name}");
        }
        TemplateCommand::OrderGroups { names } => {
            set_group_order(store, names)?;
            println!("Updated group order");
        }
    }
    Ok(())
}

fn run_generate(store: &ConfigStore, args: GenerateArgs) -> anyhow::Result<()> {
    let mut templates = args.templates;
    if let Some(group) = &args.group {
        let tree = template_tree(store.core_config().template_dir())?;
        let group = list_groups(store, &template_files(&tree))
            .into_iter()
            .find(|g| &g.name == group)
            .ok_or_else(|| anyhow!("no template group named {group}"))?;
        templates.extend(group.templates);
    }

    let service = DocumentService::new(store.core_config(), Box::new(OfficeConverter::default()));
    let report = service.generate(&GenerationRequest {
        client: args.client.as_deref().map(RecordKey::parse),
        caretaker: args.caretaker.as_deref().map(RecordKey::parse),
        templates,
        target_dir: args.target,
        folder_name: args.folder,
        pdf: args.pdf,
    })?;

    for path in &report.written {
        println!("Wrote {}", path.display());
    }
    for warning in &report.warnings {
        println!("Warning: {warning}");
    }
    for (template, reason) in &report.failures {
        eprintln!("Failed {template}: {reason}");
    }
    Ok(())
}

fn run_invoice(store: &mut ConfigStore, command: InvoiceCommand) -> anyhow::Result<()> {
    match command {
        InvoiceCommand::Templates => {
            let cfg = store.core_config();
            let templates = list_invoice_templates(cfg.invoice_template_dir())?;
            if templates.is_empty() {
                println!("No invoice templates found.");
            }
            for template in templates {
                println!("{:<32} {}", template.display_name, template.file_name);
            }
        }
        InvoiceCommand::Generate {
            clients,
            templates,
            target,
            month,
            year,
        } => {
            let report = generate_invoices(
                store,
                &InvoiceRequest {
                    clients,
                    templates,
                    target_dir: target,
                    month,
                    year,
                },
            )?;
            for path in &report.written {
                println!("Wrote {}", path.display());
            }
            for warning in &report.warnings {
                println!("Warning: {warning}");
            }
            for failure in &report.failures {
                eprintln!("Failed {failure}");
            }
            println!("Next invoice number: {}", report.next_number);
        }
    }
    Ok(())
}

fn run_config(store: &mut ConfigStore, command: ConfigCommand) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Show => {
            let cfg = store.core_config();
            println!("Config file:        {}", store.path().display());
            println!("Data:               {}", cfg.data_dir().display());
            println!("Archive:            {}", cfg.archive_dir().display());
            println!("Templates:          {}", cfg.template_dir().display());
            println!("Invoice templates:  {}", cfg.invoice_template_dir().display());
            println!("Next invoice:       {}", cfg.invoice_counter());
            println!(
                "Billing period:     {:02}.{}",
                cfg.billing_month(),
                cfg.billing_year()
            );
            let mail = cfg.mail();
            println!(
                "Mail sender:        {}",
                mail.from_address.as_deref().unwrap_or("-")
            );
            println!("SMTP:               {}:{}", mail.smtp_host, mail.smtp_port);
        }
        ConfigCommand::SetDir { kind, path } => {
            store.set_directory(kind.into(), path)?;
            println!("Saved {}", store.path().display());
        }
        ConfigCommand::SetCounter { number } => {
            store.set_invoice_counter(number)?;
            println!("Next invoice number: {number}");
        }
        ConfigCommand::SetPeriod { month, year } => {
            store.set_billing_period(month, year)?;
            println!("Billing period: {month:02}.{year}");
        }
        ConfigCommand::SetMail {
            from_name,
            from_address,
            smtp_host,
            smtp_port,
            smtp_user,
            smtp_password,
        } => {
            if let Some(address) = &from_address {
                homecare_types::EmailAddress::parse(address)?;
            }
            store.update(|cfg| {
                cfg.from_name = from_name.or(cfg.from_name.take());
                cfg.from_address = from_address.or(cfg.from_address.take());
                cfg.smtp_host = smtp_host.or(cfg.smtp_host.take());
                cfg.smtp_port = smtp_port.or(cfg.smtp_port.take());
                cfg.smtp_user = smtp_user.or(cfg.smtp_user.take());
                cfg.smtp_password = smtp_password.or(cfg.smtp_password.take());
            })?;
            println!("Saved {}", store.path().display());
        }
    }
    Ok(())
}

fn run_mail(store: &mut ConfigStore, command: MailCommand) -> anyhow::Result<()> {
    let mut service = MailService::smtp(store.core_config())?;
    match command {
        MailCommand::Send {
            to,
            subject,
            text,
            html,
            attachments,
        } => {
            let outcome = service.send(&MailRequest {
                to,
                subject,
                text,
                html,
                attachments: attachments.into_iter().map(MailAttachment::new).collect(),
                ..MailRequest::default()
            });
            if service.persist_refreshed_token(store)? {
                tracing::info!("saved renewed access token to {}", store.path().display());
            }
            if !outcome.ok {
                bail!(
                    "mail not sent: {}",
                    outcome.message.unwrap_or_else(|| "unknown error".into())
                );
            }
            println!("Sent {}", outcome.id.unwrap_or_default());
        }
        MailCommand::Log { limit } => {
            for entry in service.recent_log(limit) {
                let status = if entry.ok { "ok" } else { "failed" };
                println!(
                    "{} {:<6} {} {} {}",
                    entry.time,
                    status,
                    entry.to.unwrap_or_default(),
                    entry.subject.unwrap_or_default(),
                    entry.error.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn run_field(command: FieldCommand) -> anyhow::Result<()> {
    match command {
        FieldCommand::Sv {
            serial,
            birth_part,
            birth_date,
        } => {
            if let Some(date) = &birth_date {
                parse_flexible_date(date)?;
            }
            println!(
                "{}",
                sv_number_from_birth_date(&serial, birth_part.as_deref(), birth_date.as_deref())
            );
        }
        FieldCommand::SplitSv { value } => {
            let (serial, birth) =
                split_sv_number(&value).ok_or_else(|| anyhow!("not a 10-digit number: {value}"))?;
            println!("{serial} {birth}");
        }
        FieldCommand::SplitPhone { value } => {
            let (prefix, number) = split_phone(&value);
            println!("{}\t{}", prefix.unwrap_or_default(), number);
        }
    }
    Ok(())
}

/// Log filter for the binary and the core library, on top of `RUST_LOG`.
fn log_filter() -> anyhow::Result<tracing_subscriber::EnvFilter> {
    Ok(tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("homecare=info".parse()?)
        .add_directive("homecare_core=info".parse()?))
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(log_filter()?)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let override_dir = cli
        .config_dir
        .or_else(|| std::env::var_os(CONFIG_DIR_ENV).map(PathBuf::from));
    let config_dir = resolve_config_dir(override_dir)?;
    let mut store = ConfigStore::load(&config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;
    let mut prompt = TerminalPrompt::new(cli.yes);

    match cli.command {
        Some(Commands::Client(command)) => {
            run_records(RecordService::<Clients>::new(store.core_config()), command, &mut prompt)?
        }
        Some(Commands::Caretaker(command)) => run_records(
            RecordService::<Caretakers>::new(store.core_config()),
            command,
            &mut prompt,
        )?,
        Some(Commands::Reassign {
            client,
            slot,
            caretaker,
            start,
        }) => {
            let start: NaiveDate = parse_flexible_date(&start)?;
            let service = ReassignmentService::new(store.core_config());
            match service.reassign(
                &RecordKey::parse(&client),
                slot,
                &RecordKey::parse(&caretaker),
                start,
                &mut prompt,
            )? {
                ReassignOutcome::Reassigned {
                    history_index,
                    end_date,
                } => println!(
                    "Previous caretaker moved to Altbetreuer {history_index}, until {end_date}"
                ),
                ReassignOutcome::Cancelled => println!("Caretaker change cancelled"),
            }
        }
        Some(Commands::Templates(command)) => run_templates(&mut store, command)?,
        Some(Commands::Generate(args)) => run_generate(&store, args)?,
        Some(Commands::Invoice(command)) => run_invoice(&mut store, command)?,
        Some(Commands::Config(command)) => run_config(&mut store, command)?,
        Some(Commands::Mail(command)) => run_mail(&mut store, command)?,
        Some(Commands::Field(command)) => run_field(command)?,
        None => {
            println!("Use 'homecare --help' for commands");
        }
    }

    Ok(())
}
