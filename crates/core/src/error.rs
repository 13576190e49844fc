use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CareError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("failed to create directory {path}: {source}", path = path.display())]
    DirCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to write file: {0}")]
    FileWrite(std::io::Error),

    #[error("failed to read spreadsheet {path}: {message}", path = path.display())]
    SpreadsheetRead { path: PathBuf, message: String },
    #[error("failed to write spreadsheet: {0}")]
    SpreadsheetWrite(#[from] rust_xlsxwriter::XlsxError),

    #[error("failed to open document archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("malformed document XML in {part}: {message}")]
    Xml { part: String, message: String },

    #[error("failed to serialize configuration: {0}")]
    ConfigSerialization(serde_json::Error),
    #[error("failed to serialize mail log: {0}")]
    MailLogSerialization(serde_json::Error),

    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("caretaker slot must be 1 or 2, got {0}")]
    InvalidCaretakerSlot(u8),
    #[error("all {0} caretaker history slots are occupied")]
    HistoryFull(usize),

    #[error("mail error: {0}")]
    Mail(String),

    #[error("text error: {0}")]
    Text(#[from] homecare_types::TextError),
}

pub type CareResult<T> = std::result::Result<T, CareError>;
