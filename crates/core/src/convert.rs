//! PDF conversion through an installed office suite.
//!
//! Conversion shells out to LibreOffice in headless mode:
//!
//! ```text
//! <exe> --headless --convert-to pdf --outdir <dir> <file>
//! ```
//!
//! Several executable names and install locations are tried in turn. When none of them
//! produces a PDF the caller keeps the `.docx` and reports the document as not converted.

use std::path::{Path, PathBuf};
use std::process::Command;

/// Result of a conversion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionOutcome {
    /// The PDF was written to this path.
    Converted(PathBuf),
    /// No candidate converter succeeded; the message describes the last failure.
    Unavailable(String),
}

/// Converts `.docx` files to PDF.
pub trait PdfConverter {
    fn convert(&self, docx: &Path, out_dir: &Path) -> ConversionOutcome;
}

/// Converter backed by a LibreOffice installation.
#[derive(Debug, Clone)]
pub struct OfficeConverter {
    candidates: Vec<PathBuf>,
}

impl Default for OfficeConverter {
    fn default() -> Self {
        Self {
            candidates: default_candidates(),
        }
    }
}

impl OfficeConverter {
    /// A converter that only tries the given executables.
    pub fn with_candidates(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }
}

fn default_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("soffice"), PathBuf::from("lowriter")];
    if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from(
            "/Applications/LibreOffice.app/Contents/MacOS/soffice",
        ));
    } else if cfg!(target_os = "windows") {
        candidates.push(PathBuf::from(
            r"C:\Program Files\LibreOffice\program\soffice.exe",
        ));
        candidates.push(PathBuf::from(
            r"C:\Program Files (x86)\LibreOffice\program\soffice.exe",
        ));
    } else {
        candidates.push(PathBuf::from("/usr/bin/soffice"));
        candidates.push(PathBuf::from("/usr/lib/libreoffice/program/soffice"));
        candidates.push(PathBuf::from("/opt/libreoffice/program/soffice"));
    }
    candidates
}

/// Path LibreOffice writes the PDF of `docx` to.
pub fn pdf_path_for(docx: &Path, out_dir: &Path) -> PathBuf {
    let mut name = docx.file_stem().unwrap_or(docx.as_os_str()).to_os_string();
    name.push(".pdf");
    out_dir.join(name)
}

impl PdfConverter for OfficeConverter {
    fn convert(&self, docx: &Path, out_dir: &Path) -> ConversionOutcome {
        let expected = pdf_path_for(docx, out_dir);
        let mut last_error = String::from("no converter configured");

        for exe in &self.candidates {
            let result = Command::new(exe)
                .arg("--headless")
                .arg("--convert-to")
                .arg("pdf")
                .arg("--outdir")
                .arg(out_dir)
                .arg(docx)
                .output();

            match result {
                Ok(output) if output.status.success() && expected.exists() => {
                    tracing::debug!("converted {} with {}", docx.display(), exe.display());
                    return ConversionOutcome::Converted(expected);
                }
                Ok(output) => {
                    last_error = format!(
                        "{} exited with {}: {}",
                        exe.display(),
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Err(e) => {
                    last_error = format!("{}: {}", exe.display(), e);
                }
            }
            tracing::debug!("PDF conversion attempt failed: {}", last_error);
        }

        tracing::warn!("no PDF converter available for {}", docx.display());
        ConversionOutcome::Unavailable(last_error)
    }
}
