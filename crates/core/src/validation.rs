//! Input validation utilities.
//!
//! This module contains functions for validating operator inputs before they are
//! persisted or used to build paths.

use crate::{CareError, CareResult};

/// Validates that a folder name typed by the operator is a single safe path component.
///
/// Generated documents are written to `<target>/<folder_name>`, so the name must not
/// escape the target directory or contain characters that common file systems reject.
///
/// # Errors
///
/// Returns `CareError::InvalidInput` if the name is empty, is `.` or `..`, or contains a
/// path separator or a character reserved on Windows.
pub fn validate_folder_name(name: &str) -> CareResult<()> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(CareError::InvalidInput("folder name cannot be empty".into()));
    }

    if trimmed == "." || trimmed == ".." {
        return Err(CareError::InvalidInput(format!(
            "folder name '{}' is not allowed",
            trimmed
        )));
    }

    if let Some(c) = trimmed
        .chars()
        .find(|c| matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control())
    {
        return Err(CareError::InvalidInput(format!(
            "folder name contains invalid character {:?}",
            c
        )));
    }

    Ok(())
}

/// Validates a relative template path selected from the template tree.
///
/// # Errors
///
/// Returns `CareError::InvalidInput` if the path is absolute or contains `..`.
pub fn validate_relative_template_path(rel_path: &str) -> CareResult<()> {
    let path = std::path::Path::new(rel_path);
    if rel_path.trim().is_empty() || path.is_absolute() {
        return Err(CareError::InvalidInput(format!(
            "template path '{}' must be relative",
            rel_path
        )));
    }
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(CareError::InvalidInput(format!(
            "template path '{}' must not leave the template directory",
            rel_path
        )));
    }
    Ok(())
}

/// # Errors
///
/// Returns `CareError::InvalidInput` unless `counter >= 1`.
pub fn validate_invoice_counter(counter: u64) -> CareResult<()> {
    if counter < 1 {
        return Err(CareError::InvalidInput(
            "invoice number must be at least 1".into(),
        ));
    }
    Ok(())
}

/// # Errors
///
/// Returns `CareError::InvalidInput` unless `1 <= month <= 12`.
pub fn validate_billing_month(month: u32) -> CareResult<()> {
    if !(1..=12).contains(&month) {
        return Err(CareError::InvalidInput(format!(
            "billing month must be between 1 and 12, got {}",
            month
        )));
    }
    Ok(())
}

/// # Errors
///
/// Returns `CareError::InvalidInput` unless `2000 <= year <= 2100`.
pub fn validate_billing_year(year: i32) -> CareResult<()> {
    if !(2000..=2100).contains(&year) {
        return Err(CareError::InvalidInput(format!(
            "billing year must be between 2000 and 2100, got {}",
            year
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_folder_name_accepts_plain_names() {
        for name in ["Huber Anna", "2024-06 Vertrag", "Müller_Ö"] {
            assert!(validate_folder_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_validate_folder_name_rejects_traversal() {
        for name in ["", "  ", "..", "a/b", "a\\b", "c:", "x?"] {
            assert!(validate_folder_name(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn test_validate_relative_template_path() {
        assert!(validate_relative_template_path("Verträge/Vertrag [[kfname]].docx").is_ok());
        assert!(validate_relative_template_path("../secret.docx").is_err());
        assert!(validate_relative_template_path("/etc/passwd").is_err());
    }

    #[test]
    fn test_billing_bounds() {
        assert!(validate_billing_month(1).is_ok());
        assert!(validate_billing_month(12).is_ok());
        assert!(validate_billing_month(0).is_err());
        assert!(validate_billing_year(2000).is_ok());
        assert!(validate_billing_year(2101).is_err());
        assert!(validate_invoice_counter(1).is_ok());
        assert!(validate_invoice_counter(0).is_err());
    }
}
